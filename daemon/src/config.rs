use anyhow::{Context, Result};
use common::{FilterSpec, Size};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::validate_enum;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub producer: Vec<ProducerSettings>,
}

/// General daemon settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Target render width handed to producers
    #[serde(default = "default_width")]
    pub width: u32,

    /// Target render height handed to producers
    #[serde(default = "default_height")]
    pub height: u32,

    /// Slideshow interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Supplier slots reserved per producer
    #[serde(default = "default_producer_buffer_size")]
    pub producer_buffer_size: usize,

    /// Delay before a failing producer tries again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            width: default_width(),
            height: default_height(),
            interval: default_interval(),
            producer_buffer_size: default_producer_buffer_size(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl GeneralSettings {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_interval() -> u64 {
    300
} // 5 minutes
fn default_producer_buffer_size() -> usize {
    1
}
fn default_retry_delay_ms() -> u64 {
    5000
}

/// One content source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerSettings {
    pub name: String,

    /// images, videos, feed or on-demand
    pub kind: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Slots in the producer's own buffer (fixed at startup)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub include: Option<String>,

    #[serde(default)]
    pub exclude: Option<String>,

    #[serde(default)]
    pub shuffle: bool,

    /// Folders, files or glob patterns (images / videos)
    #[serde(default)]
    pub sources: Vec<String>,

    /// Accepted extensions; defaults depend on the kind
    #[serde(default)]
    pub extensions: Option<Vec<String>>,

    /// Listing URL (feed) or URL template (on-demand)
    #[serde(default)]
    pub url: Option<String>,

    /// Playback volume for videos, 0.0 to 1.0
    #[serde(default)]
    pub volume: f32,
}

fn default_weight() -> f64 {
    1.0
}
fn default_buffer_size() -> usize {
    2
}

pub fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_video_extensions() -> Vec<String> {
    ["mp4", "webm", "mkv", "mov", "m4v", "ogv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl ProducerSettings {
    /// Active filter at startup. Only one of include/exclude may be set.
    pub fn filter(&self) -> FilterSpec {
        match (&self.include, &self.exclude) {
            (Some(include), _) => FilterSpec::include(include.as_str()),
            (None, Some(exclude)) => FilterSpec::exclude(exclude.as_str()),
            (None, None) => FilterSpec::None,
        }
    }

    pub fn extensions(&self) -> Vec<String> {
        match &self.extensions {
            Some(extensions) => extensions.clone(),
            None if self.kind == "videos" => default_video_extensions(),
            None => default_image_extensions(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML contents
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vitrine");

        Ok(config_dir.join("config.toml"))
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        validate_enum!(
            self.general.log_level.as_str(),
            "trace",
            "debug",
            "info",
            "warn",
            "error"
        )?;

        if self.general.width == 0 || self.general.height == 0 {
            anyhow::bail!(
                "Invalid size {}x{} (must be positive)",
                self.general.width,
                self.general.height
            );
        }

        if self.general.producer_buffer_size == 0 {
            anyhow::bail!("producer_buffer_size must be at least 1");
        }

        let mut names = HashSet::new();
        for producer in &self.producer {
            if !names.insert(producer.name.as_str()) {
                anyhow::bail!("Duplicate producer name: {}", producer.name);
            }
            self.validate_producer(producer)
                .with_context(|| format!("Invalid producer '{}'", producer.name))?;
        }

        Ok(())
    }

    fn validate_producer(&self, producer: &ProducerSettings) -> Result<()> {
        if producer.name.is_empty() {
            anyhow::bail!("Producer name must not be empty");
        }

        validate_enum!(
            producer.kind.as_str(),
            "images",
            "videos",
            "feed",
            "on-demand"
        )?;

        if !(producer.weight.is_finite() && producer.weight > 0.0) {
            anyhow::bail!("Invalid weight: {} (must be positive)", producer.weight);
        }

        if producer.buffer_size == 0 {
            anyhow::bail!("buffer_size must be at least 1");
        }

        if producer.include.is_some() && producer.exclude.is_some() {
            anyhow::bail!("Only one of include/exclude may be set");
        }

        if !(0.0..=1.0).contains(&producer.volume) {
            anyhow::bail!("Invalid volume: {} (expected 0.0-1.0)", producer.volume);
        }

        match producer.kind.as_str() {
            "images" | "videos" if producer.sources.is_empty() => {
                anyhow::bail!("'{}' producers need at least one source", producer.kind)
            }
            "feed" | "on-demand" if producer.url.is_none() => {
                anyhow::bail!("'{}' producers need a url", producer.kind)
            }
            _ => {}
        }

        Ok(())
    }

    /// Get producer configuration by name
    pub fn get_producer(&self, name: &str) -> Option<&ProducerSettings> {
        self.producer.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.size(), Size::new(1920, 1080));
        assert_eq!(config.general.interval(), Duration::from_secs(300));
        assert_eq!(config.general.producer_buffer_size, 1);
        assert!(config.producer.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_with_producers() {
        let toml = r#"
[general]
log_level = "debug"
width = 2560
height = 1440
interval = 60

[[producer]]
name = "photos"
kind = "images"
sources = ["~/Pictures"]
weight = 2.0
buffer_size = 3
exclude = "/private/"
shuffle = true

[[producer]]
name = "clips"
kind = "videos"
sources = ["~/Videos/*.mp4"]
volume = 0.5

[[producer]]
name = "gallery"
kind = "feed"
url = "https://example.org/gallery.json"
include = "landscape"

[[producer]]
name = "random"
kind = "on-demand"
url = "https://picsum.photos/{width}/{height}"
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.general.size(), Size::new(2560, 1440));
        assert_eq!(config.producer.len(), 4);

        let photos = config.get_producer("photos").unwrap();
        assert_eq!(photos.weight, 2.0);
        assert_eq!(photos.buffer_size, 3);
        assert_eq!(photos.filter(), FilterSpec::exclude("/private/"));
        assert!(photos.extensions().contains(&"png".to_string()));

        let clips = config.get_producer("clips").unwrap();
        assert_eq!(clips.weight, 1.0);
        assert_eq!(clips.buffer_size, 2);
        assert!(clips.extensions().contains(&"webm".to_string()));

        let gallery = config.get_producer("gallery").unwrap();
        assert_eq!(gallery.filter(), FilterSpec::include("landscape"));

        assert!(config.get_producer("missing").is_none());
    }

    #[test]
    fn test_rejects_invalid_log_level() {
        let toml = r#"
[general]
log_level = "loud"
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_bad_weight() {
        for weight in ["0.0", "-1.0"] {
            let toml = format!(
                r#"
[[producer]]
name = "photos"
kind = "images"
sources = ["/tmp"]
weight = {}
"#,
                weight
            );
            assert!(Config::parse(&toml).is_err(), "weight {} accepted", weight);
        }
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let toml = r#"
[[producer]]
name = "x"
kind = "carousel"
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let toml = r#"
[[producer]]
name = "photos"
kind = "images"
sources = ["/a"]

[[producer]]
name = "photos"
kind = "images"
sources = ["/b"]
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_missing_kind_fields() {
        let folder = r#"
[[producer]]
name = "photos"
kind = "images"
"#;
        assert!(Config::parse(folder).is_err());

        let feed = r#"
[[producer]]
name = "gallery"
kind = "feed"
"#;
        assert!(Config::parse(feed).is_err());
    }

    #[test]
    fn test_rejects_both_filters() {
        let toml = r#"
[[producer]]
name = "photos"
kind = "images"
sources = ["/a"]
include = "x"
exclude = "y"
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_zero_buffer_size() {
        let toml = r#"
[[producer]]
name = "photos"
kind = "images"
sources = ["/a"]
buffer_size = 0
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/vitrine.toml")).unwrap();
        assert!(config.producer.is_empty());
    }
}
