//! Content sources: what each producer variant produces.
//!
//! A [`Source`] synthesizes the next content reference and names the loader
//! that turns it into something renderable. The producer owns buffering,
//! filtering, retries and cancellation; sources only answer "what next?".
//!
//! - [`folder`]: local image or video folders, files and glob patterns
//! - [`feed`]: remote API returning a JSON listing of media items
//! - [`on_demand`]: host that renders a fresh image per request at a given size

pub mod feed;
pub mod folder;
pub mod on_demand;

use crate::config::ProducerSettings;
use crate::content::Content;
use crate::error::Result;
use crate::loader::{Loader, MediaLoader};
use common::{FilterSpec, MediaKind, Size};
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;

pub type ProduceFuture = BoxFuture<'static, Result<Content>>;

/// Parameters of one production request.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// Name of the producer that will own the content
    pub producer: String,
    /// Active filter; sources skip references it rejects
    pub filter: FilterSpec,
    /// Current target render size
    pub size: Size,
}

/// Supplies content references for one producer.
pub trait Source: Send + Sync {
    /// Short label for diagnostics
    fn kind(&self) -> &'static str;

    /// Synthesize the next content item
    fn produce(&self, request: ProduceRequest) -> ProduceFuture;

    /// Loader that decodes this source's content
    fn loader(&self) -> Arc<dyn Loader>;
}

/// Guess the media kind of a path or URL from its extension
pub fn media_kind_for(reference: &str) -> MediaKind {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    match Path::new(path).extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if matches!(
                ext_lower.as_str(),
                "mp4" | "webm" | "mkv" | "avi" | "mov" | "flv" | "wmv" | "m4v" | "ogv"
            ) {
                MediaKind::Video
            } else {
                MediaKind::Image
            }
        }
        None => MediaKind::Image,
    }
}

/// Build the source described by a `[[producer]]` config entry
pub fn from_settings(
    settings: &ProducerSettings,
    client: &reqwest::Client,
) -> anyhow::Result<Arc<dyn Source>> {
    let loader: Arc<dyn Loader> = Arc::new(MediaLoader::new(client.clone()));

    let source: Arc<dyn Source> = match settings.kind.as_str() {
        "images" => Arc::new(folder::FolderSource::new(
            MediaKind::Image,
            settings.sources.clone(),
            settings.extensions(),
            settings.shuffle,
            loader,
        )),
        "videos" => Arc::new(
            folder::FolderSource::new(
                MediaKind::Video,
                settings.sources.clone(),
                settings.extensions(),
                settings.shuffle,
                loader,
            )
            .with_volume(settings.volume),
        ),
        "feed" => {
            let url = settings
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("feed producer '{}' has no url", settings.name))?;
            Arc::new(
                feed::FeedSource::new(url, client.clone(), settings.shuffle, loader)
                    .with_volume(settings.volume),
            )
        }
        "on-demand" => {
            let template = settings.url.clone().ok_or_else(|| {
                anyhow::anyhow!("on-demand producer '{}' has no url", settings.name)
            })?;
            Arc::new(on_demand::OnDemandSource::new(template, loader))
        }
        other => anyhow::bail!("Unknown producer kind: {}", other),
    };

    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_for() {
        assert_eq!(media_kind_for("/clips/a.MP4"), MediaKind::Video);
        assert_eq!(media_kind_for("https://host/v.webm?token=1"), MediaKind::Video);
        assert_eq!(media_kind_for("/pics/a.jpg"), MediaKind::Image);
        assert_eq!(media_kind_for("https://picsum.photos/200/300"), MediaKind::Image);
    }

    #[test]
    fn test_from_settings_kinds() {
        let client = reqwest::Client::new();
        let config = crate::config::Config::parse(
            r#"
[[producer]]
name = "photos"
kind = "images"
sources = ["/tmp"]

[[producer]]
name = "clips"
kind = "videos"
sources = ["/tmp"]

[[producer]]
name = "gallery"
kind = "feed"
url = "https://example.org/list.json"

[[producer]]
name = "random"
kind = "on-demand"
url = "https://example.org/{width}/{height}"
"#,
        )
        .unwrap();

        let kinds: Vec<&str> = config
            .producer
            .iter()
            .map(|p| from_settings(p, &client).unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["images", "videos", "feed", "on-demand"]);
    }
}
