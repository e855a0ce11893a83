use super::{ProduceFuture, ProduceRequest, Source};
use crate::content::Content;
use crate::error::{PipelineError, Result};
use crate::loader::Loader;
use chrono::{DateTime, Local};
use common::{FilterSpec, MediaKind};
use glob::glob;
use rand::rng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Local image or video collection.
///
/// Sources may be files, directories (scanned one level deep) or glob
/// patterns; `~` is expanded. The file list is rescanned every time the
/// rotation wraps, so files added to a folder show up on the next pass.
pub struct FolderSource {
    media: MediaKind,
    volume: f32,
    loader: Arc<dyn Loader>,
    rotation: Arc<Mutex<Rotation>>,
}

impl FolderSource {
    pub fn new(
        media: MediaKind,
        sources: Vec<String>,
        extensions: Vec<String>,
        shuffle: bool,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Self {
            media,
            volume: 0.0,
            loader,
            rotation: Arc::new(Mutex::new(Rotation::new(sources, extensions, shuffle))),
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }
}

impl Source for FolderSource {
    fn kind(&self) -> &'static str {
        match self.media {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
        }
    }

    fn produce(&self, request: ProduceRequest) -> ProduceFuture {
        let rotation = Arc::clone(&self.rotation);
        let media = self.media;
        let volume = self.volume;

        Box::pin(async move {
            tokio::task::spawn_blocking(move || next_content(&rotation, &request, media, volume))
                .await
                .map_err(|e| PipelineError::Exhausted(format!("folder scan panicked: {}", e)))?
        })
    }

    fn loader(&self) -> Arc<dyn Loader> {
        Arc::clone(&self.loader)
    }
}

/// Pick the next file and describe it. Touches the filesystem, so it runs
/// on the blocking pool.
fn next_content(
    rotation: &Mutex<Rotation>,
    request: &ProduceRequest,
    media: MediaKind,
    volume: f32,
) -> Result<Content> {
    let picked = rotation
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next_matching(&request.filter)?;
    Ok(content_for(&request.producer, media, volume, &picked))
}

fn content_for(producer: &str, media: MediaKind, volume: f32, path: &Path) -> Content {
    let mut content = Content::new(producer, media, path.to_string_lossy());
    if let Some(stem) = path.file_stem() {
        content = content.with_title(stem.to_string_lossy());
    }
    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        content = content.with_date(DateTime::<Local>::from(modified).date_naive());
    }
    if media == MediaKind::Video {
        content = content.with_volume(volume);
    }
    content
}

/// Position in the scanned file list
struct Rotation {
    sources: Vec<String>,
    extensions: Vec<String>,
    shuffle: bool,
    files: Vec<PathBuf>,
    order: Vec<usize>,
    cursor: usize,
}

impl Rotation {
    fn new(sources: Vec<String>, extensions: Vec<String>, shuffle: bool) -> Self {
        Self {
            sources,
            extensions,
            shuffle,
            files: Vec::new(),
            order: Vec::new(),
            cursor: 0,
        }
    }

    fn rescan(&mut self) {
        self.files = scan_sources(&self.sources, &self.extensions);
        self.order = (0..self.files.len()).collect();
        if self.shuffle {
            self.order.shuffle(&mut rng());
        }
        self.cursor = 0;
        log::debug!(
            "Scanned {} file(s) from {} source(s)",
            self.files.len(),
            self.sources.len()
        );
    }

    /// Next file accepted by `filter`, trying each file at most once
    fn next_matching(&mut self, filter: &FilterSpec) -> Result<PathBuf> {
        if self.cursor >= self.order.len() {
            self.rescan();
        }
        if self.files.is_empty() {
            return Err(PipelineError::Exhausted(format!(
                "no files in {}",
                self.sources.join(", ")
            )));
        }

        for _ in 0..self.files.len() {
            if self.cursor >= self.order.len() {
                self.rescan();
                if self.files.is_empty() {
                    break;
                }
            }
            let path = &self.files[self.order[self.cursor]];
            self.cursor += 1;
            if filter.accepts(&path.to_string_lossy()) {
                return Ok(path.clone());
            }
        }

        Err(PipelineError::NoMatch(filter.to_string()))
    }
}

/// Resolve files, directories and glob patterns into a sorted file list
fn scan_sources(sources: &[String], extensions: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for source in sources {
        let expanded_source = shellexpand::tilde(source);

        let source_path = Path::new(expanded_source.as_ref());
        if source_path.is_file() {
            if has_valid_extension(source_path, extensions) {
                files.push(source_path.to_path_buf());
            }
            continue;
        }

        if source_path.is_dir() {
            for ext in extensions {
                let pattern = format!("{}/*.{}", expanded_source, ext);
                if let Ok(entries) = glob(&pattern) {
                    files.extend(entries.flatten().filter(|entry| entry.is_file()));
                }
            }
            continue;
        }

        match glob(&expanded_source) {
            Ok(entries) => {
                files.extend(
                    entries
                        .flatten()
                        .filter(|entry| entry.is_file() && has_valid_extension(entry, extensions)),
                );
            }
            Err(e) => {
                log::warn!("Failed to glob pattern '{}': {}", source, e);
            }
        }
    }

    files.sort();
    files.dedup();
    files
}

fn has_valid_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}
