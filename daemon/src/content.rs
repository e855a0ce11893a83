//! Content items flowing through the pipeline.
//!
//! A [`Content`] is created by a producer's source, decoded by a loader while
//! it sits in a producer slot, moved into the supplier's buffer and finally
//! handed to the display loop. Ownership is always exclusive: the value is
//! moved at every hand-off and never shared between two slots.
//!
//! Releasing an item goes through [`Content::free`], which runs the
//! consumer's hooks, drops the renderable handle and restores the original
//! reference. Dropping a `Content` that was never freed frees it, so an
//! item discarded anywhere in the pipeline still releases its resources
//! exactly once.

use chrono::NaiveDate;
use common::{ContentInfo, MediaKind};
use image::RgbaImage;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;

/// Consumer-supplied lifecycle callback.
pub type Hook = Box<dyn FnMut(&Content) + Send>;

/// Optional lifecycle callbacks attached to a content item.
#[derive(Default)]
pub struct ContentHooks {
    pub on_free: Option<Hook>,
    pub attach: Option<Hook>,
    pub start: Option<Hook>,
    pub stop: Option<Hook>,
}

/// Monotonic lifecycle timestamps, for diagnostics only.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    pub constructed: Instant,
    pub referenced: Option<Instant>,
    pub rereferenced: Option<Instant>,
    pub buffered: Option<Instant>,
    pub loaded: Option<Instant>,
    pub decoded: Option<Instant>,
}

impl Timeline {
    fn new() -> Self {
        Self {
            constructed: Instant::now(),
            referenced: None,
            rereferenced: None,
            buffered: None,
            loaded: None,
            decoded: None,
        }
    }
}

/// What a loader produced for the display loop.
#[derive(Debug, Clone)]
pub enum RenderKind {
    /// Decoded pixels, already fitted to the target size
    Image(Arc<RgbaImage>),
    /// Playable file; decoding belongs to the display loop
    Video(PathBuf),
}

/// Renderable element handle attached to a loaded content item.
///
/// A renderable may own a transient backing file (for instance a downloaded
/// video). The file is removed when the handle is dropped.
#[derive(Debug)]
pub struct Renderable {
    kind: RenderKind,
    backing: Option<TempPath>,
}

impl Renderable {
    pub fn image(image: RgbaImage) -> Self {
        Self {
            kind: RenderKind::Image(Arc::new(image)),
            backing: None,
        }
    }

    pub fn video(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: RenderKind::Video(path.into()),
            backing: None,
        }
    }

    /// Attach a temporary file that lives as long as this handle
    pub fn with_backing(mut self, backing: TempPath) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn kind(&self) -> &RenderKind {
        &self.kind
    }

    /// Pixel dimensions for decoded images
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match &self.kind {
            RenderKind::Image(image) => Some(image.dimensions()),
            RenderKind::Video(_) => None,
        }
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }
}

/// One unit of displayable media plus its metadata and lifecycle hooks.
pub struct Content {
    reference: String,
    original_reference: Option<String>,
    reference_replaced: bool,
    producer: String,
    media: MediaKind,
    title: Option<String>,
    description: Option<String>,
    date: Option<NaiveDate>,
    link: Option<String>,
    timeline: Timeline,
    volume: f32,
    payload: Option<serde_json::Value>,
    element: Option<Renderable>,
    hooks: ContentHooks,
    freed: bool,
}

impl Content {
    /// Create a content item for `reference`, owned by `producer`
    pub fn new(producer: impl Into<String>, media: MediaKind, reference: impl Into<String>) -> Self {
        let mut content = Self {
            reference: String::new(),
            original_reference: None,
            reference_replaced: false,
            producer: producer.into(),
            media,
            title: None,
            description: None,
            date: None,
            link: None,
            timeline: Timeline::new(),
            volume: 0.0,
            payload: None,
            element: None,
            hooks: ContentHooks::default(),
            freed: false,
        };
        content.assign_reference(reference);
        content
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume.clamp(0.0, 1.0);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Point this item at a new reference.
    ///
    /// The first assignment becomes the original reference. Later ones mark
    /// the reference as replaced by a derived, transient one; [`free`]
    /// restores the original.
    ///
    /// [`free`]: Content::free
    pub fn assign_reference(&mut self, reference: impl Into<String>) {
        self.reference = reference.into();
        if self.original_reference.is_none() {
            self.original_reference = Some(self.reference.clone());
            self.timeline.referenced = Some(Instant::now());
        } else {
            self.reference_replaced = true;
            self.timeline.rereferenced = Some(Instant::now());
        }
    }

    pub fn mark_buffered(&mut self) {
        self.timeline.buffered = Some(Instant::now());
    }

    pub fn mark_loaded(&mut self) {
        self.timeline.loaded = Some(Instant::now());
    }

    pub fn mark_decoded(&mut self) {
        self.timeline.decoded = Some(Instant::now());
    }

    pub(crate) fn mark_loaded_at(&mut self, at: Instant) {
        self.timeline.loaded = Some(at);
    }

    /// Attach the renderable produced by a loader
    pub fn set_element(&mut self, element: Renderable) {
        self.element = Some(element);
    }

    pub fn element(&self) -> Option<&Renderable> {
        self.element.as_ref()
    }

    pub fn set_hooks(&mut self, hooks: ContentHooks) {
        self.hooks = hooks;
    }

    pub fn hooks_mut(&mut self) -> &mut ContentHooks {
        &mut self.hooks
    }

    pub fn attach(&mut self) {
        self.run_hook(|hooks| &mut hooks.attach, "attach");
    }

    pub fn start(&mut self) {
        self.run_hook(|hooks| &mut hooks.start, "start");
    }

    pub fn stop(&mut self) {
        self.run_hook(|hooks| &mut hooks.stop, "stop");
    }

    fn run_hook(&mut self, slot: fn(&mut ContentHooks) -> &mut Option<Hook>, name: &str) {
        match slot(&mut self.hooks).take() {
            Some(mut hook) => {
                hook(self);
                *slot(&mut self.hooks) = Some(hook);
            }
            None => log::debug!("No {} hook for {}", name, self.reference),
        }
    }

    /// Release this item.
    ///
    /// Stops playback if a stop hook exists, drops the renderable, runs the
    /// `on_free` hook and restores the original reference. Only the first
    /// call does anything.
    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        self.freed = true;

        if self.hooks.stop.is_some() {
            self.stop();
        }

        self.element = None;

        if let Some(mut on_free) = self.hooks.on_free.take() {
            on_free(self);
        }

        if self.reference_replaced {
            if let Some(original) = self.original_reference.clone() {
                self.reference = original;
            }
            self.reference_replaced = false;
        }
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn original_reference(&self) -> Option<&str> {
        self.original_reference.as_deref()
    }

    pub fn reference_replaced(&self) -> bool {
        self.reference_replaced
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn set_payload(&mut self, payload: Option<serde_json::Value>) {
        self.payload = payload;
    }

    /// Metadata snapshot for status reporting
    pub fn info(&self) -> ContentInfo {
        ContentInfo {
            reference: self.reference.clone(),
            original_reference: self.original_reference.clone(),
            media: self.media,
            producer: self.producer.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            date: self.date.map(|d| d.format("%Y-%m-%d").to_string()),
            link: self.link.clone(),
        }
    }
}

impl Drop for Content {
    fn drop(&mut self) {
        if !self.freed {
            log::trace!("Freeing dropped content {}", self.reference);
            self.free();
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content")
            .field("reference", &self.reference)
            .field("original_reference", &self.original_reference)
            .field("producer", &self.producer)
            .field("media", &self.media)
            .field("title", &self.title)
            .field("loaded", &self.element.is_some())
            .field("freed", &self.freed)
            .finish()
    }
}
