//! Loader collaborators.
//!
//! A loader turns a buffered content reference into a [`Renderable`]. The
//! producer never blocks on it: it spawns the returned future and reacts to
//! the completion message. A loader can be told to abort every in-flight
//! request for a reference; whatever the aborted request still reports is
//! discarded by the producer.

use crate::content::Renderable;
use crate::error::{PipelineError, Result};
use common::{MediaKind, Size};
use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture};
use image::RgbaImage;
use image::imageops::FilterType;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub type LoadFuture = BoxFuture<'static, Result<Loaded>>;

/// Retrieves and decodes buffered content.
pub trait Loader: Send + Sync {
    /// Start loading `request.reference`
    fn request(&self, request: LoadRequest) -> LoadFuture;

    /// Cancel in-flight requests for `reference`, where possible
    fn abort(&self, reference: &str);
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub reference: String,
    pub media: MediaKind,
    /// Target render size at the time the load started
    pub size: Size,
}

/// Result of a successful load.
#[derive(Debug)]
pub struct Loaded {
    pub renderable: Renderable,
    /// Transient reference that replaces the original one (downloaded file)
    pub derived_reference: Option<String>,
    /// When the bytes were in memory, before decoding
    pub loaded_at: Instant,
}

impl Loaded {
    pub fn new(renderable: Renderable) -> Self {
        Self {
            renderable,
            derived_reference: None,
            loaded_at: Instant::now(),
        }
    }

    pub fn with_derived_reference(mut self, reference: impl Into<String>) -> Self {
        self.derived_reference = Some(reference.into());
        self
    }
}

/// Registry of abortable in-flight loads, keyed by reference.
#[derive(Default)]
pub struct InFlight {
    next_id: AtomicU64,
    handles: Mutex<HashMap<String, Vec<(u64, AbortHandle)>>>,
}

impl InFlight {
    /// Wrap `load` so that [`InFlight::abort`] can cancel it.
    ///
    /// The load is registered immediately, before the future is polled.
    pub fn track<F>(self: &Arc<Self>, reference: String, load: F) -> LoadFuture
    where
        F: Future<Output = Result<Loaded>> + Send + 'static,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(reference.clone())
            .or_default()
            .push((id, handle));

        let registry = Arc::clone(self);
        Box::pin(async move {
            let result = Abortable::new(load, registration).await;
            registry.release(&reference, id);
            match result {
                Ok(loaded) => loaded,
                Err(Aborted) => Err(PipelineError::Aborted(reference)),
            }
        })
    }

    /// Abort every tracked load for `reference`; returns how many there were
    pub fn abort(&self, reference: &str) -> usize {
        let handles = self.lock().remove(reference).unwrap_or_default();
        for (_, handle) in &handles {
            handle.abort();
        }
        handles.len()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, reference: &str, id: u64) {
        let mut handles = self.lock();
        if let Some(entries) = handles.get_mut(reference) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                handles.remove(reference);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, AbortHandle)>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether a reference points at a remote resource
pub fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Loader for local files and HTTP(S) URLs.
///
/// Images are decoded on the blocking pool and shrunk to fit the target
/// size. Videos are only checked for readability; remote videos are
/// downloaded to a temporary file that becomes the derived reference and is
/// deleted when the content is freed.
pub struct MediaLoader {
    client: reqwest::Client,
    in_flight: Arc<InFlight>,
}

impl MediaLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Number of loads currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Loader for MediaLoader {
    fn request(&self, request: LoadRequest) -> LoadFuture {
        let client = self.client.clone();
        let reference = request.reference.clone();
        self.in_flight.track(reference, async move {
            match request.media {
                MediaKind::Image => load_image(&client, &request).await,
                MediaKind::Video => load_video(&client, &request).await,
            }
        })
    }

    fn abort(&self, reference: &str) {
        let aborted = self.in_flight.abort(reference);
        if aborted > 0 {
            log::debug!("Aborted {} load(s) for {}", aborted, reference);
        }
    }
}

async fn fetch_bytes(client: &reqwest::Client, reference: &str) -> Result<Vec<u8>> {
    if is_remote(reference) {
        let response = client.get(reference).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    } else {
        Ok(tokio::fs::read(reference).await?)
    }
}

async fn load_image(client: &reqwest::Client, request: &LoadRequest) -> Result<Loaded> {
    let bytes = fetch_bytes(client, &request.reference).await?;
    let loaded_at = Instant::now();
    let size = request.size;

    let image = tokio::task::spawn_blocking(move || decode_image(&bytes, size))
        .await
        .map_err(|e| PipelineError::load(&request.reference, e))??;

    log::debug!(
        "Decoded {} ({}x{})",
        request.reference,
        image.width(),
        image.height()
    );

    Ok(Loaded {
        renderable: Renderable::image(image),
        derived_reference: None,
        loaded_at,
    })
}

/// Decode image bytes and shrink them to fit within `size`.
///
/// Images already smaller than the target keep their dimensions; placing
/// them on screen is up to the display loop.
pub fn decode_image(bytes: &[u8], size: Size) -> Result<RgbaImage> {
    let image = image::load_from_memory(bytes)?;
    let too_large = image.width() > size.width || image.height() > size.height;
    let image = if too_large && size.width > 0 && size.height > 0 {
        image.resize(size.width, size.height, FilterType::Triangle)
    } else {
        image
    };
    Ok(image.to_rgba8())
}

async fn load_video(client: &reqwest::Client, request: &LoadRequest) -> Result<Loaded> {
    if !is_remote(&request.reference) {
        let metadata = tokio::fs::metadata(&request.reference).await?;
        if !metadata.is_file() {
            return Err(PipelineError::load(&request.reference, "not a regular file"));
        }
        if metadata.len() == 0 {
            return Err(PipelineError::load(&request.reference, "empty file"));
        }
        return Ok(Loaded::new(Renderable::video(&request.reference)));
    }

    let bytes = fetch_bytes(client, &request.reference).await?;
    let loaded_at = Instant::now();

    let suffix = Path::new(request.reference.split('?').next().unwrap_or_default())
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let file = tempfile::Builder::new()
        .prefix("vitrine-")
        .suffix(&suffix)
        .tempfile()?;
    let path = file.into_temp_path();
    tokio::fs::write(&path, &bytes).await?;

    let derived = path.to_string_lossy().to_string();
    log::debug!(
        "Downloaded {} ({} bytes) to {}",
        request.reference,
        bytes.len(),
        derived
    );

    Ok(Loaded {
        renderable: Renderable::video(path.to_path_buf()).with_backing(path),
        derived_reference: Some(derived),
        loaded_at,
    })
}
