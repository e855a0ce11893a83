//! Deterministic sources and loaders for pipeline tests.

use crate::content::{Content, Renderable};
use crate::error::{PipelineError, Result};
use crate::loader::{LoadFuture, LoadRequest, Loaded, Loader};
use crate::producer::Producer;
use crate::sources::{ProduceFuture, ProduceRequest, Source};
use common::{MediaKind, ProducerStats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn rendered() -> Loaded {
    Loaded::new(Renderable::image(image::RgbaImage::new(1, 1)))
}

/// Loader that finishes immediately
pub struct InstantLoader;

impl Loader for InstantLoader {
    fn request(&self, _request: LoadRequest) -> LoadFuture {
        Box::pin(async { Ok(rendered()) })
    }

    fn abort(&self, _reference: &str) {}
}

/// Loader whose requests stay open until the test resolves them.
///
/// `abort` is only recorded, so aborted loads can still complete late.
#[derive(Default)]
pub struct GatedLoader {
    requests: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, oneshot::Sender<Result<Loaded>>>>,
    aborted: Mutex<Vec<String>>,
}

impl GatedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self, reference: &str) {
        self.resolve(reference, Ok(rendered()));
    }

    pub fn fail(&self, reference: &str) {
        self.resolve(reference, Err(PipelineError::load(reference, "gate failed")));
    }

    fn resolve(&self, reference: &str, result: Result<Loaded>) {
        let gate = self.gates.lock().unwrap().remove(reference);
        let gate = gate.unwrap_or_else(|| panic!("no open load for {}", reference));
        let _ = gate.send(result);
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn requested(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Wait until at least `count` loads have been requested
    pub async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.requested() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("only {} of {} loads requested", self.requested(), count));
    }
}

impl Loader for GatedLoader {
    fn request(&self, request: LoadRequest) -> LoadFuture {
        let (tx, rx) = oneshot::channel();
        self.requests.lock().unwrap().push(request.reference.clone());
        self.gates
            .lock()
            .unwrap()
            .insert(request.reference.clone(), tx);
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(PipelineError::Aborted(request.reference)))
        })
    }

    fn abort(&self, reference: &str) {
        self.aborted.lock().unwrap().push(reference.to_string());
    }
}

/// Source producing `prefix-0`, `prefix-1`, ... and recording frees
pub struct SequenceSource {
    prefix: String,
    fail: bool,
    next: AtomicUsize,
    freed: Arc<Mutex<Vec<String>>>,
    loader: Arc<dyn Loader>,
}

impl SequenceSource {
    pub fn with_loader(prefix: &str, loader: Arc<dyn Loader>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            fail: false,
            next: AtomicUsize::new(0),
            freed: Arc::new(Mutex::new(Vec::new())),
            loader,
        })
    }

    pub fn instant(prefix: &str) -> Arc<Self> {
        Self::with_loader(prefix, Arc::new(InstantLoader))
    }

    /// Every production fails
    pub fn failing(prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            fail: true,
            next: AtomicUsize::new(0),
            freed: Arc::new(Mutex::new(Vec::new())),
            loader: Arc::new(InstantLoader),
        })
    }

    /// Content whose release is recorded by this source
    pub fn make(&self, reference: &str, producer: &str) -> Content {
        let freed = Arc::clone(&self.freed);
        let mut content = Content::new(producer, MediaKind::Image, reference);
        content.hooks_mut().on_free = Some(Box::new(move |c: &Content| {
            freed.lock().unwrap().push(c.reference().to_string());
        }));
        content
    }

    pub fn productions(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> Vec<String> {
        self.freed.lock().unwrap().clone()
    }
}

impl Source for SequenceSource {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    fn produce(&self, request: ProduceRequest) -> ProduceFuture {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail {
            Err(PipelineError::Exhausted(self.prefix.clone()))
        } else {
            Ok(self.make(&format!("{}-{}", self.prefix, index), &request.producer))
        };
        Box::pin(async move { result })
    }

    fn loader(&self) -> Arc<dyn Loader> {
        Arc::clone(&self.loader)
    }
}

/// Poll a producer's stats until `condition` holds
pub async fn wait_for(
    producer: &Producer,
    condition: impl Fn(&ProducerStats) -> bool,
) -> ProducerStats {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = producer.stats().await.unwrap();
            if condition(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;

    match polled {
        Ok(stats) => stats,
        Err(_) => panic!(
            "condition not reached for '{}': {:?}",
            producer.name(),
            producer.stats().await.unwrap()
        ),
    }
}
