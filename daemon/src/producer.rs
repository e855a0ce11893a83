//! Producers: one content source plus a bounded buffer of loaded items.
//!
//! Every producer runs as its own task that exclusively owns the slot ring,
//! the pending-request queue and the counters. The [`Producer`] handle only
//! sends commands; productions and loads run as spawned futures that report
//! back through the same command channel, so no state is ever shared.
//!
//! The task keeps `to_be_produced` equal to the number of slots nobody has
//! claimed yet. It is reset to the capacity on flush, decremented when a
//! production starts and incremented when a delivery frees a slot or a
//! production fails. Productions are serialized through a single queued
//! `Produce` message, and failures hold further productions back for the
//! retry delay.

use crate::buffer::{Flushed, SlotRing};
use crate::config::{GeneralSettings, ProducerSettings};
use crate::content::Content;
use crate::error::{PipelineError, Result};
use crate::loader::{LoadRequest, Loaded, Loader};
use crate::sources::{ProduceRequest, Source};
use common::{FilterSpec, ProducerStats, Size};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Startup parameters of a producer
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub name: String,
    /// Number of slots; fixed for the producer's lifetime
    pub buffer_size: usize,
    pub weight: f64,
    pub filter: FilterSpec,
    pub size: Size,
    pub retry_delay: Duration,
}

impl ProducerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer_size: 2,
            weight: 1.0,
            filter: FilterSpec::None,
            size: Size::default(),
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn from_settings(settings: &ProducerSettings, general: &GeneralSettings) -> Self {
        Self {
            name: settings.name.clone(),
            buffer_size: settings.buffer_size,
            weight: settings.weight,
            filter: settings.filter(),
            size: general.size(),
            retry_delay: general.retry_delay(),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Reject weights the fairness accounting cannot work with
pub fn validate_weight(weight: f64) -> Result<f64> {
    if weight.is_finite() && weight > 0.0 {
        Ok(weight)
    } else {
        Err(PipelineError::InvalidWeight(weight))
    }
}

enum ProducerCommand {
    Deliver(oneshot::Sender<Content>),
    Flush(oneshot::Sender<()>),
    AddToBuffer(Content),
    SetSize(Size),
    SetFilter(FilterSpec),
    SetWeight(f64),
    Stats(oneshot::Sender<ProducerStats>),
    Produce,
    Produced {
        epoch: u64,
        result: Result<Content>,
    },
    Loaded {
        slot: usize,
        ticket: u64,
        result: Result<Loaded>,
    },
    Retry {
        epoch: u64,
    },
    Shutdown,
}

/// Handle to a running producer task
#[derive(Clone)]
pub struct Producer {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<ProducerCommand>,
}

impl Producer {
    /// Start the producer task and begin filling its buffer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ProducerConfig, source: Arc<dyn Source>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(config.name.as_str());
        let task = ProducerTask::new(config, source, tx.downgrade());
        tokio::spawn(task.run(rx));
        Self { name, commands: tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next ready item. Waits, in arrival order, while nothing is ready.
    pub async fn deliver(&self) -> Result<Content> {
        let (tx, rx) = oneshot::channel();
        self.send(ProducerCommand::Deliver(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Discard everything buffered or in flight and start over.
    ///
    /// Waiting `deliver` calls stay queued and receive post-flush content.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ProducerCommand::Flush(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Push externally produced content into an Empty slot.
    ///
    /// If every slot is occupied the content is freed and counted as an
    /// internal error.
    pub fn add_to_buffer(&self, content: Content) -> Result<()> {
        self.send(ProducerCommand::AddToBuffer(content))
    }

    /// Target size for future productions and loads. Does not flush.
    pub fn set_size(&self, width: u32, height: u32) -> Result<()> {
        self.send(ProducerCommand::SetSize(Size::new(width, height)))
    }

    /// Replace the active filter. Does not flush; already buffered content
    /// is still delivered.
    pub fn set_filter(&self, filter: FilterSpec) -> Result<()> {
        self.send(ProducerCommand::SetFilter(filter))
    }

    pub fn set_include_filter(&self, pattern: &str) -> Result<()> {
        self.set_filter(FilterSpec::include(pattern))
    }

    pub fn set_exclude_filter(&self, pattern: &str) -> Result<()> {
        self.set_filter(FilterSpec::exclude(pattern))
    }

    /// Record a new weight. The supplier reads it at registration and is
    /// told directly about later changes.
    pub fn set_weight(&self, weight: f64) -> Result<()> {
        let weight = validate_weight(weight)?;
        self.send(ProducerCommand::SetWeight(weight))
    }

    pub async fn stats(&self) -> Result<ProducerStats> {
        let (tx, rx) = oneshot::channel();
        self.send(ProducerCommand::Stats(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Stop the task, freeing everything it holds. Waiting `deliver` calls
    /// fail with [`PipelineError::Closed`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(ProducerCommand::Shutdown);
    }

    fn send(&self, command: ProducerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> PipelineError {
        PipelineError::Closed(self.name.to_string())
    }
}

struct ProducerTask {
    name: String,
    source: Arc<dyn Source>,
    loader: Arc<dyn Loader>,
    commands: mpsc::WeakUnboundedSender<ProducerCommand>,
    ring: SlotRing,
    pending: VecDeque<oneshot::Sender<Content>>,
    filter: FilterSpec,
    size: Size,
    weight: f64,
    retry_delay: Duration,
    to_be_produced: usize,
    tick_queued: bool,
    retry_armed: bool,
    epoch: u64,
    next_ticket: u64,
    produced: u64,
    delivered: u64,
    failed: u64,
    discarded: u64,
}

impl ProducerTask {
    fn new(
        config: ProducerConfig,
        source: Arc<dyn Source>,
        commands: mpsc::WeakUnboundedSender<ProducerCommand>,
    ) -> Self {
        let ring = SlotRing::new(config.buffer_size);
        Self {
            name: config.name,
            loader: source.loader(),
            source,
            commands,
            to_be_produced: ring.capacity(),
            ring,
            pending: VecDeque::new(),
            filter: config.filter,
            size: config.size,
            weight: config.weight,
            retry_delay: config.retry_delay,
            tick_queued: false,
            retry_armed: false,
            epoch: 0,
            next_ticket: 0,
            produced: 0,
            delivered: 0,
            failed: 0,
            discarded: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ProducerCommand>) {
        log::info!(
            "Producer '{}' started ({} source, {} slot(s), filter {})",
            self.name,
            self.source.kind(),
            self.ring.capacity(),
            self.filter
        );
        self.trigger();

        while let Some(command) = commands.recv().await {
            match command {
                ProducerCommand::Shutdown => break,
                command => self.handle(command),
            }
        }

        self.release_all();
        log::info!("Producer '{}' stopped", self.name);
    }

    fn handle(&mut self, command: ProducerCommand) {
        match command {
            ProducerCommand::Deliver(reply) => self.deliver(reply),
            ProducerCommand::Flush(reply) => {
                self.flush();
                let _ = reply.send(());
            }
            ProducerCommand::AddToBuffer(content) => {
                self.to_be_produced = self.to_be_produced.saturating_sub(1);
                self.add_to_buffer(content);
            }
            ProducerCommand::SetSize(size) => {
                log::debug!("Producer '{}' size set to {}", self.name, size);
                self.size = size;
            }
            ProducerCommand::SetFilter(filter) => {
                log::info!("Producer '{}' filter set to {}", self.name, filter);
                self.filter = filter;
            }
            ProducerCommand::SetWeight(weight) => self.weight = weight,
            ProducerCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            ProducerCommand::Produce => self.produce(),
            ProducerCommand::Produced { epoch, result } => self.on_produced(epoch, result),
            ProducerCommand::Loaded {
                slot,
                ticket,
                result,
            } => match result {
                Ok(loaded) => self.on_success_production(slot, ticket, loaded),
                Err(e) => self.on_failed_production(slot, ticket, e),
            },
            ProducerCommand::Retry { epoch } => {
                if epoch == self.epoch {
                    self.retry_armed = false;
                    self.trigger();
                }
            }
            ProducerCommand::Shutdown => {}
        }
    }

    /// Queue one `Produce` message if production is due and none is queued
    fn trigger(&mut self) {
        if self.tick_queued || self.retry_armed || self.to_be_produced == 0 {
            return;
        }
        if let Some(tx) = self.commands.upgrade() {
            self.tick_queued = tx.send(ProducerCommand::Produce).is_ok();
        }
    }

    fn produce(&mut self) {
        self.tick_queued = false;
        if self.to_be_produced == 0 || self.retry_armed {
            return;
        }
        let Some(tx) = self.commands.upgrade() else {
            return;
        };

        self.to_be_produced -= 1;
        let epoch = self.epoch;
        let production = self.source.produce(ProduceRequest {
            producer: self.name.clone(),
            filter: self.filter.clone(),
            size: self.size,
        });
        tokio::spawn(async move {
            let result = production.await;
            let _ = tx.send(ProducerCommand::Produced { epoch, result });
        });

        self.trigger();
    }

    fn on_produced(&mut self, epoch: u64, result: Result<Content>) {
        if epoch != self.epoch {
            if let Ok(mut content) = result {
                log::debug!(
                    "Producer '{}' dropping {} produced before flush",
                    self.name,
                    content.reference()
                );
                content.free();
            }
            return;
        }

        match result {
            Ok(content) if self.filter.accepts(content.reference()) => self.add_to_buffer(content),
            Ok(mut content) => {
                log::debug!(
                    "Producer '{}' filter {} rejected {}",
                    self.name,
                    self.filter,
                    content.reference()
                );
                content.free();
                self.production_failed();
            }
            Err(e) => {
                log::warn!("Producer '{}' failed to produce: {}", self.name, e);
                self.production_failed();
            }
        }
    }

    fn add_to_buffer(&mut self, content: Content) {
        match self.ring.insert(content) {
            Ok(slot) => {
                self.produced += 1;
                self.start_load(slot);
            }
            Err(mut content) => {
                log::error!(
                    "Producer '{}' has no empty slot for {}; dropping it",
                    self.name,
                    content.reference()
                );
                content.free();
            }
        }
    }

    fn start_load(&mut self, slot: usize) {
        let Some(content) = self.ring.content(slot) else {
            return;
        };
        let request = LoadRequest {
            reference: content.reference().to_string(),
            media: content.media(),
            size: self.size,
        };
        let Some(tx) = self.commands.upgrade() else {
            return;
        };

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.ring.begin_loading(slot, ticket);

        log::debug!(
            "Producer '{}' loading {} into slot {}",
            self.name,
            request.reference,
            slot
        );
        let load = self.loader.request(request);
        tokio::spawn(async move {
            let result = load.await;
            let _ = tx.send(ProducerCommand::Loaded {
                slot,
                ticket,
                result,
            });
        });
    }

    fn on_success_production(&mut self, slot: usize, ticket: u64, loaded: Loaded) {
        match self.ring.complete(slot, ticket, loaded) {
            Ok(()) => self.serve_pending(),
            Err(_late) => {
                self.discarded += 1;
                log::debug!(
                    "Producer '{}' discarded a late load for slot {}",
                    self.name,
                    slot
                );
            }
        }
    }

    fn on_failed_production(&mut self, slot: usize, ticket: u64, error: PipelineError) {
        match self.ring.fail(slot, ticket) {
            Some(mut content) => {
                log::warn!(
                    "Producer '{}' failed to load {}: {}",
                    self.name,
                    content.reference(),
                    error
                );
                content.free();
                self.production_failed();
            }
            None => {
                self.discarded += 1;
                log::debug!(
                    "Producer '{}' ignored a stale load failure: {}",
                    self.name,
                    error
                );
            }
        }
    }

    /// Give the slot back to production, after the retry delay
    fn production_failed(&mut self) {
        self.failed += 1;
        self.to_be_produced += 1;
        self.arm_retry();
    }

    fn arm_retry(&mut self) {
        if self.retry_armed {
            return;
        }
        let Some(tx) = self.commands.upgrade() else {
            return;
        };
        self.retry_armed = true;
        let epoch = self.epoch;
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ProducerCommand::Retry { epoch });
        });
    }

    fn deliver(&mut self, reply: oneshot::Sender<Content>) {
        self.pending.push_back(reply);
        self.serve_pending();
    }

    /// Hand Ready items to waiting requests, oldest request first
    fn serve_pending(&mut self) {
        while let Some(reply) = self.pending.pop_front() {
            if reply.is_closed() {
                continue;
            }
            let Some(mut taken) = self.ring.take_ready() else {
                self.pending.push_front(reply);
                return;
            };

            let reference = taken.content.reference().to_string();
            match reply.send(taken.content) {
                Ok(()) => {
                    self.delivered += 1;
                    self.to_be_produced += 1;
                    log::debug!("Producer '{}' delivered {}", self.name, reference);
                    self.trigger();
                }
                Err(content) => {
                    taken.content = content;
                    self.ring.put_back(taken);
                }
            }
        }
    }

    fn flush(&mut self) {
        self.epoch += 1;
        self.retry_armed = false;

        let flushed = self.ring.flush();
        let count = flushed.len();
        for entry in flushed {
            let mut content = match entry {
                Flushed::Loading(content) => {
                    self.loader.abort(content.reference());
                    content
                }
                Flushed::Referenced(content) | Flushed::Ready(content) => content,
            };
            content.free();
        }

        self.to_be_produced = self.ring.capacity();
        log::info!("Producer '{}' flushed {} item(s)", self.name, count);
        self.trigger();
    }

    fn release_all(&mut self) {
        self.epoch += 1;
        for entry in self.ring.flush() {
            if let Flushed::Loading(content) = &entry {
                self.loader.abort(content.reference());
            }
            entry.into_content().free();
        }
        self.pending.clear();
    }

    fn stats(&self) -> ProducerStats {
        ProducerStats {
            name: self.name.clone(),
            kind: self.source.kind().to_string(),
            weight: self.weight,
            filter: self.filter.clone(),
            size: self.size,
            slots: self.ring.states(),
            pending: self.pending.iter().filter(|r| !r.is_closed()).count(),
            to_be_produced: self.to_be_produced,
            produced: self.produced,
            delivered: self.delivered,
            failed: self.failed,
            discarded: self.discarded,
            internal_errors: self.ring.internal_errors(),
        }
    }
}
