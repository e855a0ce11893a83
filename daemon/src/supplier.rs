//! The supplier: one virtual buffer over every registered producer.
//!
//! Each registration reserves `producer_buffer_size` slots. A slot is filled
//! by a background task awaiting the owning producer's `deliver()`; once
//! filled it stays occupied until a consumer takes the item. `supply()`
//! picks among occupied slots using the [`FairnessLedger`], and queues the
//! request in arrival order when nothing is occupied.
//!
//! Like producers, the supplier is a single task owning all of its state.
//! Every slot carries a flush epoch and fill tasks tag their results with
//! the epoch they were started in, so anything that arrives after its slot
//! was flushed is freed instead of buffered. Flushing one producer leaves
//! the other producers' slots and fills alone.

use crate::content::Content;
use crate::error::{PipelineError, Result};
use crate::log_and_continue;
use crate::producer::{Producer, validate_weight};
use crate::scheduler::FairnessLedger;
use common::{RegistrationStats, Size, SupplierStats};
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy)]
pub struct SupplierConfig {
    /// Virtual slots reserved per registered producer
    pub producer_buffer_size: usize,
    /// Target render size forwarded to every producer
    pub size: Size,
}

impl Default for SupplierConfig {
    fn default() -> Self {
        Self {
            producer_buffer_size: 1,
            size: Size::default(),
        }
    }
}

enum SupplierCommand {
    Register {
        producer: Producer,
        weight: f64,
        reply: oneshot::Sender<Size>,
    },
    Supply(oneshot::Sender<Content>),
    NewContent {
        slot: usize,
        epoch: u64,
        result: Result<Content>,
    },
    Flush {
        producer: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSize(Size),
    SetWeight {
        producer: String,
        weight: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    Producers(oneshot::Sender<Vec<Producer>>),
    Stats(oneshot::Sender<SupplierStats>),
    Shutdown,
}

/// Handle to the running supplier task
#[derive(Clone)]
pub struct Supplier {
    commands: mpsc::UnboundedSender<SupplierCommand>,
}

impl Supplier {
    /// Start the supplier task. Must be called from within a tokio runtime.
    pub fn spawn(config: SupplierConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = SupplierTask::new(config, tx.downgrade());
        tokio::spawn(task.run(rx));
        Self { commands: tx }
    }

    /// Add a producer and start filling its slots.
    ///
    /// The producer's current weight is read once here; later changes go
    /// through [`Supplier::set_weight`]. Returns the size the producer was
    /// told to render at.
    pub async fn register(&self, producer: Producer) -> Result<Size> {
        let weight = validate_weight(producer.stats().await?.weight)?;
        let (tx, rx) = oneshot::channel();
        self.send(SupplierCommand::Register {
            producer,
            weight,
            reply: tx,
        })?;
        rx.await.map_err(|_| PipelineError::SupplierClosed)
    }

    /// Forward a new target size to every producer. Does not flush.
    pub fn set_size(&self, width: u32, height: u32) -> Result<()> {
        self.send(SupplierCommand::SetSize(Size::new(width, height)))
    }

    /// Next item for the display loop, chosen by weighted fairness.
    ///
    /// Waits, in arrival order, while no slot is occupied.
    pub async fn supply(&self) -> Result<Content> {
        let (tx, rx) = oneshot::channel();
        self.send(SupplierCommand::Supply(tx))?;
        rx.await.map_err(|_| PipelineError::SupplierClosed)
    }

    /// Flush every producer and empty the virtual buffer
    pub async fn flush(&self) -> Result<()> {
        self.flush_request(None).await
    }

    /// Flush one producer and empty only its virtual slots
    pub async fn flush_producer(&self, name: &str) -> Result<()> {
        self.flush_request(Some(name.to_string())).await
    }

    async fn flush_request(&self, producer: Option<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SupplierCommand::Flush {
            producer,
            reply: tx,
        })?;
        rx.await.map_err(|_| PipelineError::SupplierClosed)?
    }

    /// Change a registered producer's weight, for scheduling and on the
    /// producer itself
    pub async fn set_weight(&self, producer: &str, weight: f64) -> Result<()> {
        let weight = validate_weight(weight)?;
        let (tx, rx) = oneshot::channel();
        self.send(SupplierCommand::SetWeight {
            producer: producer.to_string(),
            weight,
            reply: tx,
        })?;
        rx.await.map_err(|_| PipelineError::SupplierClosed)?
    }

    pub async fn producers(&self) -> Result<Vec<Producer>> {
        let (tx, rx) = oneshot::channel();
        self.send(SupplierCommand::Producers(tx))?;
        rx.await.map_err(|_| PipelineError::SupplierClosed)
    }

    pub async fn producer(&self, name: &str) -> Result<Producer> {
        self.producers()
            .await?
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| PipelineError::UnknownProducer(name.to_string()))
    }

    /// Supplier counters plus a snapshot of every producer
    pub async fn stats(&self) -> Result<SupplierStats> {
        let (tx, rx) = oneshot::channel();
        self.send(SupplierCommand::Stats(tx))?;
        let mut stats = rx.await.map_err(|_| PipelineError::SupplierClosed)?;

        for producer in self.producers().await? {
            match producer.stats().await {
                Ok(producer_stats) => stats.producers.push(producer_stats),
                Err(e) => log::warn!("No stats for producer '{}': {}", producer.name(), e),
            }
        }
        Ok(stats)
    }

    /// Stop the supplier and every registered producer
    pub fn shutdown(&self) {
        let _ = self.commands.send(SupplierCommand::Shutdown);
    }

    fn send(&self, command: SupplierCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PipelineError::SupplierClosed)
    }
}

struct Registration {
    producer: Producer,
    offset: usize,
}

struct VirtualSlot {
    owner: usize,
    content: Option<Content>,
    filling: Option<AbortHandle>,
    epoch: u64,
}

struct SupplierTask {
    commands: mpsc::WeakUnboundedSender<SupplierCommand>,
    registrations: Vec<Registration>,
    ledger: FairnessLedger,
    slots: Vec<VirtualSlot>,
    pending: VecDeque<oneshot::Sender<Content>>,
    producer_buffer_size: usize,
    size: Size,
}

impl SupplierTask {
    fn new(config: SupplierConfig, commands: mpsc::WeakUnboundedSender<SupplierCommand>) -> Self {
        Self {
            commands,
            registrations: Vec::new(),
            ledger: FairnessLedger::new(),
            slots: Vec::new(),
            pending: VecDeque::new(),
            producer_buffer_size: config.producer_buffer_size.max(1),
            size: config.size,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SupplierCommand>) {
        log::info!(
            "Supplier started ({} slot(s) per producer, size {})",
            self.producer_buffer_size,
            self.size
        );

        while let Some(command) = commands.recv().await {
            match command {
                SupplierCommand::Register {
                    producer,
                    weight,
                    reply,
                } => {
                    self.register(producer, weight);
                    let _ = reply.send(self.size);
                }
                SupplierCommand::Supply(reply) => self.supply(reply),
                SupplierCommand::NewContent {
                    slot,
                    epoch,
                    result,
                } => self.on_new_content(slot, epoch, result),
                SupplierCommand::Flush { producer, reply } => {
                    let result = self.flush(producer.as_deref()).await;
                    let _ = reply.send(result);
                }
                SupplierCommand::SetSize(size) => self.set_size(size),
                SupplierCommand::SetWeight {
                    producer,
                    weight,
                    reply,
                } => {
                    let _ = reply.send(self.set_weight(&producer, weight));
                }
                SupplierCommand::Producers(reply) => {
                    let _ = reply.send(
                        self.registrations
                            .iter()
                            .map(|r| r.producer.clone())
                            .collect(),
                    );
                }
                SupplierCommand::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                SupplierCommand::Shutdown => break,
            }
        }

        self.shutdown();
    }

    fn register(&mut self, producer: Producer, weight: f64) {
        if self.registrations.iter().any(|r| r.producer.name() == producer.name()) {
            log::warn!(
                "Producer '{}' registered twice; lookups by name find the first",
                producer.name()
            );
        }

        let owner = self.ledger.add(weight);
        let offset = self.slots.len();
        for _ in 0..self.producer_buffer_size {
            self.slots.push(VirtualSlot {
                owner,
                content: None,
                filling: None,
                epoch: 0,
            });
        }

        log_and_continue!(
            producer.set_size(self.size.width, self.size.height),
            "forward size to new producer"
        );
        log::info!(
            "Registered producer '{}' (weight {}, slots {}..{})",
            producer.name(),
            weight,
            offset,
            self.slots.len()
        );
        self.registrations.push(Registration { producer, offset });

        for index in offset..self.slots.len() {
            self.fill(index);
        }
    }

    /// Start a task that waits for the slot owner's next delivery
    fn fill(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.content.is_some() || slot.filling.is_some() {
            return;
        }
        let Some(tx) = self.commands.upgrade() else {
            return;
        };
        let Some(registration) = self.registrations.get(slot.owner) else {
            return;
        };

        let producer = registration.producer.clone();
        let epoch = slot.epoch;
        let task = tokio::spawn(async move {
            let result = producer.deliver().await;
            let _ = tx.send(SupplierCommand::NewContent {
                slot: index,
                epoch,
                result,
            });
        });
        slot.filling = Some(task.abort_handle());
    }

    fn on_new_content(&mut self, slot: usize, epoch: u64, result: Result<Content>) {
        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };
        if epoch != entry.epoch {
            if let Ok(mut content) = result {
                log::debug!("Freeing {} delivered before flush", content.reference());
                content.free();
            }
            return;
        }
        entry.filling = None;
        let owner = entry.owner;

        match result {
            Ok(content) => {
                self.ledger.count_produced(owner);
                match self.serve_pending(owner, content) {
                    Some(content) => self.slots[slot].content = Some(content),
                    None => self.fill(slot),
                }
            }
            Err(e) => log::warn!("Stopped filling slot {}: {}", slot, e),
        }
    }

    /// Hand fresh content to the oldest waiting consumer, if any.
    /// Gives the content back when nobody took it.
    fn serve_pending(&mut self, owner: usize, mut content: Content) -> Option<Content> {
        while let Some(reply) = self.pending.pop_front() {
            match reply.send(content) {
                Ok(()) => {
                    self.ledger.count_supply(owner);
                    return None;
                }
                Err(returned) => content = returned,
            }
        }
        Some(content)
    }

    fn supply(&mut self, reply: oneshot::Sender<Content>) {
        self.pending.retain(|r| !r.is_closed());
        if !self.pending.is_empty() {
            self.pending.push_back(reply);
            return;
        }

        let occupied = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.content.is_some())
            .map(|(index, s)| (index, s.owner));
        let Some(index) = self.ledger.pick(occupied) else {
            self.pending.push_back(reply);
            return;
        };

        let slot = &mut self.slots[index];
        let owner = slot.owner;
        let Some(content) = slot.content.take() else {
            return;
        };

        match reply.send(content) {
            Ok(()) => {
                self.ledger.count_supply(owner);
                self.fill(index);
            }
            Err(content) => self.slots[index].content = Some(content),
        }
    }

    /// Flush producers, then free and refill the virtual slots.
    ///
    /// With `only` set, just that producer and its slots are flushed.
    async fn flush(&mut self, only: Option<&str>) -> Result<()> {
        let targets: Vec<usize> = match only {
            Some(name) => {
                let index = self
                    .registrations
                    .iter()
                    .position(|r| r.producer.name() == name)
                    .ok_or_else(|| PipelineError::UnknownProducer(name.to_string()))?;
                vec![index]
            }
            None => (0..self.registrations.len()).collect(),
        };

        // Results of fills started before this point are stale
        for slot in &mut self.slots {
            if !targets.contains(&slot.owner) {
                continue;
            }
            slot.epoch += 1;
            if let Some(handle) = slot.filling.take() {
                handle.abort();
            }
        }

        let producers: Vec<Producer> = targets
            .iter()
            .map(|&i| self.registrations[i].producer.clone())
            .collect();
        for result in futures::future::join_all(producers.iter().map(|p| p.flush())).await {
            log_and_continue!(result, "flush producer");
        }

        let mut freed = 0;
        for slot in &mut self.slots {
            if targets.contains(&slot.owner)
                && let Some(mut content) = slot.content.take()
            {
                content.free();
                freed += 1;
            }
        }
        log::info!(
            "Flushed {} producer(s), freed {} buffered item(s)",
            producers.len(),
            freed
        );

        for index in 0..self.slots.len() {
            self.fill(index);
        }
        Ok(())
    }

    fn set_size(&mut self, size: Size) {
        self.size = size;
        for registration in &self.registrations {
            log_and_continue!(
                registration.producer.set_size(size.width, size.height),
                "forward size to producer"
            );
        }
        log::info!("Target size set to {}", size);
    }

    fn set_weight(&mut self, name: &str, weight: f64) -> Result<()> {
        let index = self
            .registrations
            .iter()
            .position(|r| r.producer.name() == name)
            .ok_or_else(|| PipelineError::UnknownProducer(name.to_string()))?;
        self.ledger.set_weight(index, weight);
        self.registrations[index].producer.set_weight(weight)?;
        log::info!("Producer '{}' weight set to {}", name, weight);
        Ok(())
    }

    fn stats(&self) -> SupplierStats {
        let registrations = self
            .registrations
            .iter()
            .zip(self.ledger.entries())
            .map(|(registration, entry)| RegistrationStats {
                name: registration.producer.name().to_string(),
                weight: entry.weight,
                offset: registration.offset,
                supplied: entry.supplied,
                batch: entry.batch,
                produced: entry.produced,
                total_supplied: entry.total_supplied,
                total_produced: entry.total_produced,
            })
            .collect();

        SupplierStats {
            size: self.size,
            total_weight: self.ledger.total_weight(),
            max_batch: self.ledger.max_batch(),
            fairness_resets: self.ledger.resets(),
            pending: self.pending.iter().filter(|r| !r.is_closed()).count(),
            occupied: self.slots.iter().map(|s| s.content.is_some()).collect(),
            registrations,
            producers: Vec::new(),
        }
    }

    fn shutdown(&mut self) {
        for slot in &mut self.slots {
            if let Some(handle) = slot.filling.take() {
                handle.abort();
            }
            if let Some(mut content) = slot.content.take() {
                content.free();
            }
        }
        for registration in &self.registrations {
            registration.producer.shutdown();
        }
        self.pending.clear();
        log::info!("Supplier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::ProducerConfig;
    use crate::testing::{GatedLoader, SequenceSource, wait_for};
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_producer(name: &str, weight: f64, source: Arc<SequenceSource>) -> Producer {
        Producer::spawn(
            ProducerConfig::new(name)
                .with_buffer_size(1)
                .with_weight(weight)
                .with_retry_delay(Duration::ZERO),
            source,
        )
    }

    async fn wait_until(supplier: &Supplier, condition: impl Fn(&SupplierStats) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if condition(&supplier.stats().await.unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("supplier condition not reached");
    }

    async fn all_occupied(supplier: &Supplier) {
        wait_until(supplier, |s| s.occupied.iter().all(|o| *o)).await;
    }

    #[tokio::test]
    async fn test_weighted_supply_ratio() {
        let supplier = Supplier::spawn(SupplierConfig::default());
        supplier
            .register(spawn_producer("a", 1.0, SequenceSource::instant("a")))
            .await
            .unwrap();
        supplier
            .register(spawn_producer("b", 2.0, SequenceSource::instant("b")))
            .await
            .unwrap();

        let mut counts = [0; 2];
        for _ in 0..150 {
            all_occupied(&supplier).await;
            let content = supplier.supply().await.unwrap();
            match content.producer() {
                "a" => counts[0] += 1,
                "b" => counts[1] += 1,
                other => panic!("unexpected producer {}", other),
            }
        }
        assert_eq!(counts, [50, 100]);

        let stats = supplier.stats().await.unwrap();
        assert_eq!(stats.total_weight, 3.0);
        assert_eq!(stats.fairness_resets, 50);
        assert_eq!(stats.registrations[0].total_supplied, 50);
        assert_eq!(stats.registrations[1].total_supplied, 100);
    }

    #[tokio::test]
    async fn test_register_forwards_size() {
        let supplier = Supplier::spawn(SupplierConfig {
            producer_buffer_size: 2,
            size: Size::new(1280, 720),
        });
        let producer = spawn_producer("a", 1.0, SequenceSource::instant("a"));

        let size = supplier.register(producer.clone()).await.unwrap();
        assert_eq!(size, Size::new(1280, 720));
        wait_for(&producer, |s| s.size == Size::new(1280, 720)).await;

        let stats = supplier.stats().await.unwrap();
        assert_eq!(stats.occupied.len(), 2);
        assert_eq!(stats.registrations[0].offset, 0);
        assert_eq!(stats.producers.len(), 1);

        supplier.set_size(640, 480).unwrap();
        wait_for(&producer, |s| s.size == Size::new(640, 480)).await;
    }

    #[tokio::test]
    async fn test_waiting_consumers_are_served_in_order() {
        let loader = GatedLoader::new();
        let source = SequenceSource::with_loader("a", loader.clone());
        let supplier = Supplier::spawn(SupplierConfig::default());
        supplier
            .register(spawn_producer("a", 1.0, source))
            .await
            .unwrap();

        let mut waiting = Vec::new();
        for expected in 1..=3 {
            let handle = supplier.clone();
            waiting.push(tokio::spawn(async move { handle.supply().await }));
            wait_until(&supplier, |s| s.pending == expected).await;
        }

        let mut received = Vec::new();
        for (index, request) in waiting.into_iter().enumerate() {
            loader.wait_for_requests(index + 1).await;
            loader.release(&format!("a-{}", index));
            received.push(request.await.unwrap().unwrap().reference().to_string());
        }
        assert_eq!(received, vec!["a-0", "a-1", "a-2"]);

        let stats = supplier.stats().await.unwrap();
        assert_eq!(stats.registrations[0].total_supplied, 3);
    }

    #[tokio::test]
    async fn test_flush_discards_buffered_content() {
        let first = SequenceSource::instant("a");
        let second = SequenceSource::instant("b");
        let supplier = Supplier::spawn(SupplierConfig::default());
        let a = spawn_producer("a", 1.0, first.clone());
        let b = spawn_producer("b", 1.0, second.clone());
        supplier.register(a.clone()).await.unwrap();
        supplier.register(b.clone()).await.unwrap();
        all_occupied(&supplier).await;
        wait_for(&a, |s| s.produced == 2).await;
        wait_for(&b, |s| s.produced == 2).await;

        let before: Vec<String> = ["a-0", "a-1", "b-0", "b-1"].map(String::from).to_vec();
        supplier.flush().await.unwrap();

        // Everything produced so far is released
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut freed = first.freed();
                freed.extend(second.freed());
                if before.iter().all(|r| freed.contains(r)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("pre-flush content was not freed");

        for _ in 0..4 {
            let content = supplier.supply().await.unwrap();
            assert!(
                !before.contains(&content.reference().to_string()),
                "{} survived the flush",
                content.reference()
            );
        }
    }

    #[tokio::test]
    async fn test_flush_single_producer() {
        let first = SequenceSource::instant("a");
        let second = SequenceSource::instant("b");
        let supplier = Supplier::spawn(SupplierConfig::default());
        let a = spawn_producer("a", 1.0, first.clone());
        let b = spawn_producer("b", 1.0, second.clone());
        supplier.register(a.clone()).await.unwrap();
        supplier.register(b.clone()).await.unwrap();
        all_occupied(&supplier).await;
        wait_for(&a, |s| s.produced == 2).await;
        wait_for(&b, |s| s.produced == 2).await;

        supplier.flush_producer("a").await.unwrap();
        assert!(second.freed().is_empty());
        assert!(first.freed().contains(&"a-0".to_string()));

        assert!(matches!(
            supplier.flush_producer("zzz").await,
            Err(PipelineError::UnknownProducer(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_single_producer_keeps_other_fills() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut task = SupplierTask::new(SupplierConfig::default(), tx.downgrade());
        let first = SequenceSource::with_loader("a", GatedLoader::new());
        let second = SequenceSource::with_loader("b", GatedLoader::new());
        task.register(spawn_producer("a", 1.0, first.clone()), 1.0);
        task.register(spawn_producer("b", 1.0, second.clone()), 1.0);
        assert!(task.slots.iter().all(|s| s.filling.is_some()));

        task.flush(Some("a")).await.unwrap();
        assert_eq!(task.slots[0].epoch, 1);
        assert_eq!(task.slots[1].epoch, 0);
        assert!(task.slots[1].filling.is_some());

        // A result for "a" started before the flush is stale
        task.on_new_content(0, 0, Ok(first.make("a-late", "a")));
        assert!(task.slots[0].content.is_none());
        assert_eq!(first.freed().iter().filter(|r| *r == "a-late").count(), 1);

        // "b" was not flushed, so its in-transit item is kept
        task.on_new_content(1, 0, Ok(second.make("b-0", "b")));
        assert_eq!(
            task.slots[1].content.as_ref().map(|c| c.reference()),
            Some("b-0")
        );
        assert!(second.freed().is_empty());
        assert_eq!(task.ledger.entry(1).unwrap().total_produced, 1);
    }

    #[tokio::test]
    async fn test_set_weight() {
        let supplier = Supplier::spawn(SupplierConfig::default());
        let producer = spawn_producer("a", 1.0, SequenceSource::instant("a"));
        supplier.register(producer.clone()).await.unwrap();

        supplier.set_weight("a", 3.0).await.unwrap();
        let stats = supplier.stats().await.unwrap();
        assert_eq!(stats.registrations[0].weight, 3.0);
        assert_eq!(stats.total_weight, 3.0);
        wait_for(&producer, |s| s.weight == 3.0).await;

        assert!(matches!(
            supplier.set_weight("zzz", 1.0).await,
            Err(PipelineError::UnknownProducer(_))
        ));
        assert!(matches!(
            supplier.set_weight("a", -2.0).await,
            Err(PipelineError::InvalidWeight(_))
        ));
    }

    #[tokio::test]
    async fn test_producer_lookup() {
        let supplier = Supplier::spawn(SupplierConfig::default());
        supplier
            .register(spawn_producer("a", 1.0, SequenceSource::instant("a")))
            .await
            .unwrap();

        assert_eq!(supplier.producer("a").await.unwrap().name(), "a");
        assert!(matches!(
            supplier.producer("b").await,
            Err(PipelineError::UnknownProducer(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_producers() {
        let source = SequenceSource::instant("a");
        let supplier = Supplier::spawn(SupplierConfig::default());
        let producer = spawn_producer("a", 1.0, source.clone());
        supplier.register(producer.clone()).await.unwrap();
        all_occupied(&supplier).await;

        supplier.shutdown();
        assert!(matches!(
            supplier.supply().await,
            Err(PipelineError::SupplierClosed)
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while producer.stats().await.is_ok() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("producer still running");
    }
}
