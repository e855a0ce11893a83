//! Vitrine's content supply pipeline.
//!
//! Producers turn content sources into bounded buffers of loaded items, and
//! the supplier hands those items to the slideshow in proportion to each
//! producer's weight.

pub mod buffer;
pub mod config;
pub mod content;
pub mod error;
pub mod ipc_server;
pub mod loader;
mod macros;
pub mod producer;
pub mod scheduler;
pub mod slideshow;
pub mod sources;
pub mod supplier;

#[cfg(test)]
mod testing;

pub use content::{Content, ContentHooks, RenderKind, Renderable};
pub use error::{PipelineError, Result};
pub use producer::{Producer, ProducerConfig};
pub use supplier::{Supplier, SupplierConfig};

use common::ContentInfo;
use config::Config;
use std::time::Instant;

/// Shared daemon state
pub struct DaemonState {
    pub should_exit: bool,
    pub start_time: Instant,
    /// Item currently on screen
    pub current: Option<ContentInfo>,
    pub shown: u64,
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            should_exit: false,
            start_time: Instant::now(),
            current: None,
            shown: 0,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the supplier and one producer per `[[producer]]` entry
pub async fn build_pipeline(config: &Config) -> anyhow::Result<Supplier> {
    let supplier = Supplier::spawn(SupplierConfig {
        producer_buffer_size: config.general.producer_buffer_size,
        size: config.general.size(),
    });

    let client = reqwest::Client::builder()
        .user_agent(concat!("vitrine/", env!("CARGO_PKG_VERSION")))
        .build()?;

    for settings in &config.producer {
        let source = sources::from_settings(settings, &client)?;
        let producer = Producer::spawn(
            ProducerConfig::from_settings(settings, &config.general),
            source,
        );
        let size = supplier.register(producer).await?;
        log::info!(
            "Producer '{}' ({}) ready at {}",
            settings.name,
            settings.kind,
            size
        );
    }

    Ok(supplier)
}
