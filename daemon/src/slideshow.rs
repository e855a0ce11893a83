//! Display loop: takes content from the supplier and keeps one item on
//! screen.
//!
//! Rendering itself belongs to whoever installs hooks on the content. The
//! loop only drives the lifecycle: `attach` and `start` the new item, then
//! release the previous one, whose `free` stops it.

use crate::DaemonState;
use crate::content::Content;
use crate::error::Result;
use crate::supplier::Supplier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Requests from the IPC server to the display loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideshowCommand {
    /// Skip to the next item now
    Next,
}

pub struct Slideshow {
    supplier: Supplier,
    current: Option<Content>,
    shown: u64,
}

impl Slideshow {
    pub fn new(supplier: Supplier) -> Self {
        Self {
            supplier,
            current: None,
            shown: 0,
        }
    }

    /// Put the next supplied item on screen and release the previous one
    pub async fn advance(&mut self) -> Result<&Content> {
        let mut next = self.supplier.supply().await?;
        next.attach();
        next.start();
        self.shown += 1;

        let previous = self.current.take();
        let current = self.current.insert(next);
        if let Some(mut previous) = previous {
            previous.free();
        }
        Ok(&*current)
    }

    pub fn current(&self) -> Option<&Content> {
        self.current.as_ref()
    }

    /// Number of items put on screen so far
    pub fn shown(&self) -> u64 {
        self.shown
    }

    /// Release whatever is on screen
    pub fn clear(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.free();
        }
    }
}

/// Advance every `interval`, or immediately on [`SlideshowCommand::Next`],
/// until the daemon exits or the supplier closes
pub async fn run(
    mut slideshow: Slideshow,
    interval: Duration,
    state: Arc<Mutex<DaemonState>>,
    mut commands: mpsc::UnboundedReceiver<SlideshowCommand>,
) -> anyhow::Result<()> {
    loop {
        if state.lock().await.should_exit {
            break;
        }

        let info = match slideshow.advance().await {
            Ok(content) => {
                log::info!(
                    "Showing {} from '{}'",
                    content.reference(),
                    content.producer()
                );
                content.info()
            }
            Err(e) => {
                log::error!("Slideshow stopped: {}", e);
                break;
            }
        };

        {
            let mut state = state.lock().await;
            state.current = Some(info);
            state.shown = slideshow.shown();
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            command = commands.recv() => match command {
                Some(SlideshowCommand::Next) => log::debug!("Skipping to next item"),
                None => break,
            },
        }
    }

    slideshow.clear();
    state.lock().await.current = None;
    Ok(())
}
