//! Common types and utilities for Vitrine.
//!
//! This crate defines the shared data structures and IPC protocol used for
//! communication between the daemon (`vitrine`) and the client (`vtctl`),
//! plus the read-only diagnostics snapshots the content pipeline exposes.
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using JSON-serialized
//! messages, one per line. The client sends [`Command`] variants and receives
//! [`Response`] variants.
//!
//! # Examples
//!
//! ```no_run
//! use common::{Command, FilterSpec};
//!
//! // Only keep references containing "beach" and refresh the buffers
//! let cmd = Command::SetFilter {
//!     producer: "photos".to_string(),
//!     filter: FilterSpec::include("beach"),
//!     flush: true,
//! };
//!
//! let json = serde_json::to_string(&cmd).unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Common error types shared between client and daemon.
///
/// All errors are serializable for transmission over IPC.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum VitrineError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for VitrineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for VitrineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ipc(e.to_string())
    }
}

/// Commands sent from client to daemon via IPC.
#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    /// Ping the daemon
    Ping,
    /// Query daemon status and the item currently on screen
    Query,
    /// Pipeline diagnostics: supplier counters and every producer's slots
    Stats,
    /// Skip to the next item now
    Next,
    /// Drop everything buffered and restart production from empty
    Flush,
    /// Replace a producer's include/exclude filter.
    ///
    /// The filter only applies to newly produced content. Set `flush` to
    /// drop what is already buffered.
    SetFilter {
        producer: String,
        filter: FilterSpec,
        flush: bool,
    },
    /// Change a producer's share of the supply
    SetWeight { producer: String, weight: f64 },
    /// Change the target render size
    SetSize { width: u32, height: u32 },
    /// Kill the daemon
    Kill,
}

/// Response from daemon to client
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(VitrineError),
    Status(DaemonStatus),
    Stats(SupplierStats),
    Pong,
}

/// Daemon status information
#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    /// Number of items the slideshow has put on screen
    pub shown: u64,
    pub current: Option<ContentInfo>,
}

/// Kind of media a content reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaKind {
    #[default]
    Image,
    Video,
}

impl MediaKind {
    pub fn name(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Display metadata of one content item, as reported over IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentInfo {
    pub reference: String,
    pub original_reference: Option<String>,
    pub media: MediaKind,
    pub producer: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Origin date in `YYYY-MM-DD` form
    pub date: Option<String>,
    pub link: Option<String>,
}

/// Target render size handed to producers and loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Size {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Include/exclude filter applied to content references.
///
/// Only one filter is active at a time: setting an include filter replaces
/// an exclude filter and vice versa. Matching is a plain substring test
/// against the reference (path or URL). An empty pattern means no filter.
///
/// # Examples
///
/// ```
/// use common::FilterSpec;
///
/// let filter = FilterSpec::exclude("/private/");
/// assert!(filter.accepts("/home/me/Pictures/sea.jpg"));
/// assert!(!filter.accepts("/home/me/private/me.jpg"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterSpec {
    #[default]
    None,
    Include(String),
    Exclude(String),
}

impl FilterSpec {
    pub fn include(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if pattern.is_empty() {
            Self::None
        } else {
            Self::Include(pattern)
        }
    }

    pub fn exclude(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if pattern.is_empty() {
            Self::None
        } else {
            Self::Exclude(pattern)
        }
    }

    /// Whether a reference passes this filter
    pub fn accepts(&self, reference: &str) -> bool {
        match self {
            Self::None => true,
            Self::Include(pattern) => reference.contains(pattern.as_str()),
            Self::Exclude(pattern) => !reference.contains(pattern.as_str()),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Include(pattern) => write!(f, "include '{}'", pattern),
            Self::Exclude(pattern) => write!(f, "exclude '{}'", pattern),
        }
    }
}

/// State of one producer buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Empty,
    Referenced,
    Loading,
    Ready,
}

impl SlotState {
    /// Single character used by `vtctl stats` to draw a slot row
    pub fn glyph(&self) -> char {
        match self {
            SlotState::Empty => '.',
            SlotState::Referenced => 'r',
            SlotState::Loading => 'L',
            SlotState::Ready => '#',
        }
    }
}

/// Diagnostics snapshot of one producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerStats {
    pub name: String,
    pub kind: String,
    pub weight: f64,
    pub filter: FilterSpec,
    pub size: Size,
    pub slots: Vec<SlotState>,
    /// Consumers waiting on `deliver()`
    pub pending: usize,
    /// Slots that still need a `produce()` call
    pub to_be_produced: usize,
    /// Items placed into the buffer
    pub produced: u64,
    /// Items handed out through `deliver()`
    pub delivered: u64,
    /// Failed productions and loads
    pub failed: u64,
    /// Late results dropped after a flush
    pub discarded: u64,
    /// Internal invariant violations (content produced with no room left)
    pub internal_errors: u64,
}

impl ProducerStats {
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| **s == state).count()
    }
}

/// Fairness counters the supplier keeps for one registered producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationStats {
    pub name: String,
    pub weight: f64,
    /// First slot of this producer in the supplier's virtual buffer
    pub offset: usize,
    /// Supplied in the current fairness window
    pub supplied: u64,
    /// Weight-normalized supplied batches in the current window
    pub batch: f64,
    /// Produced into the supplier buffer in the current window
    pub produced: u64,
    pub total_supplied: u64,
    pub total_produced: u64,
}

/// Diagnostics snapshot of the supplier and all its producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierStats {
    pub size: Size,
    pub total_weight: f64,
    pub max_batch: f64,
    /// Number of times the fairness window was restarted
    pub fairness_resets: u64,
    /// Consumers waiting on `supply()`
    pub pending: usize,
    /// Occupancy of the virtual buffer, one entry per slot
    pub occupied: Vec<bool>,
    pub registrations: Vec<RegistrationStats>,
    pub producers: Vec<ProducerStats>,
}

/// Get the IPC socket path
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("vitrine.sock")
}
