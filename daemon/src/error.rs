//! Error types for the content pipeline.

use thiserror::Error;

/// Result type alias using the pipeline's error.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by producers, loaders and the supplier.
///
/// Production and load failures never reach the consumer: the producer
/// discards the slot and asks its source for something else. Only channel
/// closure and bad runtime requests surface through the public handles.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The producer's scheduler task is gone.
    #[error("producer '{0}' is closed")]
    Closed(String),

    /// The supplier's scheduler task is gone.
    #[error("supplier is closed")]
    SupplierClosed,

    #[error("unknown producer: {0}")]
    UnknownProducer(String),

    #[error("invalid weight {0} (must be a positive number)")]
    InvalidWeight(f64),

    /// The source has content, but none of it passes the active filter.
    #[error("no content matches the active filter ({0})")]
    NoMatch(String),

    /// The source has nothing to offer at all.
    #[error("source is empty: {0}")]
    Exhausted(String),

    /// The loader was told to abort this reference.
    #[error("load aborted: {0}")]
    Aborted(String),

    #[error("load failed for {reference}: {reason}")]
    Load { reference: String, reason: String },

    #[error("feed error: {0}")]
    Feed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn load(reference: impl Into<String>, reason: impl ToString) -> Self {
        Self::Load {
            reference: reference.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<PipelineError> for common::VitrineError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::UnknownProducer(name) => Self::NotFound(name),
            PipelineError::InvalidWeight(_) => Self::InvalidArgument(e.to_string()),
            other => Self::Pipeline(other.to_string()),
        }
    }
}
