//! Error types for the relay bus

use thiserror::Error;

/// Relay bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Entity runtime error
    #[error("Core error: {0}")]
    Core(#[from] reduction_core::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Dead letter cannot be resubmitted
    #[error("Not reprocessable: {0}")]
    NotReprocessable(String),

    /// Request reuses an id with different parameters
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Metrics encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bounded wait expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Event stream or outcome channel closed
    #[error("Channel closed: {0}")]
    Closed(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
