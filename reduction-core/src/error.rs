//! Error types for the reduction core

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Command rejected by validation (non-positive amount, malformed payload)
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Identifier is empty or contains the id separator
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Entity has not been created yet
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Progress reported by a child the node never created
    #[error("Unknown child {child} for node {node}")]
    UnknownChild {
        /// Receiving node
        node: String,
        /// Reporting child
        child: String,
    },

    /// Invariant violation (sequence gap, negative availability, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry or encoding error
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Whether redelivering the same command may succeed later.
    ///
    /// Rejections (invalid ids, amounts, unknown children) are caller-correctable
    /// and never retried; storage hiccups, closed mailboxes and commands that
    /// arrive ahead of the entity's creation are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Concurrency(_) | Error::Io(_) | Error::EntityNotFound(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
