//! SHARDLINE - Error Types
//! Defines the error hierarchy shared by partitions, the engine, and the log client.

use thiserror::Error;

use crate::types::{PartitionId, Sequence};

/// Custom Result type for the node.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Error types for a shardline node.
#[derive(Error, Debug)]
pub enum ShardError {
    /// I/O errors from engine or log files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors while writing records.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored bytes could not be decoded (CRC mismatch, bad envelope).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// No partition with this id is registered on the node.
    #[error("Partition {0} is not owned by this node")]
    PartitionNotOwned(PartitionId),

    /// The partition cannot assign sequence numbers (still bootstrapping).
    #[error("Partition {0} cannot assign sequence numbers yet")]
    SequenceUnavailable(PartitionId),

    /// The partition has been released or its engine handle is closed.
    #[error("Partition {0} is offline")]
    PartitionOffline(PartitionId),

    /// A store waited longer than the configured ceiling for the apply path.
    #[error("Backpressure timeout on partition {partition}: sequence {sequence}, applied {applied}")]
    BackpressureTimeout {
        partition: PartitionId,
        sequence: Sequence,
        applied: Sequence,
    },

    /// Append-log transport failure.
    #[error("Log transport error: {0}")]
    Transport(String),

    /// Partition bootstrap could not complete.
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// The node no longer accepts ownership changes.
    #[error("Node is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShardError::Io(_)
                | ShardError::Transport(_)
                | ShardError::SequenceUnavailable(_)
                | ShardError::PartitionOffline(_)
                | ShardError::PartitionNotOwned(_)
                | ShardError::BackpressureTimeout { .. }
        )
    }

    /// Whether the error signals damaged data rather than an operational hiccup.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ShardError::Corruption(_))
    }
}

impl From<bincode::Error> for ShardError {
    fn from(err: bincode::Error) -> Self {
        ShardError::Serialization(err.to_string())
    }
}
