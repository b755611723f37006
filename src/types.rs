//! SHARDLINE - Core Type Definitions
//! Fundamental types shared by partitions, the write cache, and the sequence log.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Key type. Equality and hashing are byte-for-byte.
pub type Key = Bytes;

/// Value type.
pub type Value = Bytes;

/// Identifier of a partition (shard) assigned by the coordinator.
pub type PartitionId = u64;

/// Per-partition write sequence number. Zero means "nothing written yet".
pub type Sequence = u64;

/// A write that has been assigned a sequence number and handed to the log.
///
/// Lives in the write cache until the applied watermark passes its sequence
/// or a newer record for the same key replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub key: Key,
    pub partition_id: PartitionId,
    pub sequence: Sequence,
    pub value: Value,
    pub needs_callback: bool,
}

impl PendingWrite {
    /// Create a new record.
    pub fn new(
        key: Key,
        partition_id: PartitionId,
        sequence: Sequence,
        value: Value,
        needs_callback: bool,
    ) -> Self {
        Self {
            key,
            partition_id,
            sequence,
            value,
            needs_callback,
        }
    }
}

/// Ownership state of a partition on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartitionState {
    Absent = 0,
    Bootstrapping = 1,
    Online = 2,
    Offline = 3,
}

impl PartitionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PartitionState::Bootstrapping,
            2 => PartitionState::Online,
            3 => PartitionState::Offline,
            _ => PartitionState::Absent,
        }
    }

    /// Whether lookups may be served in this state.
    pub fn is_readable(self) -> bool {
        matches!(self, PartitionState::Bootstrapping | PartitionState::Online)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Absent => "absent",
            PartitionState::Bootstrapping => "bootstrapping",
            PartitionState::Online => "online",
            PartitionState::Offline => "offline",
        };
        f.write_str(name)
    }
}
