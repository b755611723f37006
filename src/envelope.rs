//! SHARDLINE - Value Envelope Codec
//! The blob persisted in the engine: the value together with the sequence
//! number of the write that produced it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::types::{Sequence, Value};

/// Value plus the sequence number it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEnvelope {
    pub value: Value,
    pub sequence: Sequence,
}

impl ValueEnvelope {
    pub fn new(value: Value, sequence: Sequence) -> Self {
        Self { value, sequence }
    }

    /// Encode into the opaque engine representation.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode an engine blob. Failure is reported as corruption, never as not-found.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| ShardError::Corruption(format!("undecodable value envelope: {}", e)))
    }
}
