//! SHARDLINE - Sequence Log
//! Ordered, per-partition append log that carries writes from `store()` to
//! the apply path of every replica.
//!
//! ## Contract
//! - One topic per partition: `topic_prefix + partition_id`.
//! - Records are delivered in publish order, at least once.
//! - Consumers must tolerate redelivery; the apply path skips records at or
//!   below the applied watermark.

pub mod applier;
pub mod broker;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{PartitionId, PendingWrite, Sequence};

/// Append-log transport (broker client).
pub trait LogTransport: Send + Sync {
    /// Append `record` to `topic`.
    fn publish(&self, topic: &str, record: &PendingWrite) -> Result<()>;

    /// Read `topic` starting at the first record with a sequence above `after`.
    fn subscribe(&self, topic: &str, after: Sequence) -> Result<Box<dyn LogSubscription>>;

    /// Highest sequence published to `topic`, or 0 for an empty topic.
    fn last_sequence(&self, topic: &str) -> Result<Sequence>;

    /// Drop records at or below `upto`; every consumer has applied them.
    /// Transports without retention control keep everything.
    fn trim(&self, topic: &str, upto: Sequence) -> Result<()> {
        let _ = (topic, upto);
        Ok(())
    }
}

/// Cursor over one topic.
pub trait LogSubscription: Send {
    /// Next record, waiting up to `timeout` for one to arrive.
    fn poll(&mut self, timeout: Duration) -> Result<Option<PendingWrite>>;
}

/// Partition-aware publisher over a [`LogTransport`].
#[derive(Clone)]
pub struct SequenceLogClient {
    transport: Arc<dyn LogTransport>,
    topic_prefix: String,
}

impl SequenceLogClient {
    pub fn new(transport: Arc<dyn LogTransport>, topic_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// Topic carrying writes of `partition`.
    pub fn topic(&self, partition: PartitionId) -> String {
        format!("{}{}", self.topic_prefix, partition)
    }

    /// Publish a record to its partition's topic.
    pub fn publish(&self, record: &PendingWrite) -> Result<()> {
        let topic = self.topic(record.partition_id);
        log::debug!(
            "publishing seq {} of partition {} to {}",
            record.sequence,
            record.partition_id,
            topic
        );
        self.transport.publish(&topic, record)
    }

    pub fn subscribe(
        &self,
        partition: PartitionId,
        after: Sequence,
    ) -> Result<Box<dyn LogSubscription>> {
        self.transport.subscribe(&self.topic(partition), after)
    }

    pub fn last_sequence(&self, partition: PartitionId) -> Result<Sequence> {
        self.transport.last_sequence(&self.topic(partition))
    }

    pub fn trim(&self, partition: PartitionId, upto: Sequence) -> Result<()> {
        self.transport.trim(&self.topic(partition), upto)
    }
}
