//! SHARDLINE - Partition Directory
//! Shared map from partition id to the live partition on this node. Written
//! only by the lifecycle, read by every request.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Result, ShardError};
use crate::partition::Partition;
use crate::types::PartitionId;

/// Cheap-to-clone handle to the node's partition map.
#[derive(Clone, Default)]
pub struct PartitionDirectory {
    partitions: Arc<DashMap<PartitionId, Arc<Partition>>>,
}

impl PartitionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The partition registered under `id`, or `PartitionNotOwned`.
    pub fn get(&self, id: PartitionId) -> Result<Arc<Partition>> {
        self.partitions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ShardError::PartitionNotOwned(id))
    }

    pub fn contains(&self, id: PartitionId) -> bool {
        self.partitions.contains_key(&id)
    }

    /// Register a partition, returning the one it replaced.
    pub(crate) fn insert(&self, partition: Arc<Partition>) -> Option<Arc<Partition>> {
        self.partitions.insert(partition.id(), partition)
    }

    /// Unregister `partition`, but only if it is still the registered instance.
    pub(crate) fn remove(&self, partition: &Arc<Partition>) -> bool {
        self.partitions
            .remove_if(&partition.id(), |_, current| Arc::ptr_eq(current, partition))
            .is_some()
    }

    /// Registered ids, ascending.
    pub fn ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
