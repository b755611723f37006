//! SHARDLINE - MemTable (In-Memory Sorted Map)
//! Serving copy of a partition's applied state, rebuilt from its write log on open.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::types::Key;

/// Sorted map from key to the latest encoded value envelope.
pub struct MemTable {
    entries: BTreeMap<Key, Bytes>,
    /// Approximate size of keys plus envelopes in bytes.
    size_bytes: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the envelope stored under `key`.
    pub fn insert(&mut self, key: Key, envelope: Bytes) {
        let added = key.len() + envelope.len();
        if let Some(old) = self.entries.get(&key) {
            self.size_bytes = self.size_bytes.saturating_sub(key.len() + old.len());
        }
        self.size_bytes += added;
        self.entries.insert(key, envelope);
    }

    /// Get the envelope stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Bytes)> {
        self.entries.iter()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
