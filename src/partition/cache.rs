//! SHARDLINE - Write Cache
//! Latest not-yet-applied write per key. Reads consult it before the engine,
//! and the resolver sees it as the current value.

use dashmap::DashMap;

use crate::types::{Key, PendingWrite, Sequence, Value};

/// Concurrent map from key to its newest pending write.
pub struct WriteCache {
    entries: DashMap<Key, PendingWrite>,
}

impl WriteCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<PendingWrite> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Value of the pending write for `key`.
    pub fn value(&self, key: &[u8]) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().value.clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Install `record` unless a newer write for the key is already cached.
    ///
    /// Returns the record it replaced, so a failed publish can put it back.
    pub fn install(&self, record: PendingWrite) -> Option<PendingWrite> {
        let mut previous = None;
        self.entries
            .entry(record.key.clone())
            .and_modify(|current| {
                if record.sequence > current.sequence {
                    previous = Some(std::mem::replace(current, record.clone()));
                }
            })
            .or_insert_with(|| record.clone());
        previous
    }

    /// Undo the install of the write at `sequence`, restoring `previous` if there was one.
    pub fn rollback(&self, key: &Key, sequence: Sequence, previous: Option<PendingWrite>) {
        match previous {
            Some(previous) => {
                if let Some(mut current) = self.entries.get_mut(key) {
                    if current.sequence == sequence {
                        *current = previous;
                    }
                }
            }
            None => {
                self.entries.remove_if(key, |_, current| current.sequence == sequence);
            }
        }
    }

    /// Drop the cached write for `key` once `applied` covers it.
    ///
    /// A newer pending write for the same key stays cached.
    pub fn evict_applied(&self, key: &[u8], applied: Sequence) -> bool {
        self.entries
            .remove_if(key, |_, current| current.sequence <= applied)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for WriteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn write(key: &'static str, seq: Sequence, value: &'static str) -> PendingWrite {
        PendingWrite::new(
            Bytes::from_static(key.as_bytes()),
            0,
            seq,
            Bytes::from_static(value.as_bytes()),
            false,
        )
    }

    #[test]
    fn test_later_sequence_wins() {
        let cache = WriteCache::new();
        assert!(cache.install(write("k", 1, "v1")).is_none());
        let replaced = cache.install(write("k", 2, "v2")).unwrap();
        assert_eq!(replaced.sequence, 1);
        assert_eq!(cache.value(b"k"), Some(Bytes::from_static(b"v2")));

        // An older write never displaces a newer one.
        cache.install(write("k", 1, "stale"));
        assert_eq!(cache.get(b"k").unwrap().sequence, 2);
    }

    #[test]
    fn test_evict_only_when_applied() {
        let cache = WriteCache::new();
        cache.install(write("k", 5, "v"));
        assert!(!cache.evict_applied(b"k", 4));
        assert!(cache.contains(b"k"));
        assert!(cache.evict_applied(b"k", 5));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rollback() {
        let cache = WriteCache::new();
        cache.install(write("k", 1, "old"));
        let previous = cache.install(write("k", 2, "new"));
        cache.rollback(&Bytes::from_static(b"k"), 2, previous);
        assert_eq!(cache.value(b"k"), Some(Bytes::from_static(b"old")));

        let none = cache.install(write("fresh", 3, "x"));
        cache.rollback(&Bytes::from_static(b"fresh"), 3, none);
        assert!(!cache.contains(b"fresh"));
    }
}
