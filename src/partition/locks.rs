//! SHARDLINE - Key Lock Table
//! Fixed array of mutexes serializing the read-resolve-publish sequence of
//! callback writes. A key maps to `crc32(key) mod N`; keys sharing a bucket
//! contend with each other, which is accepted in exchange for a bounded table.

use parking_lot::{Mutex, MutexGuard};

pub struct KeyLockTable {
    buckets: Vec<Mutex<()>>,
}

impl KeyLockTable {
    /// Table with `size` buckets (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            buckets: (0..size).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Bucket index of `key`.
    pub fn bucket(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.buckets.len()
    }

    /// Lock the bucket of `key` until the guard is dropped.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.buckets[self.bucket(key)].lock()
    }
}
