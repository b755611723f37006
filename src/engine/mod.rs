//! SHARDLINE - Persistent Engine Adapter
//! Narrow get/put interface over the local storage that holds the latest
//! applied value envelope per key, one set of files per partition.

pub mod memtable;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::types::{Key, PartitionId};
use crate::wal::WriteAheadLog;

use self::memtable::MemTable;

const WAL_FILE: &str = "engine.wal";

/// Storage engine seen by partitions and the apply loop.
///
/// Values are opaque encoded envelopes; `put` is durable once it returns.
pub trait PersistentEngine: Send + Sync {
    /// Open (or recover) the files of a partition. Opening an open partition is a no-op.
    fn open_partition(&self, partition: PartitionId) -> Result<()>;

    /// Read the envelope stored under `key`.
    fn get(&self, key: &[u8], partition: PartitionId) -> Result<Option<Bytes>>;

    /// Store `envelope` under `key`, replacing any previous one.
    fn put(&self, key: Key, partition: PartitionId, envelope: Bytes) -> Result<()>;

    /// All keys and envelopes of a partition in key order.
    fn entries(&self, partition: PartitionId) -> Result<Vec<(Key, Bytes)>>;

    /// Release the handle of one partition. Closing a closed partition is a no-op.
    fn close_partition(&self, partition: PartitionId) -> Result<()>;

    /// Release every handle; later calls fail.
    fn close(&self) -> Result<()>;
}

/// One frame of a partition's write log.
#[derive(Serialize, Deserialize)]
struct EngineRecord {
    key: Key,
    envelope: Bytes,
}

/// Open handle of one partition: replayed state plus its write log.
struct PartitionFiles {
    memtable: MemTable,
    wal: WriteAheadLog,
}

/// File-backed engine.
///
/// ## Layout
/// ```text
/// <root>/partition-00003/engine.wal
/// ```
/// Each `put` is appended to the partition's write log before the in-memory
/// table is updated, so a reopened partition replays to the same state.
pub struct FileEngine {
    root: PathBuf,
    sync_writes: bool,
    partitions: RwLock<HashMap<PartitionId, Arc<Mutex<PartitionFiles>>>>,
    /// Per-partition guard held while its log is replayed, outside `partitions`.
    opening: Mutex<HashMap<PartitionId, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl FileEngine {
    /// Open an engine rooted at `root`. Partitions are opened individually.
    pub fn open(root: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        log::info!("file engine opened at {:?}", root);

        Ok(Self {
            root,
            sync_writes,
            partitions: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Ids of partitions with an open handle, ascending.
    pub fn open_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn partition_dir(&self, partition: PartitionId) -> PathBuf {
        self.root.join(format!("partition-{:05}", partition))
    }

    fn open_gate(&self, partition: PartitionId) -> Arc<Mutex<()>> {
        self.opening.lock().entry(partition).or_default().clone()
    }

    fn handle(&self, partition: PartitionId) -> Result<Arc<Mutex<PartitionFiles>>> {
        self.partitions
            .read()
            .get(&partition)
            .cloned()
            .ok_or(ShardError::PartitionOffline(partition))
    }

    fn replay(&self, dir: &Path) -> Result<PartitionFiles> {
        let path = dir.join(WAL_FILE);
        let (wal, frames) = WriteAheadLog::open(path.clone(), self.sync_writes)?;

        let mut memtable = MemTable::new();
        let replayed = frames.len();
        for frame in frames {
            let record: EngineRecord = bincode::deserialize(&frame).map_err(|e| {
                ShardError::Corruption(format!("engine record in {:?}: {}", path, e))
            })?;
            memtable.insert(record.key, record.envelope);
        }

        // Superseded frames dominate the log: rewrite it with live entries only.
        if replayed > 2 * memtable.len() + 64 {
            drop(wal);
            let wal = self.rewrite(dir, &memtable)?;
            log::info!(
                "compacted {:?}: {} frames -> {} entries",
                wal.path(),
                replayed,
                memtable.len()
            );
            return Ok(PartitionFiles { memtable, wal });
        }

        log::debug!(
            "replayed {:?}: {} entries, {} bytes",
            path,
            memtable.len(),
            memtable.size()
        );
        Ok(PartitionFiles { memtable, wal })
    }

    fn rewrite(&self, dir: &Path, memtable: &MemTable) -> Result<WriteAheadLog> {
        let tmp = dir.join(format!("{}.compact", WAL_FILE));
        let _ = std::fs::remove_file(&tmp);
        {
            let (mut fresh, _) = WriteAheadLog::open(tmp.clone(), self.sync_writes)?;
            for (key, envelope) in memtable.iter() {
                let payload = bincode::serialize(&EngineRecord {
                    key: key.clone(),
                    envelope: envelope.clone(),
                })?;
                fresh.append(&payload)?;
            }
        }
        let path = dir.join(WAL_FILE);
        std::fs::rename(&tmp, &path)?;
        let (wal, _) = WriteAheadLog::open(path, self.sync_writes)?;
        Ok(wal)
    }
}

impl PersistentEngine for FileEngine {
    fn open_partition(&self, partition: PartitionId) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShardError::ShuttingDown);
        }

        // Replay runs under the partition's own gate, not the map lock.
        let gate = self.open_gate(partition);
        let _opening = gate.lock();
        if self.partitions.read().contains_key(&partition) {
            return Ok(());
        }

        let dir = self.partition_dir(partition);
        std::fs::create_dir_all(&dir)?;
        let files = self.replay(&dir)?;
        let keys = files.memtable.len();

        {
            let mut partitions = self.partitions.write();
            if self.closed.load(Ordering::Acquire) {
                return Err(ShardError::ShuttingDown);
            }
            partitions.insert(partition, Arc::new(Mutex::new(files)));
        }
        log::info!(
            "engine partition {} opened ({} keys recovered)",
            partition,
            keys
        );
        Ok(())
    }

    fn get(&self, key: &[u8], partition: PartitionId) -> Result<Option<Bytes>> {
        let handle = self.handle(partition)?;
        let files = handle.lock();
        Ok(files.memtable.get(key).cloned())
    }

    fn put(&self, key: Key, partition: PartitionId, envelope: Bytes) -> Result<()> {
        let payload = bincode::serialize(&EngineRecord {
            key: key.clone(),
            envelope: envelope.clone(),
        })?;

        let handle = self.handle(partition)?;
        let mut files = handle.lock();
        // WAL first, then the in-memory table.
        files.wal.append(&payload)?;
        files.memtable.insert(key, envelope);
        Ok(())
    }

    fn entries(&self, partition: PartitionId) -> Result<Vec<(Key, Bytes)>> {
        let handle = self.handle(partition)?;
        let files = handle.lock();
        Ok(files
            .memtable
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn close_partition(&self, partition: PartitionId) -> Result<()> {
        if self.partitions.write().remove(&partition).is_some() {
            log::info!("engine partition {} closed", partition);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut partitions = self.partitions.write();
        let count = partitions.len();
        partitions.clear();
        log::info!("file engine at {:?} closed ({} partitions)", self.root, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_put_get_per_partition() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileEngine::open(dir.path(), false).unwrap();
        engine.open_partition(1).unwrap();
        engine.open_partition(2).unwrap();

        engine.put(b("k"), 1, b("one")).unwrap();
        engine.put(b("k"), 2, b("two")).unwrap();

        assert_eq!(engine.get(b"k", 1).unwrap(), Some(b("one")));
        assert_eq!(engine.get(b"k", 2).unwrap(), Some(b("two")));
        assert_eq!(engine.get(b"missing", 1).unwrap(), None);
        assert_eq!(engine.open_partitions(), vec![1, 2]);
    }

    #[test]
    fn test_unopened_partition_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileEngine::open(dir.path(), false).unwrap();
        assert!(matches!(
            engine.get(b"k", 9),
            Err(ShardError::PartitionOffline(9))
        ));
        assert!(engine.put(b("k"), 9, b("v")).is_err());
    }

    #[test]
    fn test_reopen_recovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = FileEngine::open(dir.path(), true).unwrap();
            engine.open_partition(4).unwrap();
            engine.put(b("a"), 4, b("1")).unwrap();
            engine.put(b("a"), 4, b("2")).unwrap();
            engine.put(b("b"), 4, b("3")).unwrap();
            engine.close().unwrap();
        }

        let engine = FileEngine::open(dir.path(), true).unwrap();
        engine.open_partition(4).unwrap();
        assert_eq!(engine.get(b"a", 4).unwrap(), Some(b("2")));
        assert_eq!(engine.entries(4).unwrap().len(), 2);
    }

    #[test]
    fn test_compaction_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = FileEngine::open(dir.path(), false).unwrap();
            engine.open_partition(0).unwrap();
            for i in 0..200u32 {
                engine
                    .put(b("hot"), 0, Bytes::from(i.to_le_bytes().to_vec()))
                    .unwrap();
            }
        }

        let engine = FileEngine::open(dir.path(), false).unwrap();
        engine.open_partition(0).unwrap();
        assert_eq!(
            engine.get(b"hot", 0).unwrap(),
            Some(Bytes::from(199u32.to_le_bytes().to_vec()))
        );
        engine.close_partition(0).unwrap();

        // The rewritten log replays to the same state.
        engine.open_partition(0).unwrap();
        assert_eq!(engine.entries(0).unwrap().len(), 1);
    }

    #[test]
    fn test_open_in_progress_does_not_block_other_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FileEngine::open(dir.path(), false).unwrap());
        engine.open_partition(2).unwrap();
        engine.put(b("k"), 2, b("v")).unwrap();

        // Hold partition 1's gate so its open stays mid-flight.
        let gate = engine.open_gate(1);
        let held = gate.lock();
        let opener = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.open_partition(1))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(engine.get(b"k", 2).unwrap(), Some(b("v")));
        engine.put(b("k2"), 2, b("v2")).unwrap();
        engine.open_partition(3).unwrap();
        engine.close_partition(3).unwrap();
        assert!(!opener.is_finished());

        drop(held);
        opener.join().unwrap().unwrap();
        assert_eq!(engine.open_partitions(), vec![1, 2]);
    }

    #[test]
    fn test_concurrent_opens_replay_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = FileEngine::open(dir.path(), false).unwrap();
            engine.open_partition(5).unwrap();
            for i in 0..100u32 {
                engine
                    .put(Bytes::from(format!("k{}", i)), 5, b("v"))
                    .unwrap();
            }
        }

        let engine = Arc::new(FileEngine::open(dir.path(), false).unwrap());
        let openers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || engine.open_partition(5))
            })
            .collect();
        for opener in openers {
            opener.join().unwrap().unwrap();
        }
        assert_eq!(engine.entries(5).unwrap().len(), 100);
    }

    #[test]
    fn test_close_rejects_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileEngine::open(dir.path(), false).unwrap();
        engine.open_partition(1).unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.open_partition(1), Err(ShardError::ShuttingDown)));
        assert!(engine.get(b"k", 1).is_err());
    }
}
