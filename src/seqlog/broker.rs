//! SHARDLINE - Local Log Broker
//! In-process implementation of the append-log transport: one ordered record
//! list per topic, optionally persisted to a CRC-framed file per topic.
//!
//! ## Retention
//! `trim` drops applied records from memory. The topic file is rewritten with
//! the retained records once trimmed frames dominate it. The newest record is
//! always kept so a topic never forgets its last sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ShardError};
use crate::types::{PendingWrite, Sequence};
use crate::wal::WriteAheadLog;

use super::{LogSubscription, LogTransport};

struct TopicState {
    records: Vec<PendingWrite>,
    wal: Option<WriteAheadLog>,
    /// Frames in the topic file, trimmed ones included.
    frames_on_disk: usize,
}

impl TopicState {
    fn last_sequence(&self) -> Sequence {
        self.records.last().map_or(0, |r| r.sequence)
    }
}

struct TopicLog {
    state: Mutex<TopicState>,
    /// Signalled on every append.
    appended: Condvar,
}

/// Broker living inside the node process.
///
/// Topics are created on first use. A durable broker recovers a topic from
/// `<dir>/<topic>.log` the first time it is touched.
pub struct LocalBroker {
    dir: Option<PathBuf>,
    sync_writes: bool,
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
    /// Per-topic guard held while its file is recovered, outside `topics`.
    opening: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalBroker {
    /// Broker that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            sync_writes: false,
            topics: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// Broker persisting each topic under `dir`.
    pub fn open(dir: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        log::info!("local log broker opened at {:?}", dir);
        Ok(Self {
            dir: Some(dir),
            sync_writes,
            topics: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot of the records `topic` still retains.
    pub fn published(&self, topic: &str) -> Vec<PendingWrite> {
        match self.topic(topic) {
            Ok(log) => log.state.lock().records.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn topic(&self, name: &str) -> Result<Arc<TopicLog>> {
        if let Some(topic) = self.topics.lock().get(name) {
            return Ok(topic.clone());
        }

        let gate = self.open_gate(name);
        let _opening = gate.lock();
        if let Some(topic) = self.topics.lock().get(name) {
            return Ok(topic.clone());
        }

        let topic = Arc::new(TopicLog {
            state: Mutex::new(self.load(name)?),
            appended: Condvar::new(),
        });
        self.topics.lock().insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    fn open_gate(&self, name: &str) -> Arc<Mutex<()>> {
        self.opening
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn topic_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name.contains("..") {
            return Err(ShardError::Transport(format!("invalid topic name {:?}", name)));
        }
        Ok(Some(dir.join(format!("{}.log", name))))
    }

    /// Recover a topic from its file, or start an empty one.
    fn load(&self, name: &str) -> Result<TopicState> {
        let Some(path) = self.topic_path(name)? else {
            return Ok(TopicState {
                records: Vec::new(),
                wal: None,
                frames_on_disk: 0,
            });
        };

        let (wal, frames) = WriteAheadLog::open(path, self.sync_writes)?;
        let mut records = Vec::with_capacity(frames.len());
        for frame in &frames {
            let record: PendingWrite = bincode::deserialize(frame).map_err(|e| {
                ShardError::Corruption(format!("log record in topic {}: {}", name, e))
            })?;
            records.push(record);
        }
        if !records.is_empty() {
            log::info!("recovered {} records of topic {}", records.len(), name);
        }
        Ok(TopicState {
            records,
            wal: Some(wal),
            frames_on_disk: frames.len(),
        })
    }

    /// Replace the topic file with one holding only the retained records.
    fn rewrite(&self, name: &str, state: &mut TopicState) -> Result<()> {
        let Some(path) = self.topic_path(name)? else {
            return Ok(());
        };
        let tmp = path.with_extension("log.compact");
        let _ = std::fs::remove_file(&tmp);
        {
            let (mut fresh, _) = WriteAheadLog::open(tmp.clone(), self.sync_writes)?;
            for record in &state.records {
                fresh.append(&bincode::serialize(record)?)?;
            }
        }
        std::fs::rename(&tmp, &path)?;

        // The old handle now points at the replaced file.
        state.wal = None;
        let (wal, _) = WriteAheadLog::open(path, self.sync_writes)?;
        state.wal = Some(wal);
        state.frames_on_disk = state.records.len();
        log::debug!("rewrote topic {} with {} records", name, state.records.len());
        Ok(())
    }
}

impl LogTransport for LocalBroker {
    fn publish(&self, topic: &str, record: &PendingWrite) -> Result<()> {
        let log = self.topic(topic)?;
        let mut state = log.state.lock();

        let last = state.last_sequence();
        if !state.records.is_empty() && record.sequence <= last {
            return Err(ShardError::Transport(format!(
                "out-of-order publish to {}: sequence {} after {}",
                topic, record.sequence, last
            )));
        }

        if self.dir.is_some() {
            let payload = bincode::serialize(record)?;
            let wal = state.wal.as_mut().ok_or_else(|| {
                ShardError::Transport(format!("topic {} has no open file", topic))
            })?;
            wal.append(&payload)?;
            state.frames_on_disk += 1;
        }
        state.records.push(record.clone());
        log.appended.notify_all();
        Ok(())
    }

    fn subscribe(&self, topic: &str, after: Sequence) -> Result<Box<dyn LogSubscription>> {
        let log = self.topic(topic)?;
        if let Some(first) = log.state.lock().records.first() {
            if first.sequence > after + 1 {
                log::warn!(
                    "subscription to {} after {} starts at retained sequence {}",
                    topic,
                    after,
                    first.sequence
                );
            }
        }
        Ok(Box::new(TopicCursor { topic: log, after }))
    }

    fn last_sequence(&self, topic: &str) -> Result<Sequence> {
        let log = self.topic(topic)?;
        let state = log.state.lock();
        Ok(state.last_sequence())
    }

    fn trim(&self, topic: &str, upto: Sequence) -> Result<()> {
        let log = self.topic(topic)?;
        let mut state = log.state.lock();

        let retained_from = state
            .records
            .partition_point(|r| r.sequence <= upto)
            .min(state.records.len().saturating_sub(1));
        if retained_from == 0 {
            return Ok(());
        }
        state.records.drain(..retained_from);

        if state.wal.is_some() && state.frames_on_disk > 2 * state.records.len() + 64 {
            self.rewrite(topic, &mut state)?;
        }
        Ok(())
    }
}

/// Reads a topic in sequence order, resuming after the last record it returned.
struct TopicCursor {
    topic: Arc<TopicLog>,
    after: Sequence,
}

impl LogSubscription for TopicCursor {
    fn poll(&mut self, timeout: Duration) -> Result<Option<PendingWrite>> {
        let mut state = self.topic.state.lock();
        let after = self.after;
        let mut next = state.records.partition_point(|r| r.sequence <= after);
        if next >= state.records.len() {
            self.topic.appended.wait_for(&mut state, timeout);
            next = state.records.partition_point(|r| r.sequence <= after);
        }
        match state.records.get(next) {
            Some(record) => {
                self.after = record.sequence;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;

    fn record(seq: Sequence, value: &'static str) -> PendingWrite {
        PendingWrite::new(
            Bytes::from_static(b"key"),
            0,
            seq,
            Bytes::from_static(value.as_bytes()),
            false,
        )
    }

    #[test]
    fn test_subscribe_from_offset() {
        let broker = LocalBroker::in_memory();
        for seq in 1..=5 {
            broker.publish("t", &record(seq, "v")).unwrap();
        }

        let mut sub = broker.subscribe("t", 3).unwrap();
        let first = sub.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.sequence, 4);
        let second = sub.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(second.sequence, 5);
        assert!(sub.poll(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_rejects_out_of_order() {
        let broker = LocalBroker::in_memory();
        broker.publish("t", &record(2, "b")).unwrap();
        assert!(matches!(
            broker.publish("t", &record(2, "again")),
            Err(ShardError::Transport(_))
        ));
        assert!(broker.publish("t", &record(1, "late")).is_err());
        assert_eq!(broker.last_sequence("t").unwrap(), 2);
    }

    #[test]
    fn test_poll_wakes_on_publish() {
        let broker = Arc::new(LocalBroker::in_memory());
        let mut sub = broker.subscribe("t", 0).unwrap();

        let publisher = broker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish("t", &record(1, "late")).unwrap();
        });

        let mut got = None;
        for _ in 0..100 {
            if let Some(r) = sub.poll(Duration::from_millis(50)).unwrap() {
                got = Some(r);
                break;
            }
        }
        handle.join().unwrap();
        assert_eq!(got.unwrap().value, Bytes::from_static(b"late"));
    }

    #[test]
    fn test_durable_topic_recovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let broker = LocalBroker::open(dir.path(), true).unwrap();
            broker.publish("p-1", &record(1, "a")).unwrap();
            broker.publish("p-1", &record(2, "b")).unwrap();
        }

        let broker = LocalBroker::open(dir.path(), true).unwrap();
        assert_eq!(broker.last_sequence("p-1").unwrap(), 2);
        assert_eq!(broker.published("p-1").len(), 2);
        assert!(broker.subscribe("../escape", 0).is_err());
    }

    #[test]
    fn test_trim_bounds_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p-0.log");
        {
            let broker = LocalBroker::open(dir.path(), false).unwrap();
            for seq in 1..=10_000 {
                broker.publish("p-0", &record(seq, "payload")).unwrap();
            }
            let full = std::fs::metadata(&path).unwrap().len();

            broker.trim("p-0", 9_990).unwrap();
            assert_eq!(broker.published("p-0").len(), 10);
            assert!(std::fs::metadata(&path).unwrap().len() * 100 < full);

            // Appends keep landing in the rewritten file.
            broker.publish("p-0", &record(10_001, "after")).unwrap();
        }

        let broker = LocalBroker::open(dir.path(), false).unwrap();
        assert_eq!(broker.last_sequence("p-0").unwrap(), 10_001);
        assert_eq!(broker.published("p-0").len(), 11);

        // A cursor below the retained start begins at the first retained record.
        let mut sub = broker.subscribe("p-0", 5).unwrap();
        let first = sub.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.sequence, 9_991);
    }

    #[test]
    fn test_trim_keeps_last_record() {
        let broker = LocalBroker::in_memory();
        for seq in 1..=4 {
            broker.publish("t", &record(seq, "v")).unwrap();
        }

        broker.trim("t", 100).unwrap();
        assert_eq!(broker.published("t").len(), 1);
        assert_eq!(broker.last_sequence("t").unwrap(), 4);
        assert!(broker.publish("t", &record(4, "dup")).is_err());
        broker.publish("t", &record(5, "v")).unwrap();
    }

    #[test]
    fn test_cursor_survives_trim_behind_it() {
        let broker = LocalBroker::in_memory();
        for seq in 1..=6 {
            broker.publish("t", &record(seq, "v")).unwrap();
        }
        let mut sub = broker.subscribe("t", 0).unwrap();
        for expected in 1..=3 {
            assert_eq!(sub.poll(Duration::from_millis(10)).unwrap().unwrap().sequence, expected);
        }

        broker.trim("t", 3).unwrap();
        assert_eq!(sub.poll(Duration::from_millis(10)).unwrap().unwrap().sequence, 4);
    }

    #[test]
    fn test_topic_recovery_does_not_block_other_topics() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(LocalBroker::open(dir.path(), false).unwrap());

        // Hold topic "a" mid-recovery.
        let gate = broker.open_gate("a");
        let held = gate.lock();

        let opener = {
            let broker = broker.clone();
            thread::spawn(move || broker.subscribe("a", 0).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));

        broker.publish("b", &record(1, "v")).unwrap();
        assert_eq!(broker.last_sequence("b").unwrap(), 1);
        assert!(!opener.is_finished());

        drop(held);
        opener.join().unwrap().unwrap();
        assert_eq!(broker.last_sequence("a").unwrap(), 0);
    }
}
