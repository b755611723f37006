//! SHARDLINE - Apply Loop
//! Background thread per partition that consumes the partition's topic in
//! order and applies each record to the engine, advancing the watermark.
//! Every `trim_every` applied records the topic is trimmed up to the watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::partition::Partition;
use crate::types::{PartitionId, PendingWrite, Sequence};

use super::{LogSubscription, SequenceLogClient};

/// Handle of a running apply loop. Dropping it stops the loop.
pub struct Applier {
    partition_id: PartitionId,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Applier {
    /// Subscribe after the partition's current watermark and start applying.
    pub fn spawn(
        partition: Arc<Partition>,
        log: &SequenceLogClient,
        poll_interval: Duration,
        retry_backoff: Duration,
        trim_every: u64,
    ) -> Result<Self> {
        let partition_id = partition.id();
        let subscription = log.subscribe(partition_id, partition.applied_sequence())?;
        let stop = Arc::new(AtomicBool::new(false));

        let flag = stop.clone();
        let log = log.clone();
        let handle = thread::Builder::new()
            .name(format!("apply-{}", partition_id))
            .spawn(move || {
                let trim = Trim {
                    log,
                    every: trim_every,
                    last: 0,
                };
                run(partition, subscription, trim, flag, poll_interval, retry_backoff)
            })?;

        log::info!("apply loop started for partition {}", partition_id);
        Ok(Self {
            partition_id,
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Signal the loop and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("apply loop of partition {} panicked", self.partition_id);
            } else {
                log::info!("apply loop stopped for partition {}", self.partition_id);
            }
        }
    }
}

impl Drop for Applier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Trims the topic behind the apply loop.
struct Trim {
    log: SequenceLogClient,
    every: u64,
    last: Sequence,
}

impl Trim {
    fn after_apply(&mut self, partition: PartitionId, applied: Sequence) {
        if self.every == 0 || applied < self.last.saturating_add(self.every) {
            return;
        }
        match self.log.trim(partition, applied) {
            Ok(()) => self.last = applied,
            Err(e) => log::warn!("partition {} log trim to {} failed: {}", partition, applied, e),
        }
    }
}

fn run(
    partition: Arc<Partition>,
    mut subscription: Box<dyn LogSubscription>,
    mut trim: Trim,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    retry_backoff: Duration,
) {
    // A record that failed to apply is retried before anything after it.
    let mut pending: Option<PendingWrite> = None;

    while !stop.load(Ordering::Acquire) {
        let record = match pending.take() {
            Some(record) => record,
            None => match subscription.poll(poll_interval) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("partition {} log poll failed: {}", partition.id(), e);
                    thread::sleep(retry_backoff);
                    continue;
                }
            },
        };

        match partition.apply(&record) {
            Ok(_) => trim.after_apply(partition.id(), partition.applied_sequence()),
            Err(e) => {
                if e.is_corruption() {
                    log::error!(
                        "partition {} cannot apply seq {}: {}",
                        partition.id(),
                        record.sequence,
                        e
                    );
                } else {
                    log::warn!(
                        "partition {} apply of seq {} failed, retrying: {}",
                        partition.id(),
                        record.sequence,
                        e
                    );
                }
                pending = Some(record);
                thread::sleep(retry_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FileEngine, PersistentEngine};
    use crate::metrics::NodeMetrics;
    use crate::partition::{PartitionContext, PartitionSettings};
    use crate::seqlog::broker::LocalBroker;
    use crate::types::PartitionState;
    use bytes::Bytes;

    fn setup(dir: &std::path::Path) -> (Arc<Partition>, SequenceLogClient, Arc<LocalBroker>) {
        let engine = Arc::new(FileEngine::open(dir, false).unwrap());
        engine.open_partition(1).unwrap();
        let broker = Arc::new(LocalBroker::in_memory());
        let log = SequenceLogClient::new(broker.clone(), "a-");
        let ctx = PartitionContext {
            engine,
            log: log.clone(),
            resolver: None,
            metrics: Arc::new(NodeMetrics::new()),
            settings: PartitionSettings {
                lag_threshold: 1_000,
                backpressure_timeout: Some(Duration::from_secs(5)),
                key_lock_count: 8,
            },
        };
        let partition = Arc::new(Partition::new(1, ctx, 0, 0));
        partition.set_state(PartitionState::Online);
        (partition, log, broker)
    }

    #[test]
    fn test_applies_published_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, log, _broker) = setup(dir.path());
        let applier = Applier::spawn(
            partition.clone(),
            &log,
            Duration::from_millis(10),
            Duration::from_millis(10),
            0,
        )
        .unwrap();
        assert!(applier.is_running());

        for i in 0..20 {
            assert!(partition.store(format!("k{}", i).as_bytes(), b"v", false));
        }
        assert!(partition.wait_for_applied(20, Duration::from_secs(5)));
        assert!(partition.cache().is_empty());
        assert_eq!(partition.lookup(b"k7").unwrap(), Some(Bytes::from_static(b"v")));

        applier.stop();
    }

    #[test]
    fn test_stop_is_prompt_on_idle_topic() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, log, _broker) = setup(dir.path());
        let applier = Applier::spawn(
            partition,
            &log,
            Duration::from_millis(20),
            Duration::from_millis(20),
            0,
        )
        .unwrap();

        let started = std::time::Instant::now();
        drop(applier);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_trims_log_behind_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, log, broker) = setup(dir.path());
        let applier = Applier::spawn(
            partition.clone(),
            &log,
            Duration::from_millis(10),
            Duration::from_millis(10),
            8,
        )
        .unwrap();

        for i in 0..100 {
            assert!(partition.store(format!("k{}", i).as_bytes(), b"v", false));
        }
        assert!(partition.wait_for_applied(100, Duration::from_secs(5)));
        applier.stop();

        let retained = broker.published("a-1");
        assert!(retained.len() <= 8, "retained {} records", retained.len());
        assert_eq!(retained.last().map(|r| r.sequence), Some(100));
        assert_eq!(partition.lookup(b"k3").unwrap(), Some(Bytes::from_static(b"v")));
    }
}
