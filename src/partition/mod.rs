//! SHARDLINE - Partition
//! The unit of ownership: sequence assignment, the write cache, per-key
//! bucket locks, and the applied watermark of one partition.
//!
//! ## Write path
//! 1. The caller is counted in-flight and the partition must be online.
//! 2. Callback writes lock the key's bucket, read the current value, and let
//!    the resolver transform or veto the write.
//! 3. Under the partition's sequencer lock the next sequence is assigned, the
//!    record is installed in the write cache and published to the log. Holding
//!    the lock across publish keeps log order identical to sequence order; a
//!    failed publish rolls the counter and the cache back.
//! 4. The caller waits until `sequence - applied <= lag_threshold`.
//!
//! ## Apply path
//! Records from the log are written to the engine in order, evicted from the
//! write cache, and the watermark advances, waking blocked writers.

pub mod cache;
pub mod locks;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::engine::PersistentEngine;
use crate::envelope::ValueEnvelope;
use crate::error::{Result, ShardError};
use crate::metrics::NodeMetrics;
use crate::resolver::{ConflictResolver, Resolution};
use crate::seqlog::SequenceLogClient;
use crate::types::{Key, PartitionId, PartitionState, PendingWrite, Sequence, Value};

use self::cache::WriteCache;
use self::locks::KeyLockTable;

/// Per-partition tunables taken from [`Config`].
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    pub lag_threshold: u64,
    pub backpressure_timeout: Option<Duration>,
    pub key_lock_count: usize,
}

impl From<&Config> for PartitionSettings {
    fn from(config: &Config) -> Self {
        Self {
            lag_threshold: config.lag_threshold,
            backpressure_timeout: config.backpressure_timeout,
            key_lock_count: config.key_lock_count,
        }
    }
}

/// Collaborators injected into every partition of a node.
#[derive(Clone)]
pub struct PartitionContext {
    pub engine: Arc<dyn PersistentEngine>,
    pub log: SequenceLogClient,
    pub resolver: Option<Arc<dyn ConflictResolver>>,
    pub metrics: Arc<NodeMetrics>,
    pub settings: PartitionSettings,
}

/// Result of an accepted store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Published at this sequence and within the lag bound.
    Stored(Sequence),
    /// The resolver dropped the write; nothing was cached or published.
    Vetoed,
}

/// Result of applying one log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written to the engine.
    Applied,
    /// The engine already held this or a newer sequence for the key.
    Superseded,
    /// At or below the watermark; skipped.
    Redelivered,
}

/// Where a lookup found its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    Engine,
}

pub struct Partition {
    id: PartitionId,
    state: AtomicU8,
    /// Last assigned sequence.
    sequence: AtomicU64,
    /// Serializes sequence assignment with publish.
    sequencer: Mutex<()>,
    /// Highest sequence reflected in the engine.
    applied: Mutex<Sequence>,
    applied_changed: Condvar,
    in_flight: Mutex<usize>,
    drained: Condvar,
    cache: WriteCache,
    locks: KeyLockTable,
    ctx: PartitionContext,
}

impl Partition {
    /// Create a bootstrapping partition whose counter resumes after `published`
    /// and whose watermark starts at `applied`.
    pub fn new(
        id: PartitionId,
        ctx: PartitionContext,
        published: Sequence,
        applied: Sequence,
    ) -> Self {
        let locks = KeyLockTable::new(ctx.settings.key_lock_count);
        Self {
            id,
            state: AtomicU8::new(PartitionState::Bootstrapping as u8),
            sequence: AtomicU64::new(published.max(applied)),
            sequencer: Mutex::new(()),
            applied: Mutex::new(applied),
            applied_changed: Condvar::new(),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
            cache: WriteCache::new(),
            locks,
            ctx,
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn state(&self) -> PartitionState {
        PartitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`, waking writers blocked in backpressure so they re-check it.
    pub fn set_state(&self, state: PartitionState) {
        {
            let _order = self.sequencer.lock();
            let _applied = self.applied.lock();
            self.state.store(state as u8, Ordering::Release);
        }
        self.applied_changed.notify_all();
        log::info!("partition {} is now {}", self.id, state);
    }

    /// Last assigned sequence number.
    pub fn sequence(&self) -> Sequence {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn applied_sequence(&self) -> Sequence {
        *self.applied.lock()
    }

    /// Published-but-unapplied distance.
    pub fn lag(&self) -> u64 {
        self.sequence().saturating_sub(self.applied_sequence())
    }

    pub fn cache(&self) -> &WriteCache {
        &self.cache
    }

    pub fn key_locks(&self) -> &KeyLockTable {
        &self.locks
    }

    /// Stores currently inside the partition.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Latest value of `key`: the write cache first, then the engine.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.read(key)?.map(|(value, _)| value))
    }

    /// Like [`lookup`](Self::lookup), also reporting where the value came from.
    pub fn read(&self, key: &[u8]) -> Result<Option<(Value, ReadSource)>> {
        if !self.state().is_readable() {
            return Err(ShardError::PartitionOffline(self.id));
        }

        if let Some(value) = self.cache.value(key) {
            return Ok(Some((value, ReadSource::Cache)));
        }

        match self.ctx.engine.get(key, self.id)? {
            Some(raw) => {
                let envelope = ValueEnvelope::decode(&raw)?;
                Ok(Some((envelope.value, ReadSource::Engine)))
            }
            None => Ok(None),
        }
    }

    /// Store with the configured backpressure ceiling; every failure becomes `false`.
    pub fn store(&self, key: &[u8], value: &[u8], needs_callback: bool) -> bool {
        self.store_with_timeout(
            key,
            value,
            needs_callback,
            self.ctx.settings.backpressure_timeout,
        )
    }

    pub fn store_with_timeout(
        &self,
        key: &[u8],
        value: &[u8],
        needs_callback: bool,
        timeout: Option<Duration>,
    ) -> bool {
        let result = self.try_store(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            needs_callback,
            timeout,
        );
        match result {
            Ok(_) => true,
            Err(e) if e.is_corruption() => {
                log::error!("store of {:?} to partition {} hit corrupt data: {}", key, self.id, e);
                false
            }
            Err(e) => {
                log::warn!("store of {:?} to partition {} failed: {}", key, self.id, e);
                false
            }
        }
    }

    /// The full write protocol, reporting why a store did not go through.
    pub fn try_store(
        &self,
        key: Key,
        value: Value,
        needs_callback: bool,
        timeout: Option<Duration>,
    ) -> Result<StoreOutcome> {
        let _in_flight = self.enter();
        self.check_writable()?;

        let resolver = if needs_callback {
            self.ctx.resolver.as_ref().filter(|r| r.needs_callback())
        } else {
            None
        };

        let sequence = match resolver {
            Some(resolver) => {
                let _bucket = self.locks.lock(&key);
                let current = self.lookup(&key)?;
                match resolver.resolve(&key, current.as_deref(), &value) {
                    Resolution::Veto => {
                        NodeMetrics::incr(&self.ctx.metrics.vetoes);
                        log::debug!("write to {:?} in partition {} vetoed", key, self.id);
                        return Ok(StoreOutcome::Vetoed);
                    }
                    Resolution::Write(resolved) => self.publish(key, resolved, true)?,
                }
            }
            None => self.publish(key, value, needs_callback)?,
        };

        self.await_applied(sequence, timeout)?;
        Ok(StoreOutcome::Stored(sequence))
    }

    fn publish(&self, key: Key, value: Value, needs_callback: bool) -> Result<Sequence> {
        let _order = self.sequencer.lock();
        self.check_writable()?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = PendingWrite::new(key, self.id, sequence, value, needs_callback);
        let previous = self.cache.install(record.clone());

        if let Err(e) = self.ctx.log.publish(&record) {
            self.cache.rollback(&record.key, sequence, previous);
            self.sequence.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        log::debug!(
            "partition {} published seq {} (applied {})",
            self.id,
            sequence,
            self.applied_sequence()
        );
        Ok(sequence)
    }

    /// Block until `sequence` is within the lag bound of the watermark.
    fn await_applied(&self, sequence: Sequence, timeout: Option<Duration>) -> Result<()> {
        let threshold = self.ctx.settings.lag_threshold;
        let mut applied = self.applied.lock();
        if sequence.saturating_sub(*applied) <= threshold {
            return Ok(());
        }

        NodeMetrics::incr(&self.ctx.metrics.backpressure_waits);
        log::debug!(
            "partition {} seq {} waiting for applied {} to come within {}",
            self.id,
            sequence,
            *applied,
            threshold
        );

        // A timeout past the clock's range waits without a deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        while sequence.saturating_sub(*applied) > threshold {
            if self.state() == PartitionState::Offline {
                return Err(ShardError::PartitionOffline(self.id));
            }
            match deadline {
                Some(deadline) => {
                    let timed_out = self
                        .applied_changed
                        .wait_until(&mut applied, deadline)
                        .timed_out();
                    if timed_out && sequence.saturating_sub(*applied) > threshold {
                        NodeMetrics::incr(&self.ctx.metrics.backpressure_timeouts);
                        return Err(ShardError::BackpressureTimeout {
                            partition: self.id,
                            sequence,
                            applied: *applied,
                        });
                    }
                }
                None => self.applied_changed.wait(&mut applied),
            }
        }
        Ok(())
    }

    /// Wait until the watermark reaches `target`. Returns whether it did.
    pub fn wait_for_applied(&self, target: Sequence, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut applied = self.applied.lock();
        while *applied < target {
            match deadline {
                Some(deadline) => {
                    if self
                        .applied_changed
                        .wait_until(&mut applied, deadline)
                        .timed_out()
                    {
                        return *applied >= target;
                    }
                }
                None => self.applied_changed.wait(&mut applied),
            }
        }
        true
    }

    /// Apply one log record to the engine and advance the watermark.
    ///
    /// Safe to repeat: redelivered records are skipped, and the engine is only
    /// overwritten by a strictly newer sequence.
    pub fn apply(&self, record: &PendingWrite) -> Result<ApplyOutcome> {
        if record.partition_id != self.id {
            return Err(ShardError::Corruption(format!(
                "record for partition {} delivered to partition {}",
                record.partition_id, self.id
            )));
        }

        let applied = self.applied_sequence();
        if record.sequence <= applied {
            NodeMetrics::incr(&self.ctx.metrics.redeliveries);
            return Ok(ApplyOutcome::Redelivered);
        }
        if record.sequence != applied + 1 {
            log::warn!(
                "partition {} applying seq {} after {}; log has a gap",
                self.id,
                record.sequence,
                applied
            );
        }

        let stored_newer = match self.ctx.engine.get(&record.key, self.id)? {
            Some(raw) => match ValueEnvelope::decode(&raw) {
                Ok(stored) => stored.sequence >= record.sequence,
                Err(e) => {
                    log::error!(
                        "partition {} overwriting corrupt envelope of {:?}: {}",
                        self.id,
                        record.key,
                        e
                    );
                    false
                }
            },
            None => false,
        };

        let outcome = if stored_newer {
            ApplyOutcome::Superseded
        } else {
            let envelope = ValueEnvelope::new(record.value.clone(), record.sequence).encode()?;
            self.ctx.engine.put(record.key.clone(), self.id, envelope)?;
            ApplyOutcome::Applied
        };

        self.cache.evict_applied(&record.key, record.sequence);
        self.advance_applied(record.sequence);
        NodeMetrics::incr(&self.ctx.metrics.records_applied);
        Ok(outcome)
    }

    fn advance_applied(&self, sequence: Sequence) {
        let mut applied = self.applied.lock();
        if sequence > *applied {
            *applied = sequence;
            self.applied_changed.notify_all();
        }
    }

    /// Wait for in-flight stores to leave. Returns whether they all did.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.in_flight.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.drained.wait(&mut count),
            }
        }
        true
    }

    fn check_writable(&self) -> Result<()> {
        match self.state() {
            PartitionState::Online => Ok(()),
            PartitionState::Offline => Err(ShardError::PartitionOffline(self.id)),
            PartitionState::Absent | PartitionState::Bootstrapping => {
                Err(ShardError::SequenceUnavailable(self.id))
            }
        }
    }

    fn enter(&self) -> InFlight<'_> {
        *self.in_flight.lock() += 1;
        InFlight { partition: self }
    }
}

struct InFlight<'a> {
    partition: &'a Partition,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.partition.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.partition.drained.notify_all();
        }
    }
}
