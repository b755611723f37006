//! SHARDLINE - Partition Lifecycle
//! Turns coordinator ownership events into partition instances and drives
//! them through `Absent -> Bootstrapping -> Online -> Offline`.
//!
//! ## Bootstrap
//! Runs on its own thread per partition: open the engine files, recover the
//! applied watermark (highest envelope sequence in the engine) and the last
//! published sequence (tail of the topic), register the partition, start its
//! apply loop, and go online once the watermark catches up or the bootstrap
//! timeout passes. Failures are retried with exponential backoff; each retry
//! tears the previous attempt down first.
//!
//! ## Release
//! Stop stores, drain in-flight callers, stop the apply loop, close the
//! engine files, then unregister the partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;
use crate::directory::PartitionDirectory;
use crate::envelope::ValueEnvelope;
use crate::error::{Result, ShardError};
use crate::metrics::NodeMetrics;
use crate::partition::{Partition, PartitionContext};
use crate::seqlog::applier::Applier;
use crate::types::{PartitionId, PartitionState, Sequence};

/// Slice used when waiting on the watermark or sleeping between retries,
/// so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Ownership change issued by the cluster coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipEvent {
    BecomeOwner(PartitionId),
    ReleaseOwner(PartitionId),
}

/// Channel back to the coordinator, used to report readiness.
pub trait CoordinatorLink: Send + Sync {
    fn report(&self, partition: PartitionId, state: PartitionState);
}

/// Coordinator link that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCoordinator;

impl CoordinatorLink for NoopCoordinator {
    fn report(&self, partition: PartitionId, state: PartitionState) {
        log::debug!("partition {} reported {}", partition, state);
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub bootstrap_timeout: Duration,
    pub retry_backoff_initial: Duration,
    pub retry_backoff_max: Duration,
    pub drain_timeout: Duration,
    pub apply_poll_interval: Duration,
    pub log_trim_interval: u64,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            bootstrap_timeout: config.bootstrap_timeout,
            retry_backoff_initial: config.retry_backoff_initial,
            retry_backoff_max: config.retry_backoff_max,
            drain_timeout: config.drain_timeout,
            apply_poll_interval: config.apply_poll_interval,
            log_trim_interval: config.log_trim_interval,
        }
    }
}

/// Resources created by one bootstrap attempt.
#[derive(Default)]
struct Attempt {
    partition: Option<Arc<Partition>>,
    applier: Option<Applier>,
}

/// Ownership slot of one partition.
struct Slot {
    cancel: Arc<AtomicBool>,
    attempt: Arc<Mutex<Attempt>>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    ctx: PartitionContext,
    directory: PartitionDirectory,
    coordinator: Arc<dyn CoordinatorLink>,
    settings: LifecycleSettings,
}

/// Owner of every partition instance on the node.
pub struct PartitionLifecycle {
    shared: Arc<Shared>,
    /// Also serializes event handling.
    slots: Mutex<HashMap<PartitionId, Slot>>,
    accepting: AtomicBool,
}

impl PartitionLifecycle {
    pub fn new(
        ctx: PartitionContext,
        directory: PartitionDirectory,
        coordinator: Arc<dyn CoordinatorLink>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                directory,
                coordinator,
                settings,
            }),
            slots: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Apply one coordinator event.
    pub fn handle(&self, event: OwnershipEvent) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            log::warn!("ignoring {:?}: shutting down", event);
            return Err(ShardError::ShuttingDown);
        }

        let mut slots = self.slots.lock();
        match event {
            OwnershipEvent::BecomeOwner(id) => {
                if let Some(previous) = slots.remove(&id) {
                    log::info!("partition {} reassigned while held, resetting", id);
                    self.shared.retire(id, previous);
                }
                let slot = self.start(id)?;
                slots.insert(id, slot);
            }
            OwnershipEvent::ReleaseOwner(id) => match slots.remove(&id) {
                Some(slot) => {
                    self.shared.retire(id, slot);
                    self.shared.coordinator.report(id, PartitionState::Offline);
                    log::info!("partition {} released", id);
                }
                None => log::debug!("release of partition {} which is not held", id),
            },
        }
        Ok(())
    }

    /// Consume events until the sender side hangs up.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        events: Receiver<OwnershipEvent>,
    ) -> std::io::Result<JoinHandle<()>> {
        let lifecycle = self.clone();
        thread::Builder::new()
            .name("ownership-events".into())
            .spawn(move || {
                for event in events {
                    if let Err(e) = lifecycle.handle(event) {
                        log::warn!("ownership event {:?} failed: {}", event, e);
                        if matches!(e, ShardError::ShuttingDown) {
                            break;
                        }
                    }
                }
            })
    }

    /// Current state of `id` on this node.
    pub fn state(&self, id: PartitionId) -> PartitionState {
        let slots = self.slots.lock();
        slots
            .get(&id)
            .and_then(|slot| slot.attempt.lock().partition.as_ref().map(|p| p.state()))
            .unwrap_or(PartitionState::Absent)
    }

    /// Held partitions and their states, by id.
    pub fn owned(&self) -> Vec<(PartitionId, PartitionState)> {
        let slots = self.slots.lock();
        let mut owned: Vec<(PartitionId, PartitionState)> = slots
            .iter()
            .map(|(id, slot)| {
                let state = slot
                    .attempt
                    .lock()
                    .partition
                    .as_ref()
                    .map_or(PartitionState::Absent, |p| p.state());
                (*id, state)
            })
            .collect();
        owned.sort_unstable_by_key(|(id, _)| *id);
        owned
    }

    /// Poll until `id` is online. Returns whether it got there in time.
    pub fn wait_online(&self, id: PartitionId, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.state(id) == PartitionState::Online {
                return true;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stop taking events, wait for bootstrap threads, then release every partition.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("partition lifecycle shutting down");

        let mut slots = self.slots.lock();
        for slot in slots.values() {
            slot.cancel.store(true, Ordering::Release);
        }
        for (id, slot) in slots.iter_mut() {
            join_worker(*id, slot.worker.take());
        }
        for (id, slot) in slots.drain() {
            self.shared.teardown(id, &slot.attempt);
            self.shared.coordinator.report(id, PartitionState::Offline);
        }
    }

    fn start(&self, id: PartitionId) -> Result<Slot> {
        let cancel = Arc::new(AtomicBool::new(false));
        let attempt = Arc::new(Mutex::new(Attempt::default()));

        let shared = self.shared.clone();
        let worker_cancel = cancel.clone();
        let worker_attempt = attempt.clone();
        let worker = thread::Builder::new()
            .name(format!("bootstrap-{}", id))
            .spawn(move || shared.bootstrap_with_retry(id, &worker_cancel, &worker_attempt))?;

        Ok(Slot {
            cancel,
            attempt,
            worker: Some(worker),
        })
    }
}

impl Shared {
    fn bootstrap_with_retry(&self, id: PartitionId, cancel: &AtomicBool, attempt: &Mutex<Attempt>) {
        let mut backoff = self.settings.retry_backoff_initial;
        let mut tries = 0u32;

        while !cancel.load(Ordering::Acquire) {
            tries += 1;
            match self.bootstrap(id, cancel, attempt) {
                Ok(()) => return,
                Err(e) => {
                    if e.is_transient() {
                        log::warn!(
                            "bootstrap of partition {} failed (attempt {}): {}; retrying in {:?}",
                            id,
                            tries,
                            e,
                            backoff
                        );
                    } else {
                        log::error!(
                            "bootstrap of partition {} failed (attempt {}): {}; retrying in {:?}",
                            id,
                            tries,
                            e,
                            backoff
                        );
                    }
                    self.teardown(id, attempt);
                    if !sleep_unless_cancelled(backoff, cancel) {
                        return;
                    }
                    backoff = backoff.saturating_mul(2).min(self.settings.retry_backoff_max);
                }
            }
        }
    }

    fn bootstrap(&self, id: PartitionId, cancel: &AtomicBool, attempt: &Mutex<Attempt>) -> Result<()> {
        self.ctx.engine.open_partition(id)?;
        let applied = self.recover_applied(id)?;
        let published = self.ctx.log.last_sequence(id)?;

        let partition = Arc::new(Partition::new(id, self.ctx.clone(), published, applied));
        attempt.lock().partition = Some(partition.clone());
        if self.directory.insert(partition.clone()).is_some() {
            log::warn!("partition {} replaced a stale instance in the directory", id);
        }
        self.coordinator.report(id, PartitionState::Bootstrapping);
        log::info!(
            "partition {} bootstrapping (applied {}, published {})",
            id,
            applied,
            published
        );

        let applier = Applier::spawn(
            partition.clone(),
            &self.ctx.log,
            self.settings.apply_poll_interval,
            self.settings.retry_backoff_initial,
            self.settings.log_trim_interval,
        )
        .map_err(|e| ShardError::Bootstrap(format!("apply loop for partition {}: {}", id, e)))?;
        attempt.lock().applier = Some(applier);

        let deadline = Instant::now().checked_add(self.settings.bootstrap_timeout);
        while !partition.wait_for_applied(published, WAIT_SLICE) {
            if cancel.load(Ordering::Acquire) {
                return Ok(());
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                log::warn!(
                    "partition {} going online before catching up (applied {} of {})",
                    id,
                    partition.applied_sequence(),
                    published
                );
                break;
            }
        }
        if cancel.load(Ordering::Acquire) {
            return Ok(());
        }

        NodeMetrics::incr(&self.ctx.metrics.partitions_online);
        partition.set_state(PartitionState::Online);
        self.coordinator.report(id, PartitionState::Online);
        Ok(())
    }

    /// Highest envelope sequence stored for the partition.
    fn recover_applied(&self, id: PartitionId) -> Result<Sequence> {
        let mut applied = 0;
        for (key, raw) in self.ctx.engine.entries(id)? {
            match ValueEnvelope::decode(&raw) {
                Ok(envelope) => applied = applied.max(envelope.sequence),
                Err(e) => log::error!(
                    "partition {} has a corrupt envelope under {:?}: {}",
                    id,
                    key,
                    e
                ),
            }
        }
        Ok(applied)
    }

    /// Cancel the slot's bootstrap thread, wait for it, and tear down what it built.
    fn retire(&self, id: PartitionId, mut slot: Slot) {
        slot.cancel.store(true, Ordering::Release);
        join_worker(id, slot.worker.take());
        self.teardown(id, &slot.attempt);
    }

    fn teardown(&self, id: PartitionId, attempt: &Mutex<Attempt>) {
        let (partition, applier) = {
            let mut attempt = attempt.lock();
            (attempt.partition.take(), attempt.applier.take())
        };

        if let Some(partition) = &partition {
            let was_online = partition.state() == PartitionState::Online;
            partition.set_state(PartitionState::Offline);
            if !partition.wait_drained(self.settings.drain_timeout) {
                log::warn!(
                    "partition {} torn down with {} stores in flight",
                    id,
                    partition.in_flight()
                );
            }
            if was_online {
                NodeMetrics::decr(&self.ctx.metrics.partitions_online);
            }
        }

        if let Some(applier) = applier {
            applier.stop();
        }

        if let Err(e) = self.ctx.engine.close_partition(id) {
            log::warn!("closing engine files of partition {} failed: {}", id, e);
        }

        if let Some(partition) = partition {
            self.directory.remove(&partition);
            partition.cache().clear();
        }
    }
}

fn join_worker(id: PartitionId, worker: Option<JoinHandle<()>>) {
    if let Some(worker) = worker {
        if worker.join().is_err() {
            log::error!("bootstrap thread of partition {} panicked", id);
        }
    }
}

/// Sleep for `total` unless `cancel` is raised first. Returns false when cancelled.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now().checked_add(total);
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return true;
                }
                WAIT_SLICE.min(deadline - now)
            }
            None => WAIT_SLICE,
        };
        thread::sleep(slice);
    }
}
