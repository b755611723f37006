//! SHARDLINE - Node Metrics
//! Lock-free request and replication counters.
//!
//! Every per-request failure that is collapsed into a `false`/error result
//! bumps a counter here, so failures stay visible even though callers only
//! see a boolean.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters for one node.
///
/// All counters use `Ordering::Relaxed`; they are for observation, not synchronization.
#[derive(Debug)]
pub struct NodeMetrics {
    pub lookups: AtomicU64,
    pub lookup_failures: AtomicU64,
    /// Lookups answered from a write cache.
    pub cache_hits: AtomicU64,
    pub stores: AtomicU64,
    pub store_failures: AtomicU64,
    /// Callback writes dropped by the resolver.
    pub vetoes: AtomicU64,
    /// Stores that had to wait for the apply path.
    pub backpressure_waits: AtomicU64,
    pub backpressure_timeouts: AtomicU64,
    pub records_applied: AtomicU64,
    /// Redelivered records skipped by the apply path.
    pub redeliveries: AtomicU64,
    pub partitions_online: AtomicU64,
    lookup_micros: AtomicU64,
    store_micros: AtomicU64,
    started: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            lookups: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            vetoes: AtomicU64::new(0),
            backpressure_waits: AtomicU64::new(0),
            backpressure_timeouts: AtomicU64::new(0),
            records_applied: AtomicU64::new(0),
            redeliveries: AtomicU64::new(0),
            partitions_online: AtomicU64::new(0),
            lookup_micros: AtomicU64::new(0),
            store_micros: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a finished lookup.
    pub fn record_lookup(&self, elapsed: Duration, failed: bool) {
        Self::incr(&self.lookups);
        if failed {
            Self::incr(&self.lookup_failures);
        }
        self.lookup_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a finished store.
    pub fn record_store(&self, elapsed: Duration, failed: bool) {
        Self::incr(&self.stores);
        if failed {
            Self::incr(&self.store_failures);
        }
        self.store_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Mean lookup latency in microseconds.
    pub fn mean_lookup_micros(&self) -> f64 {
        Self::mean(&self.lookup_micros, &self.lookups)
    }

    /// Mean store latency in microseconds.
    pub fn mean_store_micros(&self) -> f64 {
        Self::mean(&self.store_micros, &self.stores)
    }

    fn mean(total: &AtomicU64, count: &AtomicU64) -> f64 {
        let n = count.load(Ordering::Relaxed);
        if n == 0 {
            return 0.0;
        }
        total.load(Ordering::Relaxed) as f64 / n as f64
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ SHARDLINE Node Metrics ═══\n\
             Requests:\n\
               lookups:        {} ({} failed, {} from cache)\n\
               stores:         {} ({} failed, {} vetoed)\n\
               mean lookup:    {:.1}us\n\
               mean store:     {:.1}us\n\
             Replication:\n\
               applied:        {}\n\
               redeliveries:   {}\n\
               backpressure:   {} waits, {} timeouts\n\
             Partitions online: {}\n\
             Uptime: {:.2}s",
            self.lookups.load(Ordering::Relaxed),
            self.lookup_failures.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.stores.load(Ordering::Relaxed),
            self.store_failures.load(Ordering::Relaxed),
            self.vetoes.load(Ordering::Relaxed),
            self.mean_lookup_micros(),
            self.mean_store_micros(),
            self.records_applied.load(Ordering::Relaxed),
            self.redeliveries.load(Ordering::Relaxed),
            self.backpressure_waits.load(Ordering::Relaxed),
            self.backpressure_timeouts.load(Ordering::Relaxed),
            self.partitions_online.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
