//! SHARDLINE - Node Configuration
//! Tunable parameters for partitions, the apply loop, and the lifecycle.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ShardError};

/// Configuration for a shardline node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for engine and log files.
    pub data_dir: PathBuf,

    /// Log topic prefix; the partition id is appended to form the topic name.
    pub topic_prefix: String,

    /// Maximum distance between a store's sequence and the applied watermark
    /// before the store blocks.
    pub lag_threshold: u64,

    /// Ceiling on the backpressure wait. `None` waits indefinitely.
    pub backpressure_timeout: Option<Duration>,

    /// Number of key-lock buckets per partition.
    pub key_lock_count: usize,

    /// How long the apply loop blocks on an empty topic before rechecking its stop flag.
    pub apply_poll_interval: Duration,

    /// Applied records between log trims. 0 keeps the whole log.
    pub log_trim_interval: u64,

    /// How long bootstrap waits for the apply loop to catch up before going online anyway.
    pub bootstrap_timeout: Duration,

    /// First delay between bootstrap retries.
    pub retry_backoff_initial: Duration,

    /// Upper bound on the delay between bootstrap retries.
    pub retry_backoff_max: Duration,

    /// How long a release waits for in-flight stores to leave the partition.
    pub drain_timeout: Duration,

    /// Whether to fsync engine and log appends.
    pub sync_writes: bool,

    /// Whether the local log broker persists topics under `data_dir`.
    pub durable_log: bool,

    /// Acknowledge requests without touching any state.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            topic_prefix: "shardline-partition-".to_string(),
            lag_threshold: 20_000_000,
            backpressure_timeout: Some(Duration::from_secs(30)),
            key_lock_count: 1024,
            apply_poll_interval: Duration::from_millis(30),
            log_trim_interval: 1024,
            bootstrap_timeout: Duration::from_secs(60),
            retry_backoff_initial: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            sync_writes: true,
            durable_log: true,
            dry_run: false,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the replication lag bound.
    pub fn with_lag_threshold(mut self, threshold: u64) -> Self {
        self.lag_threshold = threshold;
        self
    }

    /// Set (or remove) the backpressure wait ceiling.
    pub fn with_backpressure_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    /// Set the number of key-lock buckets per partition.
    pub fn with_key_lock_count(mut self, count: usize) -> Self {
        self.key_lock_count = count;
        self
    }

    /// Set the log topic prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set how many applied records pass between log trims.
    pub fn with_log_trim_interval(mut self, interval: u64) -> Self {
        self.log_trim_interval = interval;
        self
    }

    /// Set the bootstrap catch-up timeout.
    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    /// Set the bootstrap retry backoff range.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff_initial = initial;
        self.retry_backoff_max = max;
        self
    }

    /// Toggle fsync on engine and log appends.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Toggle on-disk persistence of the local log broker.
    pub fn with_durable_log(mut self, durable: bool) -> Self {
        self.durable_log = durable;
        self
    }

    /// Toggle dry-run request handling.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.key_lock_count == 0 {
            return Err(ShardError::Config("key_lock_count must be positive".into()));
        }
        if self.lag_threshold == 0 {
            return Err(ShardError::Config("lag_threshold must be positive".into()));
        }
        if self.retry_backoff_initial > self.retry_backoff_max {
            return Err(ShardError::Config(
                "retry_backoff_initial exceeds retry_backoff_max".into(),
            ));
        }
        if self.apply_poll_interval.is_zero() {
            return Err(ShardError::Config("apply_poll_interval must be positive".into()));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    /// Directory holding per-partition engine files.
    pub fn engine_dir(&self) -> PathBuf {
        self.data_dir.join("engine")
    }

    /// Directory holding durable log topics.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lag_threshold, 20_000_000);
        assert_eq!(config.key_lock_count, 1024);
    }

    #[test]
    fn test_rejects_zero_locks() {
        let config = Config::default().with_key_lock_count(0);
        assert!(matches!(config.validate(), Err(ShardError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config = Config::default()
            .with_retry_backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let config = Config::new("/tmp/node-a");
        assert_eq!(config.engine_dir(), PathBuf::from("/tmp/node-a/engine"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/node-a/log"));
    }
}
