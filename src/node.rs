//! SHARDLINE - Node
//! Wires the engine, the sequence log, the partition directory and the
//! lifecycle together, and exposes the request surface (`Handler`).
//!
//! ## Shutdown order
//! 1. Stop taking ownership events and wait for bootstrap threads.
//! 2. Release every partition (drain, stop apply loops, close files).
//! 3. Close the engine.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::directory::PartitionDirectory;
use crate::engine::{FileEngine, PersistentEngine};
use crate::error::{Result, ShardError};
use crate::lifecycle::{
    CoordinatorLink, LifecycleSettings, NoopCoordinator, OwnershipEvent, PartitionLifecycle,
};
use crate::metrics::NodeMetrics;
use crate::partition::{PartitionContext, PartitionSettings, ReadSource};
use crate::resolver::ConflictResolver;
use crate::seqlog::broker::LocalBroker;
use crate::seqlog::{LogTransport, SequenceLogClient};
use crate::types::{PartitionId, Value};

/// Application hook receiving event batches.
pub trait BatchProcessor: Send + Sync {
    fn process_batch(&self, key: &[u8], partition: PartitionId, events: &[Value]) -> Result<()>;
}

/// Request surface of a node. Cheap to clone.
#[derive(Clone)]
pub struct Handler {
    directory: PartitionDirectory,
    metrics: Arc<NodeMetrics>,
    processor: Option<Arc<dyn BatchProcessor>>,
    dry_run: bool,
}

impl Handler {
    /// Latest known value of `key`: pending writes first, then the engine.
    pub fn lookup(&self, key: &[u8], partition: PartitionId) -> Result<Option<Value>> {
        let started = Instant::now();
        if self.dry_run {
            self.metrics.record_lookup(started.elapsed(), false);
            return Ok(None);
        }

        let result = self
            .directory
            .get(partition)
            .and_then(|p| p.read(key))
            .map(|found| {
                found.map(|(value, source)| {
                    if source == ReadSource::Cache {
                        NodeMetrics::incr(&self.metrics.cache_hits);
                    }
                    value
                })
            });

        match &result {
            Ok(_) => {}
            Err(ShardError::PartitionNotOwned(_)) => log::info!(
                "lookup on partition {} which is not owned here (owned: {:?})",
                partition,
                self.directory.ids()
            ),
            Err(e) if e.is_corruption() => {
                log::error!("lookup of {:?} in partition {} failed: {}", key, partition, e)
            }
            Err(e) => log::warn!("lookup of {:?} in partition {} failed: {}", key, partition, e),
        }
        self.metrics.record_lookup(started.elapsed(), result.is_err());
        result
    }

    /// Write `value` under `key`; true once it is published and within the lag bound.
    pub fn store(
        &self,
        key: &[u8],
        partition: PartitionId,
        value: &[u8],
        needs_callback: bool,
    ) -> bool {
        let started = Instant::now();
        if self.dry_run {
            self.metrics.record_store(started.elapsed(), false);
            return true;
        }

        let stored = match self.directory.get(partition) {
            Ok(p) => p.store(key, value, needs_callback),
            Err(e) => {
                log::info!(
                    "store of {:?} rejected: {} (owned: {:?})",
                    key,
                    e,
                    self.directory.ids()
                );
                false
            }
        };
        self.metrics.record_store(started.elapsed(), !stored);
        stored
    }

    /// Hand a batch of events to the registered processor.
    pub fn process_batch(&self, key: &[u8], partition: PartitionId, events: &[Value]) -> bool {
        if self.dry_run {
            return true;
        }
        match &self.processor {
            Some(processor) => match processor.process_batch(key, partition, events) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!(
                        "batch of {} events for {:?} in partition {} failed: {}",
                        events.len(),
                        key,
                        partition,
                        e
                    );
                    false
                }
            },
            None => {
                log::debug!("no batch processor, dropping {} events", events.len());
                true
            }
        }
    }
}

pub struct NodeBuilder {
    config: Config,
    engine: Option<Arc<dyn PersistentEngine>>,
    transport: Option<Arc<dyn LogTransport>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    processor: Option<Arc<dyn BatchProcessor>>,
    coordinator: Option<Arc<dyn CoordinatorLink>>,
}

impl NodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
            transport: None,
            resolver: None,
            processor: None,
            coordinator: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn PersistentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn LogTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn BatchProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn CoordinatorLink>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn build(self) -> Result<Node> {
        let config = self.config;
        config.validate()?;
        config.ensure_dirs()?;

        let engine: Arc<dyn PersistentEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(FileEngine::open(config.engine_dir(), config.sync_writes)?),
        };
        let transport: Arc<dyn LogTransport> = match self.transport {
            Some(transport) => transport,
            None if config.durable_log => {
                Arc::new(LocalBroker::open(config.log_dir(), config.sync_writes)?)
            }
            None => Arc::new(LocalBroker::in_memory()),
        };

        let directory = PartitionDirectory::new();
        let metrics = Arc::new(NodeMetrics::new());
        let ctx = PartitionContext {
            engine: engine.clone(),
            log: SequenceLogClient::new(transport, config.topic_prefix.clone()),
            resolver: self.resolver,
            metrics: metrics.clone(),
            settings: PartitionSettings::from(&config),
        };
        let coordinator = self
            .coordinator
            .unwrap_or_else(|| Arc::new(NoopCoordinator));
        let lifecycle = Arc::new(PartitionLifecycle::new(
            ctx,
            directory.clone(),
            coordinator,
            LifecycleSettings::from(&config),
        ));
        let handler = Handler {
            directory: directory.clone(),
            metrics: metrics.clone(),
            processor: self.processor,
            dry_run: config.dry_run,
        };

        log::info!(
            "node started in {} (lag threshold {}, dry run {})",
            config.data_dir.display(),
            config.lag_threshold,
            config.dry_run
        );
        Ok(Node {
            config,
            engine,
            directory,
            metrics,
            lifecycle,
            handler,
        })
    }
}

/// One storage node.
pub struct Node {
    config: Config,
    engine: Arc<dyn PersistentEngine>,
    directory: PartitionDirectory,
    metrics: Arc<NodeMetrics>,
    lifecycle: Arc<PartitionLifecycle>,
    handler: Handler,
}

impl Node {
    pub fn builder(config: Config) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Node with the default engine, log and coordinator.
    pub fn open(config: Config) -> Result<Self> {
        NodeBuilder::new(config).build()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn lifecycle(&self) -> &Arc<PartitionLifecycle> {
        &self.lifecycle
    }

    pub fn directory(&self) -> &PartitionDirectory {
        &self.directory
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn become_owner(&self, partition: PartitionId) -> Result<()> {
        self.lifecycle.handle(OwnershipEvent::BecomeOwner(partition))
    }

    pub fn release(&self, partition: PartitionId) -> Result<()> {
        self.lifecycle.handle(OwnershipEvent::ReleaseOwner(partition))
    }

    /// Release every partition, then close the engine.
    pub fn shutdown(&self) -> Result<()> {
        self.lifecycle.shutdown();
        self.engine.close()?;
        log::info!("node shut down\n{}", self.metrics.report());
        Ok(())
    }
}
