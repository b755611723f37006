//! SHARDLINE - Partitioned Key-Value Store Node
//!
//! A storage node that owns a dynamic set of partitions and serves reads and
//! writes for them. Writes are sequenced per partition, published to an
//! ordered log, and applied to a persistent engine in the background; until
//! applied they are served from a write cache.
//!
//! ## Features
//! - **Sequencing**: dense, gap-free sequence numbers per partition
//! - **Write Cache**: read-your-writes before the engine catches up
//! - **Conflict Resolver**: read-modify-write hook under per-key bucket locks
//! - **Backpressure**: writers block when too far ahead of the apply loop
//! - **Lifecycle**: coordinator-driven bootstrap, retry, and release
//! - **Durability**: CRC32-framed logs for the engine and the local broker
//! - **Metrics**: lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use shardline::{config::Config, node::Node};
//! use std::time::Duration;
//!
//! let node = Node::open(Config::new("./data")).unwrap();
//! node.become_owner(3).unwrap();
//! node.lifecycle().wait_online(3, Duration::from_secs(10));
//!
//! let handler = node.handler();
//! assert!(handler.store(b"u1", 3, b"v1", false));
//! assert_eq!(handler.lookup(b"u1", 3).unwrap().as_deref(), Some(&b"v1"[..]));
//! node.shutdown().unwrap();
//! ```

pub mod config;
pub mod directory;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod node;
pub mod partition;
pub mod resolver;
pub mod seqlog;
pub mod types;
pub mod wal;
