//! SHARDLINE - Performance Benchmarks
//! Measures throughput of the write cache, the envelope codec, the frame log
//! and the full store/lookup path using Criterion.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use shardline::config::Config;
use shardline::envelope::ValueEnvelope;
use shardline::node::Node;
use shardline::partition::cache::WriteCache;
use shardline::resolver::CounterResolver;
use shardline::types::PendingWrite;
use shardline::wal::WriteAheadLog;

fn bench_write_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_cache");

    group.bench_function("install_1000", |b| {
        b.iter(|| {
            let cache = WriteCache::new();
            for i in 0..1000u64 {
                let key = Bytes::from(format!("key_{:06}", i));
                let record = PendingWrite::new(key, 0, i + 1, Bytes::from_static(b"value"), false);
                cache.install(black_box(record));
            }
        });
    });

    group.bench_function("get_hit", |b| {
        let cache = WriteCache::new();
        for i in 0..1000u64 {
            let key = Bytes::from(format!("key_{:06}", i));
            cache.install(PendingWrite::new(key, 0, i + 1, Bytes::from_static(b"value"), false));
        }
        b.iter(|| {
            black_box(cache.value(b"key_000500"));
        });
    });

    group.bench_function("evict_applied_1000", |b| {
        b.iter(|| {
            let cache = WriteCache::new();
            for i in 0..1000u64 {
                let key = Bytes::from(format!("key_{:06}", i));
                cache.install(PendingWrite::new(key, 0, i + 1, Bytes::from_static(b"v"), false));
            }
            for i in 0..1000u64 {
                let key = format!("key_{:06}", i);
                cache.evict_applied(key.as_bytes(), i + 1);
            }
        });
    });

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let value = Bytes::from(vec![7u8; 256]);

    group.bench_function("encode_256b", |b| {
        let envelope = ValueEnvelope::new(value.clone(), 42);
        b.iter(|| black_box(envelope.encode().unwrap()));
    });

    group.bench_function("decode_256b", |b| {
        let raw = ValueEnvelope::new(value.clone(), 42).encode().unwrap();
        b.iter(|| black_box(ValueEnvelope::decode(&raw).unwrap()));
    });

    group.finish();
}

fn bench_frame_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_log");

    group.bench_function("append_100", |b| {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, _) = WriteAheadLog::open(dir.path().join("bench.wal"), false).unwrap();
        let payload = vec![1u8; 64];

        b.iter(|| {
            for _ in 0..100 {
                wal.append(black_box(&payload)).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_node_e2e(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_e2e");
    group.sample_size(20);

    for size in [100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("store_lookup", size), size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let config = Config::new(dir.path())
                .with_sync_writes(false)
                .with_durable_log(false);
            let node = Node::open(config).unwrap();
            node.become_owner(0).unwrap();
            node.lifecycle().wait_online(0, Duration::from_secs(10));
            let handler = node.handler().clone();

            b.iter(|| {
                for i in 0..size {
                    let key = format!("key_{:06}", i);
                    handler.store(key.as_bytes(), 0, b"value", false);
                }
                for i in 0..size {
                    let key = format!("key_{:06}", i);
                    black_box(handler.lookup(key.as_bytes(), 0).unwrap());
                }
            });
            node.shutdown().unwrap();
        });
    }

    group.bench_function("counter_incr_100", |b| {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .with_sync_writes(false)
            .with_durable_log(false);
        let node = Node::builder(config)
            .resolver(Arc::new(CounterResolver))
            .build()
            .unwrap();
        node.become_owner(0).unwrap();
        node.lifecycle().wait_online(0, Duration::from_secs(10));
        let handler = node.handler().clone();
        let delta = CounterResolver::encode(1);

        b.iter(|| {
            for _ in 0..100 {
                handler.store(b"counter", 0, &delta, true);
            }
        });
        node.shutdown().unwrap();
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_write_cache,
    bench_envelope,
    bench_frame_log,
    bench_node_e2e
);
criterion_main!(benches);
