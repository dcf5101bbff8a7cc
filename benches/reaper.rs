//! Reaper Benchmarks
//!
//! Measures key routing and full scan cycles over a backlog of expired keys.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use reapkv::keyspace::{split_key, table_db_name};
use reapkv::storage::DbKind;
use reapkv::{
    register_ttl, Database, Environment, ExpiryIndex, ManualClock, MemEnv, Reaper, ReaperConfig,
    RoleContext, TickOutcome,
};
use std::sync::Arc;

/// Benchmark splitting namespaced keys
fn bench_split_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_key");
    group.throughput(Throughput::Elements(1));

    group.bench_function("namespaced", |b| {
        b.iter(|| split_key(black_box(b"orders:1234567")));
    });

    group.bench_function("default_table", |b| {
        b.iter(|| split_key(black_box(b"session-1234567")));
    });

    group.finish();
}

/// Builds a store holding `keys` records, all registered to expire at t=1.
fn backlog(keys: u32) -> (Arc<MemEnv>, ManualClock) {
    let env = Arc::new(MemEnv::new());
    let clock = ManualClock::new(0);
    let index = ExpiryIndex::open(&*env, true).unwrap();

    for i in 0..keys {
        let key = format!("t{}:{}", i % 8, i);
        let (table, name) = split_key(key.as_bytes());
        let db_name = table_db_name(&table);
        env.create_db(&db_name, DbKind::Btree);
        let db = env.open_db(&db_name, DbKind::Unknown, false).unwrap();
        db.put(None, &name, b"value").unwrap();
        register_ttl(&*env, &index, &clock, key.as_bytes(), 1, i, 1).unwrap();
    }

    clock.set(10);
    (env, clock)
}

/// Benchmark one scan cycle draining the whole backlog
fn bench_scan_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("scan_cycle");

    for (keys, batch_cap) in [(1_000u32, 1000usize), (10_000, 1000), (10_000, 100)] {
        group.throughput(Throughput::Elements(keys as u64));
        group.bench_function(format!("{}_keys_cap_{}", keys, batch_cap), |b| {
            b.iter_batched(
                || {
                    let (env, clock) = backlog(keys);
                    let role = RoleContext::new(true);
                    let config = ReaperConfig::default().with_batch_cap(batch_cap);
                    let reaper = Reaper::new(env, role.gate(), config).with_clock(Arc::new(clock));
                    (reaper, role)
                },
                |(mut reaper, _role)| {
                    let outcome = runtime.block_on(reaper.tick());
                    assert!(matches!(outcome, TickOutcome::Scanned(_)));
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_split_key, bench_scan_cycle);
criterion_main!(benches);
