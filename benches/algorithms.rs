//! Benchmarks for rate limiting algorithms.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use admit_ratelimit::{
    algorithm::{Algorithm, FixedWindow, SlidingWindow, TokenBucket},
    storage::MemoryStorage,
    ClientId, EngineConfig, Quota, RateLimiter, Variant,
};
use tokio::runtime::Runtime;

fn clients(n: u64) -> Vec<ClientId> {
    (0..n).map(|i| ClientId::from(format!("10.0.{}.{}", i / 256, i % 256))).collect()
}

fn bench_algorithms(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let quota = Quota::per_second(1000).with_bucket_size(100);
    let clients = clients(100);

    let mut group = c.benchmark_group("algorithms");

    // Token Bucket
    group.bench_function("token_bucket", |b| {
        let storage = MemoryStorage::new();
        let algorithm = TokenBucket::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let client = &clients[(i % 100) as usize];
            rt.block_on(async {
                black_box(algorithm.check_and_record(&storage, client, &quota, i).await)
            })
        })
    });

    // Fixed Window
    group.bench_function("fixed_window", |b| {
        let storage = MemoryStorage::new();
        let algorithm = FixedWindow::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let client = &clients[(i % 100) as usize];
            rt.block_on(async {
                black_box(algorithm.check_and_record(&storage, client, &quota, i).await)
            })
        })
    });

    // Sliding Window
    group.bench_function("sliding_window", |b| {
        let storage = MemoryStorage::new();
        let algorithm = SlidingWindow::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let client = &clients[(i % 100) as usize];
            rt.block_on(async {
                black_box(algorithm.check_and_record(&storage, client, &quota, i).await)
            })
        })
    });

    group.finish();
}

fn bench_engine_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let clients = clients(1000);

    let mut group = c.benchmark_group("engine");

    for num_clients in [1u64, 10, 100, 1000].iter() {
        for variant in Variant::ALL {
            group.bench_with_input(BenchmarkId::new(variant.as_str(), num_clients), num_clients, |b, &num_clients| {
                let limiter =
                    RateLimiter::new(Arc::new(MemoryStorage::new()), EngineConfig::default()).unwrap();
                let mut i = 0u64;
                b.iter(|| {
                    i += 1;
                    let client = &clients[(i % num_clients) as usize];
                    rt.block_on(async { black_box(limiter.decide(variant, client, i).await) })
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_algorithms, bench_engine_dispatch);
criterion_main!(benches);
