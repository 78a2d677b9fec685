//! Admission-control and event fan-out benchmarks.
//!
//! Measures the token-bucket check-and-consume hot path (single key, many
//! keys, contended) and event bus emit latency using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use persona_kernel::bus::{handler_fn, EventBus};
use persona_kernel::kernel::{RateLimitConfig, RateLimiter};
use std::sync::Arc;

fn bench_allow_single_key(c: &mut Criterion) {
    // Refill fast enough that the bucket never runs dry during the run.
    let limiter = RateLimiter::new(Some(RateLimitConfig::new(1_000_000.0, 1_000_000_000.0)));
    c.bench_function("allow/single_key", |b| {
        b.iter(|| limiter.allow(black_box("llm:coral")))
    });
}

fn bench_allow_many_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("allow/many_keys");
    for &keys in &[10usize, 1_000, 10_000] {
        let limiter = RateLimiter::new(Some(RateLimitConfig::new(1_000_000.0, 1_000_000.0)));
        let names: Vec<String> = (0..keys).map(|i| format!("llm:identity-{}", i)).collect();
        for name in &names {
            limiter.allow(name);
        }
        group.bench_with_input(BenchmarkId::from_parameter(keys), &names, |b, names| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % names.len();
                limiter.allow(black_box(&names[i]))
            });
        });
    }
    group.finish();
}

fn bench_allow_contended(c: &mut Criterion) {
    let limiter = Arc::new(RateLimiter::new(Some(RateLimitConfig::new(
        1_000_000.0,
        1_000_000_000.0,
    ))));
    c.bench_function("allow/contended_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let limiter = limiter.clone();
                    std::thread::spawn(move || {
                        for _ in 0..256 {
                            black_box(limiter.allow("llm:shared"));
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        })
    });
}

fn bench_emit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("emit");
    for &handlers in &[0usize, 1, 8, 64] {
        let bus = EventBus::new();
        rt.block_on(async {
            for _ in 0..handlers {
                bus.subscribe("heartbeat", handler_fn(|_| async { Ok(()) }))
                    .await;
            }
        });
        group.bench_with_input(BenchmarkId::from_parameter(handlers), &bus, |b, bus| {
            b.iter(|| rt.block_on(bus.emit("heartbeat", serde_json::json!({ "beat": 1 }))));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_allow_single_key,
    bench_allow_many_keys,
    bench_allow_contended,
    bench_emit
);
criterion_main!(benches);
