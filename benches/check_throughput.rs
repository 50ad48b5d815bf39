use abuseguard::telemetry::MemorySink;
use abuseguard::{presets, EngineConfig, RateLimiter};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};

// Allowed path: a fresh actor every iteration, so every check is a first request.
fn check_allowed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::new(presets::marketplace());
    let next = AtomicU64::new(0);

    c.bench_function("check_allowed_sliding_window", |b| {
        b.to_async(&rt).iter(|| async {
            let actor = next.fetch_add(1, Ordering::Relaxed);
            let d = limiter.check(actor, "purchase", 0.0).await.unwrap();
            black_box(d);
        })
    });

    c.bench_function("check_allowed_token_bucket", |b| {
        b.to_async(&rt).iter(|| async {
            let actor = next.fetch_add(1, Ordering::Relaxed);
            let d = limiter.check(actor, "api_call", 0.0).await.unwrap();
            black_box(d);
        })
    });
}

// Denied path: violation scoring plus event emission to an in-memory sink.
fn check_denied(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = EngineConfig { abuse_threshold: f64::MAX, ..EngineConfig::default() };
    let limiter = RateLimiter::builder()
        .config(config)
        .limits(presets::marketplace())
        .sink(MemorySink::with_capacity(1_024))
        .build()
        .unwrap();
    rt.block_on(async {
        for _ in 0..5 {
            limiter.check("hot", "login", 0.0).await.unwrap();
        }
    });

    c.bench_function("check_denied_fixed_window", |b| {
        b.to_async(&rt).iter(|| async {
            let d = limiter.check("hot", "login", 1.0).await.unwrap();
            black_box(d);
        })
    });
}

// Blocked path: short-circuit before any state access.
fn check_blocked(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::new(presets::marketplace());
    rt.block_on(async {
        for _ in 0..30 {
            limiter.check("abuser", "payment_request", 0.0).await.unwrap();
        }
    });
    assert!(limiter.is_blocked("abuser"));

    c.bench_function("check_blocked_actor", |b| {
        b.to_async(&rt).iter(|| async {
            let d = limiter.check("abuser", "purchase", 0.0).await.unwrap();
            black_box(d);
        })
    });
}

criterion_group!(benches, check_allowed, check_denied, check_blocked);
criterion_main!(benches);
