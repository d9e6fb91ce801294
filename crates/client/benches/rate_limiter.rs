//! Rate limiter hot-path micro-benchmarks.

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use meridian_client::reliability::RateLimiter;
use meridian_client::RateLimitConfig;

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: 10_000,
        window: Duration::from_secs(1),
    });
    limiter.register_zone("zone-a");

    c.bench_function("acquire_registered", |b| {
        b.iter(|| black_box(limiter.acquire("zone-a")));
    });

    c.bench_function("acquire_fallback", |b| {
        b.iter(|| black_box(limiter.acquire("unregistered")));
    });

    c.bench_function("record_request", |b| {
        b.iter(|| limiter.record_request("zone-a"));
    });
}

criterion_group!(benches, bench_rate_limiter);
criterion_main!(benches);
