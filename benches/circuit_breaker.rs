use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use gatekeeper::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

fn circuit_breaker_benchmark(c: &mut Criterion) {
    let closed = CircuitBreaker::with_defaults("bench-closed");
    c.bench_function("circuit_breaker_allow_closed", |b| {
        b.iter(|| {
            black_box(closed.allow());
            closed.record_success();
        })
    });

    let open = CircuitBreaker::new(
        "bench-open",
        CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(3600),
            ..CircuitBreakerConfig::default()
        },
    )
    .unwrap();
    open.record_failure();
    c.bench_function("circuit_breaker_allow_open", |b| {
        b.iter(|| black_box(open.allow()))
    });
}

criterion_group!(benches, circuit_breaker_benchmark);
criterion_main!(benches);
