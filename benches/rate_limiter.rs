use criterion::{black_box, criterion_group, criterion_main, Criterion};
use worksched::{RateLimitLayer, SlidingWindowLimiter};

use std::time::Duration;
use futures::future::Ready;
use tower::{Service, ServiceBuilder};

// Returns its input; the limiter is the only cost being measured.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::convert::Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn track_if_within_limit_admitting(c: &mut Criterion) {
    let limiter = SlidingWindowLimiter::new();
    // Large enough that the window never fills during a run.
    limiter.set("global", usize::MAX, Duration::from_millis(1)).unwrap();
    limiter.set("channel", usize::MAX, Duration::from_millis(1)).unwrap();

    c.bench_function("track_if_within_limit_two_keys", |b| {
        b.iter(|| black_box(limiter.track_if_within_limit(black_box(&["global", "channel"]))));
    });
}

fn next_available_over_limit(c: &mut Criterion) {
    let limiter = SlidingWindowLimiter::new();
    limiter.set("uploads", 1_000, Duration::from_secs(3600)).unwrap();
    for _ in 0..1_000 {
        limiter.track("uploads");
    }

    c.bench_function("next_available_full_window_1k", |b| {
        b.iter(|| black_box(limiter.next_available(black_box(&["uploads"]))));
    });
}

fn rate_limit_layer_rejecting(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = SlidingWindowLimiter::new();
    limiter.set("api", 1, Duration::from_secs(3600)).unwrap();
    limiter.track("api");

    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(limiter, ["api"]))
        .service(EchoService);

    c.bench_function("rate_limit_layer_rejecting", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(
    benches,
    track_if_within_limit_admitting,
    next_available_over_limit,
    rate_limit_layer_rejecting
);
criterion_main!(benches);
