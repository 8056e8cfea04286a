mod common;

use std::time::Duration;

use common::test_helpers::capture_logs;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use worksched::{GateError, ManualClock, RateLimitLayer, RateLimitStatus, SlidingWindowLimiter};

fn limiter() -> (SlidingWindowLimiter, ManualClock) {
    let clock = ManualClock::new();
    (SlidingWindowLimiter::with_clock(clock.clone()), clock)
}

#[test]
fn never_more_than_rate_hits_in_any_window() {
    let (limiter, clock) = limiter();
    limiter.set("upload", 3, Duration::from_secs(10)).unwrap();

    let mut admitted = Vec::new();
    for second in 0..40u64 {
        clock.set(Duration::from_secs(second));
        if limiter.track_if_within_limit(&["upload"]) {
            admitted.push(second);
        }
    }

    for (i, &start) in admitted.iter().enumerate() {
        let in_window = admitted[i..].iter().take_while(|&&t| t < start + 10).count();
        assert!(in_window <= 3, "window starting at {start}s admitted {in_window}");
    }
    assert_eq!(admitted, vec![0, 1, 2, 10, 11, 12, 20, 21, 22, 30, 31, 32]);
}

#[test]
fn retry_after_points_at_next_free_slot() {
    let (limiter, clock) = limiter();
    limiter.set("sync", 2, Duration::from_secs(60)).unwrap();
    limiter.track("sync");
    clock.advance(Duration::from_secs(20));
    limiter.track("sync");

    clock.advance(Duration::from_secs(10));
    let status = limiter.status("sync").unwrap();
    assert_eq!(status, RateLimitStatus::OverLimit { retry_after: Duration::from_secs(30) });

    clock.advance(status.retry_after());
    assert_eq!(limiter.status("sync"), Some(RateLimitStatus::WithinLimit { remaining: 1 }));
}

#[test]
fn re_registering_a_rule_clears_history() {
    let (limiter, _clock) = limiter();
    limiter.set("k", 1, Duration::from_secs(60)).unwrap();
    limiter.track("k");
    assert!(!limiter.status("k").unwrap().is_within_limit());

    limiter.set("k", 1, Duration::from_secs(60)).unwrap();
    assert_eq!(limiter.status("k"), Some(RateLimitStatus::WithinLimit { remaining: 1 }));
}

#[test]
fn unregistered_keys_are_lenient_but_logged() {
    let (logs, _guard) = capture_logs();
    let (limiter, _clock) = limiter();

    assert_eq!(limiter.status("missing"), None);
    limiter.track("missing");
    assert!(limiter.track_if_within_limit(&["missing"]));
    assert_eq!(limiter.next_available(&["missing"]), Duration::ZERO);

    let output = logs.contents();
    assert!(output.contains("WARN"), "expected a warning, got: {output}");
    assert!(output.contains("no rate limit rule registered"));
    assert!(output.contains("worksched::rate_limit"));
}

#[test]
fn multi_key_tracking_is_all_or_nothing() {
    let (limiter, clock) = limiter();
    limiter.set("global", 10, Duration::from_secs(60)).unwrap();
    limiter.set("channel", 1, Duration::from_secs(30)).unwrap();

    assert!(limiter.track_if_within_limit(&["global", "channel"]));
    assert!(!limiter.track_if_within_limit(&["global", "channel"]));
    assert_eq!(limiter.status("global"), Some(RateLimitStatus::WithinLimit { remaining: 9 }));
    assert_eq!(limiter.next_available(&["global", "channel"]), Duration::from_secs(30));

    clock.advance(Duration::from_secs(30));
    assert!(limiter.track_if_within_limit(&["global", "channel"]));
    assert_eq!(limiter.status("global"), Some(RateLimitStatus::WithinLimit { remaining: 8 }));
}

#[tokio::test]
async fn layer_shares_budget_with_direct_callers() {
    let (limiter, clock) = limiter();
    limiter.set("api", 2, Duration::from_secs(1)).unwrap();

    let service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(limiter.clone(), ["api"]))
        .service(service_fn(|n: u32| async move { Ok::<_, std::convert::Infallible>(n * 2) }));

    // Work dispatched elsewhere already used half the budget.
    limiter.track("api");
    assert_eq!(service.clone().oneshot(1).await.unwrap(), 2);

    let err = service.clone().oneshot(2).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err, GateError::RateLimited { retry_after: Duration::from_secs(1) });
    assert!(!limiter.track_if_within_limit(&["api"]));

    clock.advance(Duration::from_secs(1));
    assert_eq!(service.oneshot(3).await.unwrap(), 6);
}
