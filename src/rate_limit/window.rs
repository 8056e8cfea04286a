use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::error::RateLimitError;
use crate::rate_limit::{RateLimitRule, RateLimitStatus};

#[derive(Debug)]
struct RuleState {
    rule: RateLimitRule,
    /// Hit timestamps since the clock's origin, oldest first.
    hits: VecDeque<Duration>,
}

impl RuleState {
    fn prune(&mut self, now: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_sub(oldest) < self.rule.window {
                break;
            }
            self.hits.pop_front();
        }
    }

    fn status(&mut self, now: Duration) -> RateLimitStatus {
        self.prune(now);
        let count = self.hits.len();
        if count >= self.rule.rate {
            let blocking = self.hits[count - self.rule.rate];
            let elapsed = now.saturating_sub(blocking);
            RateLimitStatus::OverLimit { retry_after: self.rule.window.saturating_sub(elapsed) }
        } else {
            RateLimitStatus::WithinLimit { remaining: self.rule.rate - count }
        }
    }

    fn track(&mut self, now: Duration) {
        self.hits.push_back(now);
        self.prune(now);
    }
}

/// Sliding-window limiter keyed by rule name.
///
/// All state sits behind one mutex; critical sections only compare timestamps, so callers may
/// use the limiter from any thread or task. Cloning is cheap and clones share state.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use worksched::{RateLimitStatus, SlidingWindowLimiter};
///
/// let limiter = SlidingWindowLimiter::new();
/// limiter.set("upload", 2, Duration::from_secs(10)).unwrap();
/// limiter.track("upload");
/// assert_eq!(limiter.status("upload"), Some(RateLimitStatus::WithinLimit { remaining: 1 }));
/// assert_eq!(limiter.status("unknown"), None);
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    rules: Arc<Mutex<HashMap<String, RuleState>>>,
    clock: Arc<dyn Clock>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Use a specific time source (e.g. `ManualClock` or `TokioClock` in tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { rules: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(clock) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RuleState>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register or replace the rule for `key`, clearing its hit history.
    ///
    /// Errors if `rate == 0` or `time_interval` is zero; in that case any existing rule is left
    /// untouched.
    pub fn set(
        &self,
        key: impl Into<String>,
        rate: usize,
        time_interval: Duration,
    ) -> Result<(), RateLimitError> {
        let key = key.into();
        if rate == 0 {
            return Err(RateLimitError::InvalidRate { key, rate });
        }
        if time_interval.is_zero() {
            return Err(RateLimitError::InvalidInterval { key, interval: time_interval });
        }

        trace!(target: "worksched::rate_limit", key = %key, rate, ?time_interval, "rate limit set");
        let state = RuleState {
            rule: RateLimitRule { rate, window: time_interval },
            hits: VecDeque::with_capacity(rate.min(64)),
        };
        self.lock().insert(key, state);
        Ok(())
    }

    /// Registered rule for `key`, if any.
    pub fn rule(&self, key: &str) -> Option<RateLimitRule> {
        self.lock().get(key).map(|state| state.rule.clone())
    }

    /// Current status of `key`, or `None` when no rule is registered.
    pub fn status(&self, key: &str) -> Option<RateLimitStatus> {
        let now = self.clock.now();
        let status = self.lock().get_mut(key).map(|state| state.status(now));
        if status.is_none() {
            warn!(target: "worksched::rate_limit", key = %key, "no rate limit rule registered; treating key as unlimited");
        }
        status
    }

    /// Record a hit for `key`. No-op when no rule is registered.
    pub fn track(&self, key: &str) {
        let now = self.clock.now();
        let tracked = self.lock().get_mut(key).map(|state| state.track(now)).is_some();
        if !tracked {
            warn!(target: "worksched::rate_limit", key = %key, "no rate limit rule registered; hit not tracked");
        }
    }

    /// Longest wait among `keys` that are currently over limit; zero if all may fire.
    ///
    /// Unregistered keys never contribute a wait.
    pub fn next_available<S: AsRef<str>>(&self, keys: &[S]) -> Duration {
        let now = self.clock.now();
        let mut rules = self.lock();
        keys.iter()
            .filter_map(|key| rules.get_mut(key.as_ref()).map(|state| state.status(now)))
            .map(|status| status.retry_after())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Track a hit on every key, but only if every key is currently within its limit.
    ///
    /// The check and the tracking happen under one lock, so two callers racing for the last
    /// slot cannot both win.
    pub fn track_if_within_limit<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        let now = self.clock.now();
        let mut rules = self.lock();
        for key in keys {
            if let Some(state) = rules.get_mut(key.as_ref()) {
                if !state.status(now).is_within_limit() {
                    return false;
                }
            }
        }
        for key in keys {
            if let Some(state) = rules.get_mut(key.as_ref()) {
                state.track(now);
            }
        }
        true
    }
}
