//! Sliding-window rate limiting.
//!
//! This module provides:
//! - [`SlidingWindowLimiter`]: named rules, each allowing `rate` hits per time window, with an
//!   exact hit history per rule.
//! - [`RateLimitStatus`]: the answer to "may this key fire now, and how many more times".
//! - [`RateLimitLayer`]: tower middleware that rejects calls while any guarding key is over
//!   its limit.
//!
//! # Semantics
//!
//! Each rule keeps the timestamps of its past hits. Hits older than the window are pruned
//! lazily whenever the rule is queried or tracked, so at every observation point all retained
//! timestamps lie strictly inside the window. When a rule is over its limit, the retry hint is
//! the time until the hit that must expire to make room rolls out of the window.
//!
//! Querying or tracking a key with no rule is tolerated: the key is treated as unlimited and a
//! warning is logged.

use std::time::Duration;

pub mod middleware;
pub mod window;
pub use middleware::{RateLimitFuture, RateLimitLayer, RateLimitService};
pub use window::SlidingWindowLimiter;

/// A registered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Maximum hits allowed within `window`.
    pub rate: usize,
    /// Length of the sliding window.
    pub window: Duration,
}

/// Current state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    /// The rule is saturated; room frees up after `retry_after`.
    OverLimit { retry_after: Duration },
    /// The key may fire `remaining` more times right now.
    WithinLimit { remaining: usize },
}

impl RateLimitStatus {
    pub fn is_within_limit(&self) -> bool {
        matches!(self, RateLimitStatus::WithinLimit { .. })
    }

    /// Wait hint, zero when within limit.
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitStatus::OverLimit { retry_after } => *retry_after,
            RateLimitStatus::WithinLimit { .. } => Duration::ZERO,
        }
    }
}
