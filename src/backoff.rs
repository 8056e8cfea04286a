//! Wait between failed attempts of the same request.
//!
//! Attempt numbers are 1-based: `delay(1)` is the wait after the first failure.
//!
//! ```rust
//! use std::time::Duration;
//! use worksched::Backoff;
//!
//! let backoff = Backoff::linear(Duration::from_secs(30), Duration::from_secs(120)).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_secs(30));
//! assert_eq!(backoff.delay(3), Duration::from_secs(90));
//! assert_eq!(backoff.delay(9), Duration::from_secs(120));
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Linear schedule, `step * attempt`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn linear(step: Duration, max: Duration) -> Result<Self, ConfigError> {
        if step.is_zero() {
            return Err(ConfigError::ZeroInitialBackoff);
        }
        if max < step {
            return Err(ConfigError::MaxBackoffBelowInitial { initial: step, max });
        }
        Ok(Self { step, max })
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Wait after failed attempt number `attempt`; zero for attempt 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.step.checked_mul(attempt).map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    /// 30s steps capped at two minutes.
    fn default() -> Self {
        Self { step: Duration::from_secs(30), max: Duration::from_secs(120) }
    }
}
