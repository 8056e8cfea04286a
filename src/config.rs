//! Tunables for the dispatch layer.

use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::ConfigError;

/// Scheduling configuration shared by every worker of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WorkConfig {
    /// Work is not started while less background execution time than this remains.
    pub min_background_time: Duration,
    /// Wait after the first failed attempt; grows linearly per attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the wait between attempts.
    pub max_backoff: Duration,
}

impl WorkConfig {
    pub const DEFAULT_MIN_BACKGROUND_TIME: Duration = Duration::from_secs(60);
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff().map(|_| ())
    }

    /// Linear backoff described by this config.
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        Backoff::linear(self.initial_backoff, self.max_backoff)
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            min_background_time: Self::DEFAULT_MIN_BACKGROUND_TIME,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
        }
    }
}
