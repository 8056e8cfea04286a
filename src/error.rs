//! Error types for scheduling primitives.
//!
//! Only configuration mistakes and closed queues are errors. A request whose conditions are not
//! met, or a worker reporting failure, is ordinary control flow and never surfaces here.

use std::time::Duration;

/// Rejected rate-limit rule registration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RateLimitError {
    /// `rate` must allow at least one hit per window.
    #[error("rate limit '{key}': rate must be > 0 (got {rate})")]
    InvalidRate {
        /// Rule key supplied by the caller.
        key: String,
        /// Value provided by caller.
        rate: usize,
    },
    /// The window must be non-empty.
    #[error("rate limit '{key}': time interval must be > 0 (got {interval:?})")]
    InvalidInterval {
        /// Rule key supplied by the caller.
        key: String,
        /// Value provided by caller.
        interval: Duration,
    },
}

/// Errors returned by [`SerialQueue`](crate::SerialQueue).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SerialQueueError {
    /// The queue was stopped and no longer accepts work.
    #[error("serial queue stopped")]
    Stopped,
    /// The work item was dropped before producing a result (it panicked or the queue's
    /// worker loop went away).
    #[error("serial queue work item aborted before completing")]
    Aborted,
}

/// Invalid [`WorkConfig`](crate::WorkConfig) values.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("initial_backoff must be > 0")]
    ZeroInitialBackoff,
    #[error("max_backoff ({max:?}) must be >= initial_backoff ({initial:?})")]
    MaxBackoffBelowInitial { initial: Duration, max: Duration },
}

/// Errors from the dispatch layer and its collaborators.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkError {
    /// The platform refused to grant background execution for an attempt.
    #[error("background task unavailable for '{name}'")]
    BackgroundTaskUnavailable { name: String },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Error produced by services wrapped in [`RateLimitLayer`](crate::RateLimitLayer).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError<E> {
    /// At least one guarding key is over its limit.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> GateError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }

    /// Wait hint carried by a rate-limit rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn rate_limit_error_display_names_key() {
        let err = RateLimitError::InvalidRate { key: "upload".into(), rate: 0 };
        let msg = err.to_string();
        assert!(msg.contains("upload"));
        assert!(msg.contains("rate must be > 0"));

        let err = RateLimitError::InvalidInterval { key: "upload".into(), interval: Duration::ZERO };
        assert!(err.to_string().contains("time interval"));
    }

    #[test]
    fn work_error_wraps_sources() {
        let err: WorkError = ConfigError::ZeroInitialBackoff.into();
        assert_eq!(err.to_string(), "invalid configuration: initial_backoff must be > 0");

        let err: WorkError = RateLimitError::InvalidRate { key: "k".into(), rate: 0 }.into();
        assert!(matches!(err, WorkError::RateLimit(_)));
    }

    #[test]
    fn gate_error_accessors() {
        let limited: GateError<io::Error> =
            GateError::RateLimited { retry_after: Duration::from_secs(4) };
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(4)));
        assert!(limited.into_inner().is_none());

        let inner = GateError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!inner.is_rate_limited());
        assert_eq!(inner.to_string(), "boom");
        assert_eq!(inner.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
    }
}
