//! Waits a worker performs between steps.
//!
//! Initial delays, rate-limit waits and failure backoff all go through a [`Sleeper`] so tests
//! can observe or skip them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};

/// Source of delays for a worker.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Waits on the tokio timer; zero-length waits resolve without touching it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            future::ready(()).boxed()
        } else {
            tokio::time::sleep(duration).boxed()
        }
    }
}

/// Never waits.
///
/// Pair it only with work whose progress does not depend on time advancing. A worker polling
/// a rate limiter would never see its window roll over.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        future::ready(()).boxed()
    }
}

/// Records each requested wait, then resolves immediately. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn waits(&self) -> MutexGuard<'_, Vec<Duration>> {
        self.waits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requested waits, oldest first.
    pub fn calls(&self) -> Vec<Duration> {
        self.waits().clone()
    }

    pub fn total(&self) -> Duration {
        self.waits().iter().sum()
    }

    pub fn clear(&self) {
        self.waits().clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.waits().push(duration);
        future::ready(()).boxed()
    }
}
