//! Lifecycle events for dispatched work.
//!
//! Workers emit a [`WorkEvent`] at each step of a request's life: queued, gated by a rate
//! limit, started, finished, backing off. Events flow into a [`TelemetrySink`], which is a
//! `tower::Service<WorkEvent>` so sinks compose with ordinary tower tooling.
//!
//! ```rust
//! use worksched::telemetry::{MemorySink, WorkEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = WorkEvent::Queued { work_id: "upload".into(), request_id: 0 };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future;
use tower::Service;

use crate::request::ConflictPolicy;
use crate::task::TaskOutcome;

/// A sink that consumes work lifecycle events.
pub trait TelemetrySink:
    tower::Service<WorkEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Emit `event`, honoring `poll_ready` and dropping the event on any sink error.
pub async fn emit_best_effort<S>(sink: S, event: WorkEvent)
where
    S: tower::Service<WorkEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// One step in the life of a work request.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkEvent {
    /// Accepted into a worker's pending list.
    Queued { work_id: String, request_id: u64 },
    /// Dropped on arrival because of the conflict policy.
    Skipped { work_id: String, policy: ConflictPolicy },
    /// Pending requests discarded in favour of a newer one.
    Replaced { work_id: String, dropped: usize },
    /// No worker registered for the work ID; the request was discarded.
    Unhandled { work_id: String },
    /// Waiting on a rate limit before the attempt may start.
    RateLimited { work_id: String, request_id: u64, retry_after: Duration },
    /// The worker was handed the request.
    Started { work_id: String, request_id: u64, attempt: u32 },
    /// The attempt resolved.
    Finished { work_id: String, request_id: u64, attempt: u32, outcome: TaskOutcome, duration: Duration },
    /// Sleeping before the next attempt.
    BackingOff { work_id: String, request_id: u64, attempt: u32, delay: Duration },
}

impl WorkEvent {
    pub fn work_id(&self) -> &str {
        match self {
            WorkEvent::Queued { work_id, .. }
            | WorkEvent::Skipped { work_id, .. }
            | WorkEvent::Replaced { work_id, .. }
            | WorkEvent::Unhandled { work_id }
            | WorkEvent::RateLimited { work_id, .. }
            | WorkEvent::Started { work_id, .. }
            | WorkEvent::Finished { work_id, .. }
            | WorkEvent::BackingOff { work_id, .. } => work_id,
        }
    }
}

impl fmt::Display for WorkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkEvent::Queued { work_id, request_id } => write!(f, "Queued({work_id}#{request_id})"),
            WorkEvent::Skipped { work_id, policy } => write!(f, "Skipped({work_id}, policy={policy:?})"),
            WorkEvent::Replaced { work_id, dropped } => write!(f, "Replaced({work_id}, dropped={dropped})"),
            WorkEvent::Unhandled { work_id } => write!(f, "Unhandled({work_id})"),
            WorkEvent::RateLimited { work_id, request_id, retry_after } => {
                write!(f, "RateLimited({work_id}#{request_id}, retry_after={retry_after:?})")
            }
            WorkEvent::Started { work_id, request_id, attempt } => {
                write!(f, "Started({work_id}#{request_id}, attempt={attempt})")
            }
            WorkEvent::Finished { work_id, request_id, attempt, outcome, duration } => write!(
                f,
                "Finished({work_id}#{request_id}, attempt={attempt}, outcome={outcome}, duration={duration:?})"
            ),
            WorkEvent::BackingOff { work_id, request_id, attempt, delay } => {
                write!(f, "BackingOff({work_id}#{request_id}, attempt={attempt}, delay={delay:?})")
            }
        }
    }
}

type Done = future::Ready<Result<(), Infallible>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<WorkEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Done;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: WorkEvent) -> Self::Future {
        future::ok(())
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Forwards events to `tracing`.
///
/// Requests nobody handles are logged at WARN, failed or expired attempts at INFO, and the
/// routine steps at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<WorkEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Done;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: WorkEvent) -> Self::Future {
        match &event {
            WorkEvent::Unhandled { .. } => {
                tracing::warn!(target: "worksched::telemetry", work_id = %event.work_id(), %event, "work_event")
            }
            WorkEvent::Finished { outcome, .. } if !outcome.is_success() => {
                tracing::info!(target: "worksched::telemetry", work_id = %event.work_id(), %event, "work_event")
            }
            _ => tracing::debug!(target: "worksched::telemetry", work_id = %event.work_id(), %event, "work_event"),
        }
        future::ok(())
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory. Clones share the buffer.
#[derive(Clone, Debug)]
pub struct MemorySink {
    buffer: Arc<Mutex<VecDeque<WorkEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Holds up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<WorkEvent>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored events, oldest first.
    pub fn events(&self) -> Vec<WorkEvent> {
        self.buffer().iter().cloned().collect()
    }

    /// Stored events for one work ID, oldest first.
    pub fn events_for(&self, work_id: &str) -> Vec<WorkEvent> {
        self.buffer().iter().filter(|e| e.work_id() == work_id).cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events pushed out to make room.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<WorkEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Done;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: WorkEvent) -> Self::Future {
        let mut buffer = self.buffer();
        while buffer.len() >= self.capacity {
            buffer.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
        future::ok(())
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
