//! Composition root: routes requests to per-work-ID workers.
//!
//! ```rust
//! use std::time::Duration;
//! use worksched::{handler_fn, WorkDispatcher, WorkRequest, WorkResult};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), worksched::WorkError> {
//! let dispatcher = WorkDispatcher::builder().build()?;
//! dispatcher.set_rate_limit("uploads", 5, Duration::from_secs(60))?;
//! dispatcher.register_worker(
//!     "upload",
//!     handler_fn(|_request: WorkRequest| async { Ok::<_, std::io::Error>(WorkResult::Success) }),
//! );
//!
//! dispatcher
//!     .dispatch(WorkRequest::builder("upload").rate_limit_ids(["uploads"]).build())
//!     .await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tower::Service;
use tracing::{debug, warn};

use crate::background::{BackgroundTasks, NoopBackgroundTasks};
use crate::conditions::WorkConditionsMonitor;
use crate::config::WorkConfig;
use crate::error::WorkError;
use crate::handler::WorkHandler;
use crate::rate_limit::SlidingWindowLimiter;
use crate::request::{WorkRequest, WorkerType};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, NullSink, TelemetrySink, WorkEvent};
use crate::worker::{Worker, WorkerContext};

/// Owns the workers, the shared rate limiter and the conditions monitor.
///
/// Must be used from within a tokio runtime: registering a worker spawns its loop. Dropping the
/// dispatcher stops every worker and cancels in-flight attempts.
pub struct WorkDispatcher<S = NullSink> {
    ctx: WorkerContext<S>,
    workers: Mutex<HashMap<String, Worker<S>>>,
}

impl WorkDispatcher<NullSink> {
    pub fn builder() -> WorkDispatcherBuilder<NullSink> {
        WorkDispatcherBuilder::new()
    }
}

impl<S> WorkDispatcher<S> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Worker<S>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Monitor to notify of condition changes (app state, connectivity).
    pub fn conditions(&self) -> &WorkConditionsMonitor {
        &self.ctx.conditions
    }

    pub fn rate_limiter(&self) -> &SlidingWindowLimiter {
        &self.ctx.limiter
    }

    /// Register or replace the rate-limit rule `key`.
    pub fn set_rate_limit(
        &self,
        key: impl Into<String>,
        rate: usize,
        time_interval: Duration,
    ) -> Result<(), WorkError> {
        self.ctx.limiter.set(key, rate, time_interval)?;
        Ok(())
    }

    /// Requests queued or running for `work_id`.
    pub fn pending_count(&self, work_id: &str) -> usize {
        self.lock().get(work_id).map_or(0, |worker| worker.pending_len())
    }

    pub fn registered_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every worker; pending requests are discarded.
    pub fn shutdown(&self) {
        let workers: Vec<Worker<S>> = self.lock().drain().map(|(_, worker)| worker).collect();
        debug!(target: "worksched::dispatcher", count = workers.len(), "stopping workers");
        drop(workers);
    }
}

impl<S> WorkDispatcher<S>
where
    S: TelemetrySink + Sync,
    <S as Service<WorkEvent>>::Future: Send + 'static,
{
    /// Route requests for `work_id` to `handler`, one request at a time.
    ///
    /// Replaces (and stops) any previous worker for the same ID.
    pub fn register_worker<H>(&self, work_id: impl Into<String>, handler: H)
    where
        H: WorkHandler + 'static,
    {
        self.register_worker_with_type(work_id, WorkerType::Serial, handler);
    }

    /// Like [`register_worker`](Self::register_worker), choosing how accepted requests are
    /// scheduled.
    pub fn register_worker_with_type<H>(&self, work_id: impl Into<String>, worker_type: WorkerType, handler: H)
    where
        H: WorkHandler + 'static,
    {
        let work_id = work_id.into();
        let worker = Worker::new(work_id.clone(), worker_type, Arc::new(handler), self.ctx.clone());
        let previous = self.lock().insert(work_id, worker);
        if let Some(previous) = previous {
            debug!(target: "worksched::dispatcher", work_id = %previous.work_id(), ?worker_type, "replaced worker");
        }
    }

    /// Hand `request` to its worker, which applies the conflict policy and schedules it.
    ///
    /// Requests with no registered worker are logged and dropped.
    pub async fn dispatch(&self, request: WorkRequest) {
        let events = {
            let workers = self.lock();
            match workers.get(request.work_id()) {
                Some(worker) => worker.add_work(request),
                None => {
                    warn!(target: "worksched::dispatcher", work_id = %request.work_id(), "no worker registered; dropping request");
                    vec![WorkEvent::Unhandled { work_id: request.work_id().to_string() }]
                }
            }
        };
        for event in events {
            emit_best_effort(self.ctx.sink.clone(), event).await;
        }
    }

    /// Longest rate-limit wait, at most `max`, that pending work could use while the app is in
    /// the background. Zero if nothing is worth waiting for.
    pub fn background_wait_time(&self, max: Duration) -> Duration {
        self.lock()
            .values()
            .map(|worker| worker.background_wait_time(max))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

impl<S> fmt::Debug for WorkDispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkDispatcher")
            .field("workers", &self.registered_workers())
            .field("conditions", &self.ctx.conditions)
            .finish()
    }
}

/// Builder for [`WorkDispatcher`].
pub struct WorkDispatcherBuilder<S = NullSink> {
    limiter: SlidingWindowLimiter,
    conditions: Option<WorkConditionsMonitor>,
    background_tasks: Arc<dyn BackgroundTasks>,
    sleeper: Arc<dyn Sleeper>,
    config: WorkConfig,
    sink: S,
}

impl WorkDispatcherBuilder<NullSink> {
    /// Defaults: monotonic-clock limiter, always-connected network, unlimited background time,
    /// leases always granted, tokio timers, default [`WorkConfig`], telemetry discarded.
    pub fn new() -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(),
            conditions: None,
            background_tasks: Arc::new(NoopBackgroundTasks),
            sleeper: Arc::new(TokioSleeper),
            config: WorkConfig::default(),
            sink: NullSink,
        }
    }
}

impl Default for WorkDispatcherBuilder<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> WorkDispatcherBuilder<S> {
    pub fn rate_limiter(mut self, limiter: SlidingWindowLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Conditions monitor. Its background time margin is overridden by
    /// [`WorkConfig::min_background_time`].
    pub fn conditions(mut self, conditions: WorkConditionsMonitor) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn background_tasks<B>(mut self, background_tasks: B) -> Self
    where
        B: BackgroundTasks + 'static,
    {
        self.background_tasks = Arc::new(background_tasks);
        self
    }

    pub fn sleeper<T>(mut self, sleeper: T) -> Self
    where
        T: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn config(mut self, config: WorkConfig) -> Self {
        self.config = config;
        self
    }

    /// Send lifecycle events to `sink`.
    pub fn sink<T>(self, sink: T) -> WorkDispatcherBuilder<T> {
        WorkDispatcherBuilder {
            limiter: self.limiter,
            conditions: self.conditions,
            background_tasks: self.background_tasks,
            sleeper: self.sleeper,
            config: self.config,
            sink,
        }
    }

    /// Validate the config and assemble the dispatcher.
    pub fn build(self) -> Result<WorkDispatcher<S>, WorkError> {
        let backoff = self.config.backoff()?;
        let conditions = self
            .conditions
            .unwrap_or_default()
            .with_min_background_time(self.config.min_background_time);
        Ok(WorkDispatcher {
            ctx: WorkerContext {
                limiter: self.limiter,
                conditions: Arc::new(conditions),
                background_tasks: self.background_tasks,
                sleeper: self.sleeper,
                backoff,
                sink: self.sink,
            },
            workers: Mutex::new(HashMap::new()),
        })
    }
}
