//! Per-work-ID worker loop.
//!
//! A worker owns the pending requests for one work ID. A serial worker processes them FIFO,
//! one at a time; a concurrent worker drives each request on its own task as soon as it is
//! queued. Each attempt:
//!
//! 1. waits out whatever is left of the request's initial delay,
//! 2. waits until its rate limits have room and its conditions hold,
//! 3. takes a background task lease whose expiration expires the attempt,
//! 4. hands the request and a fresh [`WorkTask`] to the handler,
//! 5. on success drops the request; on expiry retries straight away; otherwise backs off.
//!
//! A request leaves the queue only on success or when a `Replace` request discards it.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tower::Service;
use tracing::{debug, error, trace, warn};

use crate::background::BackgroundTasks;
use crate::backoff::Backoff;
use crate::cancellable::CancellableValueHolder;
use crate::conditions::{next_event, ConditionEvent, WorkConditionsMonitor};
use crate::handler::WorkHandler;
use crate::rate_limit::SlidingWindowLimiter;
use crate::request::{ConflictPolicy, WorkRequest, WorkResult, WorkerType};
use crate::sleeper::Sleeper;
use crate::task::{TaskOutcome, WorkTask};
use crate::telemetry::{emit_best_effort, TelemetrySink, WorkEvent};

/// Collaborators shared by every worker of a dispatcher.
#[derive(Clone)]
pub(crate) struct WorkerContext<S> {
    pub(crate) limiter: SlidingWindowLimiter,
    pub(crate) conditions: Arc<WorkConditionsMonitor>,
    pub(crate) background_tasks: Arc<dyn BackgroundTasks>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) backoff: Backoff,
    pub(crate) sink: S,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    id: u64,
    request: WorkRequest,
    queued_at: Instant,
}

type AttemptHolder = CancellableValueHolder<AbortHandle>;

#[derive(Default)]
struct WorkerState {
    pending: Vec<PendingRequest>,
    in_progress: HashSet<u64>,
    next_id: u64,
    /// In-flight attempt per request.
    attempts: HashMap<u64, Arc<AttemptHolder>>,
    /// Per-request drivers spawned by a concurrent worker.
    drivers: HashMap<u64, AbortHandle>,
}

impl WorkerState {
    fn is_pending(&self, id: u64) -> bool {
        self.pending.iter().any(|p| p.id == id)
    }

    fn cancel_attempts(&mut self) {
        for (_, attempt) in self.attempts.drain() {
            attempt.cancel();
        }
    }
}

struct Shared<S> {
    work_id: String,
    worker_type: WorkerType,
    handler: Arc<dyn WorkHandler>,
    ctx: WorkerContext<S>,
    state: Mutex<WorkerState>,
}

/// Cancels the attempt's task if the attempt is torn down before resolving it.
struct CancelOnDrop(WorkTask);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Queue and loop for a single work ID. Dropping the worker stops its loop and cancels the
/// in-flight attempt.
pub(crate) struct Worker<S> {
    shared: Arc<Shared<S>>,
    sender: mpsc::UnboundedSender<PendingRequest>,
    run_loop: JoinHandle<()>,
}

impl<S> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Worker<S> {
    pub(crate) fn work_id(&self) -> &str {
        &self.shared.work_id
    }

    /// Number of requests waiting or in progress.
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl<S> Worker<S>
where
    S: TelemetrySink + Sync,
    <S as Service<WorkEvent>>::Future: Send + 'static,
{
    /// Spawn the worker loop. Must be called from within a tokio runtime.
    pub(crate) fn new(
        work_id: impl Into<String>,
        worker_type: WorkerType,
        handler: Arc<dyn WorkHandler>,
        ctx: WorkerContext<S>,
    ) -> Self {
        let shared = Arc::new(Shared {
            work_id: work_id.into(),
            worker_type,
            handler,
            ctx,
            state: Mutex::new(WorkerState::default()),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let run_loop = tokio::spawn(Self::run(Arc::clone(&shared), receiver));
        Self { shared, sender, run_loop }
    }

    /// Apply the request's conflict policy and queue it if accepted.
    ///
    /// Returns the telemetry to report; the caller emits it once no locks are held.
    pub(crate) fn add_work(&self, request: WorkRequest) -> Vec<WorkEvent> {
        let work_id = self.shared.work_id.clone();
        if request.work_id() != work_id {
            error!(target: "worksched::worker", expected = %work_id, got = %request.work_id(), "request routed to the wrong worker");
            return Vec::new();
        }

        let mut events = Vec::new();
        let policy = request.conflict_policy();
        let mut state = self.shared.lock();
        let accept = match policy {
            ConflictPolicy::Append => true,
            ConflictPolicy::Replace => {
                let dropped = state.pending.len();
                state.pending.clear();
                state.cancel_attempts();
                if dropped > 0 {
                    debug!(target: "worksched::worker", %work_id, dropped, "replacing pending work");
                    events.push(WorkEvent::Replaced { work_id: work_id.clone(), dropped });
                }
                true
            }
            ConflictPolicy::Keep => state.pending.is_empty(),
            ConflictPolicy::KeepIfNotStarted => {
                let in_progress = &state.in_progress;
                state.pending.iter().all(|p| in_progress.contains(&p.id))
            }
        };

        if !accept {
            trace!(target: "worksched::worker", %work_id, ?policy, "keeping existing work");
            events.push(WorkEvent::Skipped { work_id, policy });
            return events;
        }

        let id = state.next_id;
        state.next_id += 1;
        let pending = PendingRequest { id, request, queued_at: Instant::now() };
        state.pending.push(pending.clone());
        drop(state);

        if self.sender.send(pending).is_err() {
            // The loop only exits when the worker is dropped.
            warn!(target: "worksched::worker", %work_id, id, "worker loop gone; request not scheduled");
        }
        events.push(WorkEvent::Queued { work_id, request_id: id });
        events
    }

    /// Longest rate-limit wait, at most `max`, among the requests that would run next: the
    /// first pending one for a serial worker, every pending one for a concurrent worker.
    /// Requests whose conditions are unmet or whose wait exceeds `max` count as zero.
    pub(crate) fn background_wait_time(&self, max: Duration) -> Duration {
        let candidates: Vec<WorkRequest> = {
            let state = self.shared.lock();
            let pending = state.pending.iter().map(|p| p.request.clone());
            match self.shared.worker_type {
                WorkerType::Serial => pending.take(1).collect(),
                WorkerType::Concurrent => pending.collect(),
            }
        };
        candidates
            .iter()
            .map(|request| self.wait_within(request, max))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn wait_within(&self, request: &WorkRequest, max: Duration) -> Duration {
        let ids = request.rate_limit_ids();
        if ids.is_empty() || !self.shared.ctx.conditions.check_conditions(request) {
            return Duration::ZERO;
        }
        let wait = self.shared.ctx.limiter.next_available(ids);
        if wait > max {
            Duration::ZERO
        } else {
            wait
        }
    }

    async fn run(shared: Arc<Shared<S>>, mut receiver: mpsc::UnboundedReceiver<PendingRequest>) {
        while let Some(next) = receiver.recv().await {
            match shared.worker_type {
                WorkerType::Serial => Shared::drive(Arc::clone(&shared), next).await,
                WorkerType::Concurrent => {
                    let id = next.id;
                    // Registered under the lock so the driver cannot finish and deregister first.
                    let mut state = shared.lock();
                    let driver = tokio::spawn(Shared::drive(Arc::clone(&shared), next));
                    state.drivers.insert(id, driver.abort_handle());
                }
            }
        }
    }
}

impl<S> Shared<S>
where
    S: TelemetrySink + Sync,
    <S as Service<WorkEvent>>::Future: Send + 'static,
{
    /// Run attempts for one request until it succeeds or is no longer pending.
    async fn drive(self: Arc<Self>, next: PendingRequest) {
        let mut attempt: u32 = 1;
        loop {
            let holder = Arc::new(AttemptHolder::new(|handle: AbortHandle| handle.abort()));
            {
                let mut state = self.lock();
                if !state.is_pending(next.id) {
                    break;
                }
                state.attempts.insert(next.id, Arc::clone(&holder));
            }

            let task = tokio::spawn(Shared::process(Arc::clone(&self), next.clone(), attempt));
            // A replace that slipped in since the holder was published cancels the handle
            // on arrival.
            holder.set(task.abort_handle());
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(target: "worksched::worker", work_id = %self.work_id, id = next.id, "attempt panicked");
                } else {
                    debug!(target: "worksched::worker", work_id = %self.work_id, id = next.id, "attempt cancelled");
                }
            }

            let mut state = self.lock();
            state.in_progress.remove(&next.id);
            let is_current =
                state.attempts.get(&next.id).is_some_and(|current| Arc::ptr_eq(current, &holder));
            if is_current {
                state.attempts.remove(&next.id);
            }
            drop(state);
            attempt = attempt.saturating_add(1);
        }
        self.lock().drivers.remove(&next.id);
    }

    async fn emit(&self, event: WorkEvent) {
        emit_best_effort(self.ctx.sink.clone(), event).await;
    }

    async fn process(self: Arc<Self>, pending: PendingRequest, attempt: u32) {
        let canonical_id = format!("{}({})", self.work_id, pending.id);
        self.prepare(&pending).await;

        let task = WorkTask::new(canonical_id.clone());
        let _guard = CancelOnDrop(task.clone());
        let expiring = task.clone();
        let lease = self
            .ctx
            .background_tasks
            .begin_task(&canonical_id, Box::new(move || {
                expiring.expire();
            }));

        let started = Instant::now();
        let outcome = match lease {
            Ok(lease) => {
                self.emit(WorkEvent::Started { work_id: self.work_id.clone(), request_id: pending.id, attempt })
                    .await;
                self.lock().in_progress.insert(pending.id);
                let outcome = self.perform(&pending, &task).await;
                self.lock().in_progress.remove(&pending.id);
                lease.end();
                outcome
            }
            Err(err) => {
                warn!(target: "worksched::worker", id = %canonical_id, error = %err, "no background lease; counting attempt as failed");
                task.fail();
                TaskOutcome::Failed
            }
        };

        self.emit(WorkEvent::Finished {
            work_id: self.work_id.clone(),
            request_id: pending.id,
            attempt,
            outcome,
            duration: started.elapsed(),
        })
        .await;

        match outcome {
            TaskOutcome::Completed => {
                trace!(target: "worksched::worker", id = %canonical_id, "work finished");
                self.lock().pending.retain(|p| p.id != pending.id);
            }
            TaskOutcome::Expired => {
                debug!(target: "worksched::worker", id = %canonical_id, "background time expired; retrying");
            }
            TaskOutcome::Failed | TaskOutcome::Cancelled => {
                trace!(target: "worksched::worker", id = %canonical_id, %outcome, "work failed");
                self.back_off(&pending, attempt).await;
            }
        }
    }

    /// Wait until the request may run.
    ///
    /// Sleeps the rest of the initial delay (measured from when the request was queued). For
    /// rate-limited requests, repeats "sleep until the limits have room, wait for conditions"
    /// until all limits are tracked in one step; otherwise only waits for conditions.
    async fn prepare(&self, pending: &PendingRequest) {
        let request = &pending.request;
        let delay = request.initial_delay();
        let waited = pending.queued_at.elapsed();
        if waited < delay {
            self.ctx.sleeper.sleep(delay - waited).await;
        }

        let ids = request.rate_limit_ids();
        if ids.is_empty() {
            self.ctx.conditions.await_conditions(request).await;
            return;
        }

        loop {
            let wait = self.ctx.limiter.next_available(ids);
            if !wait.is_zero() {
                self.emit(WorkEvent::RateLimited {
                    work_id: self.work_id.clone(),
                    request_id: pending.id,
                    retry_after: wait,
                })
                .await;
                self.ctx.sleeper.sleep(wait).await;
            }
            self.ctx.conditions.await_conditions(request).await;
            if self.ctx.limiter.track_if_within_limit(ids) {
                return;
            }
        }
    }

    /// Run the handler against `task`; whichever resolves the task first wins.
    async fn perform(&self, pending: &PendingRequest, task: &WorkTask) -> TaskOutcome {
        let handler = Arc::clone(&self.handler);
        let run = AssertUnwindSafe(handler.perform(pending.request.clone(), task.clone())).catch_unwind();
        tokio::select! {
            result = run => match result {
                Ok(Ok(WorkResult::Success)) => {
                    task.complete();
                }
                Ok(Ok(WorkResult::Failure)) => {
                    task.fail();
                }
                Ok(Err(err)) => {
                    debug!(target: "worksched::worker", id = %task.id(), error = %err, "work returned an error");
                    task.fail();
                }
                Err(_) => {
                    warn!(target: "worksched::worker", id = %task.id(), "work handler panicked");
                    task.fail();
                }
            },
            _ = task.outcome() => {}
        }
        task.outcome_now().unwrap_or(TaskOutcome::Failed)
    }

    /// Linear backoff, cut short if the app moves to the background.
    async fn back_off(&self, pending: &PendingRequest, attempt: u32) {
        let delay = self.ctx.backoff.delay(attempt);
        let mut events = self.ctx.conditions.subscribe();
        self.emit(WorkEvent::BackingOff {
            work_id: self.work_id.clone(),
            request_id: pending.id,
            attempt,
            delay,
        })
        .await;
        tokio::select! {
            _ = self.ctx.sleeper.sleep(delay) => {}
            _ = next_event(&mut events, ConditionEvent::EnteredBackground) => {
                debug!(target: "worksched::worker", work_id = %self.work_id, id = pending.id, "entered background; retrying early");
            }
        }
    }
}

impl<S> Drop for Worker<S> {
    fn drop(&mut self) {
        self.run_loop.abort();
        let mut state = self.shared.lock();
        for (_, driver) in state.drivers.drain() {
            driver.abort();
        }
        state.cancel_attempts();
    }
}

impl<S> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Worker")
            .field("work_id", &self.shared.work_id)
            .field("worker_type", &self.shared.worker_type)
            .field("pending", &state.pending.len())
            .field("in_progress", &state.in_progress.len())
            .finish()
    }
}
