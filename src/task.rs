//! Continuation handed to a worker for one execution attempt.
//!
//! A [`WorkTask`] starts out running and resolves exactly once to a [`TaskOutcome`]. The first
//! of `complete`, `fail`, `cancel` or `expire` wins; later calls are no-ops. The outcome can be
//! awaited any number of times after resolution, and optional callbacks fire at most once, even
//! when registered after the task has already resolved.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::trace;

/// Terminal state of a [`WorkTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    Completed,
    Failed,
    /// Background execution time ran out before the worker finished.
    Expired,
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Expired => "expired",
            TaskOutcome::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

type ExpirationHandler = Box<dyn FnOnce() + Send>;
type CompletionHandler = Box<dyn FnOnce(TaskOutcome) + Send>;

#[derive(Default)]
struct TaskState {
    outcome: Option<TaskOutcome>,
    expiring: bool,
    expiration_handler: Option<ExpirationHandler>,
    completion_handler: Option<CompletionHandler>,
}

struct TaskShared {
    id: String,
    state: Mutex<TaskState>,
    resolved: watch::Sender<Option<TaskOutcome>>,
}

/// Handle to one in-flight attempt. Clones refer to the same attempt.
#[derive(Clone)]
pub struct WorkTask {
    shared: Arc<TaskShared>,
}

impl fmt::Debug for WorkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkTask")
            .field("id", &self.shared.id)
            .field("outcome", &self.outcome_now())
            .finish()
    }
}

impl WorkTask {
    pub fn new(id: impl Into<String>) -> Self {
        let (resolved, _) = watch::channel(None);
        Self {
            shared: Arc::new(TaskShared {
                id: id.into(),
                state: Mutex::new(TaskState::default()),
                resolved,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve to `outcome` unless already resolved. Returns whether this call won.
    fn resolve(&self, outcome: TaskOutcome) -> bool {
        let completion = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.expiration_handler = None;
            state.completion_handler.take()
        };
        trace!(target: "worksched::task", id = %self.shared.id, %outcome, "task resolved");
        self.shared.resolved.send_replace(Some(outcome));
        if let Some(handler) = completion {
            handler(outcome);
        }
        true
    }

    /// Signal success.
    pub fn complete(&self) -> bool {
        self.resolve(TaskOutcome::Completed)
    }

    /// Signal failure; the dispatcher backs off before the next attempt.
    pub fn fail(&self) -> bool {
        self.resolve(TaskOutcome::Failed)
    }

    pub fn cancel(&self) -> bool {
        self.resolve(TaskOutcome::Cancelled)
    }

    /// Background time ran out.
    ///
    /// Runs the expiration handler first, which may still resolve the task gracefully (for
    /// example by calling [`complete`](Self::complete)). If the task is still running after the
    /// handler returns, it resolves to [`TaskOutcome::Expired`].
    pub fn expire(&self) -> bool {
        let handler = {
            let mut state = self.lock();
            if state.outcome.is_some() || state.expiring {
                return false;
            }
            state.expiring = true;
            state.expiration_handler.take()
        };
        if let Some(handler) = handler {
            handler();
        }
        self.resolve(TaskOutcome::Expired)
    }

    /// Register the expiration handler, replacing any previous one.
    ///
    /// Fires immediately if the task already expired or is expiring; dropped unfired if the
    /// task resolved some other way.
    pub fn set_expiration_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            match (state.outcome, state.expiring) {
                (None, false) => {
                    state.expiration_handler = Some(Box::new(handler));
                    return;
                }
                (None, true) | (Some(TaskOutcome::Expired), _) => {}
                _ => return,
            }
        }
        handler();
    }

    /// Register a callback for the terminal outcome, replacing any previous one.
    ///
    /// Fires immediately if the task already resolved.
    pub fn on_completion<F>(&self, handler: F)
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        let resolved = {
            let mut state = self.lock();
            match state.outcome {
                Some(outcome) => outcome,
                None => {
                    state.completion_handler = Some(Box::new(handler));
                    return;
                }
            }
        };
        handler(resolved);
    }

    /// Outcome if already resolved.
    pub fn outcome_now(&self) -> Option<TaskOutcome> {
        *self.shared.resolved.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.outcome_now().is_none()
    }

    /// Wait for the task to resolve.
    pub async fn outcome(&self) -> TaskOutcome {
        let mut receiver = self.shared.resolved.subscribe();
        loop {
            if let Some(outcome) = *receiver.borrow_and_update() {
                return outcome;
            }
            // The sender lives as long as `self`, so this only fails if the task is torn down
            // mid-wait; treat that as cancellation.
            if receiver.changed().await.is_err() {
                return TaskOutcome::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    #[test]
    fn first_terminal_signal_wins() {
        let task = WorkTask::new("upload(0)");
        let (calls, seen) = counter();
        task.on_completion(move |outcome| {
            assert_eq!(outcome, TaskOutcome::Completed);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.complete());
        assert!(!task.complete());
        assert!(!task.fail());
        assert!(!task.expire());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.outcome_now(), Some(TaskOutcome::Completed));
    }

    #[test]
    fn late_completion_handler_fires_immediately() {
        let task = WorkTask::new("t");
        task.fail();
        let (calls, seen) = counter();
        task.on_completion(move |outcome| {
            assert_eq!(outcome, TaskOutcome::Failed);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiration_without_handler_resolves_expired() {
        let task = WorkTask::new("t");
        assert!(task.expire());
        assert_eq!(task.outcome_now(), Some(TaskOutcome::Expired));
        assert!(!task.outcome_now().unwrap().is_success());
    }

    #[test]
    fn expiration_handler_can_complete_gracefully() {
        let task = WorkTask::new("t");
        let inner = task.clone();
        task.set_expiration_handler(move || {
            inner.complete();
        });
        assert!(!task.expire());
        assert_eq!(task.outcome_now(), Some(TaskOutcome::Completed));
    }

    #[test]
    fn expiration_handler_fires_once_even_if_set_late() {
        let task = WorkTask::new("t");
        task.expire();
        let (calls, seen) = counter();
        task.set_expiration_handler(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let finished = WorkTask::new("t2");
        finished.complete();
        let (calls, seen) = counter();
        finished.set_expiration_handler(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        finished.expire();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_set_while_expiring_fires_immediately() {
        let task = WorkTask::new("t");
        let (calls, seen) = counter();
        let inner = task.clone();
        task.set_expiration_handler(move || {
            // The first handler swaps in a follow-up while expiry is underway.
            inner.set_expiration_handler(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert!(task.expire());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.outcome_now(), Some(TaskOutcome::Expired));
    }

    #[tokio::test]
    async fn outcome_is_readable_many_times() {
        let task = WorkTask::new("t");
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.outcome().await })
        };
        tokio::task::yield_now().await;
        task.cancel();

        assert_eq!(waiter.await.unwrap(), TaskOutcome::Cancelled);
        assert_eq!(task.outcome().await, TaskOutcome::Cancelled);
        assert_eq!(task.outcome().await, TaskOutcome::Cancelled);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn concurrent_complete_and_fail_resolve_once() {
        for _ in 0..50 {
            let task = WorkTask::new("race");
            let (calls, seen) = counter();
            task.on_completion(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            let a = task.clone();
            let b = task.clone();
            let (wa, wb) = tokio::join!(
                tokio::spawn(async move { a.complete() }),
                tokio::spawn(async move { b.fail() })
            );
            assert!(wa.unwrap() ^ wb.unwrap());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
