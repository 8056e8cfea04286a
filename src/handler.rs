//! Worker callbacks.
//!
//! Two calling conventions are supported. [`handler_fn`] wraps an async function that returns a
//! [`WorkResult`]; [`continuation_fn`] wraps a callback that is handed the attempt's
//! [`WorkTask`] and signals completion on it, possibly from another thread later on.
//! Either way, the dispatcher resolves the task exactly once per attempt.

use std::future::Future;

use async_trait::async_trait;

use crate::request::{WorkRequest, WorkResult};
use crate::task::{TaskOutcome, WorkTask};

/// Boxed error returned by handlers; logged and treated as a failed attempt.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Performs the work for one registered work ID.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Run one attempt. `task` is the attempt's continuation; handlers may resolve it directly
    /// or simply return a result.
    async fn perform(&self, request: WorkRequest, task: WorkTask) -> Result<WorkResult, BoxError>;
}

/// Handler built from an async function. See [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wrap `async fn(WorkRequest) -> Result<WorkResult, E>` as a handler.
///
/// ```
/// use worksched::{handler_fn, WorkRequest, WorkResult};
///
/// let handler = handler_fn(|request: WorkRequest| async move {
///     if request.extra("payload").is_some() {
///         Ok::<_, std::io::Error>(WorkResult::Success)
///     } else {
///         Ok(WorkResult::Failure)
///     }
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut, E>(f: F) -> FnHandler<F>
where
    F: Fn(WorkRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkResult, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut, E> WorkHandler for FnHandler<F>
where
    F: Fn(WorkRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkResult, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    async fn perform(&self, request: WorkRequest, _task: WorkTask) -> Result<WorkResult, BoxError> {
        (self.f)(request).await.map_err(Into::into)
    }
}

/// Handler built from a callback that signals on the task. See [`continuation_fn`].
#[derive(Clone)]
pub struct ContinuationHandler<F> {
    f: F,
}

impl<F> std::fmt::Debug for ContinuationHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationHandler").finish_non_exhaustive()
    }
}

/// Wrap `fn(WorkRequest, WorkTask)` as a handler. The attempt lasts until the callback (or
/// whoever it hands the task to) calls [`WorkTask::complete`] or [`WorkTask::fail`], or until
/// the task expires.
pub fn continuation_fn<F>(f: F) -> ContinuationHandler<F>
where
    F: Fn(WorkRequest, WorkTask) + Send + Sync + 'static,
{
    ContinuationHandler { f }
}

#[async_trait]
impl<F> WorkHandler for ContinuationHandler<F>
where
    F: Fn(WorkRequest, WorkTask) + Send + Sync + 'static,
{
    async fn perform(&self, request: WorkRequest, task: WorkTask) -> Result<WorkResult, BoxError> {
        (self.f)(request, task.clone());
        match task.outcome().await {
            TaskOutcome::Completed => Ok(WorkResult::Success),
            _ => Ok(WorkResult::Failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_handler_maps_errors() {
        let handler = handler_fn(|request: WorkRequest| async move {
            match request.work_id() {
                "ok" => Ok(WorkResult::Success),
                _ => Err("no route"),
            }
        });

        let ok = handler.perform(WorkRequest::new("ok"), WorkTask::new("ok(0)")).await.unwrap();
        assert_eq!(ok, WorkResult::Success);

        let err = handler.perform(WorkRequest::new("bad"), WorkTask::new("bad(0)")).await.unwrap_err();
        assert_eq!(err.to_string(), "no route");
    }

    #[tokio::test]
    async fn continuation_handler_waits_for_signal() {
        let handler = continuation_fn(|_request, task: WorkTask| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                task.complete();
            });
        });
        let result = handler.perform(WorkRequest::new("upload"), WorkTask::new("upload(0)")).await;
        assert_eq!(result.unwrap(), WorkResult::Success);
    }

    #[tokio::test]
    async fn continuation_handler_reports_expiry_as_failure() {
        let handler = continuation_fn(|_request, task: WorkTask| {
            task.expire();
        });
        let result = handler.perform(WorkRequest::new("upload"), WorkTask::new("upload(1)")).await;
        assert_eq!(result.unwrap(), WorkResult::Failure);
    }
}
