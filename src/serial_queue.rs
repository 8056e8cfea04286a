//! FIFO execution of async work items, one at a time.
//!
//! Work is sent over an unbounded channel to a single spawned loop, so submission never blocks
//! the caller and items run strictly in submission order. A panicking item is logged and the
//! loop moves on to the next one.
//!
//! ```rust
//! use worksched::SerialQueue;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let queue = SerialQueue::new();
//! queue.enqueue(|| async { /* runs first */ }).unwrap();
//! let answer = queue.run(|| async { 42 }).await.unwrap();
//! assert_eq!(answer, 42);
//! queue.wait_for_current_operations().await.unwrap();
//! # });
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::SerialQueueError;

type Job = BoxFuture<'static, ()>;

/// Serial executor backed by one tokio task.
///
/// Must be created inside a tokio runtime. Dropping the queue lets already submitted work
/// finish in the background; [`SerialQueue::stop`] does the same but waits for it.
#[derive(Debug)]
pub struct SerialQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::drain(receiver));
        Self { sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) }
    }

    async fn drain(mut receiver: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = receiver.recv().await {
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                warn!(target: "worksched::serial_queue", "work item panicked; continuing with next item");
            }
        }
        trace!(target: "worksched::serial_queue", "serial queue drained and closed");
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Job>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, job: Job) -> Result<(), SerialQueueError> {
        let guard = self.sender();
        let sender = guard.as_ref().ok_or(SerialQueueError::Stopped)?;
        sender.send(job).map_err(|_| SerialQueueError::Stopped)
    }

    /// Schedule `work` after everything submitted so far. Returns immediately.
    pub fn enqueue<F, Fut>(&self, work: F) -> Result<(), SerialQueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.submit(async move { work().await }.boxed())
    }

    /// Schedule `work` in FIFO order and wait for its result.
    ///
    /// The caller queues behind prior work like any other item. Returns
    /// [`SerialQueueError::Aborted`] if the item panicked.
    pub async fn run<F, Fut, T>(&self, work: F) -> Result<T, SerialQueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(
            async move {
                let value = work().await;
                let _ = tx.send(value);
            }
            .boxed(),
        )?;
        rx.await.map_err(|_| SerialQueueError::Aborted)
    }

    /// Resolve once every item submitted before this call has finished.
    ///
    /// Items submitted afterwards are not awaited. Returns immediately once the queue is stopped,
    /// since [`stop`](Self::stop) already waits for the backlog.
    pub async fn wait_for_current_operations(&self) -> Result<(), SerialQueueError> {
        match self.run(|| async {}).await {
            Err(SerialQueueError::Stopped) => Ok(()),
            other => other,
        }
    }

    /// Stop accepting work and wait for already submitted items to finish.
    pub async fn stop(&self) {
        drop(self.sender().take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(target: "worksched::serial_queue", error = %err, "serial queue loop ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_value_in_order() {
        let queue = SerialQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = log.clone();
        queue
            .enqueue(move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                first.lock().unwrap().push("enqueued");
            })
            .unwrap();

        let second = log.clone();
        let value = queue
            .run(move || async move {
                second.lock().unwrap().push("run");
                7
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(*log.lock().unwrap(), vec!["enqueued", "run"]);
    }

    #[tokio::test]
    async fn panicking_item_does_not_halt_queue() {
        let queue = SerialQueue::new();
        let result = queue.run(|| async { panic!("boom") }).await;
        assert_eq!(result, Err::<(), _>(SerialQueueError::Aborted));

        assert_eq!(queue.run(|| async { "still running" }).await, Ok("still running"));
    }

    #[tokio::test]
    async fn stop_finishes_backlog_and_rejects_new_work() {
        let queue = SerialQueue::new();
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        queue
            .enqueue(move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                *flag.lock().unwrap() = true;
            })
            .unwrap();

        queue.stop().await;
        assert!(*done.lock().unwrap());
        assert!(queue.is_stopped());
        assert_eq!(queue.enqueue(|| async {}), Err(SerialQueueError::Stopped));
        assert_eq!(queue.run(|| async { 1 }).await, Err(SerialQueueError::Stopped));
        assert_eq!(queue.wait_for_current_operations().await, Ok(()));
    }
}
