#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # worksched
//!
//! Scheduling primitives for deferrable background work in async Rust.
//!
//! ## Features
//!
//! - **Sliding-window rate limits** keyed by name, with multi-key check-and-track
//! - **Serial queues** running async operations one at a time in FIFO order
//! - **Condition gating** on network reachability and remaining background time
//! - **Work dispatch** with conflict policies, initial delays, background leases and backoff
//! - **Single-resolution tasks** whose outcome can be awaited any number of times
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use worksched::{continuation_fn, WorkDispatcher, WorkRequest, WorkTask};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), worksched::WorkError> {
//!     let dispatcher = WorkDispatcher::builder().build()?;
//!     dispatcher.set_rate_limit("channel_update", 1, Duration::from_secs(10))?;
//!     dispatcher.register_worker(
//!         "update_channel",
//!         continuation_fn(|_request, task: WorkTask| {
//!             task.complete();
//!         }),
//!     );
//!
//!     let request = WorkRequest::builder("update_channel")
//!         .requires_network(true)
//!         .rate_limit_ids(["channel_update"])
//!         .build();
//!     dispatcher.dispatch(request).await;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod backoff;
pub mod cancellable;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod prelude;
pub mod rate_limit;
pub mod request;
pub mod serial_queue;
pub mod sleeper;
pub mod task;
pub mod telemetry;
mod worker;

// Re-exports
pub use background::{
    BackgroundTaskHandle, BackgroundTasks, ExpirationCallback, ManualBackgroundTasks,
    NoopBackgroundTasks,
};
pub use backoff::Backoff;
pub use cancellable::CancellableValueHolder;
pub use clock::{Clock, ManualClock, MonotonicClock, TokioClock};
pub use conditions::{
    BackgroundTimeProvider, ConditionEvent, ManualBackgroundTime, ManualNetworkMonitor,
    NetworkMonitor, UnlimitedBackgroundTime, WorkConditionsMonitor,
};
pub use config::WorkConfig;
pub use dispatcher::{WorkDispatcher, WorkDispatcherBuilder};
pub use error::{ConfigError, GateError, RateLimitError, SerialQueueError, WorkError};
pub use handler::{
    continuation_fn, handler_fn, BoxError, ContinuationHandler, FnHandler, WorkHandler,
};
pub use rate_limit::{
    RateLimitLayer, RateLimitRule, RateLimitService, RateLimitStatus, SlidingWindowLimiter,
};
pub use request::{ConflictPolicy, WorkRequest, WorkRequestBuilder, WorkResult, WorkerType};
pub use serial_queue::SerialQueue;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use task::{TaskOutcome, WorkTask};
