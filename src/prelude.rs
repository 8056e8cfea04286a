//! Convenient re-exports for common worksched types.
pub use crate::{
    conditions::{ConditionEvent, WorkConditionsMonitor},
    dispatcher::{WorkDispatcher, WorkDispatcherBuilder},
    handler::{continuation_fn, handler_fn, WorkHandler},
    rate_limit::{RateLimitLayer, RateLimitStatus, SlidingWindowLimiter},
    request::{ConflictPolicy, WorkRequest, WorkResult, WorkerType},
    serial_queue::SerialQueue,
    task::{TaskOutcome, WorkTask},
    telemetry::{LogSink, MemorySink, NullSink, WorkEvent},
    Backoff, CancellableValueHolder, WorkConfig, WorkError,
};
