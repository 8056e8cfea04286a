//! Work request model.

use std::collections::HashMap;
use std::time::Duration;

/// What to do when a request arrives while another with the same work ID is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConflictPolicy {
    /// Queue both; each runs independently.
    #[default]
    Append,
    /// Drop queued requests (cancelling any in-flight attempt) and queue the new one.
    Replace,
    /// Keep the queued request and drop the new one.
    Keep,
    /// Drop the new request only if some queued request has not started yet.
    KeepIfNotStarted,
}

/// How a worker schedules the requests it has accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WorkerType {
    /// One request at a time, in arrival order.
    #[default]
    Serial,
    /// Every accepted request runs its own attempts as soon as it is queued.
    Concurrent,
}

/// Outcome reported by a worker for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkResult {
    Success,
    Failure,
}

/// A unit of deferrable work.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkRequest {
    work_id: String,
    extras: HashMap<String, String>,
    initial_delay: Duration,
    requires_network: bool,
    rate_limit_ids: Vec<String>,
    conflict_policy: ConflictPolicy,
}

impl WorkRequest {
    /// Request with defaults: no delay, no network requirement, no rate limits, append.
    pub fn new(work_id: impl Into<String>) -> Self {
        Self::builder(work_id).build()
    }

    pub fn builder(work_id: impl Into<String>) -> WorkRequestBuilder {
        WorkRequestBuilder {
            request: WorkRequest {
                work_id: work_id.into(),
                extras: HashMap::new(),
                initial_delay: Duration::ZERO,
                requires_network: false,
                rate_limit_ids: Vec::new(),
                conflict_policy: ConflictPolicy::default(),
            },
        }
    }

    pub fn work_id(&self) -> &str {
        &self.work_id
    }

    /// Opaque caller data passed through to the worker.
    pub fn extras(&self) -> &HashMap<String, String> {
        &self.extras
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn requires_network(&self) -> bool {
        self.requires_network
    }

    pub fn rate_limit_ids(&self) -> &[String] {
        &self.rate_limit_ids
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }
}

/// Builder for [`WorkRequest`].
#[derive(Debug, Clone)]
pub struct WorkRequestBuilder {
    request: WorkRequest,
}

impl WorkRequestBuilder {
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.extras.insert(key.into(), value.into());
        self
    }

    pub fn extras(mut self, extras: HashMap<String, String>) -> Self {
        self.request.extras = extras;
        self
    }

    /// Wait at least this long after dispatch before the first attempt.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.request.initial_delay = delay;
        self
    }

    pub fn requires_network(mut self, requires: bool) -> Self {
        self.request.requires_network = requires;
        self
    }

    /// Rate-limit rules that must all have room before each attempt.
    pub fn rate_limit_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.rate_limit_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.request.conflict_policy = policy;
        self
    }

    pub fn build(self) -> WorkRequest {
        self.request
    }
}
