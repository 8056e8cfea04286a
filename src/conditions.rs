//! Gating work on connectivity and remaining background execution time.
//!
//! The platform supplies two readings through small traits: whether the network is reachable
//! and how much background execution time the OS still grants. [`WorkConditionsMonitor`]
//! combines them into "may this request start now" and lets callers wait until that becomes
//! true. Changes are announced by the platform glue through [`WorkConditionsMonitor::notify`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::request::WorkRequest;

/// Current network reachability.
pub trait NetworkMonitor: Send + Sync + fmt::Debug {
    fn is_connected(&self) -> bool;
}

/// Remaining OS-granted background execution time.
///
/// Platforms without such a limit report `Duration::MAX`.
pub trait BackgroundTimeProvider: Send + Sync + fmt::Debug {
    fn remaining_time(&self) -> Duration;
}

/// Provider for platforms that never cut background work short.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedBackgroundTime;

impl BackgroundTimeProvider for UnlimitedBackgroundTime {
    fn remaining_time(&self) -> Duration {
        Duration::MAX
    }
}

/// Network monitor whose state is pushed in by platform glue (or tests).
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct ManualNetworkMonitor {
    connected: Arc<AtomicBool>,
}

impl ManualNetworkMonitor {
    pub fn new(connected: bool) -> Self {
        Self { connected: Arc::new(AtomicBool::new(connected)) }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Background time reading pushed in by platform glue (or tests). Clones share state.
#[derive(Debug, Clone)]
pub struct ManualBackgroundTime {
    millis: Arc<AtomicU64>,
}

impl ManualBackgroundTime {
    pub fn new(remaining: Duration) -> Self {
        Self { millis: Arc::new(AtomicU64::new(Self::to_millis(remaining))) }
    }

    fn to_millis(remaining: Duration) -> u64 {
        u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn set_remaining(&self, remaining: Duration) {
        self.millis.store(Self::to_millis(remaining), Ordering::SeqCst);
    }
}

impl Default for ManualBackgroundTime {
    fn default() -> Self {
        Self::new(Duration::MAX)
    }
}

impl BackgroundTimeProvider for ManualBackgroundTime {
    fn remaining_time(&self) -> Duration {
        match self.millis.load(Ordering::SeqCst) {
            u64::MAX => Duration::MAX,
            millis => Duration::from_millis(millis),
        }
    }
}

/// Something changed that may make blocked work runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionEvent {
    BecameActive,
    EnteredBackground,
    NetworkChanged { connected: bool },
}

/// Decides whether a request may start and waits until it can.
#[derive(Debug)]
pub struct WorkConditionsMonitor {
    network: Arc<dyn NetworkMonitor>,
    background_time: Arc<dyn BackgroundTimeProvider>,
    min_background_time: Duration,
    events: broadcast::Sender<ConditionEvent>,
}

impl WorkConditionsMonitor {
    /// Default margin of background time required before starting work.
    pub const DEFAULT_MIN_BACKGROUND_TIME: Duration = Duration::from_secs(60);

    pub fn new<N, B>(network: N, background_time: B) -> Self
    where
        N: NetworkMonitor + 'static,
        B: BackgroundTimeProvider + 'static,
    {
        let (events, _) = broadcast::channel(32);
        Self {
            network: Arc::new(network),
            background_time: Arc::new(background_time),
            min_background_time: Self::DEFAULT_MIN_BACKGROUND_TIME,
            events,
        }
    }

    /// Override the background time margin.
    pub fn with_min_background_time(mut self, min: Duration) -> Self {
        self.min_background_time = min;
        self
    }

    pub fn min_background_time(&self) -> Duration {
        self.min_background_time
    }

    /// Whether `request` may start right now.
    pub fn check_conditions(&self, request: &WorkRequest) -> bool {
        let remaining = self.background_time.remaining_time();
        if remaining < self.min_background_time {
            trace!(target: "worksched::conditions", work_id = %request.work_id(), ?remaining, "not enough background time");
            return false;
        }
        if request.requires_network() {
            return self.network.is_connected();
        }
        true
    }

    /// Wait until `request` may start.
    ///
    /// There is no timeout; drop the future (or abort the surrounding task) to give up.
    pub async fn await_conditions(&self, request: &WorkRequest) {
        // Subscribe before checking so a change between the check and the wait is not lost.
        let mut events = self.events.subscribe();
        while !self.check_conditions(request) {
            match events.recv().await {
                Ok(event) => {
                    trace!(target: "worksched::conditions", work_id = %request.work_id(), ?event, "rechecking conditions");
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    // The monitor owns the sender; unreachable while `self` is alive.
                    futures::future::pending::<()>().await;
                }
            }
        }
    }

    /// Announce a change to everyone waiting on conditions.
    pub fn notify(&self, event: ConditionEvent) {
        trace!(target: "worksched::conditions", ?event, "condition change");
        // No receivers just means nobody is waiting.
        let _ = self.events.send(event);
    }

    /// Stream of change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConditionEvent> {
        self.events.subscribe()
    }
}

impl Default for WorkConditionsMonitor {
    fn default() -> Self {
        Self::new(ManualNetworkMonitor::default(), UnlimitedBackgroundTime)
    }
}

/// Resolve on the next event matching `wanted`; pends forever once the sender is gone.
pub(crate) async fn next_event(
    events: &mut broadcast::Receiver<ConditionEvent>,
    wanted: ConditionEvent,
) {
    loop {
        match events.recv().await {
            Ok(event) if event == wanted => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => futures::future::pending::<()>().await,
        }
    }
}
