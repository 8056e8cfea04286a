//! Leases on OS background execution.
//!
//! Each work attempt asks the platform to keep the process alive while it runs. The platform
//! may revoke the lease early, in which case the expiration callback fires and the attempt's
//! [`WorkTask`](crate::WorkTask) expires.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::WorkError;

/// Callback invoked when the platform revokes a lease.
pub type ExpirationCallback = Box<dyn FnOnce() + Send>;

/// Source of background execution leases.
pub trait BackgroundTasks: Send + Sync + fmt::Debug {
    /// Begin a lease named `name`. `on_expire` runs at most once if the lease is revoked
    /// before it is ended.
    fn begin_task(
        &self,
        name: &str,
        on_expire: ExpirationCallback,
    ) -> Result<BackgroundTaskHandle, WorkError>;
}

/// An active lease. Ending it (explicitly or by dropping) releases the background time.
pub struct BackgroundTaskHandle {
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for BackgroundTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTaskHandle").field("active", &self.on_end.is_some()).finish()
    }
}

impl BackgroundTaskHandle {
    pub fn new<F>(on_end: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { on_end: Some(Box::new(on_end)) }
    }

    /// Handle with nothing to release.
    pub fn detached() -> Self {
        Self { on_end: None }
    }

    pub fn end(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

impl Drop for BackgroundTaskHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Leases that are always granted and never revoked.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackgroundTasks;

impl BackgroundTasks for NoopBackgroundTasks {
    fn begin_task(
        &self,
        _name: &str,
        _on_expire: ExpirationCallback,
    ) -> Result<BackgroundTaskHandle, WorkError> {
        Ok(BackgroundTaskHandle::detached())
    }
}

#[derive(Default)]
struct Leases {
    next_id: u64,
    active: HashMap<u64, (String, ExpirationCallback)>,
}

/// Lease source driven by platform glue or tests: leases can be refused or revoked at will.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct ManualBackgroundTasks {
    leases: Arc<Mutex<Leases>>,
    refuse: Arc<AtomicBool>,
    granted: Arc<AtomicU64>,
}

impl fmt::Debug for ManualBackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualBackgroundTasks")
            .field("active", &self.active())
            .field("refuse", &self.refuse.load(Ordering::SeqCst))
            .finish()
    }
}

impl ManualBackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse (or grant again) new leases.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Names of leases currently held, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().active.values().map(|(name, _)| name.clone()).collect();
        names.sort();
        names
    }

    /// Total leases granted so far.
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::SeqCst)
    }

    /// Revoke every active lease, running their expiration callbacks.
    pub fn expire_all(&self) -> usize {
        let expired: Vec<_> = self.lock().active.drain().map(|(_, (_, cb))| cb).collect();
        let count = expired.len();
        for callback in expired {
            callback();
        }
        count
    }
}

impl BackgroundTasks for ManualBackgroundTasks {
    fn begin_task(
        &self,
        name: &str,
        on_expire: ExpirationCallback,
    ) -> Result<BackgroundTaskHandle, WorkError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(WorkError::BackgroundTaskUnavailable { name: name.to_string() });
        }
        let id = {
            let mut leases = self.lock();
            let id = leases.next_id;
            leases.next_id += 1;
            leases.active.insert(id, (name.to_string(), on_expire));
            id
        };
        self.granted.fetch_add(1, Ordering::SeqCst);
        let leases = Arc::clone(&self.leases);
        Ok(BackgroundTaskHandle::new(move || {
            leases.lock().unwrap_or_else(PoisonError::into_inner).active.remove(&id);
        }))
    }
}
