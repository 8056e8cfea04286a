//! Holder that ties a value's lifetime to a cancellation flag.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    cancelled: bool,
}

/// Stores at most one value and hands it to `on_cancel` when cancelled.
///
/// Once cancelled, any value passed to [`set`](Self::set) goes straight to `on_cancel` instead
/// of being stored, so a resource attached after cancellation is never left running. The
/// worker uses this to cancel an in-flight attempt whose abort handle may not exist yet when a
/// replacing request arrives.
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use worksched::CancellableValueHolder;
///
/// let cancelled = Arc::new(Mutex::new(Vec::new()));
/// let sink = cancelled.clone();
/// let holder = CancellableValueHolder::new(move |v: u32| sink.lock().unwrap().push(v));
///
/// holder.cancel();
/// holder.set(7);
/// assert_eq!(*cancelled.lock().unwrap(), vec![7]);
/// assert!(holder.is_empty());
/// ```
pub struct CancellableValueHolder<T> {
    slot: Mutex<Slot<T>>,
    on_cancel: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> fmt::Debug for CancellableValueHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("CancellableValueHolder")
            .field("has_value", &slot.value.is_some())
            .field("cancelled", &slot.cancelled)
            .finish()
    }
}

impl<T> CancellableValueHolder<T> {
    pub fn new<F>(on_cancel: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self { slot: Mutex::new(Slot { value: None, cancelled: false }), on_cancel: Box::new(on_cancel) }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value`, or cancel it on the spot if the holder is already cancelled.
    ///
    /// A previously stored value is dropped without being cancelled.
    pub fn set(&self, value: T) {
        let rejected = {
            let mut slot = self.lock();
            if slot.cancelled {
                Some(value)
            } else {
                slot.value = Some(value);
                None
            }
        };
        if let Some(value) = rejected {
            (self.on_cancel)(value);
        }
    }

    /// Mark the holder cancelled and cancel the stored value, if any. Idempotent.
    pub fn cancel(&self) {
        let value = {
            let mut slot = self.lock();
            if slot.cancelled {
                return;
            }
            slot.cancelled = true;
            slot.value.take()
        };
        if let Some(value) = value {
            (self.on_cancel)(value);
        }
    }

    /// Remove the stored value without cancelling it.
    pub fn take(&self) -> Option<T> {
        self.lock().value.take()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_empty(&self) -> bool {
        self.lock().value.is_none()
    }
}

impl<T: Clone> CancellableValueHolder<T> {
    /// Copy of the stored value.
    pub fn value(&self) -> Option<T> {
        self.lock().value.clone()
    }
}
