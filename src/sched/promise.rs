//! Single-assignment promises.
//!
//! A promise is the only sanctioned way to move a result across the thread
//! boundary into a scheduler: CPU-heavy work (certificate validation,
//! signature checks, RSA decryption) runs on a detached thread and writes
//! its result here, while the waiting worker holds a `Promise` holdup.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::sched::worker::{lock, Settle};

struct Shared<T> {
    slot: Mutex<Option<T>>,
    settled: AtomicBool,
    ready: Condvar,
}

/// Write-once value, readable after [`Promise::is_pending`] returns `false`.
///
/// Cloning yields another handle to the same slot.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Create a pending promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                settled: AtomicBool::new(false),
                ready: Condvar::new(),
            }),
        }
    }

    /// Create a promise that is already fulfilled.
    pub fn fulfilled(value: T) -> Self {
        let promise = Self::new();
        promise.fulfil(value);
        promise
    }

    pub fn is_pending(&self) -> bool {
        !self.shared.settled.load(Ordering::Acquire)
    }

    pub fn is_fulfilled(&self) -> bool {
        !self.is_pending()
    }

    /// Store the value. A promise can only be fulfilled once; later calls
    /// are ignored.
    pub fn fulfil(&self, value: T) {
        let mut slot = lock(&self.shared.slot);
        if self.shared.settled.load(Ordering::Acquire) {
            tracing::warn!("Promise fulfilled twice, keeping the first value");
            return;
        }
        *slot = Some(value);
        self.shared.settled.store(true, Ordering::Release);
        self.shared.ready.notify_all();
    }

    /// Compute the value on a detached OS thread.
    ///
    /// The job must only touch data it owns; the promise is its sole channel
    /// back to the scheduler.
    pub fn fulfil_off_thread<F>(&self, job: F) -> io::Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = self.clone();
        thread::Builder::new()
            .name("promise-worker".to_string())
            .spawn(move || promise.fulfil(job()))?;
        Ok(())
    }

    /// Block the calling thread until the promise is fulfilled.
    pub fn await_fulfilment(&self) {
        let mut slot = lock(&self.shared.slot);
        while !self.shared.settled.load(Ordering::Acquire) {
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Move the value out. Returns `None` while pending or once taken.
    pub fn take(&self) -> Option<T> {
        lock(&self.shared.slot).take()
    }

    /// Borrow the stored value without moving it out.
    pub fn with_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let slot = lock(&self.shared.slot);
        f(slot.as_ref())
    }

    /// Return to the pending state, dropping any stored value.
    pub fn reset(&self) {
        let mut slot = lock(&self.shared.slot);
        *slot = None;
        self.shared.settled.store(false, Ordering::Release);
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Copy of the value, if fulfilled and not yet taken.
    pub fn get(&self) -> Option<T> {
        lock(&self.shared.slot).clone()
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Settle for Promise<T> {
    fn is_settled(&self) -> bool {
        self.is_fulfilled()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.shared.settled.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_pending() {
        let p: Promise<u32> = Promise::new();
        assert!(p.is_pending());
        assert_eq!(p.take(), None);
    }

    #[test]
    fn first_fulfilment_wins() {
        let p = Promise::new();
        p.fulfil(1);
        p.fulfil(2);
        assert!(p.is_fulfilled());
        assert_eq!(p.get(), Some(1));
        assert_eq!(p.take(), Some(1));
        assert_eq!(p.take(), None);
        assert!(p.is_fulfilled());
    }

    #[test]
    fn off_thread_result_is_visible_after_await() {
        let p = Promise::new();
        p.fulfil_off_thread(|| {
            thread::sleep(Duration::from_millis(20));
            "done".to_string()
        })
        .unwrap();
        p.await_fulfilment();
        assert_eq!(p.take().as_deref(), Some("done"));
    }

    #[test]
    fn reset_returns_to_pending() {
        let p = Promise::fulfilled(());
        assert!(p.is_fulfilled());
        p.reset();
        assert!(p.is_pending());
        assert!(!p.is_settled());
    }
}
