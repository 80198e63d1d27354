//! Completion and doorbell signals.
//!
//! A [`Signal`] is a 64-bit value that producers store to or decrement and
//! consumers block on until it satisfies a condition. Clones share the same
//! underlying signal.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Condition a waiter blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCondition {
    Eq,
    Ne,
    Lt,
    Gte,
}

impl SignalCondition {
    fn holds(self, value: i64, compare: i64) -> bool {
        match self {
            Self::Eq => value == compare,
            Self::Ne => value != compare,
            Self::Lt => value < compare,
            Self::Gte => value >= compare,
        }
    }
}

#[derive(Debug)]
struct SignalInner {
    handle: u64,
    value: AtomicI64,
    lock: Mutex<()>,
    changed: Condvar,
}

#[derive(Debug, Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new(handle: u64, initial: i64) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                handle,
                value: AtomicI64::new(initial),
                lock: Mutex::new(()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Opaque handle written into packets.
    pub fn handle(&self) -> u64 {
        self.inner.handle
    }

    pub fn load_acquire(&self) -> i64 {
        self.inner.value.load(Ordering::Acquire)
    }

    pub fn load_relaxed(&self) -> i64 {
        self.inner.value.load(Ordering::Relaxed)
    }

    pub fn store_relaxed(&self, value: i64) {
        self.inner.value.store(value, Ordering::Relaxed);
        self.notify();
    }

    pub fn store_release(&self, value: i64) {
        self.inner.value.store(value, Ordering::Release);
        self.notify();
    }

    /// Atomically subtract `value`, returning the new value.
    pub fn subtract_release(&self, value: i64) -> i64 {
        let prev = self.inner.value.fetch_sub(value, Ordering::Release);
        self.notify();
        prev - value
    }

    /// Block until `condition(value, compare)` holds or `timeout` elapses.
    ///
    /// Returns the last observed value; the caller decides whether the wait
    /// was satisfied. `None` blocks indefinitely.
    pub fn wait_acquire(
        &self,
        condition: SignalCondition,
        compare: i64,
        timeout: Option<Duration>,
    ) -> i64 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.guard();
        loop {
            let value = self.inner.value.load(Ordering::Acquire);
            if condition.holds(value, compare) {
                return value;
            }
            guard = match deadline {
                None => self.inner.changed.wait(guard).unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return value;
                    }
                    self.inner
                        .changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|p| p.into_inner())
                        .0
                }
            };
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // Recover from poisoned lock; the guarded data is `()`.
        self.inner.lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self) {
        let _guard = self.guard();
        self.inner.changed.notify_all();
    }
}
