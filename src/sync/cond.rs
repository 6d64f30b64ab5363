//! A fiber-blocking condition variable, paired with [`super::Mutex`] the
//! same way `std::sync::Condvar` is paired with `std::sync::Mutex`.

use std::time::Duration;

use crate::clock;
use crate::error::WaitTimeoutResult;
use crate::waitable::Waitable;

use super::mutex::MutexGuard;

pub struct Cond {
    waitable: Waitable,
}

impl Cond {
    pub fn new() -> Self {
        Self {
            waitable: Waitable::new(),
        }
    }

    /// Atomically releases `guard`'s mutex and suspends the calling fiber
    /// until notified, then re-acquires the mutex before returning.
    ///
    /// As with any condition variable, the predicate must be re-checked in
    /// a loop after this returns — a notify carries no guarantee about
    /// *why* it fired.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        drop(guard);
        super::park_on(&self.waitable);
        mutex.lock()
    }

    pub fn wait_timeout<'a, T>(&self, guard: MutexGuard<'a, T>, timeout: Duration) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let mutex = guard.mutex;
        drop(guard);
        let deadline = clock::deadline_after(timeout);
        let result = super::park_on_timeout(&self.waitable, deadline);
        (mutex.lock(), result)
    }

    /// Wakes one waiter, if any.
    pub fn notify_one(&self) -> bool {
        super::wake_one(&self.waitable)
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) {
        super::wake_all(self.waitable.wake_all());
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}
