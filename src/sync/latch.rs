//! Count-down latches.
//!
//! [`Latch`] is the public, general-purpose primitive (the external
//! interface's `fiber_latch`): any fiber may count it down, any number of
//! fibers may wait for it to reach zero.
//!
//! [`ExitBarrier`] is a narrower internal variant used only by
//! [`crate::fiber`] to implement joinability. The count-down there happens
//! from a dying fiber's own trampoline tail, right before the stack it is
//! running on gets freed out from under it — a step that must not itself
//! block acquiring a lock. So the lock acquisition (`grab_lock`) and the
//! mutation (`unsafe_count_down`) are split: the dying fiber grabs the lock
//! *before* it is in any danger of being descheduled for stack-freeing
//! reasons, and only later, from the master's resume_proc, performs the
//! actual (guaranteed non-blocking) decrement-and-notify.

use std::sync::Arc;

use crate::fiber::FiberPtr;
use crate::group;
use crate::spinlock::SpinLock;
use crate::waitable::Waitable;

struct Inner {
    count: SpinLock<usize>,
    waitable: Waitable,
}

/// A count-down latch any number of fibers may wait on.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<Inner>,
}

impl Latch {
    pub fn new(initial: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                count: SpinLock::new(initial),
                waitable: Waitable::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        *self.inner.count.lock()
    }

    /// Decrements the count by one. Wakes every waiter once it reaches
    /// zero.
    pub fn count_down(&self) {
        let done = {
            let mut count = self.inner.count.lock();
            *count = count.saturating_sub(1);
            *count == 0
        };
        if done {
            super::wake_all(self.inner.waitable.set_persistent_awakened());
        }
    }

    /// Blocks the calling fiber until the count reaches zero. Returns
    /// immediately if it already has.
    pub fn wait(&self) {
        loop {
            if *self.inner.count.lock() == 0 {
                return;
            }
            super::park_on(&self.inner.waitable);
            // A fiber can only be woken here once `set_persistent_awakened`
            // has fired, which only ever happens once the count is zero.
            if self.inner.waitable.is_persistently_awakened() {
                return;
            }
        }
    }
}

/// A lock grabbed by [`ExitBarrier::grab_lock`], not yet consumed by
/// [`ExitBarrier::unsafe_count_down`].
pub struct ExitBarrierGuard {
    inner: Arc<Inner>,
}

unsafe impl Send for ExitBarrierGuard {}

/// The joinability handle embedded in a spawned fiber's control block.
/// Always starts at count 1 (the fiber itself) and is counted down exactly
/// once, by that same fiber, as it exits. `Clone`-able so a `JoinHandle` can
/// hold its own reference to wait on independently of the fiber's own copy.
#[derive(Clone)]
pub struct ExitBarrier {
    inner: Arc<Inner>,
}

impl ExitBarrier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                count: SpinLock::new(1),
                waitable: Waitable::new(),
            }),
        }
    }

    /// Locks the internal count ahead of the actual decrement. Called from
    /// the dying fiber's own context, before it transitions to `Dead`.
    pub fn grab_lock(&self) -> ExitBarrierGuard {
        let guard = self.inner.count.lock();
        std::mem::forget(guard);
        ExitBarrierGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Consumes a lock from [`Self::grab_lock`], decrements the count, and
    /// wakes any joiners once it reaches zero. Never blocks.
    ///
    /// # Safety
    /// `grabbed` must be the guard most recently returned by a `grab_lock`
    /// call on this same barrier, and must not have been consumed already.
    pub fn unsafe_count_down(&mut self, grabbed: ExitBarrierGuard) {
        debug_assert!(Arc::ptr_eq(&self.inner, &grabbed.inner));
        let woken = unsafe {
            let count = self.inner.count.data();
            *count = count.saturating_sub(1);
            let done = *count == 0;
            self.inner.count.unlock();
            if done {
                self.inner.waitable.set_persistent_awakened()
            } else {
                Vec::new()
            }
        };
        for f in woken {
            ready(f);
        }
    }

    /// Blocks the calling fiber until the owning fiber has exited.
    pub fn join(&self) {
        loop {
            if *self.inner.count.lock() == 0 {
                return;
            }
            super::park_on(&self.inner.waitable);
            if self.inner.waitable.is_persistently_awakened() {
                return;
            }
        }
    }
}

impl Default for ExitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

fn ready(f: FiberPtr) {
    group::group_of(f).ready_fiber(f, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_starts_at_given_count() {
        let l = Latch::new(3);
        assert_eq!(l.count(), 3);
        l.count_down();
        assert_eq!(l.count(), 2);
    }

    #[test]
    fn latch_saturates_at_zero() {
        let l = Latch::new(1);
        l.count_down();
        l.count_down();
        assert_eq!(l.count(), 0);
    }
}
