//! Intrusive wait-queue primitive underlying all blocking synchronization.
//!
//! A [`Waitable`] is a spinlock-guarded doubly-linked list of [`WaitBlock`]s.
//! Every higher-level primitive (mutex, condvar, latch, event, one-shot timed
//! event) composes a `Waitable` rather than deriving from it — the wait-queue
//! node stays a plain struct with a fiber pointer, as called for by the
//! "tagged variants vs. inheritance" design note this crate follows.
//!
//! Grounded on `waitable.h`'s `wait_block`/`waitable` pair from the original
//! fiber runtime: a `satisfied` flag that flips from false to true at most
//! once arbitrates between racing wakers (a timer firing and a signal firing
//! concurrently, say), and `persistent_awakened` makes the waitable latch
//! permanently signalled for event-like one-shot use.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::fiber::FiberPtr;
use crate::spinlock::SpinLock;

/// A stack-allocated node linking one waiting fiber into a [`Waitable`]'s
/// list. The caller owns this on its stack for the duration of the wait and
/// it must outlive any possibility of the waitable touching it — enforced by
/// always removing it (successfully or not) before returning from the wait
/// call, on every exit path including timeout.
pub struct WaitBlock {
    pub fiber: FiberPtr,
    /// Flips false -> true exactly once. Whoever performs that flip is the
    /// sole winner entitled to actually resume `fiber`.
    pub satisfied: AtomicBool,
    /// Set by a racing timeout just before it wins `try_satisfy`, so the
    /// woken fiber can tell a timeout apart from a genuine signal. Unused
    /// (stays `false`) by waits with no deadline.
    timed_out: AtomicBool,
}

impl WaitBlock {
    pub fn new(fiber: FiberPtr) -> Self {
        Self {
            fiber,
            satisfied: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    /// Records that the winning wake-up was a timeout. Must be called by the
    /// timer path before it calls `try_satisfy`.
    #[inline]
    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Attempts to claim this wait block. Returns `true` for exactly one
    /// caller, ever.
    #[inline]
    pub fn try_satisfy(&self) -> bool {
        self.satisfied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::Acquire)
    }
}

/// A pointer-identity handle to a [`WaitBlock`] living on some fiber's stack.
/// Only ever dereferenced while that fiber is provably still suspended
/// (guaranteed by the scheduler-lock protocol in [`crate::group`]).
#[derive(Clone, Copy)]
pub struct WaitBlockRef(*const WaitBlock);

unsafe impl Send for WaitBlockRef {}

impl WaitBlockRef {
    pub fn new(wb: &WaitBlock) -> Self {
        Self(wb as *const WaitBlock)
    }

    /// # Safety
    /// The referenced `WaitBlock` must still be alive.
    pub unsafe fn get(&self) -> &WaitBlock {
        &*self.0
    }
}

struct Inner {
    waiters: VecDeque<WaitBlockRef>,
    persistent_awakened: bool,
}

/// An intrusive, spinlock-guarded wait list. All higher-level blocking
/// primitives in this crate are built on top of one or more `Waitable`s.
pub struct Waitable {
    inner: SpinLock<Inner>,
}

impl Waitable {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                waiters: VecDeque::new(),
                persistent_awakened: false,
            }),
        }
    }

    /// Enqueues `wb`. Fails if the waitable has already latched
    /// [`Self::set_persistent_awakened`] (one-way transition).
    ///
    /// The caller must already hold the waiting fiber's `scheduler_lock`
    /// before calling this, to close the race between "about to sleep" and
    /// "signalled now" — see the race-free sleep protocol in
    /// [`crate::group::SchedulingGroup::halt`].
    pub fn add_waiter(&self, wb: &WaitBlock) -> bool {
        let mut inner = self.inner.lock();
        if inner.persistent_awakened {
            return false;
        }
        inner.waiters.push_back(WaitBlockRef::new(wb));
        true
    }

    /// Unlinks `wb` if it is still present. Used on the timeout path to
    /// avoid waking an already-removed waiter later.
    pub fn try_remove_waiter(&self, wb: &WaitBlock) -> bool {
        let target = wb as *const WaitBlock;
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.waiters.iter().position(|w| w.0 == target) {
            inner.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Pops and wakes exactly one waiter whose `satisfied` flag we win the
    /// race to flip. Waiters already satisfied by a racing waker (most
    /// commonly a timeout) are discarded without being "woken" again.
    pub fn wake_one(&self) -> Option<FiberPtr> {
        let mut inner = self.inner.lock();
        while let Some(wb_ref) = inner.waiters.pop_front() {
            let wb = unsafe { wb_ref.get() };
            if wb.try_satisfy() {
                return Some(wb.fiber);
            }
            // Already satisfied by someone else (e.g. a timeout); keep going.
        }
        None
    }

    /// Marks the waitable as permanently signalled: no further
    /// `add_waiter` will succeed. Drains and returns every not-yet-satisfied
    /// waiter so the caller can ready them all.
    pub fn set_persistent_awakened(&self) -> Vec<FiberPtr> {
        let mut inner = self.inner.lock();
        inner.persistent_awakened = true;
        let mut woken = Vec::with_capacity(inner.waiters.len());
        while let Some(wb_ref) = inner.waiters.pop_front() {
            let wb = unsafe { wb_ref.get() };
            if wb.try_satisfy() {
                woken.push(wb.fiber);
            }
        }
        woken
    }

    /// Wakes every current waiter without latching the waitable
    /// permanently — used by `notify_all`-style callers that may be
    /// `wake_one`/`wake_all`'d again later (a plain condition variable, not
    /// a one-shot event).
    pub fn wake_all(&self) -> Vec<FiberPtr> {
        let mut inner = self.inner.lock();
        let mut woken = Vec::with_capacity(inner.waiters.len());
        while let Some(wb_ref) = inner.waiters.pop_front() {
            let wb = unsafe { wb_ref.get() };
            if wb.try_satisfy() {
                woken.push(wb.fiber);
            }
        }
        woken
    }

    /// Reverts [`Self::set_persistent_awakened`]. Only used when a waitable
    /// is recycled from a pool and reused for an unrelated instance.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.persistent_awakened = false;
        debug_assert!(inner.waiters.is_empty());
    }

    pub fn is_persistently_awakened(&self) -> bool {
        self.inner.lock().persistent_awakened
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl Default for Waitable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fiber(tag: u64) -> FiberPtr {
        FiberPtr::from_tag(tag)
    }

    #[test]
    fn satisfied_flips_once() {
        let wb = WaitBlock::new(fiber(1));
        assert!(wb.try_satisfy());
        assert!(!wb.try_satisfy());
        assert!(wb.is_satisfied());
    }

    #[test]
    fn wake_one_skips_already_satisfied() {
        let w = Waitable::new();
        let wb1 = WaitBlock::new(fiber(1));
        let wb2 = WaitBlock::new(fiber(2));
        w.add_waiter(&wb1);
        w.add_waiter(&wb2);
        // Simulate a racing timer winning wb1 first.
        assert!(wb1.try_satisfy());
        let woken = w.wake_one().unwrap();
        assert_eq!(woken.tag(), 2);
        assert!(w.wake_one().is_none());
    }

    #[test]
    fn persistent_awakened_rejects_late_waiters() {
        let w = Waitable::new();
        let wb1 = WaitBlock::new(fiber(1));
        w.add_waiter(&wb1);
        let drained = w.set_persistent_awakened();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tag(), 1);

        let wb2 = WaitBlock::new(fiber(2));
        assert!(!w.add_waiter(&wb2));
    }

    #[test]
    fn try_remove_waiter_unlinks() {
        let w = Waitable::new();
        let wb1 = WaitBlock::new(fiber(1));
        w.add_waiter(&wb1);
        assert!(w.try_remove_waiter(&wb1));
        assert!(!w.try_remove_waiter(&wb1));
        assert!(w.wake_one().is_none());
    }
}
