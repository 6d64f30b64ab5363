//! Fiber-aware synchronization primitives, all built on top of
//! [`crate::waitable::Waitable`] plus the scheduling group's
//! `halt`/`ready_fiber` handoff. These are the fiber analogues of their OS
//! counterparts: a fiber blocking on one of these suspends via a context
//! switch rather than parking an OS thread.

pub mod cond;
pub mod event;
pub mod latch;
pub mod mutex;
pub mod semaphore;

pub use cond::Cond;
pub use event::{Event, OneshotTimedEvent};
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::CountingSemaphore;

use std::time::Instant;

use crate::error::WaitTimeoutResult;
use crate::fiber::{self, FiberPtr};
use crate::group;
use crate::waitable::{WaitBlock, WaitBlockRef, Waitable};

/// Suspends the calling fiber on `waitable` until some other fiber wakes it
/// (`wake_one`) or the waitable is latched permanently
/// (`set_persistent_awakened`). Every blocking primitive in this module
/// bottoms out here for the no-deadline case.
///
/// Precondition/postcondition: the caller has *not* locked anything of its
/// own across this call (any caller-side lock, e.g. a `Mutex`'s internal
/// count, must already be released before parking, exactly as with a
/// condvar).
pub(crate) fn park_on(waitable: &Waitable) {
    let fiber = fiber::current();
    let entity = unsafe { fiber.entity() };
    let wb = WaitBlock::new(fiber);

    let guard = entity.scheduler_lock.lock();
    if !waitable.add_waiter(&wb) {
        // Already persistently signalled; nothing to wait for.
        drop(guard);
        return;
    }
    std::mem::forget(guard);
    group::current_group().halt(fiber);
}

/// Like [`park_on`], but gives up and returns
/// [`WaitTimeoutResult::TimedOut`] if not woken by `deadline`.
pub(crate) fn park_on_timeout(waitable: &Waitable, deadline: Instant) -> WaitTimeoutResult {
    let fiber = fiber::current();
    let entity = unsafe { fiber.entity() };
    let wb = WaitBlock::new(fiber);
    let wb_ref = WaitBlockRef::new(&wb);
    let waitable_ptr: *const Waitable = waitable;

    let group = group::current_group();
    let (_, handle) = group.timer_worker.create_timer(deadline, move || {
        // Safety: the WaitBlock lives on the waiting fiber's stack, which is
        // still suspended (it can only resume after this closure returns,
        // via `ready_fiber` below) for as long as this closure might run.
        let wb = unsafe { wb_ref.get() };
        if wb.try_satisfy() {
            // Only the winner of the race gets to call this a timeout —
            // marking it unconditionally would mislabel a fiber that was
            // already woken genuinely before this callback ran.
            wb.mark_timed_out();
            let waitable = unsafe { &*waitable_ptr };
            waitable.try_remove_waiter(wb);
            group::group_of(wb.fiber).ready_fiber(wb.fiber, false);
        }
    });
    group.timer_worker.enable_timer(&crate::timer::current_inbox(), &handle);

    let guard = entity.scheduler_lock.lock();
    if !waitable.add_waiter(&wb) {
        drop(guard);
        group.timer_worker.remove_timer(&handle);
        return WaitTimeoutResult::Woken;
    }
    std::mem::forget(guard);
    group.halt(fiber);

    // We only resume once the race in `try_satisfy` has a winner. Cancel
    // the timer unconditionally; it's a no-op if it already fired.
    group.timer_worker.remove_timer(&handle);
    if wb.timed_out() {
        WaitTimeoutResult::TimedOut
    } else {
        WaitTimeoutResult::Woken
    }
}

/// Wakes one waiter on `waitable`, if any, readying it on its own group.
pub(crate) fn wake_one(waitable: &Waitable) -> bool {
    match waitable.wake_one() {
        Some(f) => {
            group::group_of(f).ready_fiber(f, false);
            true
        }
        None => false,
    }
}

/// Wakes every (not-already-satisfied) waiter on `waitable` — used by
/// `notify_all` and by anything latching a waitable permanently.
pub(crate) fn wake_all(woken: Vec<FiberPtr>) {
    for f in woken {
        group::group_of(f).ready_fiber(f, false);
    }
}
