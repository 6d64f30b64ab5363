//! One-shot signalling primitives: [`Event`] and [`OneshotTimedEvent`].
//!
//! Both are thin compositions over [`crate::waitable::Waitable`]'s
//! `persistent_awakened` latch (§4.5 of the design this crate implements) —
//! once set, an `Event` stays set forever, and any `wait()` that arrives
//! after the fact returns immediately rather than blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock;
use crate::group;
use crate::waitable::Waitable;

/// A one-shot flag any number of fibers may wait on. `set()` is idempotent:
/// only the first call actually wakes anyone, later calls are no-ops.
pub struct Event {
    waitable: Waitable,
    is_set: AtomicBool,
}

impl Event {
    pub fn new() -> Self {
        Self {
            waitable: Waitable::new(),
            is_set: AtomicBool::new(false),
        }
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    /// Latches the event permanently and wakes every current waiter.
    pub fn set(&self) {
        if self.is_set.swap(true, Ordering::AcqRel) {
            return;
        }
        super::wake_all(self.waitable.set_persistent_awakened());
    }

    /// Blocks the calling fiber until [`Self::set`] has been (or already
    /// was) called.
    pub fn wait(&self) {
        super::park_on(&self.waitable);
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    event: Event,
}

/// A ref-counted [`Event`] wired to a timer: the event is set exactly once,
/// either by an explicit [`Self::fire_now`]-style caller or, more commonly,
/// by the timer expiring on its own. Used by [`crate::fiber::fiber_sleep_for`]
/// and [`crate::fiber::fiber_sleep_until`] to turn "sleep until a deadline"
/// into "wait on an event that a timer sets".
#[derive(Clone)]
pub struct OneshotTimedEvent {
    inner: Arc<Inner>,
}

impl OneshotTimedEvent {
    /// Arms a timer on the current fiber's scheduling group that calls
    /// [`Event::set`] on expiry.
    ///
    /// # Panics
    /// Panics outside of fiber context.
    pub fn new_with_deadline(deadline: Instant) -> Self {
        let inner = Arc::new(Inner { event: Event::new() });
        let group = group::current_group();
        let cb_inner = Arc::clone(&inner);
        let (_id, handle) = group.timer_worker.create_timer(deadline, move || {
            cb_inner.event.set();
        });
        group.timer_worker.enable_timer(&crate::timer::current_inbox(), &handle);
        // The inbox already holds its own reference to the entry (detach
        // semantics): dropping our handle here doesn't cancel the timer.
        drop(handle);
        Self { inner }
    }

    pub fn new_after(timeout: Duration) -> Self {
        Self::new_with_deadline(clock::deadline_after(timeout))
    }

    pub fn is_set(&self) -> bool {
        self.inner.event.is_set()
    }

    /// Blocks the calling fiber until the timer fires (or the event is
    /// otherwise already set).
    pub fn wait(&self) {
        self.inner.event.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent() {
        let e = Event::new();
        assert!(!e.is_set());
        e.set();
        assert!(e.is_set());
        e.set();
        assert!(e.is_set());
    }
}
