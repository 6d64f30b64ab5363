//! A fiber-blocking counting semaphore, the external interface's
//! `counting_semaphore`.
//!
//! Built the same way as [`super::Mutex`]: a small spinlock-guarded count
//! plus an intrusive [`crate::waitable::Waitable`] wait list, rather than
//! spinning a contended acquire.

use std::collections::VecDeque;

use crate::fiber;
use crate::group;
use crate::spinlock::SpinLock;
use crate::waitable::{WaitBlock, WaitBlockRef};

struct State {
    count: usize,
    waiters: VecDeque<WaitBlockRef>,
}

pub struct CountingSemaphore {
    state: SpinLock<State>,
}

unsafe impl Send for CountingSemaphore {}
unsafe impl Sync for CountingSemaphore {}

impl CountingSemaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            state: SpinLock::new(State {
                count: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().count
    }

    /// Blocks the calling fiber until a permit is available, then takes one.
    ///
    /// # Panics
    /// Panics outside of fiber context.
    pub fn acquire(&self) {
        loop {
            let fiber = fiber::current();
            assert!(!fiber.is_null(), "CountingSemaphore::acquire called outside of fiber context");
            let entity = unsafe { fiber.entity() };
            let wb = WaitBlock::new(fiber);

            let sched_guard = entity.scheduler_lock.lock();
            {
                let mut state = self.state.lock();
                if state.count > 0 {
                    state.count -= 1;
                    return;
                }
                state.waiters.push_back(WaitBlockRef::new(&wb));
            }
            std::mem::forget(sched_guard);
            group::current_group().halt(fiber);
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Returns one permit, waking a single waiter if any are queued.
    pub fn release(&self) {
        let woken = {
            let mut state = self.state.lock();
            let mut woken = None;
            while let Some(wb_ref) = state.waiters.pop_front() {
                let wb = unsafe { wb_ref.get() };
                if wb.try_satisfy() {
                    woken = Some(wb.fiber);
                    break;
                }
            }
            if woken.is_none() {
                state.count += 1;
            }
            woken
        };
        if let Some(f) = woken {
            group::group_of(f).ready_fiber(f, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_drains_permits() {
        let s = CountingSemaphore::new(2);
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        s.release();
        assert!(s.try_acquire());
    }

    #[test]
    fn available_reflects_count() {
        let s = CountingSemaphore::new(3);
        assert_eq!(s.available(), 3);
        s.try_acquire();
        assert_eq!(s.available(), 2);
    }
}
