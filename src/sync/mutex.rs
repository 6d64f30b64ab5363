//! A fiber-blocking mutex.
//!
//! Unlike [`crate::spinlock::SpinLock`], a contended `lock()` here suspends
//! the calling fiber (via the scheduler's `halt`/`ready_fiber` handoff)
//! rather than spinning, so it is safe to hold across a call that itself
//! blocks. The locked flag and the wait queue share one
//! [`crate::spinlock::SpinLock`]-guarded state, so a `lock()` that observes
//! the mutex held and an `unlock()` releasing it can never race past each
//! other and lose a wakeup.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use crate::fiber;
use crate::group;
use crate::spinlock::SpinLock;
use crate::waitable::{WaitBlock, WaitBlockRef};

struct State {
    locked: bool,
    waiters: VecDeque<WaitBlockRef>,
}

pub struct Mutex<T> {
    state: SpinLock<State>,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Blocks the calling fiber until the lock is acquired.
    ///
    /// # Panics
    /// Panics outside of fiber context.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let fiber = fiber::current();
            assert!(!fiber.is_null(), "Mutex::lock called outside of fiber context");
            let entity = unsafe { fiber.entity() };
            let wb = WaitBlock::new(fiber);

            let sched_guard = entity.scheduler_lock.lock();
            {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    drop(state);
                    drop(sched_guard);
                    return MutexGuard { mutex: self };
                }
                state.waiters.push_back(WaitBlockRef::new(&wb));
            }
            std::mem::forget(sched_guard);
            group::current_group().halt(fiber);
            // Resumed: either we just won a race for the lock, or we're
            // merely being given another shot at it. Either way, loop and
            // re-attempt the fast path.
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    fn unlock(&self) {
        let woken = {
            let mut state = self.state.lock();
            state.locked = false;
            let mut woken = None;
            while let Some(wb_ref) = state.waiters.pop_front() {
                let wb = unsafe { wb_ref.get() };
                if wb.try_satisfy() {
                    woken = Some(wb.fiber);
                    break;
                }
            }
            woken
        };
        if let Some(f) = woken {
            group::group_of(f).ready_fiber(f, false);
        }
    }
}

pub struct MutexGuard<'a, T> {
    pub(crate) mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_is_exclusive() {
        let m = Mutex::new(0u32);
        let g1 = m.try_lock().unwrap();
        assert!(m.try_lock().is_none());
        drop(g1);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn guard_derefs_to_value() {
        let m = Mutex::new(5i32);
        {
            let mut g = m.try_lock().unwrap();
            *g += 1;
        }
        assert_eq!(*m.try_lock().unwrap(), 6);
    }
}
