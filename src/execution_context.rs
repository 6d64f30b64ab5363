//! Explicit propagation of per-logical-request state across the two
//! asynchronous boundaries this crate has: starting a fiber, and firing a
//! timer callback.
//!
//! Unlike thread-locals or fiber-locals, an [`ExecutionContext`] is never
//! ambient — nothing consults "the current context" implicitly. A caller
//! that cares captures one explicitly and threads it through
//! [`crate::fiber::FiberAttr::execution_context`] or a timer's callback
//! setup; everything else this crate does is indifferent to it.
//!
//! The "currently installed" context for a fiber lives in that fiber's own
//! control block (not a thread-local), because a fiber's execution can
//! span being resumed on different worker threads after a work-steal — a
//! plain `thread_local!` would lose track of it across such a migration.
//!
//! Backed by `Arc<SpinLock<..>>` rather than `Rc<RefCell<..>>`: a captured
//! context can end up referenced from a timer entry fired on the group's
//! dedicated timer-worker thread, a different OS thread from whichever
//! worker the owning fiber runs on, so the bag must genuinely be `Send`/
//! `Sync`, not just cheaply `Clone`.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::fiber;
use crate::spinlock::SpinLock;

type Slots = HashMap<TypeId, Box<dyn Any + Send>>;

/// A reference-counted, cheaply `Clone`-able bag of arbitrary typed values.
#[derive(Clone)]
pub struct ExecutionContext {
    slots: Arc<SpinLock<Slots>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, keyed by its type. A later `get::<T>()` on this same
    /// handle (or any clone of it) retrieves it.
    pub fn set<T: Send + 'static>(&self, value: T) {
        self.slots.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Clone + Send + 'static>(&self) -> Option<T> {
        self.slots
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Captures the context currently installed on the calling fiber, if
    /// any.
    ///
    /// # Panics
    /// Panics outside of fiber/master context.
    pub fn capture() -> Option<Self> {
        let cur = fiber::current();
        assert!(!cur.is_null(), "ExecutionContext::capture called outside of fiber context");
        unsafe { cur.entity() }.execution_context.borrow().clone()
    }

    /// Installs `self` as the current fiber's context for the duration of
    /// `f`, restoring whatever was previously installed afterwards — even
    /// if `f` unwinds.
    ///
    /// # Panics
    /// Panics outside of fiber/master context.
    pub fn run_in<R>(&self, f: impl FnOnce() -> R) -> R {
        let cur = fiber::current();
        assert!(!cur.is_null(), "ExecutionContext::run_in called outside of fiber context");
        let entity = unsafe { cur.entity() };
        let previous = entity.execution_context.replace(Some(self.clone()));

        struct Restore<'a> {
            slot: &'a RefCell<Option<ExecutionContext>>,
            previous: Option<ExecutionContext>,
        }
        impl<'a> Drop for Restore<'a> {
            fn drop(&mut self) {
                *self.slot.borrow_mut() = self.previous.take();
            }
        }
        let _guard = Restore {
            slot: &entity.execution_context,
            previous,
        };
        f()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            slots: Arc::new(SpinLock::new(HashMap::new())),
        }
    }
}

thread_local! {
    // Mirrors a fiber's own `execution_context` slot, but for OS threads
    // that never run a fiber at all (the timer worker's dedicated thread).
    static CURRENT_ON_THREAD: RefCell<Option<ExecutionContext>> = RefCell::new(None);
}

impl ExecutionContext {
    /// Like [`Self::run_in`], but installs into the calling *OS thread*'s
    /// own slot rather than the current fiber's control block, and never
    /// panics outside of fiber context. Used by the timer worker to apply a
    /// timer's captured context around its callback: that callback runs on
    /// the timer worker's dedicated thread, which has no fiber of its own
    /// for `run_in` to install onto.
    pub(crate) fn run_in_on_thread<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT_ON_THREAD.with(|slot| {
            let previous = slot.replace(Some(self.clone()));

            struct Restore<'a> {
                slot: &'a RefCell<Option<ExecutionContext>>,
                previous: Option<ExecutionContext>,
            }
            impl<'a> Drop for Restore<'a> {
                fn drop(&mut self) {
                    self.slot.replace(self.previous.take());
                }
            }
            let _guard = Restore { slot, previous };
            f()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let ec = ExecutionContext::new();
        ec.set(42u32);
        ec.set("hello".to_string());
        assert_eq!(ec.get::<u32>(), Some(42));
        assert_eq!(ec.get::<String>(), Some("hello".to_string()));
        assert_eq!(ec.get::<u64>(), None);
    }

    #[test]
    fn clones_share_state() {
        let ec = ExecutionContext::new();
        let clone = ec.clone();
        ec.set(7i32);
        assert_eq!(clone.get::<i32>(), Some(7));
    }
}
