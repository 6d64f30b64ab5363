//! Fiber-local storage: the `fiber_local<T>` facility from the external
//! interface, plus its backing slot-index allocator.
//!
//! Every fiber owns a small inline array of slots (for values that fit in a
//! pointer's worth of bits) and a lazily-allocated overflow map (for
//! everything else). Slot indices are handed out by a single process-wide,
//! recycling allocator — so a slot freed by one `FiberLocal<T>` going out of
//! scope can be reused by the next one created, keeping the inline array
//! from growing unboundedly over the life of a long-running program.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::fiber;

/// Number of slots stored inline in every fiber's control block before
/// falling back to the overflow map. Chosen to cover the common case (a
/// handful of fiber-local handles per program) without per-fiber heap
/// traffic.
pub const INLINE_SLOTS: usize = 8;

struct IndexAlloc {
    next: AtomicUsize,
    free: Mutex<Vec<usize>>,
}

impl IndexAlloc {
    const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
        }
    }

    fn alloc(&self) -> usize {
        if let Some(idx) = self.free.lock().unwrap().pop() {
            return idx;
        }
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn free(&self, idx: usize) {
        self.free.lock().unwrap().push(idx);
    }
}

static SLOT_ALLOC: Lazy<IndexAlloc> = Lazy::new(IndexAlloc::new);

/// One fiber's FLS: an inline array of type-erased owning slots plus an
/// overflow map for slot indices beyond [`INLINE_SLOTS`].
#[derive(Default)]
pub struct Fls {
    inline: [Option<Box<dyn Any + Send>>; INLINE_SLOTS],
    overflow: Option<std::collections::HashMap<usize, Box<dyn Any + Send>>>,
}

impl Fls {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_init(&mut self, slot: usize, init: impl FnOnce() -> Box<dyn Any + Send>) -> &mut (dyn Any + Send) {
        if slot < INLINE_SLOTS {
            if self.inline[slot].is_none() {
                self.inline[slot] = Some(init());
            }
            self.inline[slot].as_deref_mut().unwrap()
        } else {
            let map = self.overflow.get_or_insert_with(Default::default);
            map.entry(slot).or_insert_with(init).as_mut()
        }
    }

    fn clear(&mut self, slot: usize) {
        if slot < INLINE_SLOTS {
            self.inline[slot] = None;
        } else if let Some(map) = self.overflow.as_mut() {
            map.remove(&slot);
        }
    }
}

/// A fiber-local handle to a `T`, lazily initialized the first time it is
/// accessed on any given fiber, exactly like [`std::thread::LocalKey`] but
/// scoped to the fiber rather than the OS thread.
pub struct FiberLocal<T: Send + 'static> {
    slot: usize,
    init: fn() -> T,
}

impl<T: Send + 'static> FiberLocal<T> {
    /// Allocates a new slot. `init` is called at most once per fiber, the
    /// first time [`Self::with`] is called on it from that fiber.
    pub fn new(init: fn() -> T) -> Self {
        Self {
            slot: SLOT_ALLOC.alloc(),
            init,
        }
    }

    /// Runs `f` with a reference to this fiber's value, initializing it
    /// first if this is the first access on the current fiber.
    ///
    /// # Panics
    /// Panics if called outside of fiber context (no fiber currently
    /// running on this worker).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let init = self.init;
        fiber::with_current_fls(|fls| {
            let value = fls.get_or_init(self.slot, move || Box::new(init()));
            let value = value
                .downcast_ref::<T>()
                .expect("FiberLocal slot type mismatch — slot index reused incorrectly");
            f(value)
        })
    }

    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !fiber::is_in_fiber_context() {
            return None;
        }
        Some(self.with(f))
    }
}

impl<T: Send + 'static> Drop for FiberLocal<T> {
    fn drop(&mut self) {
        clear_current(self.slot);
        SLOT_ALLOC.free(self.slot);
    }
}

/// Removes the value (if any) in the current fiber's copy of `slot`. Used
/// internally when recycling a slot index so a stale value doesn't leak
/// into whatever `FiberLocal` gets the recycled index next.
pub(crate) fn clear_current(slot: usize) {
    if fiber::is_in_fiber_context() {
        fiber::with_current_fls(|fls| fls.clear(slot));
    }
}
