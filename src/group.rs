//! The scheduling group: the smallest self-contained scheduler. Owns one
//! run queue, a worker wake-up engine (two 64-bit bitmasks), and a pointer
//! to the group's dedicated timer worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use log::warn;

use crate::fiber::{self, FiberPtr, FiberState};
use crate::run_queue::RunQueue;
use crate::timer::TimerWorker;

/// Group size is capped at 64 — one bit per worker in the wake-up masks.
pub const MAX_GROUP_SIZE: usize = 64;

/// A per-worker parking cell. Workers park on their own `Thread` handle
/// (`std::thread::park`/`unpark`); this struct exists so the group can hand
/// a worker its own index-addressable slot before the OS thread exists.
struct WorkerSlot {
    thread: std::sync::Mutex<Option<Thread>>,
}

pub struct SchedulingGroup {
    pub index: usize,
    pub numa_node: usize,
    pub run_queue: RunQueue,
    slots: Vec<WorkerSlot>,
    spinning_workers: AtomicU64,
    sleeping_workers: AtomicU64,
    /// Global cap on concurrent spinners, regardless of group size.
    spinner_count: AtomicU64,
    pub timer_worker: Arc<TimerWorker>,
    stopped: AtomicBool,
}

impl SchedulingGroup {
    pub fn new(index: usize, numa_node: usize, size: usize, queue_capacity: usize, timer_worker: Arc<TimerWorker>) -> Arc<Self> {
        assert!(size > 0 && size <= MAX_GROUP_SIZE, "scheduling group size must be in 1..=64");
        let slots = (0..size)
            .map(|_| WorkerSlot {
                thread: std::sync::Mutex::new(None),
            })
            .collect();
        Arc::new(Self {
            index,
            numa_node,
            run_queue: RunQueue::new(queue_capacity),
            slots,
            spinning_workers: AtomicU64::new(0),
            sleeping_workers: AtomicU64::new(0),
            spinner_count: AtomicU64::new(0),
            timer_worker,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Registers the calling OS thread as worker `index`'s parkable handle.
    /// Must be called as the first act of that worker's loop.
    pub fn register_worker_thread(&self, index: usize) {
        *self.slots[index].thread.lock().unwrap() = Some(thread::current());
    }

    /// Pops the run queue and transitions the popped fiber Ready -> Running.
    pub fn acquire_fiber(&self) -> AcquireResult {
        match self.run_queue.pop() {
            Some(f) => {
                let entity = unsafe { f.entity() };
                let _guard = entity.scheduler_lock.lock();
                entity.set_state(FiberState::Running);
                AcquireResult::Fiber(f)
            }
            None => {
                if self.is_stopped() {
                    AcquireResult::Shutdown
                } else {
                    AcquireResult::Empty
                }
            }
        }
    }

    /// Bounded spin before a worker commits to sleeping. Capped globally at
    /// two concurrent spinners per group (spinning is cheap per-worker but
    /// wasteful in aggregate).
    pub fn spinning_acquire_fiber(&self, worker_index: usize) -> AcquireResult {
        const MAX_SPINNERS: u64 = 2;
        const SPIN_BUDGET: Duration = Duration::from_micros(10);

        if self.spinner_count.fetch_add(1, Ordering::AcqRel) >= MAX_SPINNERS {
            self.spinner_count.fetch_sub(1, Ordering::AcqRel);
            return AcquireResult::Empty;
        }
        let bit = 1u64 << worker_index;
        self.spinning_workers.fetch_or(bit, Ordering::AcqRel);

        let deadline = std::time::Instant::now() + SPIN_BUDGET;
        let result = loop {
            match self.acquire_fiber() {
                AcquireResult::Empty => {
                    if std::time::Instant::now() >= deadline {
                        break AcquireResult::Empty;
                    }
                    std::hint::spin_loop();
                }
                other => break other,
            }
        };

        self.spinning_workers.fetch_and(!bit, Ordering::AcqRel);
        self.spinner_count.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Sets our sleeping bit, rechecks the queue once (to close the race
    /// against a `ready_fiber` that ran between our last empty check and
    /// now), then parks.
    pub fn wait_for_fiber(&self, worker_index: usize) -> AcquireResult {
        let bit = 1u64 << worker_index;
        self.sleeping_workers.fetch_or(bit, Ordering::AcqRel);

        match self.acquire_fiber() {
            AcquireResult::Empty => {}
            other => {
                let prev = self.sleeping_workers.fetch_and(!bit, Ordering::AcqRel);
                if prev & bit == 0 {
                    // Someone already cleared our bit via wake_up_one_worker,
                    // meaning a fiber was pushed for us specifically; we're
                    // returning via a different, already-queued fiber
                    // instead, so pass that wake-up along rather than drop it.
                    self.wake_up_one_worker();
                }
                return other;
            }
        }

        loop {
            thread::park();
            if self.sleeping_workers.load(Ordering::Acquire) & bit == 0 {
                // We were already cleared (woken) by wake_up_one_worker.
                break;
            }
            if self.is_stopped() {
                self.sleeping_workers.fetch_and(!bit, Ordering::AcqRel);
                return AcquireResult::Shutdown;
            }
            // Spurious unpark; loop back and park again.
        }

        match self.acquire_fiber() {
            AcquireResult::Empty if self.is_stopped() => AcquireResult::Shutdown,
            other => other,
        }
    }

    /// Assigns `f` to this group without touching its state or the run
    /// queue. Used by `batch_start_fibers` to make `group_of(f)` resolve
    /// correctly for every fiber in the batch before any of them is
    /// enqueued (and thus before any could possibly be stolen).
    pub fn set_owner(self: &Arc<Self>, f: FiberPtr) {
        let entity = unsafe { f.entity() };
        entity.own_scheduling_group.set(Arc::as_ptr(self) as *const ());
    }

    /// Readies a whole batch of fibers at once: all-or-nothing push, one
    /// wake-up. `f`s must already be owned by this group (see
    /// [`Self::set_owner`]) and in the `Ready` state.
    ///
    /// Unlike [`Self::ready_fiber`], never retries under queue overflow —
    /// callers that need a batch larger than the queue's free capacity
    /// should split it themselves; a spec-sized default queue (§4.3) makes
    /// this a non-issue in practice.
    pub fn batch_ready(self: &Arc<Self>, fibers: &[FiberPtr]) -> bool {
        let now = crate::clock::now();
        for &f in fibers {
            let entity = unsafe { f.entity() };
            entity.set_state(FiberState::Ready);
            entity.own_scheduling_group.set(Arc::as_ptr(self) as *const ());
            entity.last_ready_tsc.set(now);
        }
        // All fibers in a batch share the same `scheduling_group_local`
        // policy in practice (they come from one `batch_start_fibers` call
        // with one shared `FiberAttr`); using the first fiber's flag keeps
        // this a single push instead of one per fiber.
        let instealable = fibers.first().map(|&f| unsafe { f.entity() }.scheduling_group_local).unwrap_or(false);
        let ok = self.run_queue.batch_push(fibers, instealable);
        if ok {
            self.wake_up_one_worker();
        }
        ok
    }

    /// Readies `f`: marks it Ready, assigns it to this group, pushes it to
    /// the run queue (retrying under overflow), and wakes a worker.
    ///
    /// If `f`'s `scheduler_lock` is currently held by the caller (as part of
    /// a suspend-then-ready handoff), pass `unlock_after` so it is released
    /// only once the fiber is safely enqueued — never before.
    pub fn ready_fiber(self: &Arc<Self>, f: FiberPtr, unlock_after: bool) {
        let entity = unsafe { f.entity() };
        entity.set_state(FiberState::Ready);
        entity
            .own_scheduling_group
            .set(Arc::as_ptr(self) as *const ());
        entity.last_ready_tsc.set(crate::clock::now());

        let instealable = entity.scheduling_group_local;
        let mut waited = Duration::ZERO;
        let mut warned = false;
        while !self.run_queue.push(f, instealable) {
            thread::sleep(Duration::from_micros(100));
            waited += Duration::from_micros(100);
            if !warned && waited >= Duration::from_secs(5) {
                warn!(target: crate::log::TARGET_RUN_QUEUE, "run queue for group {} has been full for 5s, still retrying", self.index);
                warned = true;
            }
        }

        if unlock_after {
            unsafe { entity.scheduler_lock.unlock() };
        }

        self.wake_up_one_worker();
    }

    /// Prefers clearing a spinning bit (near-zero cost: the spinner notices
    /// on its own) over waking a sleeper. Among sleepers, always the
    /// lowest-indexed one, so high-index workers stay parked under light
    /// load.
    pub fn wake_up_one_worker(&self) {
        let spinning = self.spinning_workers.load(Ordering::Acquire);
        if spinning != 0 {
            // A spinning worker will notice the queue on its own; nothing
            // further to do.
            return;
        }
        loop {
            let sleeping = self.sleeping_workers.load(Ordering::Acquire);
            if sleeping == 0 {
                return;
            }
            let lowest = sleeping.trailing_zeros() as usize;
            let bit = 1u64 << lowest;
            if self
                .sleeping_workers
                .compare_exchange(sleeping, sleeping & !bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(t) = self.slots[lowest].thread.lock().unwrap().clone() {
                    t.unpark();
                }
                return;
            }
        }
    }

    /// Persistently wakes every worker so they all observe
    /// queue-empty-and-stopped and return `Shutdown`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        for slot in &self.slots {
            if let Some(t) = slot.thread.lock().unwrap().clone() {
                t.unpark();
            }
        }
    }

    /// Precondition: `f == current()`, `f`'s `scheduler_lock` is held by the
    /// caller (and the guard has been `mem::forget`-ten), `f.state ==
    /// Running`. Transitions to `Waiting` and switches to the worker's
    /// master fiber, which releases the lock only once the switch has
    /// fully completed.
    pub fn halt(&self, f: FiberPtr) {
        let entity = unsafe { f.entity() };
        debug_assert_eq!(entity.state(), FiberState::Running);
        entity.set_state(FiberState::Waiting);
        let master = fiber::master_ptr();
        unsafe { master.entity() }.set_resume_proc(Box::new(move || unsafe {
            entity.scheduler_lock.unlock();
        }));
        fiber::switch_raw(master, 0);
    }

    /// Cooperative yield: put ourselves back on our own run queue and
    /// switch to master.
    pub fn yield_now(self: &Arc<Self>, f: FiberPtr) {
        let entity = unsafe { f.entity() };
        let guard = entity.scheduler_lock.lock();
        std::mem::forget(guard);
        let master = fiber::master_ptr();
        let group = Arc::clone(self);
        unsafe { master.entity() }.set_resume_proc(Box::new(move || {
            group.ready_fiber(f, true);
        }));
        fiber::switch_raw(master, 0);
    }

    /// Directly switches the current worker from `f` to `to` (used by
    /// `Launch::Dispatch`). `to` must currently be Ready. Defers re-readying
    /// `f` until after the switch so no thief can observe `f` mid-transition.
    pub fn switch_to(self: &Arc<Self>, f: FiberPtr, to: FiberPtr) {
        debug_assert_eq!(unsafe { to.entity() }.state(), FiberState::Ready);
        debug_assert_ne!(f, to);
        let f_entity = unsafe { f.entity() };
        let guard = f_entity.scheduler_lock.lock();
        std::mem::forget(guard);
        let group = Arc::clone(self);
        unsafe { to.entity() }.set_resume_proc(Box::new(move || {
            group.ready_fiber(f, true);
        }));
        unsafe { to.entity() }.set_state(FiberState::Running);
        fiber::switch_raw(to, 0);
    }
}

pub enum AcquireResult {
    Fiber(FiberPtr),
    Empty,
    Shutdown,
}

/// Returns the scheduling group the currently running fiber belongs to.
///
/// # Panics
/// Panics outside of fiber context, or if called before the fiber has been
/// assigned to a group (i.e. before its first `ready_fiber`).
pub fn current_group() -> Arc<SchedulingGroup> {
    group_of(fiber::current())
}

/// Returns the scheduling group `f` is assigned to. Used by synchronization
/// primitives to ready a *different* fiber than the caller (e.g. a mutex
/// waking a waiter it is unlocking on behalf of).
///
/// # Panics
/// Panics if `f` is null or has not yet been assigned to a group.
pub fn group_of(f: FiberPtr) -> Arc<SchedulingGroup> {
    assert!(!f.is_null(), "group_of() called with a null fiber");
    let entity = unsafe { f.entity() };
    let ptr = entity.own_scheduling_group.get() as *const SchedulingGroup;
    assert!(!ptr.is_null(), "fiber has not been assigned to a scheduling group yet");
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}
