//! The per-group timer worker: one dedicated OS thread driving a min-heap
//! of timers, fed by per-producer thread-local inboxes.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;

use crate::execution_context::ExecutionContext;
use crate::group;
use crate::spinlock::SpinLock;

/// Opaque timer identity, returned by `create_timer` and accepted by
/// `remove_timer`/`detach_timer`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

struct TimerEntryInner {
    id: TimerId,
    expiry: SpinLock<Instant>,
    interval: Option<Duration>,
    callback: SpinLock<Option<Box<dyn FnMut() + Send>>>,
    execution_context: Option<ExecutionContext>,
    cancelled: AtomicBool,
}

type TimerEntry = Arc<TimerEntryInner>;

/// A single producer's thread-local staging area: a spinlock-guarded
/// vector of not-yet-published entries plus a cheap "earliest expiry"
/// hint the timer worker can check without draining the whole vector.
pub struct Inbox {
    pending: SpinLock<Vec<TimerEntry>>,
    earliest_hint: SpinLock<Option<Instant>>,
}

impl Inbox {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: SpinLock::new(Vec::new()),
            earliest_hint: SpinLock::new(None),
        })
    }

    fn push(&self, entry: TimerEntry) {
        let expiry = *entry.expiry.lock();
        self.pending.lock().push(entry);
        let mut hint = self.earliest_hint.lock();
        if hint.map_or(true, |h| expiry < h) {
            *hint = Some(expiry);
        }
    }

    fn drain(&self) -> Vec<TimerEntry> {
        *self.earliest_hint.lock() = None;
        std::mem::take(&mut *self.pending.lock())
    }
}

/// A plain OS-thread-level countdown latch, used only for the timer
/// worker's own startup synchronization (waiting for every worker thread
/// in the group to register its inbox). Unlike [`crate::sync::latch`]'s
/// fiber latch, this one is waited on by the timer worker's native OS
/// thread, which has no fiber context to suspend with.
struct StartupLatch {
    lock: Mutex<usize>,
    cond: Condvar,
}

impl StartupLatch {
    fn new(count: usize) -> Self {
        Self {
            lock: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut n = self.lock.lock().unwrap();
        if *n > 0 {
            *n -= 1;
            if *n == 0 {
                self.cond.notify_all();
            }
        }
    }

    fn wait(&self) {
        let mut n = self.lock.lock().unwrap();
        while *n > 0 {
            n = self.cond.wait(n).unwrap();
        }
    }
}

pub struct TimerWorker {
    inboxes: Mutex<Vec<Arc<Inbox>>>,
    next_expires_at: SpinLock<Option<Instant>>,
    wake_lock: Mutex<()>,
    wake_cond: Condvar,
    stopped: AtomicBool,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    registered_latch: StartupLatch,
    expected_producers: usize,
    /// Maps the facade's bare [`TimerId`]s back to the handle that keeps
    /// the entry's callback alive, so `stop_timer`/`detach_timer` can work
    /// from an id alone rather than an unsafe reinterpretation of the id as
    /// a raw pointer.
    handles: Mutex<HashMap<TimerId, TimerEntryHandle>>,
}

impl TimerWorker {
    pub fn new(expected_producers: usize) -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(Vec::new()),
            next_expires_at: SpinLock::new(None),
            wake_lock: Mutex::new(()),
            wake_cond: Condvar::new(),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            thread: Mutex::new(None),
            registered_latch: StartupLatch::new(expected_producers),
            expected_producers,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Retains `handle` under `id` so a later `stop_timer`/`detach_timer`
    /// call can find it again by id alone.
    fn retain_handle(&self, id: TimerId, handle: TimerEntryHandle) {
        self.handles.lock().unwrap().insert(id, handle);
    }

    /// Removes and returns the handle registered under `id`, if any. A
    /// second call for the same id (idempotent stop/detach) finds nothing.
    fn take_handle(&self, id: TimerId) -> Option<TimerEntryHandle> {
        self.handles.lock().unwrap().remove(&id)
    }

    /// Registers a brand-new inbox for a producer (worker) thread and
    /// returns it. Called once by every worker (and conceptually by the
    /// timer worker itself) as part of `enter_group`.
    pub fn register_inbox(&self) -> Arc<Inbox> {
        let inbox = Inbox::new();
        self.inboxes.lock().unwrap().push(Arc::clone(&inbox));
        self.registered_latch.count_down();
        inbox
    }

    pub fn expected_producers(&self) -> usize {
        self.expected_producers
    }

    /// Spawns the dedicated OS thread running [`Self::run`]. Call once,
    /// after every producer inbox is expected to register.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("corogroup-timer".into())
            .spawn(move || this.run())
            .expect("failed to spawn timer worker thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _g = self.wake_lock.lock().unwrap();
        self.wake_cond.notify_all();
    }

    pub fn join(&self) {
        if let Some(h) = self.thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Allocates (but does not publish) a one-shot timer entry.
    pub fn create_timer(&self, expiry: Instant, cb: impl FnMut() + Send + 'static) -> (TimerId, TimerEntryHandle) {
        self.create_timer_with_context(expiry, None, cb)
    }

    pub fn create_periodic_timer(&self, first: Instant, interval: Duration, cb: impl FnMut() + Send + 'static) -> (TimerId, TimerEntryHandle) {
        self.create_timer_with_context(first, Some(interval), cb)
    }

    fn create_timer_with_context(
        &self,
        expiry: Instant,
        interval: Option<Duration>,
        cb: impl FnMut() + Send + 'static,
    ) -> (TimerId, TimerEntryHandle) {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(TimerEntryInner {
            id,
            expiry: SpinLock::new(expiry),
            interval,
            callback: SpinLock::new(Some(Box::new(cb))),
            execution_context: if crate::fiber::is_in_fiber_context() {
                ExecutionContext::capture()
            } else {
                None
            },
            cancelled: AtomicBool::new(false),
        });
        (id, TimerEntryHandle(entry))
    }

    /// Publishes a created-but-not-yet-enabled timer into `inbox`, and
    /// pokes the timer worker's sleep condition if this beats its current
    /// estimate of the next deadline.
    pub fn enable_timer(&self, inbox: &Inbox, handle: &TimerEntryHandle) {
        let expiry = *handle.0.expiry.lock();
        inbox.push(Arc::clone(&handle.0));

        let mut next = self.next_expires_at.lock();
        if (*next).map_or(true, |n| expiry < n) {
            let _g = self.wake_lock.lock().unwrap();
            *next = Some(expiry);
            drop(next);
            self.wake_cond.notify_all();
        }
    }

    pub fn remove_timer(&self, handle: &TimerEntryHandle) {
        handle.0.cancelled.store(true, Ordering::Release);
        *handle.0.callback.lock() = None;
    }

    pub fn detach_timer(&self, handle: TimerEntryHandle) {
        drop(handle);
    }

    fn run(self: Arc<Self>) {
        // Wait until every expected producer (including the workers that
        // will start posting timers) has registered its inbox, mirroring
        // the group's startup latch.
        self.registered_latch.wait();

        let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
        let mut by_key: std::collections::HashMap<(Instant, u64), TimerEntry> = std::collections::HashMap::new();
        let mut tie_breaker = 0u64;

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            // Reset before draining: a late producer whose hint already
            // beats our latest observation can always push next_expires_at
            // earlier before we commit to sleeping.
            *self.next_expires_at.lock() = Some(Instant::now() + crate::clock::INFINITY);

            for inbox in self.inboxes.lock().unwrap().iter() {
                for entry in inbox.drain() {
                    if entry.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    let expiry = *entry.expiry.lock();
                    tie_breaker += 1;
                    let key = (expiry, tie_breaker);
                    heap.push(Reverse(key));
                    by_key.insert(key, entry);
                }
            }

            let now = Instant::now();
            while let Some(&Reverse((expiry, _))) = heap.peek() {
                if expiry > now {
                    break;
                }
                let Reverse(key) = heap.pop().unwrap();
                let Some(entry) = by_key.remove(&key) else { continue };
                self.fire(&entry, &mut heap, &mut by_key, &mut tie_breaker);
            }

            if let Some(&Reverse((next, _))) = heap.peek() {
                let mut guard = self.next_expires_at.lock();
                if (*guard).map_or(true, |cur| next < cur) {
                    *guard = Some(next);
                }
            }

            let sleep_until = (*self.next_expires_at.lock()).unwrap_or_else(|| Instant::now() + crate::clock::INFINITY);
            let wake_guard = self.wake_lock.lock().unwrap();
            let now = Instant::now();
            if sleep_until > now && !self.stopped.load(Ordering::Acquire) {
                let timeout = sleep_until - now;
                let _ = self.wake_cond.wait_timeout(wake_guard, timeout.min(Duration::from_millis(50)));
            }
        }
    }

    fn fire(
        &self,
        entry: &TimerEntry,
        heap: &mut BinaryHeap<Reverse<(Instant, u64)>>,
        by_key: &mut std::collections::HashMap<(Instant, u64), TimerEntry>,
        tie_breaker: &mut u64,
    ) {
        if entry.cancelled.load(Ordering::Acquire) {
            return;
        }
        let cb = entry.callback.lock().take();
        let Some(mut cb) = cb else { return };

        let expected = entry.interval.map(|iv| *entry.expiry.lock() + iv);

        // The timer worker's thread never runs a fiber of its own, so a
        // captured context is applied via the thread-local slot, not
        // `ExecutionContext::run_in` (which requires fiber context and
        // would panic here every time).
        match entry.execution_context.clone() {
            Some(ec) => ec.run_in_on_thread(|| cb()),
            None => cb(),
        }

        if !entry.cancelled.load(Ordering::Acquire) {
            *entry.callback.lock() = Some(cb);
            if let Some(next_expiry) = expected {
                let now = Instant::now();
                if next_expiry < now {
                    warn!(
                        target: crate::log::TARGET_TIMER,
                        "periodic timer {:?} fell behind; previous firing still catching up",
                        entry.id
                    );
                }
                *entry.expiry.lock() = next_expiry;
                *tie_breaker += 1;
                let key = (next_expiry, *tie_breaker);
                heap.push(Reverse(key));
                by_key.insert(key, Arc::clone(entry));
            }
        }
    }
}

thread_local! {
    /// The calling worker thread's own producer inbox, set once by
    /// [`set_current_inbox`] as part of that worker's startup. Sync
    /// primitives that need a timed wait (`wait_timeout` on a condvar, a
    /// mutex `try_lock_for`, a one-shot timed event) reach for this rather
    /// than threading an `Arc<Inbox>` through every call site.
    static CURRENT_INBOX: RefCell<Option<Arc<Inbox>>> = RefCell::new(None);
}

pub fn set_current_inbox(inbox: Arc<Inbox>) {
    CURRENT_INBOX.with(|c| *c.borrow_mut() = Some(inbox));
}

/// # Panics
/// Panics if called on a thread that hasn't registered an inbox (i.e.
/// anything other than a group's own worker threads).
pub fn current_inbox() -> Arc<Inbox> {
    CURRENT_INBOX.with(|c| {
        c.borrow()
            .clone()
            .expect("no timer inbox registered for this worker thread")
    })
}

/// Caller-owned handle to a timer. Dropping it detaches (per `detach_timer`
/// semantics) rather than cancelling — call [`TimerWorker::remove_timer`]
/// explicitly to cancel.
pub struct TimerEntryHandle(TimerEntry);

impl TimerEntryHandle {
    pub fn id(&self) -> TimerId {
        self.0.id
    }
}

/// Arms a one-shot timer on the current fiber's scheduling group. `cb` runs
/// on the group's timer worker thread, not on any fiber's stack — if it
/// needs to touch fiber state (e.g. to ready a sleeping fiber) it must do so
/// through thread-safe handles such as [`crate::fiber::FiberPtr`].
///
/// # Panics
/// Panics outside of fiber context.
pub fn set_timer(expiry: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
    let group = group::current_group();
    let (id, handle) = group.timer_worker.create_timer(expiry, cb);
    group.timer_worker.enable_timer(&current_inbox(), &handle);
    group.timer_worker.retain_handle(id, handle);
    id
}

/// Arms a periodic timer, firing every `interval` starting at `first`.
///
/// # Panics
/// Panics outside of fiber context.
pub fn set_periodic_timer(first: Instant, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
    let group = group::current_group();
    let (id, handle) = group.timer_worker.create_periodic_timer(first, interval, cb);
    group.timer_worker.enable_timer(&current_inbox(), &handle);
    group.timer_worker.retain_handle(id, handle);
    id
}

/// Cancels a timer. Idempotent: a second call, or a call after the timer
/// already fired (and for one-shot timers, was forgotten), is a no-op. A
/// firing already in progress when this is called may still complete.
///
/// # Panics
/// Panics outside of fiber context.
pub fn stop_timer(id: TimerId) {
    let group = group::current_group();
    if let Some(handle) = group.timer_worker.take_handle(id) {
        group.timer_worker.remove_timer(&handle);
    }
}

/// Drops the caller's interest in `id` without cancelling it — the timer
/// keeps firing (or fires once more, for a one-shot) on its own schedule.
///
/// # Panics
/// Panics outside of fiber context.
pub fn detach_timer(id: TimerId) {
    let group = group::current_group();
    if let Some(handle) = group.timer_worker.take_handle(id) {
        group.timer_worker.detach_timer(handle);
    }
}

/// Arms a one-shot timer that the caller never intends to stop or detach
/// explicitly — equivalent to `detach_timer(set_timer(expiry, cb))` but
/// without ever publishing an id the caller has to remember to drop.
///
/// # Panics
/// Panics outside of fiber context.
pub fn set_detached_timer(expiry: Instant, cb: impl FnMut() + Send + 'static) {
    let group = group::current_group();
    let (_id, handle) = group.timer_worker.create_timer(expiry, cb);
    group.timer_worker.enable_timer(&current_inbox(), &handle);
    group.timer_worker.detach_timer(handle);
}

#[cfg(test)]
mod facade_tests {
    use super::*;

    #[test]
    fn timer_ids_are_distinct() {
        let tw = TimerWorker::new(1);
        let (id1, h1) = tw.create_timer(Instant::now(), || {});
        let (id2, h2) = tw.create_timer(Instant::now(), || {});
        assert_ne!(id1, id2);
        drop(h1);
        drop(h2);
    }
}
