//! The fiber control block and the raw context-switch trampoline.
//!
//! A [`FiberEntity`] is heap-allocated (unlike the original design's
//! embedded-in-the-stack control block — see `DESIGN.md` for why this
//! crate trades that micro-optimization for a safe Rust ownership story)
//! and owns a dedicated [`Stack`]. Every worker OS thread also owns exactly
//! one *master* fiber, a `FiberEntity` with no backing [`Stack`] of its own
//! (it runs on the worker's native thread stack); all scheduling decisions
//! happen on the master fiber's "turn".

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::clock;
use crate::context::{self, RawContext};
use crate::error::{Error, Result};
use crate::execution_context::ExecutionContext;
use crate::fls::Fls;
use crate::group;
use crate::spinlock::SpinLock;
use crate::stack::Stack;
use crate::sync::latch::ExitBarrier;

pub use crate::future::block_on;

/// A fixed sentinel written into a fiber's control block the first time it
/// runs. Exists purely so a debugger (or a defensive assertion) can tell
/// "allocated but never started" from "started, now elsewhere" by reading
/// this field out of core.
const EVER_STARTED_MAGIC: u64 = 0xFB_5CA1AB1E_F1BE5u64 as u64;

static NEXT_DEBUG_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Ready,
    Running,
    Waiting,
    Dead,
}

/// A raw, `Copy`, possibly-null pointer to a [`FiberEntity`]. Deliberately
/// not a smart pointer: fibers are handed around the scheduler by identity
/// (run queues, wait lists, wake masks) long before Rust's borrow rules
/// could express their lifetime, exactly as in the intrusive data
/// structures described by the original design.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberPtr(*mut FiberEntity);

unsafe impl Send for FiberPtr {}
unsafe impl Sync for FiberPtr {}

impl FiberPtr {
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    fn from_raw(ptr: *mut FiberEntity) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> *mut FiberEntity {
        self.0
    }

    /// # Safety
    /// The pointee must be alive and not concurrently mutated by another
    /// thread without synchronization external to this call.
    pub unsafe fn entity(&self) -> &FiberEntity {
        &*self.0
    }

    /// Builds a non-dereferenceable `FiberPtr` out of a raw integer, for
    /// tests exercising pointer-identity data structures (run queue,
    /// waitable) without needing to allocate a real fiber.
    #[doc(hidden)]
    pub fn from_tag(tag: u64) -> Self {
        Self(tag as usize as *mut FiberEntity)
    }

    #[doc(hidden)]
    pub fn tag(&self) -> u64 {
        self.0 as usize as u64
    }
}

impl Default for FiberPtr {
    fn default() -> Self {
        Self::null()
    }
}

/// A single-slot "asynchronous procedure call": a callback that will run
/// exactly once, on top of the target fiber's own context, the moment it
/// next resumes — before it observes any of its regular user code (or, for
/// the master fiber, before it re-enters the acquire loop).
type ResumeProc = Box<dyn FnOnce() + Send>;

pub(crate) struct FiberEntity {
    pub debug_id: u64,
    ever_started_magic: Cell<u64>,
    pub scheduler_lock: crate::spinlock::SpinLock<()>,
    state: Cell<FiberState>,
    pub own_scheduling_group: Cell<*const ()>,
    pub scheduling_group_local: bool,
    pub system_fiber: bool,
    context: Cell<RawContext>,
    pub last_ready_tsc: Cell<Instant>,
    resume_proc: RefCell<Option<ResumeProc>>,
    start_proc: RefCell<Option<Box<dyn FnOnce() + Send>>>,
    pub exit_barrier: RefCell<Option<ExitBarrier>>,
    pub execution_context: RefCell<Option<ExecutionContext>>,
    fls: RefCell<Fls>,
    /// Kept alive for the fiber's lifetime; dropped (and the memory freed)
    /// only from the master fiber's continuation, per the stack-freeing
    /// discipline in §5 of the design this crate implements.
    stack: Option<Stack>,
    pub name: Option<CString>,
    is_master: bool,
}

impl FiberEntity {
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    pub fn set_state(&self, s: FiberState) {
        self.state.set(s);
    }

    pub fn has_ever_started(&self) -> bool {
        self.ever_started_magic.get() == EVER_STARTED_MAGIC
    }

    pub fn set_resume_proc(&self, cb: ResumeProc) {
        *self.resume_proc.borrow_mut() = Some(cb);
    }

    fn drain_resume_proc(&self) {
        let cb = self.resume_proc.borrow_mut().take();
        if let Some(cb) = cb {
            cb();
        }
    }

    pub fn with_fls<R>(&self, f: impl FnOnce(&mut Fls) -> R) -> R {
        f(&mut self.fls.borrow_mut())
    }
}

thread_local! {
    static CURRENT: Cell<FiberPtr> = Cell::new(FiberPtr::null());
    static MASTER: RefCell<Option<Box<FiberEntity>>> = RefCell::new(None);
}

/// Installs the calling OS thread's master fiber. Must be called exactly
/// once, as the first act of every worker thread (including the timer
/// worker's "logical" participation is out of scope — only fiber workers
/// have a master fiber).
pub(crate) fn init_master_on_this_thread() {
    MASTER.with(|m| {
        let mut m = m.borrow_mut();
        assert!(m.is_none(), "master fiber already initialized on this thread");
        let entity = Box::new(FiberEntity {
            debug_id: 0,
            ever_started_magic: Cell::new(EVER_STARTED_MAGIC),
            scheduler_lock: crate::spinlock::SpinLock::new(()),
            state: Cell::new(FiberState::Running),
            own_scheduling_group: Cell::new(std::ptr::null()),
            scheduling_group_local: false,
            system_fiber: true,
            context: Cell::new(std::ptr::null_mut()),
            last_ready_tsc: Cell::new(clock::now()),
            resume_proc: RefCell::new(None),
            start_proc: RefCell::new(None),
            exit_barrier: RefCell::new(None),
            execution_context: RefCell::new(None),
            fls: RefCell::new(Fls::new()),
            stack: None,
            name: None,
            is_master: true,
        });
        *m = Some(entity);
    });
    MASTER.with(|m| {
        let ptr = m.borrow_mut().as_deref_mut().unwrap() as *mut FiberEntity;
        CURRENT.with(|c| c.set(FiberPtr::from_raw(ptr)));
    });
}

pub(crate) fn master_ptr() -> FiberPtr {
    MASTER.with(|m| {
        let mut m = m.borrow_mut();
        let ptr = m.as_deref_mut().expect("master fiber not initialized on this thread") as *mut FiberEntity;
        FiberPtr::from_raw(ptr)
    })
}

pub fn current() -> FiberPtr {
    CURRENT.with(|c| c.get())
}

pub fn is_in_fiber_context() -> bool {
    !current().is_null()
}

pub fn is_current_master() -> bool {
    let cur = current();
    !cur.is_null() && cur == master_ptr()
}

fn set_current(f: FiberPtr) {
    CURRENT.with(|c| c.set(f));
}

pub(crate) fn with_current_fls<R>(f: impl FnOnce(&mut Fls) -> R) -> R {
    let cur = current();
    assert!(!cur.is_null(), "fiber-local storage accessed outside of fiber context");
    unsafe { cur.entity() }.with_fls(f)
}

/// Whether a freshly created fiber is enqueued for some worker to pick up
/// later, or runs immediately on the calling worker in place of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Push onto the target group's run queue; the calling fiber keeps
    /// running.
    Post,
    /// Switch the calling worker directly onto the new fiber via
    /// [`group::SchedulingGroup::switch_to`]; the caller is re-queued to
    /// resume once the new fiber next yields or blocks.
    Dispatch,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        LaunchPolicy::Post
    }
}

/// Which scheduling group a new fiber should be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingGroupSelector {
    /// A specific group, by index.
    Index(usize),
    /// The group whose NUMA node matches the calling worker's, if any.
    Nearest,
    /// No preference; the runtime picks (round-robin across groups).
    Unspecified,
}

impl Default for SchedulingGroupSelector {
    fn default() -> Self {
        SchedulingGroupSelector::Unspecified
    }
}

/// Attributes controlling how a fiber is constructed. Mirrors the external
/// interface's `{ launch_policy, scheduling_group, execution_context,
/// system_fiber, scheduling_group_local }` bundle.
///
/// `stack_size`/`guard_page` of `None` mean "use the running runtime's
/// `fiber_stack_size`/`fiber_stack_enable_guard_page` config" — resolved by
/// [`crate::runtime::start_fiber`]/[`crate::runtime::batch_start_fibers`]
/// before the fiber is actually built, so a caller only needs to set these
/// explicitly to override the runtime-wide default for one fiber.
#[derive(Clone)]
pub struct FiberAttr {
    pub name: Option<String>,
    pub system_fiber: bool,
    pub scheduling_group_local: bool,
    pub stack_size: Option<usize>,
    pub guard_page: Option<bool>,
    pub execution_context: Option<ExecutionContext>,
    pub launch_policy: LaunchPolicy,
    pub scheduling_group: SchedulingGroupSelector,
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self {
            name: None,
            system_fiber: false,
            scheduling_group_local: false,
            stack_size: None,
            guard_page: None,
            execution_context: None,
            launch_policy: LaunchPolicy::default(),
            scheduling_group: SchedulingGroupSelector::default(),
        }
    }
}

/// Entry point invoked for every fiber, regardless of which user closure it
/// was created with. The address of this function is what gets baked into
/// every fresh fiber's saved context by [`context::make_context`]; `arg` is
/// the [`FiberPtr`] (as a `usize`) of the fiber being entered.
extern "sysv64" fn fiber_trampoline(arg: usize) -> ! {
    let me = FiberPtr::from_raw(arg as *mut FiberEntity);
    let entity = unsafe { me.entity() };

    // (d) drain resume_proc: on first entry nothing else will do this for us.
    entity.drain_resume_proc();

    // (b), (c)
    entity.set_state(FiberState::Running);
    entity.ever_started_magic.set(EVER_STARTED_MAGIC);

    if let Some(ec) = entity.execution_context.borrow().clone() {
        ec.run_in(|| {
            // (e) invoke and clear start_proc
            let start = entity.start_proc.borrow_mut().take();
            if let Some(start) = start {
                start();
            }
        });
    } else {
        let start = entity.start_proc.borrow_mut().take();
        if let Some(start) = start {
            start();
        }
    }

    exit_current_fiber(me)
}

/// Implements the two exit paths from §4.1: with or without a joiner's
/// exit barrier. Never returns — it switches away to the master fiber and
/// the stack of this fiber is freed from the master's side.
fn exit_current_fiber(me: FiberPtr) -> ! {
    let entity = unsafe { me.entity() };
    let master = master_ptr();

    let barrier = entity.exit_barrier.borrow_mut().take();
    match barrier {
        None => {
            entity.set_state(FiberState::Dead);
            master_entity_resume_proc(master, move || unsafe {
                free_fiber(me);
            });
        }
        Some(barrier) => {
            // Acquire the barrier's internal lock *before* writing Dead —
            // the acquisition itself may reschedule us, which is fine: we
            // haven't touched the stack-freeing path yet.
            let grabbed = barrier.grab_lock();
            entity.set_state(FiberState::Dead);
            master_entity_resume_proc(master, move || {
                let mut barrier = barrier;
                unsafe {
                    free_fiber(me);
                }
                barrier.unsafe_count_down(grabbed);
            });
        }
    }

    unreachable!("switching to master never returns into the dead fiber")
}

fn master_entity_resume_proc(master: FiberPtr, cb: impl FnOnce() + Send + 'static) -> ! {
    unsafe { master.entity() }.set_resume_proc(Box::new(cb));
    switch_raw(master, 0);
    unreachable!("a dead fiber is never resumed again")
}

/// # Safety
/// `f` must be in the `Dead` state and must never be referenced again
/// after this call.
unsafe fn free_fiber(f: FiberPtr) {
    drop(Box::from_raw(f.as_ptr()));
}

/// Low-level switch: suspends the currently running fiber and resumes
/// `to`. Returns once some later switch resumes the caller again.
///
/// This is the one place that calls [`context::jump_context`]; every
/// higher-level suspension point (`halt`, `yield_now`, `switch_to`, and the
/// worker's `resume()` of a freshly-acquired fiber) goes through it.
pub(crate) fn switch_raw(to: FiberPtr, arg_override: usize) -> usize {
    let from = current();
    assert!(!from.is_null(), "switch_raw called outside of fiber/master context");
    let from_entity = unsafe { from.entity() };
    let to_entity = unsafe { to.entity() };

    set_current(to);
    let arg = if arg_override != 0 {
        arg_override
    } else {
        to.as_ptr() as usize
    };

    let save_here = from_entity.context.as_ptr();
    let jump_to = to_entity.context.get();
    let ret = unsafe { context::jump_context(save_here, jump_to, arg) };

    // We have been resumed: re-establish ourselves as current and run
    // whatever resume_proc was staged for us.
    set_current(from);
    from_entity.drain_resume_proc();
    ret
}

/// Constructs a fresh, not-yet-started fiber in the `Ready` state.
pub(crate) fn spawn_raw(attr: &FiberAttr, start: Box<dyn FnOnce() + Send>) -> Result<FiberPtr> {
    let name = match &attr.name {
        Some(n) => Some(CString::new(n.as_str()).map_err(Error::from)?),
        None => None,
    };

    let stack_size = if attr.system_fiber {
        crate::stack::SYSTEM_STACK_SIZE
    } else {
        attr.stack_size.unwrap_or(crate::stack::DEFAULT_USER_STACK_SIZE)
    };
    let guard_page = attr.guard_page.unwrap_or(true) && !attr.system_fiber;
    let stack = Stack::allocate(stack_size, guard_page).map_err(|e| Error::other(e))?;

    let entity = Box::new(FiberEntity {
        debug_id: NEXT_DEBUG_ID.fetch_add(1, Ordering::Relaxed),
        ever_started_magic: Cell::new(0),
        scheduler_lock: crate::spinlock::SpinLock::new(()),
        state: Cell::new(FiberState::Ready),
        own_scheduling_group: Cell::new(std::ptr::null()),
        scheduling_group_local: attr.scheduling_group_local,
        system_fiber: attr.system_fiber,
        context: Cell::new(std::ptr::null_mut()),
        last_ready_tsc: Cell::new(clock::now()),
        resume_proc: RefCell::new(None),
        start_proc: RefCell::new(Some(start)),
        exit_barrier: RefCell::new(None),
        execution_context: RefCell::new(attr.execution_context.clone()),
        fls: RefCell::new(Fls::new()),
        stack: Some(stack),
        name,
        is_master: false,
    });

    let ptr = Box::into_raw(entity);
    let top = unsafe { (*ptr).stack.as_ref().unwrap().top() };
    let usable = unsafe { (*ptr).stack.as_ref().unwrap().usable_len() };
    let ctx = unsafe { context::make_context(top, usable, fiber_trampoline) };
    unsafe {
        (*ptr).context.set(ctx);
    }

    Ok(FiberPtr::from_raw(ptr))
}

/// Resumes `f` (must be `Ready`) from the calling (typically master)
/// context. Transitions it to `Running` for the duration.
pub(crate) fn resume(f: FiberPtr) {
    debug_assert_eq!(unsafe { f.entity() }.state(), FiberState::Ready);
    unsafe { f.entity() }.set_state(FiberState::Running);
    switch_raw(f, 0);
}

/// Sets `cb` to run exactly once, the moment `f` next resumes, then
/// resumes it.
pub(crate) fn resume_on(f: FiberPtr, cb: impl FnOnce() + Send + 'static) {
    unsafe { f.entity() }.set_resume_proc(Box::new(cb));
    resume(f);
}

/// Resumes `f` from a worker's master fiber. Unlike [`resume`], does not
/// assert or set the `Ready` state itself: callers reach this only via
/// [`group::SchedulingGroup::acquire_fiber`], which already performs the
/// `Ready` -> `Running` transition under `f`'s `scheduler_lock` as part of
/// popping it off the run queue.
pub(crate) fn run_fiber(f: FiberPtr) {
    debug_assert_eq!(unsafe { f.entity() }.state(), FiberState::Running);
    switch_raw(f, 0);
}

/// Builds a fresh, joinable fiber: `start` runs on the new fiber, its return
/// value is captured for the returned [`JoinHandle`], and an [`ExitBarrier`]
/// is wired into the fiber's control block so [`exit_current_fiber`] counts
/// it down on the way out. The fiber is left in the `Ready` state, not yet
/// assigned to any group — the caller (`start_fiber`/`batch_start_fibers`)
/// is responsible for that.
pub(crate) fn build_joinable<T: Send + 'static>(
    attr: &FiberAttr,
    start: impl FnOnce() -> T + Send + 'static,
) -> Result<(FiberPtr, JoinHandle<T>)> {
    let result = Arc::new(SpinLock::new(None));
    let result_for_fiber = Arc::clone(&result);
    let wrapped = Box::new(move || {
        let value = start();
        *result_for_fiber.lock() = Some(value);
    });

    let f = spawn_raw(attr, wrapped)?;
    let barrier = ExitBarrier::new();
    *unsafe { f.entity() }.exit_barrier.borrow_mut() = Some(barrier.clone());

    Ok((
        f,
        JoinHandle {
            fiber: Some(f),
            barrier,
            result,
        },
    ))
}

/// An owned permission to join on a fiber spawned joinable (the default):
/// block until it has fully exited and recover the value its entry closure
/// returned.
///
/// Must be consumed by [`Self::join`] or [`Self::detach`] before being
/// dropped.
pub struct JoinHandle<T> {
    fiber: Option<FiberPtr>,
    barrier: ExitBarrier,
    result: Arc<SpinLock<Option<T>>>,
}

unsafe impl<T: Send> Send for JoinHandle<T> {}

impl<T> JoinHandle<T> {
    /// Blocks the calling fiber until the joined fiber's entry closure has
    /// fully returned, then yields its result.
    ///
    /// # Panics
    /// Panics outside of fiber context.
    pub fn join(mut self) -> T {
        self.fiber.take();
        self.barrier.join();
        self.result.lock().take().expect("joined fiber exited without storing a result")
    }

    /// Gives up the right (and the obligation) to join: the fiber keeps
    /// running to completion on its own, its result is discarded.
    pub fn detach(mut self) {
        self.fiber.take();
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.fiber.is_some() && !std::thread::panicking() {
            panic!("JoinHandle dropped without join() or detach()");
        }
    }
}

/// Cooperatively yields the calling fiber back to its scheduling group.
///
/// # Panics
/// Panics outside of fiber context.
pub fn fiber_yield() {
    group::current_group().yield_now(current());
}

/// Suspends the calling fiber until `deadline`.
///
/// # Panics
/// Panics outside of fiber context.
pub fn fiber_sleep_until(deadline: Instant) {
    crate::sync::event::OneshotTimedEvent::new_with_deadline(deadline).wait();
}

/// Suspends the calling fiber for `duration`.
///
/// # Panics
/// Panics outside of fiber context.
pub fn fiber_sleep_for(duration: std::time::Duration) {
    crate::sync::event::OneshotTimedEvent::new_after(duration).wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_ptr_null_roundtrip() {
        let p = FiberPtr::null();
        assert!(p.is_null());
    }

    #[test]
    fn fiber_ptr_tag_roundtrip() {
        let p = FiberPtr::from_tag(42);
        assert_eq!(p.tag(), 42);
    }
}
