//! Raw stackful context switching.
//!
//! Two primitives, assumed by `fiber.rs` from this "platform layer":
//! - [`make_context`] prepares a stack so that jumping into it enters an
//!   entry function.
//! - [`jump_context`] saves the current machine context and loads another,
//!   passing a `usize` across the switch in both directions.
//!
//! No crate in this workspace's dependency graph provides stackful context
//! switching (the handful of such crates on crates.io are not part of this
//! stack), so it is hand-written here, one small `global_asm!` block per
//! architecture, in the spirit of how `boost::context`/`ucontext`-based
//! runtimes implement the same trick.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as arch;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("corogroup's hand-written context switch only supports x86_64 and aarch64 so far");

/// Opaque saved-machine-context pointer. Lives at the bottom of whichever
/// stack it represents the state of; never dereferenced by Rust code, only
/// ever handed back to [`jump_context`].
pub type RawContext = *mut u8;

/// The function a freshly made context starts executing at, once first
/// jumped into. Receives the `arg` passed to the first [`jump_context`]
/// call that targets it.
pub type EntryFn = extern "sysv64" fn(usize) -> !;

/// Prepares `stack` (a `stack_size`-byte region, `stack_top` pointing one
/// past its highest address, i.e. where a machine stack pointer starts)
/// so that jumping into the returned context enters `entry(arg)`, where
/// `arg` is whatever is passed to the [`jump_context`] call that performs
/// that first jump.
///
/// # Safety
/// `stack_top` must point to the high end of at least `stack_size` bytes
/// of writable memory, and that memory must remain valid and exclusively
/// owned by the resulting context until the fiber using it has exited and
/// its stack is freed.
pub unsafe fn make_context(stack_top: *mut u8, stack_size: usize, entry: EntryFn) -> RawContext {
    arch::make_context(stack_top, stack_size, entry)
}

/// Saves the currently-executing context into `*save_here`, then loads and
/// resumes `jump_to`, passing `arg` to it. When some later `jump_context`
/// call switches back into the context saved here, execution resumes
/// immediately after this call as if it were a normal function return,
/// yielding whatever `arg` that later call passed.
///
/// # Safety
/// `jump_to` must be a context produced by [`make_context`] that has never
/// been jumped into while also currently suspended elsewhere (a context
/// may only ever be "resumed into" by one caller at a time), or a context
/// previously saved by a `jump_context` call that has not since been
/// resumed.
#[inline(always)]
pub unsafe fn jump_context(save_here: *mut RawContext, jump_to: RawContext, arg: usize) -> usize {
    arch::jump_context(save_here, jump_to, arg)
}
