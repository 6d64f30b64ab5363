//! x86_64 System V context switch.
//!
//! Callee-saved registers per the SysV AMD64 ABI: `rbx`, `rbp`, `r12`-`r15`
//! (plus `rsp` itself, which is the thing being switched). `jump_context`
//! pushes those six onto the outgoing stack, swaps `rsp`, then pops them
//! back off the incoming stack before returning (via `ret`) into whatever
//! instruction follows the call that suspended it.
//!
//! A freshly [`make_context`]-ed stack fakes that same layout so the first
//! `ret` lands in a two-instruction trampoline that feeds the resume
//! argument (arrives in `rax`, the normal return-value register) into the
//! real entry function as its first argument (`rdi`, per SysV).

use std::arch::global_asm;
use std::mem::size_of;

use super::{EntryFn, RawContext};

extern "sysv64" {
    fn corogroup_jump_context(save_here: *mut RawContext, jump_to: RawContext, arg: usize) -> usize;
}

global_asm!(
    ".global corogroup_jump_context",
    "corogroup_jump_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "mov rax, rdx",
    "ret",
    ".global corogroup_trampoline",
    "corogroup_trampoline:",
    // rax holds the first resume argument, r15 holds the entry fn pointer;
    // both survived the pop sequence above untouched.
    "mov rdi, rax",
    "jmp r15",
);

#[inline]
pub unsafe fn jump_context(save_here: *mut RawContext, jump_to: RawContext, arg: usize) -> usize {
    corogroup_jump_context(save_here, jump_to, arg)
}

pub unsafe fn make_context(stack_top: *mut u8, stack_size: usize, entry: EntryFn) -> RawContext {
    extern "sysv64" {
        fn corogroup_trampoline();
    }

    // 16-byte-align the region we write into, per the SysV requirement that
    // rsp is 16-byte aligned immediately before a `call` (equivalently, right
    // after the `ret` address is popped at function entry).
    let aligned_top = (stack_top as usize & !0xf) as *mut u8;
    debug_assert!(stack_size > 256, "fiber stack too small for a context frame");

    // Layout, from high address to low, matching the pop order in
    // corogroup_jump_context (r15, r14, r13, r12, rbx, rbp, return_address):
    let word = size_of::<usize>();
    let mut sp = aligned_top as usize;

    // Return address: the trampoline. A `ret` in corogroup_jump_context
    // will pop this and jump here.
    sp -= word;
    *(sp as *mut usize) = corogroup_trampoline as usize;

    // rbp: zero, terminates the frame-pointer chain for unwinders/debuggers.
    sp -= word;
    *(sp as *mut usize) = 0;

    // rbx, r12, r13: unused scratch.
    for _ in 0..3 {
        sp -= word;
        *(sp as *mut usize) = 0;
    }

    // r14: unused scratch (kept symmetric with jump_context's six pops).
    sp -= word;
    *(sp as *mut usize) = 0;

    // r15: the entry function pointer, read straight out of the register by
    // corogroup_trampoline after the pop sequence restores it.
    sp -= word;
    *(sp as *mut usize) = entry as usize;

    let _ = stack_size;
    sp as RawContext
}
