//! Fiber stack allocation.
//!
//! Two size classes: *user* stacks (configurable, default 128 KiB, optional
//! guard page) and *system* stacks (small, fixed, never guarded — used for
//! the small number of internal housekeeping fibers the runtime itself
//! spawns). Stacks are `mmap`-backed directly rather than drawn from the
//! process heap, so that a guard page can be installed with `mprotect` and
//! so that huge numbers of fibers don't fragment the allocator the rest of
//! the program uses.

use std::io;
use std::ptr::NonNull;

/// Default size of a user fiber's stack.
pub const DEFAULT_USER_STACK_SIZE: usize = 128 * 1024;

/// Fixed size of a system fiber's stack. System fibers do internal
/// housekeeping only and never run deeply-recursive or large-frame user code.
pub const SYSTEM_STACK_SIZE: usize = 32 * 1024;

fn page_size() -> usize {
    // `sysconf` is the standard POSIX way to learn this at runtime; it is
    // not necessarily 4 KiB (notably on some aarch64 configurations).
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        4096
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

/// An owned, `mmap`-backed stack, optionally guarded.
pub struct Stack {
    /// Base of the mapping (lowest address), including the guard page if any.
    base: NonNull<u8>,
    /// Total bytes mapped, including the guard page.
    mapped_len: usize,
    /// Usable byte length (excludes the guard page).
    usable_len: usize,
    guarded: bool,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocates a stack of `usable_len` bytes (rounded up to a page),
    /// optionally preceded by one inaccessible guard page.
    pub fn allocate(usable_len: usize, guard_page: bool) -> io::Result<Self> {
        let page = page_size();
        let usable_len = round_up(usable_len.max(page), page);
        let mapped_len = if guard_page { usable_len + page } else { usable_len };

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if guard_page {
            let rc = unsafe { libc::mprotect(addr, page, libc::PROT_NONE) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::munmap(addr, mapped_len);
                }
                return Err(err);
            }
        }

        Ok(Self {
            base: NonNull::new(addr as *mut u8).expect("mmap returned a null non-failure address"),
            mapped_len,
            usable_len,
            guarded: guard_page,
        })
    }

    /// Pointer one past the stack's highest usable address — what a machine
    /// stack pointer should be initialized to.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.mapped_len) }
    }

    pub fn usable_len(&self) -> usize {
        self.usable_len
    }

    pub fn has_guard_page(&self) -> bool {
        self.guarded
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_without_guard() {
        let s = Stack::allocate(64 * 1024, false).unwrap();
        assert!(!s.has_guard_page());
        assert!(s.usable_len() >= 64 * 1024);
        let top = s.top();
        unsafe {
            // Touch the last byte of the usable region to prove it's mapped.
            *(top.sub(1)) = 0x42;
            assert_eq!(*(top.sub(1)), 0x42);
        }
    }

    #[test]
    fn allocate_with_guard() {
        let s = Stack::allocate(DEFAULT_USER_STACK_SIZE, true).unwrap();
        assert!(s.has_guard_page());
        assert!(s.usable_len() >= DEFAULT_USER_STACK_SIZE);
    }
}
