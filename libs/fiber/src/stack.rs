// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guard-protected, pre-faulted stacks.
//!
//! Layout, low address to high: one `PROT_NONE` guard page, then the
//! usable pages. Overflowing the stack faults deterministically on the
//! guard page instead of corrupting a neighboring allocation. The usable
//! pages are touched once at construction so a running task never takes a
//! demand-paging fault mid-execution.

use std::io::Error;
use std::ptr;

/// Address of a stack boundary. Matches the switching layer's definition
/// (a stack can never sit at address zero).
pub type StackPointer = core::num::NonZeroUsize;

/// Minimum usable size of a stack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 4096;

/// Upper bound on a single stack.
pub const MAX_STACK_SIZE: usize = 1024 * 1024 * 1024;

/// Stack size used when the caller has no opinion.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// An owned stack mapping with a low guard page.
///
/// The stack itself is just memory: contexts borrow it through
/// [`GuardedStack::handle`], so the mapping can be reused for successive
/// contexts without re-faulting the pages.
#[derive(Debug)]
pub struct GuardedStack {
    top: StackPointer,
    mmap_len: usize,
}

/// A borrowed view of a [`GuardedStack`], consumed by the switching layer.
#[derive(Clone, Copy, Debug)]
pub struct StackHandle {
    base: StackPointer,
    limit: StackPointer,
}

// === impl GuardedStack ===

impl GuardedStack {
    /// Maps a new stack with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the address space for the stack cannot be
    /// reserved or protected.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let page_size = page_size();

        // Round the usable size up to page granularity, then prepend the
        // guard page.
        let size = size.max(MIN_STACK_SIZE).max(2 * page_size);
        let size = size
            .checked_add(page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);
        let mmap_len = size + page_size;

        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping at a kernel-chosen address
        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Construct the result first so the mapping is released if the
            // mprotect below fails.
            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
            };

            // Everything above the guard page becomes usable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            // Touch every usable page now, not on first push.
            let limit = mmap.cast::<u8>().add(page_size);
            for offset in (0..size).step_by(page_size) {
                ptr::write_volatile(limit.add(offset), 0);
            }

            Ok(out)
        }
    }

    /// Highest usable address of the stack.
    pub fn top(&self) -> StackPointer {
        self.top
    }

    /// Lowest usable address of the stack (just above the guard page).
    pub fn limit(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len + page_size()).unwrap()
    }

    /// Usable bytes between [`Self::limit`] and [`Self::top`].
    pub fn usable_size(&self) -> usize {
        self.top.get() - self.limit().get()
    }

    /// Returns a borrowed handle for the switching layer.
    ///
    /// The handle carries no lifetime; whoever hands it to a context must
    /// keep this stack alive for at least as long (see
    /// [`StackContext::new`](crate::StackContext::new)).
    pub fn handle(&self) -> StackHandle {
        StackHandle {
            base: self.top,
            limit: self.limit(),
        }
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        let mmap = self.top.get() - self.mmap_len;
        // Safety: we own the mapping and nothing is executing on it
        let ret = unsafe { libc::munmap(mmap as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

// === impl StackHandle ===

// Safety: `base`/`limit` delimit a mapping whose usable pages are
// read-write and aligned to at least 16 (page granularity), per the
// `GuardedStack` construction; liveness is the documented obligation of
// whoever created the owning context.
unsafe impl corosensei::stack::Stack for StackHandle {
    fn base(&self) -> StackPointer {
        self.base
    }

    fn limit(&self) -> StackPointer {
        self.limit
    }
}

/// The system page size.
pub fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = usize::try_from(page_size).expect("negative page size");
    assert!(page_size.is_power_of_two());
    page_size
}

/// Smallest stack the platform will run a signal handler on; used as the
/// floor when clamping configured stack sizes.
pub fn min_platform_stack_size() -> usize {
    libc::MINSIGSTKSZ.max(MIN_STACK_SIZE)
}
