// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task/stack allocator: per-thread free lists of recycled task
//! records, each carrying an already-mapped, already-faulted stack.
//!
//! Allocation on a warm thread is a pointer pop plus a context reset; no
//! mmap, no heap. Records released on *any* thread go onto *that* thread's
//! list (up to a bound), so the lists drift toward wherever tasks actually
//! complete — which is where the next allocation usually happens too.

use crate::task::{EntryFn, Task};
use core::cell::Cell;
use core::ptr::{self, NonNull};
use tid_cache::TidCache;

#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct TaskAllocator {
    stack_size: usize,
    initial_capacity: usize,
    max_local: usize,
    free: TidCache<FreeList>,
    #[cfg(debug_assertions)]
    allocations: AtomicU64,
    #[cfg(debug_assertions)]
    deallocations: AtomicU64,
}

/// One thread's stash of reusable records, linked through
/// `Task::next_free`.
struct FreeList {
    head: Cell<*mut Task>,
    len: Cell<usize>,
}

// Safety: the list owns its records outright; per the thread-cache
// protocol only the slot's owning thread operates on it, and the allocator
// teardown that finally drops it holds `&mut` over everything.
unsafe impl Send for FreeList {}

// === impl TaskAllocator ===

impl TaskAllocator {
    /// `stack_size` bytes per task stack; `initial_capacity` records
    /// pre-warmed per thread; `max_local` cap on each thread's list, past
    /// which released records are destroyed instead of pooled.
    pub(crate) fn new(stack_size: usize, initial_capacity: usize, max_local: usize) -> Self {
        Self {
            stack_size,
            initial_capacity,
            max_local,
            // workers plus some slack for foreign threads releasing
            // promises
            free: TidCache::with_capacity(4 * crate::os::hardware_threads()),
            #[cfg(debug_assertions)]
            allocations: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            deallocations: AtomicU64::new(0),
        }
    }

    /// Pre-warms the calling thread's free list with `initial_capacity`
    /// records, stacks mapped and faulted.
    pub(crate) fn initialize_thread(&self) {
        let list = self.thread_list();

        while list.len.get() < self.initial_capacity {
            let task = Task::allocate(self, self.stack_size);
            list.push(task.as_ptr());
        }

        tracing::trace!(
            tid = tid_cache::current_thread_id(),
            count = list.len.get(),
            "task allocator thread warm"
        );
    }

    /// Destroys every record on the calling thread's free list.
    pub(crate) fn deinitialize_thread(&self) {
        let list = self.thread_list();

        while let Some(task) = list.pop() {
            // Safety: pooled records are owned by the list
            drop(unsafe { Box::from_raw(task) });
        }
    }

    /// Hands out a record prepared to run `entry`: popped from the local
    /// free list when possible, freshly constructed otherwise.
    pub(crate) fn allocate(&self, entry: EntryFn) -> NonNull<Task> {
        #[cfg(debug_assertions)]
        self.allocations.fetch_add(1, Ordering::Relaxed);

        let task = match self.thread_list().pop() {
            // Safety: pooled records are valid and exclusively ours
            Some(task) => unsafe { util::non_null(task) },
            None => Task::allocate(self, self.stack_size),
        };

        // Safety: we are the sole owner until the caller enqueues it
        unsafe { task.as_ref().reset(entry) };
        task
    }

    /// Takes back a record whose reference count hit zero.
    pub(crate) fn deallocate(&self, task: *mut Task) {
        #[cfg(debug_assertions)]
        self.deallocations.fetch_add(1, Ordering::Relaxed);

        // Safety: refs hit zero, so we are the sole owner
        let task_ref = unsafe { &*task };
        task_ref.drop_job();
        // unwind a mid-execution task now, while promises its frames hold
        // can still reach the runtime
        task_ref.clear_context();

        let list = self.thread_list();
        if list.len.get() < self.max_local {
            list.push(task);
        } else {
            // Safety: sole owner, see above
            drop(unsafe { Box::from_raw(task) });
        }
    }

    fn thread_list(&self) -> &FreeList {
        let tid = tid_cache::current_thread_id();

        if let Some(list) = self.free.get(tid) {
            return list;
        }

        self.free.set(
            tid,
            FreeList {
                head: Cell::new(ptr::null_mut()),
                len: Cell::new(0),
            },
        );
        self.free.get(tid).expect("slot was just claimed")
    }
}

#[cfg(debug_assertions)]
impl Drop for TaskAllocator {
    fn drop(&mut self) {
        // every record handed out must have come back
        let allocations = self.allocations.load(Ordering::Acquire);
        let deallocations = self.deallocations.load(Ordering::Acquire);
        debug_assert_eq!(
            allocations, deallocations,
            "task allocator dropped with live tasks"
        );
    }
}

// === impl FreeList ===

impl FreeList {
    fn push(&self, task: *mut Task) {
        // Safety: the record is exclusively owned by this list now
        unsafe { (*task).set_next_free(self.head.get()) };
        self.head.set(task);
        self.len.set(self.len.get() + 1);
    }

    fn pop(&self) -> Option<*mut Task> {
        let task = self.head.get();
        if task.is_null() {
            return None;
        }

        // Safety: list nodes are valid records owned by the list
        let next = unsafe { (*task).next_free() };
        self.head.set(next);
        self.len.set(self.len.get() - 1);
        Some(task)
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        // records released after their thread deinitialized (or never
        // drained at all) die with the allocator
        while let Some(task) = self.pop() {
            // Safety: pooled records are owned by the list
            drop(unsafe { Box::from_raw(task) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task_entry;

    #[test]
    fn init_deinit_roundtrip() {
        let allocator = TaskAllocator::new(fiber::stack::MIN_STACK_SIZE, 4, 8);
        allocator.initialize_thread();
        assert_eq!(allocator.thread_list().len.get(), 4);

        allocator.deinitialize_thread();
        assert_eq!(allocator.thread_list().len.get(), 0);
        assert!(allocator.thread_list().head.get().is_null());
    }

    #[test]
    fn allocate_reuses_pooled_records() {
        let allocator = TaskAllocator::new(fiber::stack::MIN_STACK_SIZE, 1, 8);
        allocator.initialize_thread();

        let pooled = allocator.thread_list().head.get();
        let task = allocator.allocate(task_entry);
        assert_eq!(task.as_ptr(), pooled, "warm path must reuse the pool");

        // Safety: we are the only owner
        unsafe { task.as_ref().ref_n(1) };
        // Safety: see above
        unsafe { task.as_ref().deref_n(1) };

        // the record went back onto the list
        assert_eq!(allocator.thread_list().head.get(), task.as_ptr());

        allocator.deinitialize_thread();
    }

    #[test]
    fn overflow_beyond_initial_capacity_allocates() {
        let allocator = TaskAllocator::new(fiber::stack::MIN_STACK_SIZE, 1, 2);
        allocator.initialize_thread();

        let a = allocator.allocate(task_entry);
        let b = allocator.allocate(task_entry);
        assert_ne!(a, b);

        for task in [a, b] {
            // Safety: sole owners of freshly allocated records
            unsafe {
                task.as_ref().ref_n(1);
                task.as_ref().deref_n(1);
            }
        }

        allocator.deinitialize_thread();
    }

    #[test]
    fn bounded_list_destroys_overflow() {
        let allocator = TaskAllocator::new(fiber::stack::MIN_STACK_SIZE, 0, 1);

        let a = allocator.allocate(task_entry);
        let b = allocator.allocate(task_entry);

        // Safety: sole owners
        unsafe {
            a.as_ref().ref_n(1);
            b.as_ref().ref_n(1);
            a.as_ref().deref_n(1);
            b.as_ref().deref_n(1);
        }

        // only one record fits the bounded list; the other was destroyed
        assert_eq!(allocator.thread_list().len.get(), 1);

        allocator.deinitialize_thread();
    }
}
