// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task record: one unit of scheduled work with its own stack.
//!
//! A task is shared across threads as a raw pointer and synchronized by two
//! words and a protocol:
//!
//! - `refs` counts logical owners (the run-queue slot, each promise, each
//!   in-flight wait pin). The `1 → 0` transition returns the record to its
//!   allocator.
//! - `waiter` is a [`MarkedPtr`]: the pointer half is "the task waiting on
//!   me", the mark is "my callable has returned". Packing both into one
//!   word makes the `set_waiter`/`resolve` race a single CAS — there is no
//!   window where a waiter can be installed on a task that already
//!   completed.
//! - Everything else (`waiting`, `manager`, `yielding`, the stack context,
//!   the payload) is only ever touched by the one worker that dequeued the
//!   task, between switch-in and switch-out. Single writer, no locks.
//!
//! The callable lives *inside* the record: `submit` placement-writes a
//! monomorphized `JobData<F, R>` (header of fn-pointer thunks, then the
//! closure, then the result slot) into a fixed payload buffer, so a submit
//! allocates nothing once the task cache is warm.

use crate::alloc::TaskAllocator;
use core::cell::{Cell, UnsafeCell};
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use fiber::stack::GuardedStack;
use fiber::{StackContext, Suspend, Switch};
use static_assertions::const_assert;
use util::MarkedPtr;

/// Bytes reserved in every task for the type-erased callable and its
/// result. `submit` asserts the concrete payload fits.
pub(crate) const PAYLOAD_SIZE: usize = 256;

/// Entry handler installed by the allocator; the scheduler passes
/// [`task_entry`].
pub(crate) type EntryFn = fn(&Task);

#[repr(align(16))]
struct PayloadBuf([MaybeUninit<u8>; PAYLOAD_SIZE]);

pub(crate) struct Task {
    /// Logical owner count; `1 → 0` releases the record.
    refs: AtomicU64,
    /// Waiter pointer + completed mark, mutated together. The single
    /// linearization point of the task lifecycle.
    waiter: MarkedPtr<Task>,

    // Fields below are owned by the executing worker (or the thread
    // resetting/destroying the task); see the module docs.
    /// Task this one suspended on, consumed by the worker loop.
    waiting: Cell<*mut Task>,
    /// The worker-shim task currently running us.
    manager: Cell<*mut Task>,
    /// Re-enqueue after this suspension instead of waiting.
    yielding: Cell<bool>,
    /// Suspension handle, valid while the entry closure runs.
    suspend: Cell<*const Suspend>,
    /// The live context; `None` for thread shims and pre-warmed records.
    context: UnsafeCell<Option<StackContext>>,
    /// Owned stack, reused across resets; `None` for thread shims.
    stack: Option<GuardedStack>,
    /// Type-erased callable header inside `payload`; null when empty.
    job: Cell<*mut JobHeader>,
    /// Whether the callable was consumed by `invoke` (the task started).
    payload_started: Cell<bool>,
    /// Whether the result slot was consumed by a promise.
    result_taken: Cell<bool>,
    /// Free-list link while pooled.
    next_free: Cell<*mut Task>,
    /// Owning allocator; null for thread shims, which are simply dropped.
    allocator: *const TaskAllocator,
    payload: UnsafeCell<PayloadBuf>,
}

// the waiter protocol needs the low bit, and the allocator hands out
// 8-byte-aligned records
const_assert!(align_of::<Task>() >= 8);

/// Thunk table at the head of every installed payload.
pub(crate) struct JobHeader {
    /// Consumes the closure and writes the result.
    invoke: unsafe fn(*mut JobHeader),
    /// Drops a closure that never ran.
    drop_func: unsafe fn(*mut JobHeader),
    /// Drops a result no promise consumed.
    drop_result: unsafe fn(*mut JobHeader),
}

#[repr(C)]
struct JobData<F, R> {
    header: JobHeader,
    func: ManuallyDrop<F>,
    result: MaybeUninit<R>,
}

/// A `Send` wrapper for the task pointer captured by the entry closure.
struct TaskPtr(NonNull<Task>);
// Safety: the pointee is Sync (see below) and heap-pinned
unsafe impl Send for TaskPtr {}

// === impl Task ===

impl Task {
    fn new(allocator: *const TaskAllocator, stack: Option<GuardedStack>) -> Self {
        Self {
            refs: AtomicU64::new(0),
            waiter: MarkedPtr::null(),
            waiting: Cell::new(ptr::null_mut()),
            manager: Cell::new(ptr::null_mut()),
            yielding: Cell::new(false),
            suspend: Cell::new(ptr::null()),
            context: UnsafeCell::new(None),
            stack,
            job: Cell::new(ptr::null_mut()),
            payload_started: Cell::new(false),
            result_taken: Cell::new(false),
            next_free: Cell::new(ptr::null_mut()),
            allocator,
            payload: UnsafeCell::new(PayloadBuf([MaybeUninit::uninit(); PAYLOAD_SIZE])),
        }
    }

    /// Allocates a pooled task record with its stack. No context yet; the
    /// allocator installs one via [`Task::reset`] when the record is handed
    /// out.
    ///
    /// Stack allocation failure is fatal: the runtime cannot operate
    /// without task stacks.
    pub(crate) fn allocate(allocator: &TaskAllocator, stack_size: usize) -> NonNull<Task> {
        let stack = GuardedStack::new(stack_size).expect("failed to allocate a task stack");
        let task = Box::new(Self::new(allocator, Some(stack)));
        NonNull::from(Box::leak(task))
    }

    /// Wraps the calling OS thread into a task record (the worker shim):
    /// no stack of its own, no allocator, one reference held by the worker.
    pub(crate) fn current_thread_to_task() -> NonNull<Task> {
        let task = Box::new(Self::new(ptr::null(), None));
        task.ref_n(1);
        NonNull::from(Box::leak(task))
    }

    /// Prepares a recycled record to run `entry`: clears all transient
    /// state and builds a fresh context on the existing stack.
    pub(crate) fn reset(&self, entry: EntryFn) {
        self.drop_job();

        self.waiter.store(ptr::null_mut(), false, Ordering::Relaxed);
        self.waiting.set(ptr::null_mut());
        self.manager.set(ptr::null_mut());
        self.yielding.set(false);
        self.suspend.set(ptr::null());
        self.next_free.set(ptr::null_mut());
        self.payload_started.set(false);
        self.result_taken.set(false);

        let stack = self
            .stack
            .as_ref()
            .expect("thread-shim tasks are never reset");

        let task_ptr = TaskPtr(NonNull::from(self));
        // Safety: the record owns `stack` and outlives the context
        let context = unsafe {
            StackContext::new(stack, move |suspend| {
                // force capturing the whole `TaskPtr` wrapper (and its
                // manual `Send` impl) rather than the disjoint `NonNull`
                // field, per RFC 2229 precise closure captures
                let task_ptr = task_ptr;
                // Safety: the record is kept alive by the scheduler's
                // reference for as long as it can run
                let task = unsafe { task_ptr.0.as_ref() };
                task.suspend.set(ptr::from_ref(suspend));
                entry(task);
            })
        };

        // Safety: reset is only called while the allocator is the sole
        // owner of the record
        let slot = unsafe { &mut *self.context.get() };
        if let Some(old) = slot.as_ref() {
            debug_assert!(old.done(), "reset of a task whose context is still live");
        }
        *slot = Some(context);
    }

    pub(crate) fn ref_n(&self, n: u64) {
        self.refs.fetch_add(n, Ordering::Relaxed);
    }

    /// Drops `n` references; the holder of the last one releases the
    /// record back to its allocator (or frees it outright for shims).
    pub(crate) fn deref_n(&self, n: u64) {
        let old = self.refs.fetch_sub(n, Ordering::AcqRel);
        assert!(old >= n, "task reference count underflow");

        if old == n {
            let ptr = ptr::from_ref(self).cast_mut();
            if self.allocator.is_null() {
                // Safety: refs hit zero, so this was the last owner; shims
                // are plain boxed records
                drop(unsafe { Box::from_raw(ptr) });
            } else {
                // Safety: the allocator outlives every task it owns
                unsafe { (*self.allocator).deallocate(ptr) };
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Installs `waiter` as the task waiting on us.
    ///
    /// Returns `false` when this task has already completed — the caller
    /// must not suspend and should reschedule `waiter` instead. At most one
    /// waiter may ever be installed.
    pub(crate) fn set_waiter(&self, waiter: *mut Task) -> bool {
        loop {
            let (current, marked) = self.waiter.load(Ordering::Acquire);
            if marked {
                return false;
            }
            assert!(current.is_null(), "task already has a waiter");

            if self.waiter.compare_exchange(
                (ptr::null_mut(), false),
                (waiter, false),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                return true;
            }
        }
    }

    /// Marks the task completed, leaving any installed waiter in place for
    /// the worker loop to collect.
    pub(crate) fn resolve(&self) {
        loop {
            let (waiter, marked) = self.waiter.load(Ordering::Acquire);
            debug_assert!(!marked, "task resolved twice");

            if self.waiter.attempt_mark(waiter, true) {
                tracing::trace!(task = ?ptr::from_ref(self), waiter = ?waiter, "task resolved");
                break;
            }
        }
    }

    /// Reads the waiter slot; the mark is true once the callable returned.
    pub(crate) fn waiter(&self) -> (*mut Task, bool) {
        self.waiter.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.waiter.is_marked(Ordering::Acquire)
    }

    /// Switches onto this task's stack until it suspends or finishes.
    ///
    /// `current` is the calling thread's current-task slot: we become
    /// current for the duration of the switch and the previous task (the
    /// worker shim) is restored afterwards.
    pub(crate) fn resume(&self, current: &Cell<*mut Task>) -> Switch {
        let previous = current.get();
        current.set(ptr::from_ref(self).cast_mut());

        // Safety: only the worker that dequeued the task touches its
        // context, and a context always exists once the task is enqueued
        let switch = unsafe {
            (*self.context.get())
                .as_mut()
                .expect("resumed a task without a context")
                .resume()
        };

        current.set(previous);
        switch
    }

    /// Suspends the currently-executing task, returning to its manager.
    /// Must be called from the task's own stack.
    pub(crate) fn suspend_to_manager(&self) {
        let suspend = self.suspend.get();
        assert!(
            !suspend.is_null(),
            "suspension requested outside a task context"
        );
        debug_assert!(
            !self.manager.get().is_null(),
            "suspension with no manager to return to"
        );
        // Safety: the suspend handle lives on this task's stack and is
        // valid for the whole run of the entry closure
        unsafe { (*suspend).suspend() };
    }

    pub(crate) fn set_manager(&self, manager: *mut Task) {
        self.manager.set(manager);
    }

    pub(crate) fn set_waiting(&self, target: *mut Task) {
        self.waiting.set(target);
    }

    /// Consumes the waiting field (worker loop, after switch-out).
    pub(crate) fn take_waiting(&self) -> *mut Task {
        self.waiting.replace(ptr::null_mut())
    }

    pub(crate) fn set_yielding(&self, yielding: bool) {
        self.yielding.set(yielding);
    }

    pub(crate) fn is_yielding(&self) -> bool {
        self.yielding.get()
    }

    /// Whether this is a worker shim (an OS thread's native stack).
    pub(crate) fn is_thread_shim(&self) -> bool {
        self.stack.is_none()
    }

    pub(crate) fn set_next_free(&self, next: *mut Task) {
        self.next_free.set(next);
    }

    pub(crate) fn next_free(&self) -> *mut Task {
        self.next_free.get()
    }

    /// Placement-writes the callable into the payload buffer and returns a
    /// pointer to the result slot.
    ///
    /// # Safety
    ///
    /// The caller must be the sole owner of the record (freshly allocated,
    /// not yet enqueued).
    pub(crate) unsafe fn install_payload<F, R>(&self, func: F) -> *mut R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(
            size_of::<JobData<F, R>>() <= PAYLOAD_SIZE
                && align_of::<JobData<F, R>>() <= align_of::<PayloadBuf>(),
            "task payload too large: {} bytes of closure + result exceed the {} byte inline buffer",
            size_of::<JobData<F, R>>(),
            PAYLOAD_SIZE,
        );

        let slot = self.payload.get().cast::<JobData<F, R>>();
        // Safety: fit asserted above; sole ownership per the contract
        unsafe {
            slot.write(JobData {
                header: JobHeader {
                    invoke: JobData::<F, R>::invoke,
                    drop_func: JobData::<F, R>::drop_func,
                    drop_result: JobData::<F, R>::drop_result,
                },
                func: ManuallyDrop::new(func),
                result: MaybeUninit::uninit(),
            });
            self.job.set(ptr::addr_of_mut!((*slot).header));
            ptr::addr_of_mut!((*slot).result).cast::<R>()
        }
    }

    /// Runs the installed callable. Called exactly once, from the task's
    /// own stack.
    pub(crate) fn invoke_payload(&self) {
        let job = self.job.get();
        assert!(!job.is_null(), "task resumed without a payload");
        self.payload_started.set(true);
        // Safety: the thunk was installed together with the payload and
        // runs at most once (invoke is only reachable from the entry
        // closure, which runs once per reset)
        unsafe { ((*job).invoke)(job) };
    }

    /// Marks the result slot consumed so teardown won't drop it again.
    pub(crate) fn mark_result_taken(&self) {
        self.result_taken.set(true);
    }

    /// Drops the stack context, force-unwinding it if the task is
    /// suspended mid-execution.
    ///
    /// Must happen while the runtime is still intact: the unwind runs the
    /// suspended frames' destructors, which may release promises and
    /// re-enter the allocator. Called from `deallocate`, where calls nest
    /// strictly (an unwind-triggered release completes before the outer
    /// one continues).
    pub(crate) fn clear_context(&self) {
        // Safety: only called by the record's sole owner (refs == 0)
        unsafe { *self.context.get() = None };
    }

    /// Disposes of whatever the payload still holds: the closure when the
    /// task never ran, or the result when nobody waited for it. Runs when
    /// the record is released to its allocator (so captured resources are
    /// freed promptly, not when the record is next reused) and again as a
    /// no-op backstop from reset and drop.
    pub(crate) fn drop_job(&self) {
        let job = self.job.get();
        if job.is_null() {
            return;
        }
        self.job.set(ptr::null_mut());

        // Safety: the thunks match the payload installed alongside `job`,
        // and the caller of reset/drop is the record's sole owner.
        //
        // A task that started but never finished holds neither: `invoke`
        // consumed the closure, the result was never written, and whatever
        // the callable still owns sits in its suspended frames, which the
        // context unwind releases.
        unsafe {
            if !self.payload_started.get() {
                ((*job).drop_func)(job);
            } else if self.is_finished() && !self.result_taken.get() {
                ((*job).drop_result)(job);
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.refs.load(Ordering::Acquire),
            0,
            "task dropped while references exist"
        );
        self.drop_job();
        // `context` drops before `stack` by declaration order, unwinding a
        // mid-execution task's frames while its stack is still mapped
    }
}

// Safety: `refs` and `waiter` are atomic; all other fields follow the
// single-owner protocol described in the module docs (exactly one worker
// runs the task at any time, and reset/teardown require sole ownership).
unsafe impl Send for Task {}
// Safety: see above
unsafe impl Sync for Task {}

// === impl JobData ===

impl<F, R> JobData<F, R>
where
    F: FnOnce() -> R,
{
    unsafe fn invoke(header: *mut JobHeader) {
        let this = header.cast::<Self>();
        // Safety: thunks are only invoked on the payload they were
        // installed with; `func` is initialized and taken exactly once
        unsafe {
            let func = ManuallyDrop::take(&mut (*this).func);
            (*this).result.write(func());
        }
    }

    unsafe fn drop_func(header: *mut JobHeader) {
        let this = header.cast::<Self>();
        // Safety: only called when the closure never ran
        unsafe { ManuallyDrop::drop(&mut (*this).func) };
    }

    unsafe fn drop_result(header: *mut JobHeader) {
        let this = header.cast::<Self>();
        // Safety: only called when the callable completed (result written)
        // and no promise consumed the slot
        unsafe { (*this).result.assume_init_drop() };
    }
}

/// The entry handler for submitted tasks: run the callable, then flip the
/// completion mark. The worker loop sees the switch return with neither
/// `waiting` nor `yielding` set and collects the waiter.
pub(crate) fn task_entry(task: &Task) {
    task.invoke_payload();
    task.resolve();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TaskAllocator;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_allocator() -> TaskAllocator {
        TaskAllocator::new(fiber::stack::MIN_STACK_SIZE, 1, 4)
    }

    #[test]
    fn waiter_slot_protocol() {
        let allocator = test_allocator();
        allocator.initialize_thread();

        let task = allocator.allocate(task_entry);
        // Safety: allocate returns a valid record
        let task = unsafe { task.as_ref() };
        task.ref_n(1);

        let mut other = Task::new(ptr::null(), None);
        let other_ptr = ptr::from_mut(&mut other);

        // install, then resolve: the waiter survives under the mark
        assert!(task.set_waiter(other_ptr));
        task.resolve();
        assert!(task.is_finished());
        assert_eq!(task.waiter(), (other_ptr, true));

        // no installs after completion
        assert!(!task.set_waiter(other_ptr));

        task.deref_n(1);
        allocator.deinitialize_thread();
    }

    #[test]
    #[should_panic(expected = "task already has a waiter")]
    fn double_waiter_is_fatal() {
        let task = Task::new(ptr::null(), None);
        let mut a = Task::new(ptr::null(), None);
        let mut b = Task::new(ptr::null(), None);

        assert!(task.set_waiter(ptr::from_mut(&mut a)));
        task.set_waiter(ptr::from_mut(&mut b));
    }

    #[test]
    fn set_waiter_races_resolve_exactly_once() {
        // many rounds of a 2-thread race: exactly one of {install
        // succeeded and the resolver sees it, install failed} must hold
        for _ in 0..200 {
            let task = Arc::new(Task::new(ptr::null(), None));
            let waiter = Box::into_raw(Box::new(Task::new(ptr::null(), None)));

            let resolver = {
                let task = task.clone();
                std::thread::spawn(move || {
                    task.resolve();
                    let (seen, marked) = task.waiter();
                    assert!(marked);
                    seen as usize
                })
            };

            let installed = task.set_waiter(waiter);
            let seen = resolver.join().unwrap() as *mut Task;

            if installed {
                // the resolver's mark came after the install, or the
                // install came after the mark was observed; either way the
                // final word must contain the waiter
                assert_eq!(task.waiter(), (waiter, true));
            } else {
                // install failed: the slot can never contain the waiter
                assert!(seen.is_null());
                assert_eq!(task.waiter(), (ptr::null_mut(), true));
            }

            // Safety: raw waiter was never shared beyond this test
            drop(unsafe { Box::from_raw(waiter) });
        }
    }

    #[test]
    fn payload_roundtrip() {
        let allocator = test_allocator();
        allocator.initialize_thread();

        let task = allocator.allocate(task_entry);
        // Safety: allocate returns a valid record
        let task = unsafe { task.as_ref() };
        task.ref_n(1);
        assert_eq!(task.refs(), 1);

        // Safety: sole owner
        let result = unsafe { task.install_payload(|| 41_u64 + 1) };
        task.invoke_payload();
        task.resolve();

        // Safety: invoke wrote the result
        assert_eq!(unsafe { *result }, 42);
        task.mark_result_taken();

        task.deref_n(1);
        allocator.deinitialize_thread();
    }

    #[test]
    fn unrun_payloads_are_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Token(Arc<AtomicUsize>);
        impl Drop for Token {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let allocator = test_allocator();
        allocator.initialize_thread();

        let task = allocator.allocate(task_entry);
        // Safety: allocate returns a valid record
        let task = unsafe { task.as_ref() };
        task.ref_n(1);

        let token = Token(drops.clone());
        // Safety: sole owner
        let _result = unsafe {
            task.install_payload(move || {
                let _token = token;
            })
        };

        // never ran: releasing the task must drop the captured token
        task.deref_n(1);
        allocator.deinitialize_thread();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn untaken_results_are_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Token(Arc<AtomicUsize>);
        impl Drop for Token {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let allocator = test_allocator();
        allocator.initialize_thread();

        let task = allocator.allocate(task_entry);
        // Safety: allocate returns a valid record
        let task = unsafe { task.as_ref() };
        task.ref_n(1);

        let token_drops = drops.clone();
        // Safety: sole owner
        let _result = unsafe { task.install_payload(move || Token(token_drops)) };
        task.invoke_payload();
        task.resolve();

        // nobody consumed the result: teardown must drop it
        task.deref_n(1);
        allocator.deinitialize_thread();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
