// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler: worker startup and teardown, the worker loop, and the
//! suspension entry points.
//!
//! Every OS thread in the pool (the `init` caller included) is wrapped in
//! a *thread-shim* task — a task record with no stack of its own — and
//! runs the worker loop on its native stack. Running a real task is a
//! switch from the shim onto the task's stack; every suspension switches
//! straight back to the shim. Tasks never switch to each other directly,
//! which is what lets a suspended task be resumed by any worker later.
//!
//! After a task switches out, the worker inspects it in this order:
//!
//! 1. `waiting` set: the task suspended on another task `W`. Try to
//!    install it as `W`'s waiter; if `W` already finished, requeue it
//!    right away.
//! 2. `yielding` set: clear the flag and requeue.
//! 3. otherwise the task finished: its completion mark is already set, so
//!    read the waiter out of the marked slot, requeue the waiter, and drop
//!    the queue's reference.

use crate::alloc::TaskAllocator;
use crate::error::Error;
use crate::promise::Promise;
use crate::settings::Settings;
use crate::task::{Task, task_entry};
use crate::os;
use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use fiber::Switch;
use sharded_queue::ShardedQueue;
use std::sync::Arc;
use tid_cache::TidCache;
use util::{Backoff, Barrier};

/// The process-wide runtime; installed by [`init`], torn down by
/// [`shutdown`].
static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

pub(crate) struct Runtime {
    /// Runnable tasks. Null entries appear only while worker startup
    /// primes the producer lanes.
    queue: ShardedQueue<*mut Task>,
    allocator: TaskAllocator,
    /// Per-thread current-task pointer; the slot outlives parking and
    /// migration, which a plain `thread_local!` would not give us for
    /// values tied to the runtime's lifetime.
    current: TidCache<CurrentTask>,
    running: AtomicBool,
    settings: Settings,
}

struct CurrentTask(Cell<*mut Task>);

// Safety: each slot is only accessed by its owning thread; Send is needed
// so the cache can be dropped wherever the runtime is dropped.
unsafe impl Send for CurrentTask {}

/// Returns the installed runtime.
///
/// # Panics
///
/// Panics when called outside the `init`..`shutdown` window.
fn runtime() -> &'static Runtime {
    let ptr = RUNTIME.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "the runtime is not initialized");
    // Safety: the pointer stays valid until `shutdown`, which must not be
    // called while runtime threads are still inside it (enforced by the
    // running flag assert there)
    unsafe { &*ptr }
}

/// The calling thread's current task (its shim between task executions).
fn current_task(rt: &Runtime) -> &Task {
    let slot = rt
        .current
        .get(tid_cache::current_thread_id())
        .expect("calling thread is not a runtime worker");
    let ptr = slot.0.get();
    assert!(!ptr.is_null(), "calling thread is not a runtime worker");
    // Safety: non-null entries point at a live shim or executing task
    unsafe { &*ptr }
}

// === lifecycle ===

/// Builds the runtime, spawns the workers, runs `entry` as the first task
/// and participates in the worker loop until [`stop`]; returns once every
/// worker has been joined.
pub(crate) fn init(entry: fn(), settings: Settings) -> Result<(), Error> {
    let settings = settings.validated()?;

    let rt_box = Box::new(Runtime {
        queue: ShardedQueue::with_capacity(settings.threads_count + 1),
        allocator: TaskAllocator::new(
            settings.stack_size,
            settings.jobs_capacity + 1,
            settings.jobs_capacity + 1,
        ),
        current: TidCache::with_capacity(2 * (settings.threads_count + 1)),
        running: AtomicBool::new(true),
        settings,
    });

    let ptr = Box::into_raw(rt_box);
    if RUNTIME
        .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Safety: the runtime was never shared
        drop(unsafe { Box::from_raw(ptr) });
        return Err(Error::AlreadyRunning);
    }

    // Safety: just installed, valid until shutdown
    let rt = unsafe { &*ptr };

    let barrier = Arc::new(Barrier::new(settings.threads_count));
    let mut workers = Vec::with_capacity(settings.threads_count - 1);

    for index in 1..settings.threads_count {
        let barrier = barrier.clone();

        let handle = std::thread::Builder::new()
            .name(format!("strand-worker-{index}"))
            .spawn(move || {
                os::set_max_priority();
                os::pin_to_cpu((index - 1) % os::hardware_threads());

                let rt = runtime();
                let shim = worker_init(rt);
                barrier.wait();

                worker_loop(rt);
                worker_fini(rt, shim);
            })
            .expect("failed to spawn a worker thread");

        workers.push(handle);
    }

    os::set_max_priority();
    let shim = worker_init(rt);
    barrier.wait();

    // the caller-provided entry point is just the first submitted task;
    // nobody waits on it through the promise
    drop(submit_task(move || entry()));

    worker_loop(rt);

    for worker in workers {
        worker.join().expect("a worker thread panicked");
    }
    worker_fini(rt, shim);

    Ok(())
}

/// Signals cooperative shutdown: workers finish their current task and
/// exit the loop. In-flight tasks are allowed to complete; queued ones
/// stay queued until [`shutdown`] drains them.
pub(crate) fn stop() {
    tracing::debug!("stop requested");
    runtime().running.store(false, Ordering::Release);
}

/// Destroys the runtime: drains the runnable queue (releasing queued tasks
/// and their waiter chains without running them) and frees the shared
/// allocator and queue.
///
/// Must only be called after [`init`] returned. Every `Promise` must have
/// been dropped by now; a promise held across `shutdown` dangles.
pub(crate) fn shutdown() {
    let ptr = RUNTIME.swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        return;
    }

    // Safety: unpublished; only this thread can reach it now
    let rt = unsafe { &*ptr };
    assert!(
        !rt.running.load(Ordering::Acquire),
        "shutdown() while the runtime is running"
    );

    // Tasks still queued were submitted but never dequeued. Release the
    // queue's reference on each, and on every task chained behind it
    // through a waiter slot (those were dequeued once, suspended, and will
    // never be woken now).
    while let Some(task) = rt.queue.dequeue() {
        let mut cursor = task;
        while !cursor.is_null() {
            // Safety: queued tasks are alive; the queue's reference on
            // them is ours now
            let task = unsafe { &*cursor };
            let (waiter, _) = task.waiter();
            tracing::trace!(task = ?cursor, "releasing undispatched task");
            task.deref_n(1);
            cursor = waiter;
        }
    }

    // Safety: swapped out above
    drop(unsafe { Box::from_raw(ptr) });
}

// === worker lifecycle ===

/// Per-thread startup: wrap the thread in a shim task, pre-warm the
/// allocator, and prime the sharded queue so this thread's producer lane
/// exists before real traffic starts.
fn worker_init(rt: &Runtime) -> NonNull<Task> {
    let tid = tid_cache::current_thread_id();

    let shim = Task::current_thread_to_task();
    rt.current.set(tid, CurrentTask(Cell::new(shim.as_ptr())));

    rt.allocator.initialize_thread();

    for _ in 0..rt.settings.jobs_capacity {
        rt.queue.enqueue(ptr::null_mut());
    }
    let mut reclaimed = 0;
    while reclaimed < rt.settings.jobs_capacity {
        if let Some(task) = rt.queue.dequeue() {
            assert!(task.is_null(), "dequeued a real task while priming");
            reclaimed += 1;
        } else {
            std::thread::yield_now();
        }
    }

    tracing::debug!(tid, "worker online");
    shim
}

/// Per-thread teardown, symmetric with [`worker_init`]. The caller runs
/// this only after every other worker has been joined.
fn worker_fini(rt: &Runtime, shim: NonNull<Task>) {
    let tid = tid_cache::current_thread_id();

    if let Some(slot) = rt.current.get(tid) {
        slot.0.set(ptr::null_mut());
    }

    rt.allocator.deinitialize_thread();
    // Safety: the loop has exited, nothing references the shim anymore
    unsafe { shim.as_ref().deref_n(1) };

    tracing::debug!(tid, "worker offline");
}

fn worker_loop(rt: &Runtime) {
    let slot = rt
        .current
        .get(tid_cache::current_thread_id())
        .expect("worker_loop on an uninitialized thread");
    let shim = slot.0.get();

    let span = tracing::debug_span!("worker", tid = tid_cache::current_thread_id());
    let _enter = span.enter();

    let mut backoff = Backoff::new();

    while rt.running.load(Ordering::Acquire) {
        let Some(task_ptr) = rt.queue.dequeue() else {
            backoff.spin();
            // an idle pool shares its cores with whatever else runs here
            std::thread::yield_now();
            continue;
        };
        backoff.reset();

        assert!(!task_ptr.is_null(), "null sentinel after priming");
        // Safety: the queue's reference keeps dequeued tasks alive
        let task = unsafe { &*task_ptr };

        task.set_manager(shim);
        let switch = task.resume(&slot.0);
        task.set_manager(ptr::null_mut());

        let waiting = task.take_waiting();
        if !waiting.is_null() {
            // Safety: the task pinned its wait target before suspending
            let target = unsafe { &*waiting };

            // Install ourselves as the waiter. Losing the race (the
            // target already completed) just means nobody would ever wake
            // us, so go straight back into the queue instead.
            if !target.set_waiter(task_ptr) {
                rt.queue.enqueue(task_ptr);
            }
        } else if task.is_yielding() {
            task.set_yielding(false);
            rt.queue.enqueue(task_ptr);
        } else {
            // the task ran to completion; resolve() already set the mark,
            // which also froze the waiter slot
            debug_assert_eq!(switch, Switch::Returned);
            debug_assert!(task.is_finished());

            let (waiter, marked) = task.waiter();
            debug_assert!(marked);
            if !waiter.is_null() {
                tracing::trace!(task = ?task_ptr, waiter = ?waiter, "waking waiter");
                rt.queue.enqueue(waiter);
            }

            // the queue's reference
            task.deref_n(1);
        }
    }
}

// === task-side entry points ===

/// Allocates a task for `func`, enqueues it, and returns the owning
/// promise.
///
/// Tasks submitted after [`stop`] may never execute; their payloads are
/// released by the [`shutdown`] drain.
pub(crate) fn submit_task<F, R>(func: F) -> Promise<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let rt = runtime();
    let task = rt.allocator.allocate(task_entry);
    // Safety: freshly allocated
    let task_ref = unsafe { task.as_ref() };

    // one reference for the queue, one for the promise
    task_ref.ref_n(2);
    // Safety: sole owner until the enqueue below
    let result = unsafe { task_ref.install_payload(func) };

    tracing::trace!(task = ?task, "task submitted");
    rt.queue.enqueue(task.as_ptr());

    // Safety: `result` points into `task`'s payload and the promise takes
    // over one of the references added above
    unsafe { Promise::from_raw(task, result) }
}

/// Suspends the current task and requeues it behind everything currently
/// runnable.
pub(crate) fn yield_now() {
    let rt = runtime();
    let task = current_task(rt);
    assert!(
        !task.is_thread_shim(),
        "yield_now() called from outside a task"
    );

    task.set_yielding(true);
    task.suspend_to_manager();
}

/// Suspends the current task until `target` resolves. The worker loop
/// installs us as `target`'s waiter after the switch; if `target` has
/// already finished by then, we are requeued immediately.
pub(crate) fn sleep_until_resolve(target: &Task) {
    let rt = runtime();
    let task = current_task(rt);
    assert!(
        !task.is_thread_shim(),
        "wait() called from outside a task"
    );

    // pin the target across the suspension
    target.ref_n(1);
    task.set_waiting(ptr::from_ref(target).cast_mut());

    task.suspend_to_manager();

    debug_assert!(target.is_finished());
    target.deref_n(1);
}
