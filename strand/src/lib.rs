// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! strand — a cooperative task runtime on stackful fibers.
//!
//! Closures submitted with [`submit`] run on pooled, guard-protected
//! stacks, distributed over a fixed pool of OS threads. A running task may
//! [`wait`] on another task's promise or [`yield_now`]; both suspend the
//! task's stack and hand the OS thread back to the scheduler, and a
//! suspended task resumes on whichever worker picks it up next. There is
//! no preemption: tasks run until they suspend or return.
//!
//! The runtime is a process-wide singleton with an explicit lifecycle:
//! [`init`] runs an entry function and returns once [`stop`] has been
//! called and every worker has wound down; [`shutdown`] then releases the
//! runtime's memory.
//!
//! ```no_run
//! fn entry() {
//!     let promises: Vec<_> = (0..64_u64)
//!         .map(|i| strand::submit(move || i + 1))
//!         .collect();
//!
//!     let total: u64 = promises.into_iter().map(strand::wait).sum();
//!     assert_eq!(total, (1..=64).sum());
//!
//!     strand::stop();
//! }
//!
//! strand::init(entry, strand::Settings::default()).unwrap();
//! strand::shutdown();
//! ```

mod alloc;
mod error;
mod os;
mod promise;
mod scheduler;
mod settings;
mod task;

pub use error::Error;
pub use promise::Promise;
pub use settings::Settings;

/// Starts the runtime and runs `entry` as its first task.
///
/// The calling thread becomes worker 0; `settings.threads_count - 1`
/// additional workers are spawned at maximum OS priority and pinned
/// round-robin across hardware threads. Returns once [`stop`] has been
/// observed and every spawned worker has been joined.
///
/// # Errors
///
/// Returns an [`Error`] for invalid settings or when a runtime already
/// exists.
pub fn init(entry: fn(), settings: Settings) -> Result<(), Error> {
    scheduler::init(entry, settings)
}

/// Schedules `f` to run on some worker and returns the owning
/// [`Promise`] for its result.
///
/// The closure and its result are stored inline in the task record;
/// submitting does not allocate once the per-thread task pool is warm.
/// Tasks submitted after [`stop`] may never execute.
///
/// # Panics
///
/// Panics when the runtime is not initialized, or when the closure plus
/// result exceed the task's inline payload buffer (256 bytes).
pub fn submit<F, R>(f: F) -> Promise<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    scheduler::submit_task(f)
}

/// Suspends the current task until `promise` resolves and returns the
/// result. Equivalent to [`Promise::wait`].
///
/// # Panics
///
/// Panics when called from outside a task context.
pub fn wait<T>(promise: Promise<T>) -> T {
    promise.wait()
}

/// Suspends the current task and requeues it, giving other runnable tasks
/// a chance to execute.
///
/// # Panics
///
/// Panics when called from outside a task context.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Requests cooperative shutdown: workers finish the task they are
/// running and exit. Tasks still queued are not executed.
pub fn stop() {
    scheduler::stop();
}

/// Tears the runtime down after [`init`] has returned, draining
/// unexecuted tasks and freeing all runtime memory.
///
/// Every [`Promise`] must have been waited or dropped before this call.
/// Idempotent; a no-op when no runtime exists.
pub fn shutdown() {
    scheduler::shutdown();
}
