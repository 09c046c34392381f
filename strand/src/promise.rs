// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler;
use crate::task::Task;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// An owning handle to a submitted task's completion and result.
///
/// Holds one reference on the task; dropping the promise releases it.
/// [`Promise::wait`] suspends the calling task until the submitted
/// callable has returned, then moves the result out of the task's inline
/// result slot.
///
/// Value-returning promises are move-only (the result slot has a single
/// owner). `Promise<()>` is additionally [`Clone`], since its only state
/// is the reference count — but still at most one holder may `wait` on a
/// given task at a time.
///
/// Promises must not outlive the runtime: drop (or wait) every promise
/// before calling [`shutdown`](crate::shutdown).
pub struct Promise<T> {
    task: NonNull<Task>,
    result: *mut T,
    _marker: PhantomData<T>,
}

// === impl Promise ===

impl<T> Promise<T> {
    /// Binds a promise to `task`, taking over one of its references.
    ///
    /// # Safety
    ///
    /// `result` must point to `task`'s payload result slot, and the caller
    /// must have added the reference this promise releases on drop.
    pub(crate) unsafe fn from_raw(task: NonNull<Task>, result: *mut T) -> Self {
        Self {
            task,
            result,
            _marker: PhantomData,
        }
    }

    /// Whether the submitted callable has already returned.
    pub fn is_resolved(&self) -> bool {
        // Safety: the promise's reference keeps the task alive
        unsafe { self.task.as_ref() }.is_finished()
    }

    /// Suspends the current task until this promise resolves, then returns
    /// the callable's result.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a task context (only code running
    /// on a task stack can suspend).
    pub fn wait(self) -> T {
        // Safety: the promise's reference keeps the task alive
        let task = unsafe { self.task.as_ref() };

        scheduler::sleep_until_resolve(task);

        // Safety: the callable returned, so the slot is initialized; the
        // single-owner rule for value promises makes this read unique
        let value = unsafe { self.result.read() };
        task.mark_result_taken();
        value
    }
}

impl Clone for Promise<()> {
    fn clone(&self) -> Self {
        // Safety: the existing reference keeps the task alive while we add
        // another
        unsafe { self.task.as_ref() }.ref_n(1);
        Self {
            task: self.task,
            result: self.result,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // Safety: releases exactly the reference this promise owned
        unsafe { self.task.as_ref() }.deref_n(1);
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("task", &self.task)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// Safety: the task record is Sync and the result slot is only read once
// the callable (which produced a Send value) has finished.
unsafe impl<T: Send> Send for Promise<T> {}
