// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guarded stacks and stack switching for the task runtime.
//!
//! A [`StackContext`] is a suspended computation bound to a
//! [`GuardedStack`]: resuming it transfers the OS thread onto that stack
//! until the context either suspends itself (via [`Suspend::suspend`]) or
//! returns from its entry closure. The raw switch primitive comes from
//! [`corosensei`]; the stacks — guard page placement, pre-faulting, reuse —
//! are ours.
//!
//! Contexts deliberately carry no values across switches. The runtime
//! communicates through its task records instead, which keeps every switch
//! to two machine-word writes.
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

pub mod stack;

use crate::stack::{GuardedStack, StackHandle};
use core::fmt;
use corosensei::{Coroutine, CoroutineResult, Yielder};

/// Outcome of [`StackContext::resume`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Switch {
    /// The context suspended itself and can be resumed again.
    Yielded,
    /// The context's entry closure returned; the context is done.
    Returned,
}

/// A suspended computation on a [`GuardedStack`].
///
/// A context may be resumed from a different OS thread than the one that
/// last suspended it, as long as at most one thread resumes it at a time.
pub struct StackContext {
    coro: Coroutine<(), (), (), StackHandle>,
}

/// Handle for suspending the currently-executing context, passed to the
/// entry closure. Its address is stable for the context's whole lifetime,
/// so callers may stash a raw pointer to it and suspend from arbitrarily
/// deep in the call stack.
#[repr(transparent)]
pub struct Suspend {
    inner: Yielder<(), ()>,
}

// === impl StackContext ===

impl StackContext {
    /// Creates a context that will run `entry` on `stack` when first
    /// resumed.
    ///
    /// # Safety
    ///
    /// The context borrows `stack` without a lifetime: the caller must keep
    /// `stack` alive (and not hand it to another context) until this
    /// context is dropped.
    pub unsafe fn new<F>(stack: &GuardedStack, entry: F) -> Self
    where
        F: FnOnce(&Suspend) + Send + 'static,
    {
        let coro = Coroutine::with_stack(stack.handle(), move |yielder, ()| {
            // Safety: `Suspend` is a transparent wrapper around `Yielder`
            let suspend = unsafe {
                &*core::ptr::from_ref(yielder).cast::<Suspend>()
            };
            entry(suspend);
        });

        Self { coro }
    }

    /// Transfers control to the context until it suspends or returns.
    ///
    /// # Panics
    ///
    /// Panics if the context already returned.
    pub fn resume(&mut self) -> Switch {
        match self.coro.resume(()) {
            CoroutineResult::Yield(()) => Switch::Yielded,
            CoroutineResult::Return(()) => Switch::Returned,
        }
    }

    /// Whether the context has been resumed at least once.
    pub fn started(&self) -> bool {
        self.coro.started()
    }

    /// Whether the entry closure has returned. A finished context cannot be
    /// resumed again.
    pub fn done(&self) -> bool {
        self.coro.done()
    }
}

impl fmt::Debug for StackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackContext")
            .field("started", &self.started())
            .field("done", &self.done())
            .finish()
    }
}

// Safety: the entry closure is required to be `Send` and no values cross
// the switch boundary; the runtime guarantees a context is resumed by at
// most one thread at a time.
unsafe impl Send for StackContext {}

// === impl Suspend ===

impl Suspend {
    /// Suspends the calling context, returning control to whoever resumed
    /// it. The matching [`StackContext::resume`] call returns
    /// [`Switch::Yielded`].
    pub fn suspend(&self) {
        self.inner.suspend(());
    }
}
