// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use fiber::stack::{MAX_STACK_SIZE, min_platform_stack_size};

/// Runtime configuration, passed to [`init`](crate::init).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Total worker threads, *including* the thread that calls `init`.
    pub threads_count: usize,
    /// Upper bound on concurrently live tasks the runtime should be warm
    /// for: this many tasks (with stacks) are preallocated per thread, and
    /// each thread's producer lane is primed with as many slots.
    pub jobs_capacity: usize,
    /// Usable bytes for each task stack. Clamped to
    /// `[min_platform_stack_size(), MAX_STACK_SIZE]`.
    pub stack_size: usize,
}

// === impl Settings ===

impl Settings {
    /// Checks the hard requirements and clamps the stack size to what the
    /// platform supports.
    pub(crate) fn validated(mut self) -> Result<Self, Error> {
        if self.threads_count == 0 {
            return Err(Error::ZeroThreads);
        }
        if self.jobs_capacity == 0 {
            return Err(Error::ZeroJobsCapacity);
        }

        self.stack_size = self
            .stack_size
            .clamp(min_platform_stack_size(), MAX_STACK_SIZE);

        Ok(self)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads_count: crate::os::hardware_threads(),
            jobs_capacity: 256,
            stack_size: fiber::stack::DEFAULT_STACK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_threads() {
        let settings = Settings {
            threads_count: 0,
            ..Settings::default()
        };
        assert_eq!(settings.validated(), Err(Error::ZeroThreads));
    }

    #[test]
    fn rejects_zero_capacity() {
        let settings = Settings {
            jobs_capacity: 0,
            ..Settings::default()
        };
        assert_eq!(settings.validated(), Err(Error::ZeroJobsCapacity));
    }

    #[test]
    fn clamps_stack_size() {
        let tiny = Settings {
            stack_size: 1,
            ..Settings::default()
        }
        .validated()
        .unwrap();
        assert!(tiny.stack_size >= min_platform_stack_size());

        let huge = Settings {
            stack_size: usize::MAX,
            ..Settings::default()
        }
        .validated()
        .unwrap();
        assert_eq!(huge.stack_size, MAX_STACK_SIZE);
    }
}
