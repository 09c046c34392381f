// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Best-effort OS scheduling hooks for worker threads. Failures are
//! expected (raising priority usually needs privileges) and ignored.

/// Number of hardware threads, at least 1.
pub(crate) fn hardware_threads() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Gives the calling thread the highest priority the OS will grant
        /// within the normal scheduling class.
        ///
        /// Deliberately not a real-time class: the workers spin when idle,
        /// and a fixed-priority spinner livelocks the machine whenever
        /// there are fewer cores than workers.
        pub(crate) fn set_max_priority() {
            // Safety: adjusts niceness of the calling thread only
            unsafe {
                libc::setpriority(libc::PRIO_PROCESS, 0, -20);
            }
        }

        /// Pins the calling thread to one hardware thread.
        pub(crate) fn pin_to_cpu(index: usize) {
            // Safety: CPU_* macros operate on the local cpu_set_t only
            unsafe {
                let mut set: libc::cpu_set_t = core::mem::zeroed();
                libc::CPU_SET(index % libc::CPU_SETSIZE as usize, &mut set);
                libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set);
            }
        }
    } else if #[cfg(target_vendor = "apple")] {
        pub(crate) fn set_max_priority() {
            // Safety: only changes the calling thread's QoS class
            unsafe {
                libc::pthread_set_qos_class_self_np(libc::QOS_CLASS_USER_INTERACTIVE, 0);
            }
        }

        /// Explicit thread placement is not available on this platform.
        pub(crate) fn pin_to_cpu(_index: usize) {}
    } else {
        pub(crate) fn set_max_priority() {}
        pub(crate) fn pin_to_cpu(_index: usize) {}
    }
}
