// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Backoff;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A reusable spin barrier.
///
/// All `n` participating threads block in [`Barrier::wait`] until the last
/// one arrives; the barrier then resets for the next generation. Unlike the
/// std barrier the waiters never park, which is what we want for worker
/// startup where every participant is about to enter a spin loop anyway.
#[derive(Debug)]
pub struct Barrier {
    count: AtomicUsize,
    generation: AtomicUsize,
    num_threads: usize,
}

/// Returned by [`Barrier::wait`]; `true` for exactly one thread per
/// generation.
pub struct BarrierWaitResult(bool);

// === impl Barrier ===

impl Barrier {
    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            num_threads: n,
        }
    }

    pub fn wait(&self) -> BarrierWaitResult {
        let generation = self.generation.load(Ordering::Acquire);
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == self.num_threads {
            // last to arrive: reset the count and open the next generation
            self.count.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            BarrierWaitResult(true)
        } else {
            let mut boff = Backoff::new();
            while self.generation.load(Ordering::Acquire) == generation {
                boff.spin();
            }
            BarrierWaitResult(false)
        }
    }
}

impl BarrierWaitResult {
    pub fn is_leader(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn all_threads_rendezvous() {
        const N: usize = 4;

        let barrier = Arc::new(Barrier::new(N));
        let before = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..N - 1)
            .map(|_| {
                let barrier = barrier.clone();
                let before = before.clone();
                let leaders = leaders.clone();
                std::thread::spawn(move || {
                    before.fetch_add(1, Ordering::SeqCst);
                    if barrier.wait().is_leader() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                    assert_eq!(before.load(Ordering::SeqCst), N);
                })
            })
            .collect();

        before.fetch_add(1, Ordering::SeqCst);
        if barrier.wait().is_leader() {
            leaders.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(before.load(Ordering::SeqCst), N);

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }
}
