// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A sharded multi-producer, multi-consumer queue.
//!
//! Logically one queue of `T`; physically one [Michael-Scott] linked queue
//! *per producer thread*, plus an insert-only list of all producer lanes
//! ever created. A thread's first enqueue allocates its lane and caches it
//! in a thread-indexed map, so the hot enqueue path touches only memory
//! that thread owns — the tail contention that dominates a single shared
//! queue under N simultaneous submitters simply never happens.
//!
//! The price is ordering: FIFO holds *per producer*, not globally. For a
//! runnable-task queue that is exactly the right trade.
//!
//! Consumers prefer their own lane, then sample a bounded number of
//! non-empty lanes starting from a randomized offset; a dequeue reports
//! empty only after a full cycle over every lane observed no items. Node
//! reclamation uses a 2-slot hazard record per lane (head and next are the
//! only pointers a dequeue dereferences).
//!
//! [Michael-Scott]: https://www.cs.rochester.edu/~scott/papers/1996_PODC_queues.pdf

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use reclaim::hazard::HazardDomain;
use std::cell::Cell;
use tid_cache::TidCache;
use util::{Backoff, CachePadded};

/// Non-empty lanes a dequeue attempts per cycle before conceding the rest
/// of the cycle to the size census.
const SAMPLED_PRODUCERS: usize = 3;

/// A sharded MPMC queue.
///
/// `T: Copy` because values sit in nodes that may be observed by several
/// racing dequeuers; exactly one wins the head CAS and keeps the copy. The
/// runtime stores task pointers, which is the intended shape.
pub struct ShardedQueue<T: Copy> {
    /// Insert-only list of every lane ever created. Lanes are never
    /// unlinked while the queue is alive, so walking it needs no hazards.
    producers: AtomicPtr<Producer<T>>,
    producer_count: AtomicUsize,
    /// Thread → home lane.
    local: TidCache<Cell<*mut Producer<T>>>,
    /// Approximate number of queued items.
    len: AtomicUsize,
}

/// One producer lane: a Michael-Scott queue with a sentinel head.
struct Producer<T: Copy> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicIsize,
    /// Link in the queue's producer list.
    next: AtomicPtr<Producer<T>>,
    hazard: HazardDomain<Node<T>, 2>,
}

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    /// Initialized for every node except a lane's sentinel, whose value is
    /// never read.
    value: core::mem::MaybeUninit<T>,
}

// === impl ShardedQueue ===

impl<T: Copy> ShardedQueue<T> {
    /// Creates a queue sized for `threads` participating threads. Lanes are
    /// created lazily on each thread's first enqueue.
    #[must_use]
    pub fn with_capacity(threads: usize) -> Self {
        Self {
            producers: AtomicPtr::new(ptr::null_mut()),
            producer_count: AtomicUsize::new(0),
            local: TidCache::with_capacity(2 * threads.max(1)),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends `value` to the calling thread's lane.
    ///
    /// Items enqueued by one thread are dequeued in order relative to each
    /// other; there is no order across threads.
    pub fn enqueue(&self, value: T) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.home_producer().enqueue(value);
    }

    /// Removes one item, preferring the calling thread's lane.
    ///
    /// Returns `None` only after a full pass over every lane observed no
    /// items; a `None` therefore means the queue was empty at some point
    /// during the call, not merely that a race was lost.
    pub fn dequeue(&self) -> Option<T> {
        // the home lane keeps single-submitter workloads on owned memory
        if let Some(slot) = self.local.get(tid_cache::current_thread_id()) {
            let home = slot.get();
            if !home.is_null() {
                // Safety: lanes live as long as the queue
                if let Some(value) = unsafe { (*home).try_dequeue() } {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(value);
                }
            }
        }

        let mut backoff = Backoff::new();

        loop {
            let count = self.producer_count.load(Ordering::Acquire);
            if count == 0 {
                return None;
            }

            let head = self.producers.load(Ordering::Acquire);
            let start = fastrand::usize(..count);

            // advance to the jittered starting lane
            let mut cursor = head;
            for _ in 0..start {
                // Safety: lanes live as long as the queue
                cursor = unsafe { (*cursor).next.load(Ordering::Acquire) };
                if cursor.is_null() {
                    cursor = head;
                }
            }

            // one full cycle over the lane list
            let mut observed = 0_usize;
            let mut sampled = 0_usize;

            for _ in 0..count {
                if cursor.is_null() {
                    cursor = head;
                }
                // Safety: lanes live as long as the queue
                let producer = unsafe { &*cursor };
                cursor = producer.next.load(Ordering::Acquire);

                if producer.len.load(Ordering::Acquire) > 0 {
                    observed += 1;

                    if sampled < SAMPLED_PRODUCERS {
                        sampled += 1;
                        if let Some(value) = producer.try_dequeue() {
                            self.len.fetch_sub(1, Ordering::Relaxed);
                            return Some(value);
                        }
                    }
                }
            }

            if observed == 0 {
                return None;
            }

            // items exist but every sampled lane raced empty; go around
            backoff.spin();
        }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn home_producer(&self) -> &Producer<T> {
        let tid = tid_cache::current_thread_id();

        let slot = match self.local.get(tid) {
            Some(slot) => slot,
            None => {
                self.local.set(tid, Cell::new(ptr::null_mut()));
                self.local.get(tid).expect("slot was just claimed")
            }
        };

        if slot.get().is_null() {
            slot.set(self.link_producer());
        }

        // Safety: lanes live as long as the queue
        unsafe { &*slot.get() }
    }

    /// Allocates a fresh lane and links it into the producer list.
    fn link_producer(&self) -> *mut Producer<T> {
        let sentinel = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: core::mem::MaybeUninit::uninit(),
        }));

        let producer = Box::into_raw(Box::new(Producer {
            head: CachePadded(AtomicPtr::new(sentinel)),
            tail: CachePadded(AtomicPtr::new(sentinel)),
            len: AtomicIsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            hazard: HazardDomain::new(),
        }));

        let mut head = self.producers.load(Ordering::Relaxed);
        loop {
            // Safety: just allocated, not yet shared
            unsafe { (*producer).next.store(head, Ordering::Relaxed) };
            match self.producers.compare_exchange_weak(
                head,
                producer,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let count = self.producer_count.fetch_add(1, Ordering::Release) + 1;
        tracing::trace!(lanes = count, "producer lane created");

        producer
    }
}

impl<T: Copy> Drop for ShardedQueue<T> {
    fn drop(&mut self) {
        let mut cursor = *self.producers.get_mut();
        while !cursor.is_null() {
            // Safety: `&mut self` means no operation is in flight; every
            // lane, node and hazard domain is exclusively ours
            unsafe {
                let producer = Box::from_raw(cursor);
                cursor = producer.next.load(Ordering::Relaxed);

                let mut node = producer.head.load(Ordering::Relaxed);
                while !node.is_null() {
                    let owned = Box::from_raw(node);
                    node = owned.next.load(Ordering::Relaxed);
                }
            }
        }
    }
}

impl<T: Copy> fmt::Debug for ShardedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedQueue")
            .field("producers", &self.producer_count.load(Ordering::Relaxed))
            .field("len", &self.len())
            .finish()
    }
}

// Safety: lanes and nodes are shared only through atomics and reclaimed
// through the hazard protocol; values are `Copy` and cross threads by
// value.
unsafe impl<T: Copy + Send> Send for ShardedQueue<T> {}
// Safety: see above
unsafe impl<T: Copy + Send> Sync for ShardedQueue<T> {}

// === impl Producer ===

impl<T: Copy> Producer<T> {
    fn enqueue(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: core::mem::MaybeUninit::new(value),
        }));

        let guard = self.hazard.acquire();
        let mut backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            guard.protect(0, tail);
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            // Safety: `tail` is protected by the hazard above and was
            // re-validated after publication
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if !next.is_null() {
                // another enqueue won but has not swung the tail yet; help
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }

            // Safety: still protected
            if unsafe {
                (*tail)
                    .next
                    .compare_exchange(
                        ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            } {
                let _ = self.tail.compare_exchange(
                    tail,
                    node,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                break;
            }

            backoff.spin();
        }

        self.len.fetch_add(1, Ordering::Release);
    }

    fn try_dequeue(&self) -> Option<T> {
        let guard = self.hazard.acquire();

        loop {
            let head = self.head.load(Ordering::Acquire);
            guard.protect(0, head);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            let tail = self.tail.load(Ordering::Acquire);
            // Safety: `head` is protected and re-validated
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            guard.protect(1, next);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if next.is_null() {
                return None;
            }

            if head == tail {
                // tail is lagging behind the real last node; help it along
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }

            // Read the value before competing for the head: the winner
            // keeps its copy, losers discard theirs (T: Copy).
            //
            // Safety: `next` is protected by hazard slot 1 and is not the
            // sentinel (it hangs off the sentinel), so its value is
            // initialized
            let value = unsafe { (*next).value.assume_init() };

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Release);
                // Safety: the old sentinel is unlinked; nobody can newly
                // reach it, and the hazard scan defers the actual free
                unsafe { guard.retire(head) };
                return Some(value);
            }
        }
    }
}
