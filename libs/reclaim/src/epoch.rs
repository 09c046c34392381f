// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Epoch-based garbage collection.
//!
//! A thread opens a [`Guard`] before touching the structure, which pins the
//! record's entry epoch. Retiring a node stamps it with the current global
//! epoch. The reclaimer bumps the global epoch, computes the minimum entry
//! epoch across all *active* records and frees exactly the retired nodes
//! stamped below that minimum: a guard opened at epoch `E` can only have
//! observed nodes retired at `>= E`, and those are never freed while the
//! guard lives because `min <= E`.
//!
//! Nodes come from [`EpochGc::alloc`], which recycles a small per-record
//! cache of freed bodies before going to the heap, so tight
//! allocate/retire loops mostly run allocation-free.

use core::mem::{ManuallyDrop, offset_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use tid_cache::TidCache;

/// Retired nodes a record accumulates before the amortized release runs.
const RELEASE_THRESHOLD: usize = 16;

/// Freed node bodies kept per record for quick reallocation.
const BODY_CACHE: usize = 8;

/// An epoch-based garbage collector for nodes embedding a `T`.
pub struct EpochGc<T> {
    global_epoch: AtomicU64,
    head: AtomicPtr<ThreadRecord<T>>,
    /// Thread → record it used last, so reacquisition is O(1).
    local: TidCache<Cell<*mut ThreadRecord<T>>>,
    /// The pre-sized record block; records allocated past it are owned by
    /// the list itself.
    seed: Box<[ThreadRecord<T>]>,
}

/// Per-thread reclamation state. A record is exclusively owned (fields in
/// `UnsafeCell` included) by whichever thread holds it `active`.
struct ThreadRecord<T> {
    next: AtomicPtr<ThreadRecord<T>>,
    active: AtomicBool,
    /// Live guards on this record; the last drop releases it.
    guards: AtomicU32,
    /// Global epoch at the time the current critical section opened; read
    /// by reclaiming threads, written by the owner.
    epoch: AtomicU64,
    retired: UnsafeCell<RetiredList<T>>,
}

struct RetiredList<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    len: usize,
    cache: *mut Node<T>,
    cache_len: usize,
}

/// One garbage-collected allocation: list link, retire stamp, body.
#[repr(C)]
struct Node<T> {
    next: *mut Node<T>,
    epoch: u64,
    data: ManuallyDrop<T>,
}

/// RAII pin on the collector. Cloning shares the underlying record; the
/// last clone to drop releases it (running an amortized collection).
///
/// Guards are not `Send`: a record's retired list belongs to the thread
/// that opened it.
pub struct Guard<'gc, T> {
    gc: &'gc EpochGc<T>,
    record: &'gc ThreadRecord<T>,
    _not_send: PhantomData<*mut ()>,
}

// === impl EpochGc ===

impl<T> EpochGc<T> {
    /// Creates a collector pre-sized for `records` concurrently pinned
    /// threads. More threads than that still work; their records are
    /// heap-allocated and linked on demand.
    #[must_use]
    pub fn with_capacity(records: usize) -> Self {
        let records = records.max(1);

        let seed: Box<[ThreadRecord<T>]> =
            (0..records).map(|_| ThreadRecord::new()).collect();

        // chain the seed block into the list
        for window in 0..records - 1 {
            let next = ptr::from_ref(&seed[window + 1]).cast_mut();
            seed[window].next.store(next, Ordering::Relaxed);
        }

        Self {
            global_epoch: AtomicU64::new(1),
            head: AtomicPtr::new(ptr::from_ref(&seed[0]).cast_mut()),
            local: TidCache::with_capacity(2 * records),
            seed,
        }
    }

    /// Pins the collector, returning a guard for this critical section.
    pub fn guard(&self) -> Guard<'_, T> {
        let record = self.acquire_record();
        record
            .epoch
            .store(self.global_epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        // the epoch publication must be ordered before any read of the
        // protected structure, and before the reclaimer's epoch bump
        core::sync::atomic::fence(Ordering::SeqCst);
        record.guards.fetch_add(1, Ordering::Relaxed);

        Guard {
            gc: self,
            record,
            _not_send: PhantomData,
        }
    }

    fn acquire_record(&self) -> &ThreadRecord<T> {
        let tid = tid_cache::current_thread_id();

        // the record this thread used last is almost always free
        if let Some(cached) = self.local.get(tid) {
            let record = cached.get();
            if !record.is_null() {
                // Safety: records are never deallocated while the gc lives
                let record = unsafe { &*record };
                if record
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return record;
                }
            }
        } else {
            self.local.set(tid, Cell::new(ptr::null_mut()));
        }

        // otherwise take any inactive record
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // Safety: records are never deallocated while the gc lives
            let record = unsafe { &*cursor };

            if record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.remember_record(tid, cursor);
                return record;
            }

            cursor = record.next.load(Ordering::Acquire);
        }

        // every record is pinned: grow the list
        let record = Box::leak(Box::new(ThreadRecord::new()));
        record.active.store(true, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            record.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                ptr::from_mut(record),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        tracing::trace!("epoch record list grown");
        self.remember_record(tid, ptr::from_mut(record));
        record
    }

    fn remember_record(&self, tid: u32, record: *mut ThreadRecord<T>) {
        if let Some(cached) = self.local.get(tid) {
            cached.set(record);
        }
    }

    /// Allocates a node embedding `value`, reusing a cached body when the
    /// guard's record has one.
    pub fn alloc(&self, guard: &Guard<'_, T>, value: T) -> NonNull<T> {
        // Safety: the guard owns its record's retired state
        let reused = unsafe {
            let retired = &mut *guard.record.retired.get();
            retired.pop_cached()
        };

        let node = match reused {
            Some(node) => {
                // Safety: cached bodies had their data dropped; the header
                // stays initialized
                unsafe {
                    (*node.as_ptr()).epoch = u64::MAX;
                    (*node.as_ptr()).next = ptr::null_mut();
                    ptr::write(&raw mut (*node.as_ptr()).data, ManuallyDrop::new(value));
                }
                node
            }
            None => NonNull::from(Box::leak(Box::new(Node {
                next: ptr::null_mut(),
                epoch: u64::MAX,
                data: ManuallyDrop::new(value),
            }))),
        };

        // Safety: `node` is valid and `data` is initialized
        unsafe { NonNull::new_unchecked(&raw mut (*node.as_ptr()).data).cast::<T>() }
    }

    /// The amortized reclaim: bump the epoch, then free this record's
    /// retired nodes that every active record has moved past.
    ///
    /// # Safety
    ///
    /// The caller must own `record`.
    unsafe fn release(&self, record: &ThreadRecord<T>, force: bool) {
        // Safety: ownership per the contract
        let retired = unsafe { &mut *record.retired.get() };

        if retired.len < RELEASE_THRESHOLD && !force {
            return;
        }

        self.global_epoch.fetch_add(1, Ordering::SeqCst);

        // The owner's section is over (last guard dropped, or the record is
        // lock-held by `flush`), so this record no longer pins anything:
        // move its entry epoch forward or it would block its own batch.
        record
            .epoch
            .store(self.global_epoch.load(Ordering::SeqCst), Ordering::SeqCst);

        let min_active = self.min_active_epoch();

        let mut freed = 0_usize;
        while !retired.head.is_null() {
            // Safety: list nodes are valid until freed here
            let node = unsafe { &mut *retired.head };
            if node.epoch >= min_active {
                break;
            }

            retired.head = node.next;
            if retired.head.is_null() {
                retired.tail = ptr::null_mut();
            }
            retired.len -= 1;
            freed += 1;

            // Safety: nothing can reach a node below the minimum active
            // epoch anymore
            unsafe {
                ManuallyDrop::drop(&mut node.data);

                if retired.cache_len < BODY_CACHE {
                    node.next = retired.cache;
                    node.epoch = u64::MAX;
                    retired.cache = node;
                    retired.cache_len += 1;
                } else {
                    drop(Box::from_raw(ptr::from_mut(node)));
                }
            }
        }

        if freed > 0 {
            tracing::trace!(freed, remaining = retired.len, "epoch release");
        }
    }

    fn min_active_epoch(&self) -> u64 {
        let mut min = u64::MAX;

        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // Safety: records are never deallocated while the gc lives
            let record = unsafe { &*cursor };

            if record.active.load(Ordering::Acquire) {
                let epoch = record.epoch.load(Ordering::Acquire);
                if epoch > 0 && epoch < min {
                    min = epoch;
                }
            }

            cursor = record.next.load(Ordering::Acquire);
        }

        min
    }

    /// Force-releases every record that is not currently pinned by some
    /// thread.
    pub fn flush(&self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // Safety: records are never deallocated while the gc lives
            let record = unsafe { &*cursor };
            cursor = record.next.load(Ordering::Acquire);

            if record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: the CAS gave us ownership
                unsafe { self.release(record, true) };
                record.active.store(false, Ordering::Release);
            }
        }
    }

    /// Current global epoch; exposed for tests and diagnostics.
    pub fn epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }
}

impl<T> Drop for EpochGc<T> {
    fn drop(&mut self) {
        let seed_range = self.seed.as_ptr_range();

        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // Safety: `&mut self` means no guards are alive anywhere
            unsafe {
                let record = &mut *cursor;
                let next = record.next.load(Ordering::Relaxed);

                let retired = record.retired.get_mut();

                // drop everything still waiting for reclamation
                let mut node = retired.head;
                while !node.is_null() {
                    let current = &mut *node;
                    node = current.next;
                    ManuallyDrop::drop(&mut current.data);
                    drop(Box::from_raw(ptr::from_mut(current)));
                }

                // cached bodies have no live data
                let mut node = retired.cache;
                while !node.is_null() {
                    let current = node;
                    node = (*current).next;
                    drop(Box::from_raw(current));
                }

                // records outside the seed block were heap-allocated
                if !seed_range.contains(&cursor.cast_const()) {
                    drop(Box::from_raw(cursor));
                }

                cursor = next;
            }
        }
    }
}

// Safety: cross-thread state (epoch, active, guards, links) is atomic;
// retired lists follow the active-flag ownership protocol.
unsafe impl<T: Send> Send for EpochGc<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for EpochGc<T> {}

// === impl ThreadRecord ===

impl<T> ThreadRecord<T> {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(false),
            guards: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            retired: UnsafeCell::new(RetiredList {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
                len: 0,
                cache: ptr::null_mut(),
                cache_len: 0,
            }),
        }
    }
}

// === impl RetiredList ===

impl<T> RetiredList<T> {
    fn push(&mut self, node: *mut Node<T>) {
        // Safety: the caller owns the record and `node` is unreachable to
        // other threads
        unsafe { (*node).next = ptr::null_mut() };

        if self.tail.is_null() {
            self.head = node;
        } else {
            // Safety: a non-null tail is a valid node
            unsafe { (*self.tail).next = node };
        }
        self.tail = node;
        self.len += 1;
    }

    fn pop_cached(&mut self) -> Option<NonNull<Node<T>>> {
        let node = NonNull::new(self.cache)?;
        // Safety: cache nodes are exclusively owned
        self.cache = unsafe { (*node.as_ptr()).next };
        self.cache_len -= 1;
        Some(node)
    }
}

// === impl Guard ===

impl<'gc, T> Guard<'gc, T> {
    /// Hands a pointer obtained from [`EpochGc::alloc`] back for deferred
    /// freeing.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`EpochGc::alloc`] on the same collector, must
    /// be unreachable to threads that pin *after* this call, and must not
    /// be retired twice.
    pub unsafe fn retire(&self, ptr: NonNull<T>) {
        // Safety: alloc hands out pointers to the `data` field of a `Node`
        let node = unsafe {
            ptr.as_ptr()
                .byte_sub(offset_of!(Node<T>, data))
                .cast::<Node<T>>()
        };

        // Safety: the node is ours again per the contract above
        unsafe {
            (*node).epoch = self.gc.global_epoch.load(Ordering::Acquire);
            (*self.record.retired.get()).push(node);
        }
    }

    /// The collector this guard pins.
    pub fn collector(&self) -> &'gc EpochGc<T> {
        self.gc
    }
}

impl<T> Clone for Guard<'_, T> {
    fn clone(&self) -> Self {
        self.record.guards.fetch_add(1, Ordering::Relaxed);
        Self {
            gc: self.gc,
            record: self.record,
            _not_send: PhantomData,
        }
    }
}

impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        if self.record.guards.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Safety: we are the last guard, so we own the record
            unsafe { self.gc.release(self.record, false) };
            self.record.active.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn retire_then_flush_frees() {
        let gc = EpochGc::<Tracked>::with_capacity(4);
        let drops = Arc::new(AtomicUsize::new(0));

        {
            let guard = gc.guard();
            let ptr = gc.alloc(&guard, Tracked(drops.clone()));
            // Safety: allocated above, retired once
            unsafe { guard.retire(ptr) };
        }

        // the guard is gone; a flush may now free the node
        gc.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_guard_pins_its_garbage() {
        let gc = EpochGc::<Tracked>::with_capacity(4);
        let drops = Arc::new(AtomicUsize::new(0));

        let pin = gc.guard();
        let ptr = gc.alloc(&pin, Tracked(drops.clone()));
        // Safety: allocated above, retired once
        unsafe { pin.retire(ptr) };

        // the pinned record blocks reclamation of its own batch
        gc.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(pin);
        gc.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_pin() {
        let gc = EpochGc::<Tracked>::with_capacity(4);
        let drops = Arc::new(AtomicUsize::new(0));

        let first = gc.guard();
        let second = first.clone();

        let ptr = gc.alloc(&first, Tracked(drops.clone()));
        // Safety: allocated above, retired once
        unsafe { first.retire(ptr) };

        drop(first);
        gc.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 0, "second guard still pins");

        drop(second);
        gc.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bodies_are_cached_for_reuse() {
        let gc = EpochGc::<u64>::with_capacity(2);

        let first = {
            let guard = gc.guard();
            let ptr = gc.alloc(&guard, 1);
            // Safety: allocated above, retired once
            unsafe { guard.retire(ptr) };
            ptr
        };

        gc.flush();

        let guard = gc.guard();
        let second = gc.alloc(&guard, 2);
        assert_eq!(first, second, "freed body should be recycled");
        // Safety: `second` is live until retired
        unsafe {
            assert_eq!(*second.as_ref(), 2);
            guard.retire(second);
        }
    }

    #[test]
    fn batches_free_once_threshold_is_reached() {
        let gc = EpochGc::<Tracked>::with_capacity(2);
        let drops = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 * RELEASE_THRESHOLD {
            let guard = gc.guard();
            let ptr = gc.alloc(&guard, Tracked(drops.clone()));
            // Safety: allocated above, retired once
            unsafe { guard.retire(ptr) };
        }

        // most of the garbage must have been collected along the way,
        // without any explicit flush
        assert!(drops.load(Ordering::SeqCst) >= 8 * RELEASE_THRESHOLD);
    }

    #[test]
    fn concurrent_churn_loses_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let gc = Arc::new(EpochGc::<Tracked>::with_capacity(THREADS));
        let drops = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let gc = gc.clone();
                let drops = drops.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let guard = gc.guard();
                        let ptr = gc.alloc(&guard, Tracked(drops.clone()));
                        // Safety: allocated above, retired once
                        unsafe { guard.retire(ptr) };
                        if i % 128 == 0 {
                            gc.flush();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        drop(Arc::into_inner(gc).unwrap());
        assert_eq!(drops.load(Ordering::SeqCst), THREADS * PER_THREAD);
    }
}
