// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hazard pointers.
//!
//! A [`HazardDomain`] owns a list of records, each holding `K` hazard
//! slots and a thread-local list of retired nodes. Threads borrow a record
//! with [`HazardDomain::acquire`], publish the pointers they are about to
//! dereference with [`HazardGuard::protect`], and hand removed nodes to
//! [`HazardGuard::retire`]. Retired nodes are freed in batches by `scan`,
//! which snapshots every published hazard and frees exactly the retired
//! pointers that appear in no record's slots.
//!
//! The contract: once a pointer has been retired, a thread may only
//! dereference it if it published it as a hazard *before* the retiring
//! thread took its snapshot. Structures uphold this with the standard
//! publish-then-revalidate pattern (publish the pointer, re-read the shared
//! location it came from, retry if it changed).

use core::array;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::cell::UnsafeCell;

/// Floor for the retire-list length that triggers a scan.
const MIN_SCAN_THRESHOLD: usize = 16;

/// A reclamation domain for nodes of type `T`, with `K` hazard slots per
/// record.
///
/// Retired pointers must have been allocated with [`Box::new`]; the domain
/// frees them by reconstituting the box.
pub struct HazardDomain<T, const K: usize> {
    head: AtomicPtr<Record<T, K>>,
    records: AtomicUsize,
    _owns: PhantomData<fn(Box<T>)>,
}

struct Record<T, const K: usize> {
    next: AtomicPtr<Record<T, K>>,
    active: AtomicBool,
    slots: [AtomicPtr<T>; K],
    /// Owned by whichever thread holds (or CAS-locked) this record.
    retired: UnsafeCell<Vec<*mut T>>,
}

/// A borrowed hazard record. Dropping the guard clears the published slots
/// and returns the record to the domain.
pub struct HazardGuard<'domain, T, const K: usize> {
    domain: &'domain HazardDomain<T, K>,
    record: &'domain Record<T, K>,
}

// === impl HazardDomain ===

impl<T, const K: usize> HazardDomain<T, K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            records: AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    /// Borrows an inactive record, allocating and linking a fresh one when
    /// every existing record is in use.
    pub fn acquire(&self) -> HazardGuard<'_, T, K> {
        // reuse an inactive record if there is one
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // Safety: records are only unlinked by `Drop`, which has
            // exclusive access to the domain
            let record = unsafe { &*cursor };

            if record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return HazardGuard {
                    domain: self,
                    record,
                };
            }

            cursor = record.next.load(Ordering::Acquire);
        }

        // none free: link a new record at the head
        let record = Box::leak(Box::new(Record {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            slots: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            retired: UnsafeCell::new(Vec::new()),
        }));
        self.records.fetch_add(1, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            record.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                record,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        tracing::trace!(records = self.records.load(Ordering::Relaxed), "hazard record linked");

        HazardGuard {
            domain: self,
            record,
        }
    }

    /// Retire-list length at which a scan is worthwhile: scanning costs
    /// O(records · K), so amortize it over at least that many frees.
    fn scan_threshold(&self) -> usize {
        MIN_SCAN_THRESHOLD.max(2 * K * self.records.load(Ordering::Relaxed))
    }

    /// Snapshot every published hazard in the domain, sorted for binary
    /// search.
    fn hazard_snapshot(&self) -> Vec<*mut T> {
        let mut hazards = Vec::new();

        let mut cursor = self.head.load(Ordering::SeqCst);
        while !cursor.is_null() {
            // Safety: records live until the domain is dropped
            let record = unsafe { &*cursor };

            if record.active.load(Ordering::SeqCst) {
                for slot in &record.slots {
                    let ptr = slot.load(Ordering::SeqCst);
                    if !ptr.is_null() {
                        hazards.push(ptr);
                    }
                }
            }

            cursor = record.next.load(Ordering::Acquire);
        }

        hazards.sort_unstable();
        hazards
    }

    /// Frees every pointer in `record`'s retired list that no record
    /// currently publishes.
    ///
    /// # Safety
    ///
    /// The caller must own `record` (hold it active).
    unsafe fn scan(&self, record: &Record<T, K>) {
        let hazards = self.hazard_snapshot();

        // Safety: the retired list is owned by the caller per the contract
        let retired = unsafe { &mut *record.retired.get() };
        let before = retired.len();

        retired.retain(|&ptr| {
            if hazards.binary_search(&ptr).is_ok() {
                true
            } else {
                // Safety: retired pointers were Box-allocated and
                // unreachable, and no hazard protects this one
                drop(unsafe { Box::from_raw(ptr) });
                false
            }
        });

        tracing::trace!(freed = before - retired.len(), kept = retired.len(), "hazard scan");
    }

    /// Adopts the retired lists of records whose owning threads are gone
    /// (inactive records), so their garbage cannot linger forever.
    ///
    /// # Safety
    ///
    /// The caller must own `record`.
    unsafe fn help_scan(&self, record: &Record<T, K>) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // Safety: records live until the domain is dropped
            let other = unsafe { &*cursor };
            cursor = other.next.load(Ordering::Acquire);

            // lock the inactive record; failing just means someone is using it
            if other
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // Safety: the CAS above gives us ownership of `other`, and we
            // already own `record`
            unsafe {
                let adopted = &mut *other.retired.get();
                let mine = &mut *record.retired.get();

                mine.append(adopted);

                if mine.len() >= self.scan_threshold() {
                    self.scan(record);
                }
            }

            other.active.store(false, Ordering::Release);
        }
    }
}

impl<T, const K: usize> Default for HazardDomain<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const K: usize> Drop for HazardDomain<T, K> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // Safety: `&mut self` means no guards are alive; every record
            // and every retired pointer is exclusively ours
            unsafe {
                let record = Box::from_raw(cursor);
                cursor = record.next.load(Ordering::Relaxed);

                for &ptr in &*record.retired.get() {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    }
}

// Safety: all cross-thread state is atomic; the retired lists are owned by
// the record's holder per the active-flag protocol.
unsafe impl<T: Send, const K: usize> Send for HazardDomain<T, K> {}
// Safety: see above
unsafe impl<T: Send, const K: usize> Sync for HazardDomain<T, K> {}

// === impl HazardGuard ===

impl<T, const K: usize> HazardGuard<'_, T, K> {
    /// Publishes `ptr` in slot `index`.
    ///
    /// Publication alone proves nothing: callers must re-validate that the
    /// shared location still holds `ptr` after publishing, and retry when
    /// it does not.
    #[inline]
    pub fn protect(&self, index: usize, ptr: *mut T) {
        self.record.slots[index].store(ptr, Ordering::SeqCst);
    }

    /// Clears slot `index`.
    #[inline]
    pub fn clear(&self, index: usize) {
        self.record.slots[index].store(ptr::null_mut(), Ordering::SeqCst);
    }

    /// Hands a node to the domain for deferred freeing.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated with `Box::new`, must have been
    /// unlinked from the shared structure (no new readers can reach it),
    /// and must not be retired twice.
    pub unsafe fn retire(&self, ptr: *mut T) {
        // Safety: the retired list belongs to this guard's record
        let len = unsafe {
            let retired = &mut *self.record.retired.get();
            retired.push(ptr);
            retired.len()
        };

        if len >= self.domain.scan_threshold() {
            // Safety: we own the record
            unsafe {
                self.domain.scan(self.record);
                self.domain.help_scan(self.record);
            }
        }
    }
}

impl<T, const K: usize> Drop for HazardGuard<'_, T, K> {
    fn drop(&mut self) {
        for slot in &self.record.slots {
            slot.store(ptr::null_mut(), Ordering::SeqCst);
        }
        self.record.active.store(false, Ordering::Release);
    }
}
