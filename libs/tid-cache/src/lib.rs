// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity, lock-free cache of per-thread values, keyed by OS
//! thread id.
//!
//! This is the storage primitive behind everything in the runtime that
//! needs "one slot per OS thread" without `thread_local!`'s `'static`
//! restriction: the current-task pointer, a thread's home producer queue,
//! and the task allocator's free lists all live in one of these.
//!
//! The table is open-addressed with linear probing. A slot's key is claimed
//! exactly once per thread with a CAS and is never released; after that
//! only the slot's *value* changes, and only the owning thread ever touches
//! it. Lookups are therefore wait-free and return references that stay
//! valid for the cache's whole lifetime.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

/// Sentinel for an unclaimed slot. No real thread id takes this value.
const EMPTY: u32 = u32::MAX;

pub struct TidCache<V> {
    slots: Box<[Slot<V>]>,
    mask: usize,
}

struct Slot<V> {
    key: AtomicU32,
    value: UnsafeCell<MaybeUninit<V>>,
}

// === impl TidCache ===

impl<V> TidCache<V> {
    /// Creates a cache with room for at least `capacity` threads.
    ///
    /// The capacity is rounded up to a power of two. Filling every slot is
    /// fatal (see [`TidCache::set`]), so callers size this to a multiple of
    /// the expected thread count.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();

        let slots = (0..capacity)
            .map(|_| Slot {
                key: AtomicU32::new(EMPTY),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            slots,
            mask: capacity - 1,
        }
    }

    /// Claims a slot for `tid` and stores `value` in it.
    ///
    /// # Panics
    ///
    /// Panics if every slot is already claimed; running out of thread slots
    /// means the cache was sized wrong and the runtime cannot continue.
    pub fn set(&self, tid: u32, value: V) {
        assert_ne!(tid, EMPTY);

        let start = hash(tid) as usize & self.mask;

        for i in 0..self.slots.len() {
            let slot = &self.slots[(start + i) & self.mask];

            debug_assert_ne!(
                slot.key.load(Ordering::Relaxed),
                tid,
                "thread {tid} claimed two slots"
            );

            if slot
                .key
                .compare_exchange(EMPTY, tid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: the CAS above made this thread the slot's owner;
                // no other thread reads or writes the value of a slot it
                // does not own.
                unsafe { (*slot.value.get()).write(value) };
                return;
            }
        }

        panic!("thread cache exhausted ({} slots)", self.slots.len());
    }

    /// Replaces the value in `tid`'s already-claimed slot.
    ///
    /// Returns `false` when the thread never claimed a slot. Must only be
    /// called from the thread that owns the slot.
    pub fn update(&self, tid: u32, value: V) -> bool {
        match self.probe(tid) {
            Some(slot) => {
                // Safety: slots are updated only by their owning thread, so
                // this is the only live access to the value.
                unsafe {
                    (*slot.value.get()).assume_init_drop();
                    (*slot.value.get()).write(value);
                }
                true
            }
            None => false,
        }
    }

    /// Returns a reference to `tid`'s value, valid for the cache's
    /// lifetime.
    pub fn get(&self, tid: u32) -> Option<&V> {
        // Safety: the slot's key was claimed before its value was written
        // by the owning thread, and lookups for `tid` run on that same
        // thread, so the value is initialized and not being mutated.
        self.probe(tid)
            .map(|slot| unsafe { (*slot.value.get()).assume_init_ref() })
    }

    fn probe(&self, tid: u32) -> Option<&Slot<V>> {
        assert_ne!(tid, EMPTY);

        let start = hash(tid) as usize & self.mask;

        for i in 0..self.slots.len() {
            let slot = &self.slots[(start + i) & self.mask];

            match slot.key.load(Ordering::Acquire) {
                key if key == tid => return Some(slot),
                EMPTY => return None,
                _ => {}
            }
        }

        None
    }
}

impl<V> Drop for TidCache<V> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if slot.key.load(Ordering::Relaxed) != EMPTY {
                // Safety: a claimed slot always holds an initialized value,
                // and `&mut self` means no thread is still using it.
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}

impl<V> fmt::Debug for TidCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let claimed = self
            .slots
            .iter()
            .filter(|s| s.key.load(Ordering::Relaxed) != EMPTY)
            .count();
        f.debug_struct("TidCache")
            .field("capacity", &self.slots.len())
            .field("claimed", &claimed)
            .finish()
    }
}

// Safety: the key word is atomic and a slot's value is only ever accessed
// by the thread that claimed the slot, so sharing the table is sound as
// long as values can be dropped on another thread.
unsafe impl<V: Send> Send for TidCache<V> {}
// Safety: see above
unsafe impl<V: Send> Sync for TidCache<V> {}

/// 32-bit avalanche mix (the murmur3 finalizer); thread ids are often
/// consecutive and would otherwise pile into neighboring slots.
#[inline]
fn hash(mut key: u32) -> u32 {
    key ^= key >> 16;
    key = key.wrapping_mul(0x85eb_ca6b);
    key ^= key >> 13;
    key = key.wrapping_mul(0xc2b2_ae35);
    key ^= key >> 16;
    key
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Returns a stable 32-bit id for the calling OS thread.
        pub fn current_thread_id() -> u32 {
            // Safety: gettid has no failure modes
            let tid = unsafe { libc::gettid() };
            // kernel tids are positive
            tid.unsigned_abs()
        }
    } else {
        /// Returns a stable 32-bit id for the calling OS thread.
        ///
        /// Without a cheap native tid query, ids are handed out from a
        /// process-wide counter on first use.
        pub fn current_thread_id() -> u32 {
            static NEXT: AtomicU32 = AtomicU32::new(0);
            std::thread_local! {
                static TID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
            }
            TID.with(|tid| *tid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_get_update() {
        let cache = TidCache::with_capacity(8);
        let tid = current_thread_id();

        assert!(cache.get(tid).is_none());

        cache.set(tid, 17_usize);
        assert_eq!(cache.get(tid), Some(&17));

        assert!(cache.update(tid, 42));
        assert_eq!(cache.get(tid), Some(&42));
    }

    #[test]
    fn references_are_stable() {
        let cache = TidCache::with_capacity(8);
        let tid = current_thread_id();

        cache.set(tid, 1_u64);
        let first = core::ptr::from_ref(cache.get(tid).unwrap());
        let second = core::ptr::from_ref(cache.get(tid).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "thread cache exhausted")]
    fn full_table_is_fatal() {
        // single-threaded stand-in: claim every slot with distinct keys
        let cache = TidCache::with_capacity(2);
        cache.set(1, ());
        cache.set(2, ());
        cache.set(3, ());
    }

    #[test]
    fn each_thread_owns_its_slot() {
        const THREADS: usize = 16;

        let cache = Arc::new(TidCache::with_capacity(THREADS * 2));
        let hits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = cache.clone();
                let hits = hits.clone();
                std::thread::spawn(move || {
                    let tid = current_thread_id();
                    cache.set(tid, tid as u64);
                    if cache.get(tid) == Some(&(tid as u64)) {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), THREADS);
    }

    #[test]
    fn drops_claimed_values() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let cache = TidCache::with_capacity(4);
        cache.set(1, Tracked(drops.clone()));
        cache.set(2, Tracked(drops.clone()));
        drop(cache);

        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
