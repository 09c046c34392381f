// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduler scenarios.
//!
//! The runtime is a process-wide singleton, so every test takes the same
//! lock and runs a full init → entry → stop → shutdown cycle. Entry
//! functions are plain `fn()`s; scenario state goes through statics that
//! each test resets up front.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strand::Settings;

static LOCK: Mutex<()> = Mutex::new(());

fn run(entry: fn(), settings: Settings) {
    let _guard = LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    strand::init(entry, settings).unwrap();
    strand::shutdown();
}

fn settings(threads: usize) -> Settings {
    Settings {
        threads_count: threads,
        jobs_capacity: 64,
        stack_size: 64 * 1024,
    }
}

// === fan-out / fan-in ===

static FANOUT_OK: AtomicBool = AtomicBool::new(false);

fn fanout_entry() {
    const TASKS: u64 = 128;
    const ITERATIONS: usize = 200;

    for _ in 0..ITERATIONS {
        let promises: Vec<_> = (0..TASKS)
            .map(|i| strand::submit(move || i + 1))
            .collect();

        for (i, promise) in promises.into_iter().enumerate() {
            assert_eq!(strand::wait(promise), i as u64 + 1);
        }
    }

    FANOUT_OK.store(true, Ordering::SeqCst);
    strand::stop();
}

#[test]
fn fan_out_fan_in() {
    FANOUT_OK.store(false, Ordering::SeqCst);
    run(fanout_entry, settings(4));
    assert!(FANOUT_OK.load(Ordering::SeqCst));
}

// === chained wait ===

static CHAIN_OK: AtomicBool = AtomicBool::new(false);

fn chain_entry() {
    for _ in 0..100 {
        let promises: Vec<_> = (0..32_u64)
            .map(|i| {
                strand::submit(move || {
                    let inner = strand::submit(move || i + 1);
                    strand::wait(inner) + 2
                })
            })
            .collect();

        for (i, promise) in promises.into_iter().enumerate() {
            assert_eq!(strand::wait(promise), i as u64 + 3);
        }
    }

    CHAIN_OK.store(true, Ordering::SeqCst);
    strand::stop();
}

#[test]
fn chained_wait() {
    CHAIN_OK.store(false, Ordering::SeqCst);
    run(chain_entry, settings(4));
    assert!(CHAIN_OK.load(Ordering::SeqCst));
}

// === yield fairness on a single thread ===

static YIELD_COUNTER: AtomicUsize = AtomicUsize::new(0);
static YIELD_LAST: AtomicUsize = AtomicUsize::new(0);
static YIELD_RUN: AtomicUsize = AtomicUsize::new(0);
static YIELD_MAX_RUN: AtomicUsize = AtomicUsize::new(0);

fn yield_bump(id: usize) {
    // single worker thread: plain relaxed bookkeeping is race-free
    let run = if YIELD_LAST.swap(id, Ordering::Relaxed) == id {
        YIELD_RUN.fetch_add(1, Ordering::Relaxed) + 1
    } else {
        YIELD_RUN.store(1, Ordering::Relaxed);
        1
    };
    YIELD_MAX_RUN.fetch_max(run, Ordering::Relaxed);
    YIELD_COUNTER.fetch_add(1, Ordering::Relaxed);
}

fn yield_entry() {
    const INCREMENTS: usize = 1000;

    let looper = |id: usize| {
        move || {
            for _ in 0..INCREMENTS {
                yield_bump(id);
                strand::yield_now();
            }
        }
    };

    let first = strand::submit(looper(1));
    let second = strand::submit(looper(2));
    strand::wait(first);
    strand::wait(second);

    assert_eq!(YIELD_COUNTER.load(Ordering::Relaxed), 2 * INCREMENTS);
    // neither task may monopolize the worker between yields
    assert!(YIELD_MAX_RUN.load(Ordering::Relaxed) <= 10);

    strand::stop();
}

#[test]
fn yield_is_fair_on_one_thread() {
    YIELD_COUNTER.store(0, Ordering::SeqCst);
    YIELD_LAST.store(0, Ordering::SeqCst);
    YIELD_RUN.store(0, Ordering::SeqCst);
    YIELD_MAX_RUN.store(0, Ordering::SeqCst);

    run(yield_entry, settings(1));

    assert_eq!(YIELD_COUNTER.load(Ordering::SeqCst), 2000);
}

// === shutdown ===

static SHUTDOWN_EFFECT: AtomicBool = AtomicBool::new(false);

fn shutdown_entry() {
    let task = strand::submit(|| {
        SHUTDOWN_EFFECT.store(true, Ordering::SeqCst);
        7_u32
    });
    assert_eq!(strand::wait(task), 7);
    strand::stop();
}

#[test]
fn stop_winds_the_runtime_down() {
    SHUTDOWN_EFFECT.store(false, Ordering::SeqCst);
    run(shutdown_entry, settings(2));
    // the entry task's side effects are visible after init returns
    assert!(SHUTDOWN_EFFECT.load(Ordering::SeqCst));
}

#[test]
fn submit_outside_the_runtime_panics() {
    let _guard = LOCK.lock().unwrap_or_else(|poison| poison.into_inner());

    let result = std::panic::catch_unwind(|| {
        drop(strand::submit(|| ()));
    });
    assert!(result.is_err(), "submit must panic without a runtime");
}

// === waiter race ===

static RACE_OK: AtomicBool = AtomicBool::new(false);

fn race_entry() {
    for _ in 0..500 {
        // A usually finishes before B even starts, so set_waiter loses to
        // resolve about half the time; both outcomes must return 7
        let a = strand::submit(|| 7_u32);
        let b = strand::submit(move || strand::wait(a));
        assert_eq!(strand::wait(b), 7);
    }

    RACE_OK.store(true, Ordering::SeqCst);
    strand::stop();
}

#[test]
fn waiting_races_completion_without_loss() {
    RACE_OK.store(false, Ordering::SeqCst);
    run(race_entry, settings(4));
    assert!(RACE_OK.load(Ordering::SeqCst));
}

// === boundary: everything on the caller thread ===

static SINGLE_OK: AtomicBool = AtomicBool::new(false);

fn single_thread_entry() {
    let value = strand::submit(|| {
        strand::yield_now();
        41_u64 + 1
    });
    assert_eq!(strand::wait(value), 42);

    SINGLE_OK.store(true, Ordering::SeqCst);
    strand::stop();
}

#[test]
fn single_thread_still_round_trips() {
    SINGLE_OK.store(false, Ordering::SeqCst);
    run(single_thread_entry, settings(1));
    assert!(SINGLE_OK.load(Ordering::SeqCst));
}

// === boundary: minimal pre-warm, allocator falls through to the heap ===

static TINY_POOL_SUM: AtomicUsize = AtomicUsize::new(0);

fn tiny_pool_entry() {
    let promises: Vec<_> = (0..64_usize)
        .map(|i| strand::submit(move || i))
        .collect();

    let total: usize = promises.into_iter().map(strand::wait).sum();
    TINY_POOL_SUM.store(total, Ordering::SeqCst);

    strand::stop();
}

#[test]
fn jobs_capacity_of_one_overflows_to_heap() {
    TINY_POOL_SUM.store(0, Ordering::SeqCst);

    run(
        tiny_pool_entry,
        Settings {
            threads_count: 2,
            jobs_capacity: 1,
            stack_size: 64 * 1024,
        },
    );

    assert_eq!(TINY_POOL_SUM.load(Ordering::SeqCst), (0..64).sum());
}

// === promise clone (unit variant) ===

static CLONE_OK: AtomicBool = AtomicBool::new(false);

fn promise_clone_entry() {
    let done = strand::submit(|| ());
    let watcher = done.clone();

    strand::wait(done);
    // the clone shares only the reference count; by now the task resolved
    assert!(watcher.is_resolved());
    drop(watcher);

    CLONE_OK.store(true, Ordering::SeqCst);
    strand::stop();
}

#[test]
fn unit_promises_are_cloneable() {
    CLONE_OK.store(false, Ordering::SeqCst);
    run(promise_clone_entry, settings(2));
    assert!(CLONE_OK.load(Ordering::SeqCst));
}
