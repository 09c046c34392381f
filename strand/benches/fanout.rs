// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use strand::Settings;

const TASKS: u64 = 64;

fn fanout_entry() {
    for _ in 0..100 {
        let promises: Vec<_> = (0..TASKS)
            .map(|i| strand::submit(move || black_box(i) + 1))
            .collect();

        for promise in promises {
            black_box(strand::wait(promise));
        }
    }

    strand::stop();
}

/// Full lifecycle: init, 100 rounds of 64-task fan-out/fan-in on two
/// workers, shutdown.
fn fanout(c: &mut Criterion) {
    let settings = Settings {
        threads_count: 2,
        jobs_capacity: TASKS as usize * 2,
        stack_size: 64 * 1024,
    };

    c.bench_function("fanout_6400_tasks", |b| {
        b.iter(|| {
            strand::init(fanout_entry, settings).unwrap();
            strand::shutdown();
        });
    });
}

criterion_group!(benches, fanout);
criterion_main!(benches);
