//! Cost of spawning and running a batch of trivial fibers through one
//! `Scheduler`, against spawning the same count of trivial OS threads
//! (split across the machine's core count) as a rough scale reference.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fibra::{fiber, Scheduler};

const FIBERS: usize = 1_000;

fn bench_fiber_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_and_run");

    group.bench_with_input(BenchmarkId::new("fibra_fibers", FIBERS), &FIBERS, |b, &n| {
        b.iter(|| {
            let scheduler = Scheduler::new();
            scheduler
                .spawn(move || {
                    let handles: Vec<_> = (0..n - 1).map(|i| fiber::spawn(move || i * 2)).collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                })
                .unwrap();
            scheduler.run();
        });
    });

    group.bench_with_input(
        BenchmarkId::new("os_threads_per_core_batch", FIBERS),
        &FIBERS,
        |b, &n| {
            let cores = num_cpus::get().max(1);
            b.iter(|| {
                for batch_start in (0..n).step_by(cores) {
                    let batch_end = (batch_start + cores).min(n);
                    let handles: Vec<_> = (batch_start..batch_end)
                        .map(|i| std::thread::spawn(move || i * 2))
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                }
            });
        },
    );

    group.finish();
}

criterion_group!(benches, bench_fiber_spawn);
criterion_main!(benches);
