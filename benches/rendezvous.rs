//! Throughput of the unbuffered rendezvous channel against `crossbeam-channel`'s
//! bounded(0) channel, the closest apples-to-apples comparison in that crate.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fibra::sync::channel;
use fibra::Scheduler;

const MESSAGES: usize = 10_000;

fn bench_fibra_rendezvous(c: &mut Criterion) {
    let mut group = c.benchmark_group("rendezvous_ping_pong");
    group.bench_with_input(BenchmarkId::new("fibra", MESSAGES), &MESSAGES, |b, &n| {
        b.iter(|| {
            let scheduler = Scheduler::new();
            let (tx, rx) = channel::<usize>();
            scheduler
                .spawn(move || {
                    for i in 0..n {
                        tx.send(i).unwrap();
                    }
                })
                .unwrap();
            let received = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let received_in_consumer = received.clone();
            scheduler
                .spawn(move || {
                    for _ in 0..n {
                        rx.recv().unwrap();
                        received_in_consumer.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                })
                .unwrap();
            scheduler.run();
        });
    });

    group.bench_with_input(
        BenchmarkId::new("crossbeam_channel", MESSAGES),
        &MESSAGES,
        |b, &n| {
            b.iter(|| {
                let (tx, rx) = crossbeam_channel::bounded::<usize>(0);
                let producer = std::thread::spawn(move || {
                    for i in 0..n {
                        tx.send(i).unwrap();
                    }
                });
                for _ in 0..n {
                    rx.recv().unwrap();
                }
                producer.join().unwrap();
            });
        },
    );

    group.finish();
}

criterion_group!(benches, bench_fibra_rendezvous);
criterion_main!(benches);
