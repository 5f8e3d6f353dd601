//! Ring buffer benchmarks
//!
//! Measures uncontended and contended push/pop on the MPMC and
//! ordered MPSC queues.
//!
//! Performance targets:
//! - MPMC push/pop (uncontended): < 30ns
//! - Ordered MPSC push (single producer): < 40ns
//! - pop_each batch of 64: < 1μs
//!
//! Run with: cargo bench --bench queue_bench

use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rivulet_core::queue::{Mpmc, OrderedMpsc};

fn bench_mpmc_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc_uncontended");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_pop", |b| {
        let queue: Mpmc<u64> = Mpmc::new(1024);
        b.iter(|| {
            queue.push(black_box(42)).unwrap();
            black_box(queue.pop());
        });
    });

    group.bench_function("pop_each_64", |b| {
        let queue: Mpmc<u64> = Mpmc::new(1024);
        b.iter(|| {
            for i in 0..64 {
                queue.push(i).unwrap();
            }
            let mut sum = 0u64;
            queue.pop_each(64, |v| {
                sum += v;
                true
            });
            black_box(sum);
        });
    });

    group.finish();
}

fn bench_mpsc_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_mpsc");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_pop", |b| {
        let queue: OrderedMpsc<u64> = OrderedMpsc::new(1024);
        b.iter(|| {
            queue.push(black_box(42)).unwrap();
            black_box(queue.pop());
        });
    });

    group.finish();
}

fn bench_mpmc_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc_contended");

    for producers in [2usize, 4] {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let queue: Arc<Mpmc<u64>> = Arc::new(Mpmc::new(1024));
                    let per_producer = 10_000 / producers as u64;

                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            let queue = Arc::clone(&queue);
                            thread::spawn(move || {
                                for i in 0..per_producer {
                                    while queue.push(i).is_err() {
                                        thread::yield_now();
                                    }
                                }
                            })
                        })
                        .collect();

                    let mut popped = 0u64;
                    let total = per_producer * producers as u64;
                    while popped < total {
                        popped += queue.pop_each(64, |v| {
                            black_box(v);
                            true
                        }) as u64;
                    }

                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mpmc_uncontended,
    bench_mpsc_push,
    bench_mpmc_contended
);
criterion_main!(benches);
