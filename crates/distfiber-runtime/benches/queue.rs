//! Work queue and switch benchmarks
//!
//! - Single-threaded push/pop through one queue (node reuse, no allocation)
//! - Contended push from several producers with one draining consumer
//! - Yield round-trip between the root fiber and one spawned fiber
//!
//! Run: `cargo bench -p distfiber-runtime --bench queue`

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use distfiber_runtime::queue::{Node, Pop, WorkQueue};
use distfiber_runtime::{spawn, yield_now, Manager, Registry, RuntimeConfig};

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/push_pop");

    for &batch in &[1usize, 16, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let queue = WorkQueue::new();
            let mut nodes: Vec<Box<Node<u64>>> = (0..batch as u64).map(Node::with).collect();
            b.iter(|| {
                for node in nodes.drain(..) {
                    queue.push(node);
                }
                loop {
                    match queue.try_pop() {
                        Pop::Node(node) => nodes.push(node),
                        Pop::Empty => break,
                        Pop::Retry => continue,
                    }
                }
                black_box(nodes.len());
            });
        });
    }

    group.finish();
}

fn bench_contended_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/contended");
    const PER_PRODUCER: u64 = 10_000;

    for &producers in &[2usize, 4] {
        group.throughput(Throughput::Elements(PER_PRODUCER * producers as u64));
        group.bench_with_input(
            BenchmarkId::new("producers", producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let queue = Arc::new(WorkQueue::new());
                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            let queue = Arc::clone(&queue);
                            thread::spawn(move || {
                                for i in 0..PER_PRODUCER {
                                    queue.push(Node::with(i));
                                }
                            })
                        })
                        .collect();

                    let expected = PER_PRODUCER * producers as u64;
                    let mut seen = 0u64;
                    while seen < expected {
                        match queue.try_pop() {
                            Pop::Node(_) => seen += 1,
                            Pop::Empty | Pop::Retry => std::hint::spin_loop(),
                        }
                    }
                    for h in handles {
                        h.join().unwrap();
                    }
                    black_box(seen);
                });
            },
        );
    }

    group.finish();
}

fn bench_yield_round_trip(c: &mut Criterion) {
    let registry = Arc::new(
        Registry::new(RuntimeConfig::new().threads(1).idle_spins(0)).unwrap(),
    );
    Manager::bind(Arc::clone(&registry), 0, false).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let partner = {
        let stop = Arc::clone(&stop);
        spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                yield_now();
            }
        })
        .unwrap()
    };

    c.bench_function("switch/yield_round_trip", |b| {
        b.iter(|| yield_now());
    });

    stop.store(true, Ordering::Relaxed);
    partner.join().unwrap();
    Manager::unbind();
}

criterion_group!(queue_benches, bench_push_pop, bench_contended_push);
criterion_group!(switch_benches, bench_yield_round_trip);
criterion_main!(queue_benches, switch_benches);
