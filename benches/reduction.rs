//! Benchmarks for deferred reductions

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distmem::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

fn bench_reducer_vs_atomic(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_reduction");
    let threads = 4;
    let updates = 10_000u64;
    group.throughput(Throughput::Elements(threads * updates));

    let machine = Machine::with_partitions(threads as usize).unwrap();

    group.bench_function("reducer", |b| {
        b.iter(|| {
            let arena = ReductionArena::<OpAdd<u64>>::new(&machine);
            let root = Reducer::new(&arena);
            crossbeam::scope(|scope| {
                for _ in 0..threads {
                    let mut view = root.clone();
                    scope.spawn(move |_| {
                        for i in 0..updates {
                            view += black_box(i);
                        }
                    });
                }
            })
            .unwrap();
            root.get_value()
        });
    });

    group.bench_function("shared_atomic", |b| {
        b.iter(|| {
            let total = AtomicU64::new(0);
            crossbeam::scope(|scope| {
                for _ in 0..threads {
                    let total = &total;
                    scope.spawn(move |_| {
                        for i in 0..updates {
                            total.fetch_add(black_box(i), Ordering::AcqRel);
                        }
                    });
                }
            })
            .unwrap();
            total.load(Ordering::Acquire)
        });
    });

    group.finish();
}

fn bench_replicated_reducer(c: &mut Criterion) {
    let mut group = c.benchmark_group("replicated_reducer");

    for partitions in [2, 8, 16].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            partitions,
            |b, &partitions| {
                let machine = Machine::with_partitions(partitions).unwrap();

                b.iter(|| {
                    let arena = ReductionArena::<OpAdd<f64>>::new(&machine);
                    let sum = ShallowReplica::new(&machine, Reducer::new(&arena));
                    for_each_partition(&machine, ExecutionPolicy::parallel(1), |p| {
                        let mut view = sum.local().clone();
                        for _ in 0..100 {
                            view += black_box(p as f64);
                        }
                    });
                    sum.get_value()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_reducer_vs_atomic, bench_replicated_reducer);

criterion_main!(benches);
