//! Benchmarks for replication and partition walks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distmem::prelude::*;
use distmem::repl_for_each_mut;

fn bench_replicated_value_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("replicated_value_set");

    for partitions in [2, 8, 32].iter() {
        group.throughput(Throughput::Elements(*partitions as u64));

        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            partitions,
            |b, &partitions| {
                let machine = Machine::with_partitions(partitions).unwrap();
                let mut value = ReplicatedValue::new(&machine, 0u64);

                b.iter(|| value.set(black_box(7)));
            },
        );
    }

    group.finish();
}

fn bench_replica_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("replica_construction");
    let machine = Machine::with_partitions(16).unwrap();

    group.bench_function("shallow", |b| {
        b.iter(|| ShallowReplica::new_trivial(&machine, black_box([0u64; 8])));
    });

    group.bench_function("deep", |b| {
        b.iter(|| DeepReplica::new(&machine, || vec![0u64; black_box(8)]));
    });

    group.finish();
}

fn bench_walk_grain(c: &mut Criterion) {
    let mut group = c.benchmark_group("walk_grain");
    let machine = Machine::with_partitions(32).unwrap();
    let mut replica = ShallowReplica::new_trivial(&machine, 0u64);

    group.bench_function("sequential", |b| {
        b.iter(|| repl_for_each_mut(&mut replica, ExecutionPolicy::Sequential, |x| *x += 1));
    });

    for grain in [1, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::new("parallel", grain), grain, |b, &grain| {
            let policy = ExecutionPolicy::parallel(grain);
            b.iter(|| repl_for_each_mut(&mut replica, policy, |x| *x += 1));
        });
    }

    group.finish();
}

fn bench_striped_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("striped_apply");
    let size = 1 << 16;
    group.throughput(Throughput::Elements(size as u64));

    for partitions in [1, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            partitions,
            |b, &partitions| {
                let machine = Machine::with_partitions(partitions).unwrap();
                let mut array = StripedArray::<i64>::with_len(&machine, size);

                b.iter(|| array.apply_local(ExecutionPolicy::parallel(1), |i, x| *x = i as i64));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_replicated_value_set,
    bench_replica_construction,
    bench_walk_grain,
    bench_striped_apply
);

criterion_main!(benches);
