//! Per-partition traversal
//!
//! Everything that touches every partition goes through
//! [`for_each_partition`]: replica broadcasts, array copies and striped
//! applies. A parallel walk is strict fork-join. It splits the partition
//! range at the midpoint, hands the upper half to a new task that first
//! migrates to the midpoint partition, recurses on the lower half itself,
//! and joins before returning.

use crate::machine::Machine;
use crate::partition::PartitionId;
use crate::replicated::{Replicated, ReplicatedMut};
use std::any::Any;
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// How a walk schedules its per-partition work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum ExecutionPolicy {
    /// One task visits partitions in increasing order without migrating
    Sequential,

    /// Recursive halving until a range holds at most `grain` partitions
    Parallel {
        /// Largest range run sequentially by one task
        grain: usize,
    },
}

impl ExecutionPolicy {
    /// Parallel policy with the given grain
    pub fn parallel(grain: usize) -> Self {
        ExecutionPolicy::Parallel { grain }
    }

    /// Grain of a parallel policy; `None` when sequential
    pub fn grain(&self) -> Option<usize> {
        match self {
            ExecutionPolicy::Sequential => None,
            ExecutionPolicy::Parallel { grain } => Some((*grain).max(1)),
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        ExecutionPolicy::Parallel { grain: 1 }
    }
}

/// Run `f` exactly once for every partition of `machine`
///
/// Returns after every invocation has completed. If any invocation panics
/// the panic is re-raised here once all spawned tasks have been joined.
pub fn for_each_partition<F>(machine: &Machine, policy: ExecutionPolicy, f: F)
where
    F: Fn(PartitionId) + Sync,
{
    for_each_partition_in(machine, 0..machine.partition_count(), policy, f)
}

/// Run `f` exactly once for every partition in `range`
pub fn for_each_partition_in<F>(
    machine: &Machine,
    range: Range<PartitionId>,
    policy: ExecutionPolicy,
    f: F,
) where
    F: Fn(PartitionId) + Sync,
{
    if range.is_empty() {
        return;
    }
    assert!(
        range.end <= machine.partition_count(),
        "partition range {:?} exceeds {} partitions",
        range,
        machine.partition_count()
    );

    match policy.grain() {
        None => range.for_each(&f),
        Some(grain) => machine.on_partition(range.start, || {
            divide(machine, range.start, range.end, grain, &f)
        }),
    }
}

fn divide<F>(machine: &Machine, lo: PartitionId, hi: PartitionId, grain: usize, f: &F)
where
    F: Fn(PartitionId) + Sync,
{
    if hi - lo <= grain {
        (lo..hi).for_each(f);
        return;
    }

    let mid = lo + (hi - lo) / 2;
    // A panic in the lower half unwinds out of the scope after the upper
    // half has been joined; a panic in the upper half comes back from join.
    let joined = crossbeam::scope(|scope| {
        machine.stats().spawns.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(lo = mid, hi, "spawn");
        let upper = scope.spawn(move |_| {
            machine.migrate_to(mid);
            divide(machine, mid, hi, grain, f);
        });
        divide(machine, lo, mid, grain, f);
        upper.join()
    });

    match joined {
        Ok(Ok(())) => {}
        Ok(Err(panic)) => std::panic::resume_unwind(panic),
        Err(panics) => std::panic::resume_unwind(first_panic(panics)),
    }
}

/// Unwrap the list of payloads a scope reports for unjoined tasks
fn first_panic(panics: Box<dyn Any + Send>) -> Box<dyn Any + Send> {
    match panics.downcast::<Vec<Box<dyn Any + Send>>>() {
        Ok(mut list) if !list.is_empty() => list.swap_remove(0),
        Ok(list) => list,
        Err(other) => other,
    }
}

/// Call `f` on every copy of a replicated object
pub fn repl_for_each<R, F>(obj: &R, policy: ExecutionPolicy, f: F)
where
    R: Replicated + Sync,
    F: Fn(&R::Target) + Sync,
{
    for_each_partition(obj.machine(), policy, |partition| f(obj.get_nth(partition)));
}

/// Raw pointer to one copy, shared with the task that owns that partition
struct CopyPtr<T>(*mut T);

// SAFETY: each pointer is dereferenced by exactly one task, the one
// visiting its partition.
unsafe impl<T: Send> Send for CopyPtr<T> {}
unsafe impl<T: Send> Sync for CopyPtr<T> {}

impl<T> CopyPtr<T> {
    fn get(&self) -> *mut T {
        self.0
    }
}

/// Call `f` with mutable access to every copy of a replicated object
pub fn repl_for_each_mut<R, F>(obj: &mut R, policy: ExecutionPolicy, f: F)
where
    R: ReplicatedMut,
    R::Target: Send,
    F: Fn(&mut R::Target) + Sync,
{
    let machine = Arc::clone(obj.machine());
    let copies: Vec<CopyPtr<R::Target>> = obj
        .copies_mut()
        .into_iter()
        .map(|copy| CopyPtr(copy as *mut R::Target))
        .collect();

    for_each_partition(&machine, policy, |partition| {
        // SAFETY: copies are distinct, `obj` is exclusively borrowed for the
        // whole walk, and the walk visits each partition once.
        f(unsafe { &mut *copies[partition].get() })
    });
}

/// Fold every copy left to right, starting from partition 0
pub fn repl_reduce<R, A, F>(obj: &R, init: A, mut fold: F) -> A
where
    R: Replicated,
    F: FnMut(A, &R::Target) -> A,
{
    (0..obj.machine().partition_count())
        .fold(init, |acc, partition| fold(acc, obj.get_nth(partition)))
}
