//! Deferred reductions
//!
//! A [`Reducer`] is a cheap per-task accumulator. Cloning one produces a
//! child view that starts at the monoid identity; every update touches only
//! the view's own value. When a child is dropped it folds its value into the
//! shared accumulator of the reducer it descends from, with a single
//! concurrency-safe combine. The root therefore pays one atomic operation
//! per child rather than one per update.
//!
//! Shared accumulators live in a [`ReductionArena`]: one slot table per
//! partition, each behind a partition-local [`SpinMutex`]. Reducers refer
//! to their fold target by [`SlotHandle`] and borrow the arena, so a fold
//! can never outlive the storage it writes to. Slots are not reused while
//! the arena is alive.
//!
//! ```
//! use distmem::prelude::*;
//!
//! let machine = Machine::with_partitions(4).unwrap();
//! let arena = ReductionArena::<OpAdd<i64>>::new(&machine);
//! let root = Reducer::new(&arena);
//!
//! crossbeam::scope(|scope| {
//!     for delta in [10, 20, 30] {
//!         let mut view = root.clone();
//!         scope.spawn(move |_| view += delta);
//!     }
//! })
//! .unwrap();
//!
//! assert_eq!(root.get_value(), 60);
//! ```

use crate::atomic::{AtomicF32, AtomicF64, RemoteAdd};
use crate::machine::Machine;
use crate::mutex::SpinMutex;
use crate::partition::PartitionId;
use crate::shallow::{Shallow, ShallowCopy, ShallowReplica};
use crate::walk::repl_reduce;
use crossbeam::utils::CachePadded;
use std::fmt;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicU16, AtomicU32, AtomicU64,
    AtomicU8, AtomicUsize, Ordering,
};
use std::sync::Arc;

/// An identity and an associative combine, with a shared form
pub trait Monoid: 'static {
    /// Accumulated value
    type Value: Copy + Send + Sync;

    /// Storage that can be combined into concurrently
    type Shared: Send + Sync;

    /// Neutral element of `combine`
    fn identity() -> Self::Value;

    /// Combine two plain values
    fn combine(a: Self::Value, b: Self::Value) -> Self::Value;

    /// Shared storage holding `value`
    fn new_shared(value: Self::Value) -> Self::Shared;

    /// Current value of shared storage
    fn load_shared(shared: &Self::Shared) -> Self::Value;

    /// Combine `value` into `target`, safe under concurrent callers
    fn combine_shared(target: &Self::Shared, value: Self::Value);
}

/// Summation
pub struct OpAdd<T>(PhantomData<fn() -> T>);

/// Maximum
pub struct OpMax<T>(PhantomData<fn() -> T>);

/// Minimum
pub struct OpMin<T>(PhantomData<fn() -> T>);

macro_rules! int_monoids {
    ($($int:ty => $atomic:ty),* $(,)?) => {
        $(
            impl Monoid for OpAdd<$int> {
                type Value = $int;
                type Shared = $atomic;

                fn identity() -> $int {
                    0
                }

                fn combine(a: $int, b: $int) -> $int {
                    a.wrapping_add(b)
                }

                fn new_shared(value: $int) -> $atomic {
                    <$atomic as RemoteAdd>::with_value(value)
                }

                fn load_shared(shared: &$atomic) -> $int {
                    shared.load_value()
                }

                fn combine_shared(target: &$atomic, value: $int) {
                    target.remote_add(value);
                }
            }

            impl Monoid for OpMax<$int> {
                type Value = $int;
                type Shared = $atomic;

                fn identity() -> $int {
                    <$int>::MIN
                }

                fn combine(a: $int, b: $int) -> $int {
                    a.max(b)
                }

                fn new_shared(value: $int) -> $atomic {
                    <$atomic>::new(value)
                }

                fn load_shared(shared: &$atomic) -> $int {
                    shared.load(Ordering::Acquire)
                }

                fn combine_shared(target: &$atomic, value: $int) {
                    target.fetch_max(value, Ordering::AcqRel);
                }
            }

            impl Monoid for OpMin<$int> {
                type Value = $int;
                type Shared = $atomic;

                fn identity() -> $int {
                    <$int>::MAX
                }

                fn combine(a: $int, b: $int) -> $int {
                    a.min(b)
                }

                fn new_shared(value: $int) -> $atomic {
                    <$atomic>::new(value)
                }

                fn load_shared(shared: &$atomic) -> $int {
                    shared.load(Ordering::Acquire)
                }

                fn combine_shared(target: &$atomic, value: $int) {
                    target.fetch_min(value, Ordering::AcqRel);
                }
            }

            impl Reducer<'_, OpAdd<$int>> {
                /// Add one to the local value
                pub fn increment(&mut self) {
                    self.local = self.local.wrapping_add(1);
                }
            }

            impl AddAssign<$int> for Reducer<'_, OpAdd<$int>> {
                fn add_assign(&mut self, rhs: $int) {
                    self.update(rhs);
                }
            }
        )*
    };
}

int_monoids!(
    i8 => AtomicI8,
    i16 => AtomicI16,
    i32 => AtomicI32,
    i64 => AtomicI64,
    isize => AtomicIsize,
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    usize => AtomicUsize,
);

macro_rules! float_add {
    ($($float:ty => $atomic:ty),* $(,)?) => {
        $(
            impl Monoid for OpAdd<$float> {
                type Value = $float;
                type Shared = $atomic;

                fn identity() -> $float {
                    0.0
                }

                fn combine(a: $float, b: $float) -> $float {
                    a + b
                }

                fn new_shared(value: $float) -> $atomic {
                    <$atomic>::new(value)
                }

                fn load_shared(shared: &$atomic) -> $float {
                    shared.load(Ordering::Acquire)
                }

                // no atomic float add; retry compare-and-swap
                fn combine_shared(target: &$atomic, value: $float) {
                    target.fetch_add(value);
                }
            }

            impl Reducer<'_, OpAdd<$float>> {
                /// Add one to the local value
                pub fn increment(&mut self) {
                    self.local += 1.0;
                }
            }

            impl AddAssign<$float> for Reducer<'_, OpAdd<$float>> {
                fn add_assign(&mut self, rhs: $float) {
                    self.update(rhs);
                }
            }
        )*
    };
}

float_add!(f32 => AtomicF32, f64 => AtomicF64);

const SLOTS_PER_CHUNK: usize = 32;

/// Location of a shared accumulator in a [`ReductionArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    partition: PartitionId,
    index: usize,
}

impl SlotHandle {
    /// Partition whose table holds the slot
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Index within that partition's table
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Append-only slots; chunks are never moved or freed once allocated
struct SlotTable<S> {
    chunks: Vec<Box<[CachePadded<S>]>>,
    len: usize,
}

/// Storage for the shared accumulators of a reduction tree
///
/// Slots are never reclaimed while the arena lives. Every
/// [`Reducer::new`] and every shallow copy of a reducer reserves one more
/// slot, and dropping the reducer does not give it back. Memory is released
/// only when the arena itself is dropped, so create one arena per reduction
/// rather than sharing a long-lived arena across many of them.
///
/// ```
/// use distmem::prelude::*;
///
/// let machine = Machine::with_partitions(2).unwrap();
/// let arena = ReductionArena::<OpAdd<u64>>::new(&machine);
///
/// let sum = Reducer::new(&arena);
/// let mut view = sum.clone();
/// view += 5;
/// drop(view);
/// assert_eq!(sum.get_value(), 5);
/// ```
pub struct ReductionArena<M: Monoid> {
    machine: Arc<Machine>,
    tables: Vec<CachePadded<SpinMutex<SlotTable<M::Shared>>>>,
    _monoid: PhantomData<fn() -> M>,
}

impl<M: Monoid> ReductionArena<M> {
    /// Create an arena with an empty slot table per partition
    pub fn new(machine: &Arc<Machine>) -> Self {
        let tables = (0..machine.partition_count())
            .map(|_| {
                CachePadded::new(SpinMutex::new(SlotTable {
                    chunks: Vec::new(),
                    len: 0,
                }))
            })
            .collect();

        Self {
            machine: Arc::clone(machine),
            tables,
            _monoid: PhantomData,
        }
    }

    /// Machine the arena serves
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Reserve a fresh slot, holding the identity, on `partition`
    pub fn alloc_slot(&self, partition: PartitionId) -> SlotHandle {
        let mut table = self.tables[partition].lock();
        if table.len == table.chunks.len() * SLOTS_PER_CHUNK {
            let chunk = (0..SLOTS_PER_CHUNK)
                .map(|_| CachePadded::new(M::new_shared(M::identity())))
                .collect();
            table.chunks.push(chunk);
        }
        let index = table.len;
        table.len += 1;

        tracing::trace!(partition, index, "reduction slot allocated");
        SlotHandle { partition, index }
    }

    /// Shared accumulator behind `handle`
    pub fn slot(&self, handle: SlotHandle) -> &M::Shared {
        let table = self.tables[handle.partition].lock();
        assert!(handle.index < table.len, "unknown reduction slot {:?}", handle);
        let chunk = &table.chunks[handle.index / SLOTS_PER_CHUNK];
        let slot: *const M::Shared = &*chunk[handle.index % SLOTS_PER_CHUNK];
        drop(table);
        // SAFETY: chunks are boxed and only ever appended, so the slot stays
        // put until the arena itself is dropped, which `&self` prevents.
        unsafe { &*slot }
    }

    /// Slots handed out on `partition`
    pub fn slots_in_use(&self, partition: PartitionId) -> usize {
        self.tables[partition].lock().len
    }
}

impl<M: Monoid> fmt::Debug for ReductionArena<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<usize> = (0..self.tables.len()).map(|p| self.slots_in_use(p)).collect();
        f.debug_struct("ReductionArena").field("slots", &slots).finish()
    }
}

/// Where a reducer's value ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Top of a tree; children fold into the slot
    Root(SlotHandle),
    /// Folds into the slot on drop
    Child(SlotHandle),
    /// Unconnected root made by a shallow copy; never folds
    Detached(SlotHandle),
}

/// A view onto a reduction
pub struct Reducer<'a, M: Monoid> {
    arena: &'a ReductionArena<M>,
    local: M::Value,
    role: Role,
}

impl<'a, M: Monoid> Reducer<'a, M> {
    /// A new root on the calling partition
    pub fn new(arena: &'a ReductionArena<M>) -> Self {
        let partition = arena.machine().current_partition();
        Self {
            arena,
            local: M::identity(),
            role: Role::Root(arena.alloc_slot(partition)),
        }
    }

    /// Combine `value` into the local value
    pub fn update(&mut self, value: M::Value) {
        self.local = M::combine(self.local, value);
    }

    /// The local value alone
    pub fn view(&self) -> M::Value {
        self.local
    }

    /// Whether this view folds into another accumulator when dropped
    pub fn is_child(&self) -> bool {
        matches!(self.role, Role::Child(_))
    }

    /// Slot this reducer's children fold into
    fn fold_target(&self) -> SlotHandle {
        match self.role {
            Role::Root(slot) | Role::Child(slot) | Role::Detached(slot) => slot,
        }
    }

    /// Final value of this reducer
    ///
    /// For a root this includes everything its children folded in, so it is
    /// only meaningful once every child has been dropped. For a child it is
    /// the local value.
    pub fn get_value(&self) -> M::Value {
        match self.role {
            Role::Root(slot) | Role::Detached(slot) => {
                M::combine(self.local, M::load_shared(self.arena.slot(slot)))
            }
            Role::Child(_) => self.local,
        }
    }
}

impl<M: Monoid> Clone for Reducer<'_, M> {
    /// A child starting at the identity, folding where `self`'s children do
    fn clone(&self) -> Self {
        Self {
            arena: self.arena,
            local: M::identity(),
            role: Role::Child(self.fold_target()),
        }
    }
}

impl<M: Monoid> ShallowCopy for Reducer<'_, M> {
    /// A detached root with a fresh slot on the destination partition
    unsafe fn shallow_copy(&self, tag: Shallow) -> Self {
        Self {
            arena: self.arena,
            local: M::identity(),
            role: Role::Detached(self.arena.alloc_slot(tag.dest)),
        }
    }
}

impl<M: Monoid> Drop for Reducer<'_, M> {
    fn drop(&mut self) {
        if let Role::Child(target) = self.role {
            M::combine_shared(self.arena.slot(target), self.local);
        }
    }
}

impl<M: Monoid> fmt::Debug for Reducer<'_, M>
where
    M::Value: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer")
            .field("local", &self.local)
            .field("role", &self.role)
            .finish()
    }
}

impl<M: Monoid> ShallowReplica<Reducer<'_, M>> {
    /// Fold every partition's reducer, left to right from partition 0
    pub fn get_value(&self) -> M::Value {
        repl_reduce(self, M::identity(), |acc, reducer| M::combine(acc, reducer.get_value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicated::Replicated;
    use crate::walk::{for_each_partition, ExecutionPolicy};

    #[test]
    fn test_views_fold_into_root() {
        let machine = Machine::with_partitions(2).unwrap();
        let arena = ReductionArena::<OpAdd<i64>>::new(&machine);
        let root = Reducer::new(&arena);

        {
            let mut a = root.clone();
            let mut b = root.clone();
            let mut c = root.clone();
            a += 10;
            b += 20;
            c += 30;
            assert!(a.is_child());
            assert_eq!(b.get_value(), 20);
        }

        assert_eq!(root.get_value(), 60);
    }

    #[test]
    fn test_root_local_updates_count() {
        let machine = Machine::with_partitions(1).unwrap();
        let arena = ReductionArena::<OpAdd<u32>>::new(&machine);
        let mut root = Reducer::new(&arena);

        root.increment();
        root += 4;
        drop(root.clone());
        assert_eq!(root.view(), 5);
        assert_eq!(root.get_value(), 5);
    }

    #[test]
    fn test_reduction_tree() {
        const N: usize = 4;
        const M: usize = 8;
        const K: usize = 500;

        let machine = Machine::with_partitions(4).unwrap();
        let arena = ReductionArena::<OpAdd<usize>>::new(&machine);
        let root = Reducer::new(&arena);

        crossbeam::scope(|scope| {
            for _ in 0..N {
                let parent = root.clone();
                scope.spawn(move |inner| {
                    for _ in 0..M {
                        let mut view = parent.clone();
                        inner.spawn(move |_| {
                            for _ in 0..K {
                                view.increment();
                            }
                        });
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(root.get_value(), N * M * K);
    }

    #[test]
    fn test_float_sum_never_drops_updates() {
        let machine = Machine::with_partitions(2).unwrap();
        let arena = ReductionArena::<OpAdd<f64>>::new(&machine);
        let root = Reducer::new(&arena);

        crossbeam::scope(|scope| {
            for _ in 0..16 {
                let root = &root;
                scope.spawn(move |_| {
                    for _ in 0..100 {
                        let mut view = root.clone();
                        view += 0.25;
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(root.get_value(), 400.0);
    }

    #[test]
    fn test_max_and_min() {
        let machine = Machine::with_partitions(2).unwrap();
        let max_arena = ReductionArena::<OpMax<i32>>::new(&machine);
        let min_arena = ReductionArena::<OpMin<i32>>::new(&machine);
        let max = Reducer::new(&max_arena);
        let min = Reducer::new(&min_arena);

        for value in [3, -7, 12, 0] {
            max.clone().update(value);
            min.clone().update(value);
        }

        assert_eq!(max.get_value(), 12);
        assert_eq!(min.get_value(), -7);
    }

    #[test]
    fn test_replicated_reducer_sums_partitions() {
        let machine = Machine::with_partitions(4).unwrap();
        let arena = ReductionArena::<OpAdd<u64>>::new(&machine);
        let sum = ShallowReplica::new(&machine, Reducer::new(&arena));

        for partition in 0..4 {
            assert_eq!(arena.slots_in_use(partition), 1);
        }
        assert!(!sum.get_nth(3).is_child());

        for_each_partition(&machine, ExecutionPolicy::parallel(1), |partition| {
            let mut view = sum.local().clone();
            view += partition as u64 + 1;
        });

        assert_eq!(sum.get_value(), 10);
    }

    #[test]
    fn test_detached_copy_does_not_fold() {
        let machine = Machine::with_partitions(2).unwrap();
        let arena = ReductionArena::<OpAdd<i64>>::new(&machine);
        let root = Reducer::new(&arena);

        let mut detached = unsafe { root.shallow_copy(Shallow { dest: 1 }) };
        detached += 5;
        let mut grandchild = detached.clone();
        grandchild += 2;
        drop(grandchild);

        assert_eq!(detached.get_value(), 7);
        std::mem::forget(detached);
        assert_eq!(root.get_value(), 0);
    }

    #[test]
    fn test_slots_are_not_reused() {
        let machine = Machine::with_partitions(1).unwrap();
        let arena = ReductionArena::<OpAdd<i8>>::new(&machine);

        let handles: Vec<SlotHandle> =
            (0..SLOTS_PER_CHUNK * 2 + 1).map(|_| arena.alloc_slot(0)).collect();
        assert_eq!(arena.slots_in_use(0), SLOTS_PER_CHUNK * 2 + 1);
        assert_eq!(handles.last().map(SlotHandle::index), Some(SLOTS_PER_CHUNK * 2));

        OpAdd::<i8>::combine_shared(arena.slot(handles[40]), 3);
        assert_eq!(OpAdd::<i8>::load_shared(arena.slot(handles[40])), 3);
        assert_eq!(OpAdd::<i8>::load_shared(arena.slot(handles[41])), 0);
    }

    #[test]
    fn test_dropped_reducers_keep_their_slots() {
        let machine = Machine::with_partitions(2).unwrap();
        let arena = ReductionArena::<OpAdd<u64>>::new(&machine);
        let partition = machine.current_partition();

        for round in 0..3 {
            let sum = Reducer::new(&arena);
            let mut view = sum.clone();
            view += 1;
            drop(view);
            assert_eq!(sum.get_value(), 1);
            assert_eq!(arena.slots_in_use(partition), round + 1);
        }

        assert_eq!(arena.slots_in_use(partition), 3);
    }
}
