//! Element-interleaved arrays
//!
//! A [`StripedArray<T>`] is one flat sequence whose element `i` lives on
//! partition `i % partitions`. Indexing is the same from every partition;
//! only the cost of the access changes.

use crate::alloc::StripedPtr;
use crate::error::Result;
use crate::machine::{out_of_memory, Machine};
use crate::partition::PartitionId;
use crate::replicated::{Replicated, ReplicatedValue};
use crate::shallow::{Shallow, ShallowCopy};
use crate::walk::{for_each_partition, ExecutionPolicy};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// A flat array striped round-robin over every partition
pub struct StripedArray<T: Copy> {
    ptr: ReplicatedValue<Option<StripedPtr<T>>>,
    n: ReplicatedValue<usize>,
}

/// Indices of `len` elements that live on `partition`
fn stripe(partition: PartitionId, partitions: usize, len: usize) -> impl Iterator<Item = usize> {
    (partition..len).step_by(partitions)
}

impl<T> StripedArray<T>
where
    T: Copy + Default + Send + Sync,
{
    /// Create an empty array
    pub fn new(machine: &Arc<Machine>) -> Self {
        Self {
            ptr: ReplicatedValue::new(machine, None),
            n: ReplicatedValue::new(machine, 0),
        }
    }

    /// Create an array of `len` default elements
    ///
    /// Aborts the process if the machine is out of memory.
    pub fn with_len(machine: &Arc<Machine>, len: usize) -> Self {
        Self::try_with_len(machine, len).unwrap_or_else(|err| out_of_memory(err))
    }

    /// Create an array of `len` default elements
    pub fn try_with_len(machine: &Arc<Machine>, len: usize) -> Result<Self> {
        let mut array = Self {
            ptr: ReplicatedValue::try_new(machine, None)?,
            n: ReplicatedValue::try_new(machine, 0)?,
        };
        array.ptr.set(Some(Self::allocate(machine, len, None)?));
        array.n.set(len);
        Ok(array)
    }

    /// Allocate `len` elements, copying `old` over the prefix
    ///
    /// Each partition's task fills only its own stripe.
    fn allocate(
        machine: &Arc<Machine>,
        len: usize,
        old: Option<StripedPtr<T>>,
    ) -> Result<StripedPtr<T>> {
        let ptr = machine.allocate_striped::<T>(len)?;
        let partitions = ptr.partitions();
        for_each_partition(machine, machine.default_policy(), |partition| {
            for i in stripe(partition, partitions, len) {
                let value = match old {
                    // SAFETY: `i` is below the old length, so initialized.
                    Some(src) if i < src.len() => unsafe { src.element(i).as_ptr().read() },
                    _ => T::default(),
                };
                // SAFETY: only this task writes partition `partition`.
                unsafe { ptr.element(i).as_ptr().write(value) };
            }
        });
        Ok(ptr)
    }

    /// Grow to `new_size` elements, preserving existing ones
    ///
    /// Does nothing when `new_size <= size()`.
    pub fn resize(&mut self, new_size: usize) {
        if new_size <= self.size() {
            return;
        }

        let machine = Arc::clone(self.machine());
        let ptr = Self::allocate(&machine, new_size, self.ptr.get())
            .unwrap_or_else(|err| out_of_memory(err));

        self.free_storage();
        self.ptr.set(Some(ptr));
        self.n.set(new_size);
    }

    /// Free the storage and reset the length to zero
    pub fn clear(&mut self) {
        self.free_storage();
        self.n.set(0);
    }

    fn free_storage(&mut self) {
        if let Some(ptr) = self.ptr.get() {
            if let Err(err) = self.machine().free(ptr.addr()) {
                tracing::error!(%err, "failed to free striped array");
            }
            self.ptr.set(None);
        }
    }

    /// Move the contents out, leaving an empty array behind
    pub fn take(&mut self) -> Self {
        let mut taken = Self::new(self.machine());
        self.swap(&mut taken);
        taken
    }

    /// Call `f(i, &mut self[i])` for every element
    ///
    /// Work is split by partition: the task for partition `p` migrates to
    /// `p` and touches only the elements stored there.
    pub fn apply_local<F>(&mut self, policy: ExecutionPolicy, f: F)
    where
        F: Fn(usize, &mut T) + Sync,
    {
        let Some(ptr) = self.ptr.get() else {
            return;
        };
        let machine = self.machine();
        let len = self.size();

        for_each_partition(machine, policy, |partition| {
            machine.on_partition(partition, || {
                for i in stripe(partition, ptr.partitions(), len) {
                    // SAFETY: `&mut self` excludes other access, and stripes
                    // of different partitions are disjoint.
                    f(i, unsafe { &mut *ptr.element(i).as_ptr() });
                }
            })
        });
    }
}

impl<T: Copy> StripedArray<T> {
    /// Machine the array is striped over
    pub fn machine(&self) -> &Arc<Machine> {
        self.n.machine()
    }

    /// Number of elements
    pub fn size(&self) -> usize {
        self.n.get()
    }

    /// Whether the array has no elements
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Exchange contents with `other`
    pub fn swap(&mut self, other: &mut Self) {
        self.ptr.swap(&mut other.ptr);
        self.n.swap(&mut other.n);
    }

    /// Partition holding element `index`
    pub fn partition_of(&self, index: usize) -> PartitionId {
        index % self.machine().partition_count()
    }

    /// Element `index`, or `None` if out of bounds
    pub fn get(&self, index: usize) -> Option<&T> {
        let ptr = self.ptr.get()?;
        if index < self.size() {
            // SAFETY: in bounds and initialized.
            Some(unsafe { &*ptr.element(index).as_ptr() })
        } else {
            None
        }
    }

    /// Mutable element `index`, or `None` if out of bounds
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        let ptr = self.ptr.get()?;
        if index < self.size() {
            // SAFETY: in bounds, initialized, and exclusively borrowed.
            Some(unsafe { &mut *ptr.element(index).as_ptr() })
        } else {
            None
        }
    }

    /// First element
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Last element
    pub fn back(&self) -> Option<&T> {
        self.size().checked_sub(1).and_then(|last| self.get(last))
    }

    /// Elements in logical order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.size()).filter_map(move |i| self.get(i))
    }
}

impl<T: Copy> Index<usize> for StripedArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("index {} out of bounds for length {}", index, self.size()),
        }
    }
}

impl<T: Copy> IndexMut<usize> for StripedArray<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        let len = self.size();
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("index {} out of bounds for length {}", index, len),
        }
    }
}

impl<T> Clone for StripedArray<T>
where
    T: Copy + Default + Send + Sync,
{
    fn clone(&self) -> Self {
        let machine = self.machine();
        match self.ptr.get() {
            Some(src) => {
                let ptr = Self::allocate(machine, self.size(), Some(src))
                    .unwrap_or_else(|err| out_of_memory(err));
                Self {
                    ptr: ReplicatedValue::new(machine, Some(ptr)),
                    n: ReplicatedValue::new(machine, self.size()),
                }
            }
            None => Self::new(machine),
        }
    }

    /// Copy-and-swap: `self` is untouched if building the copy fails
    fn clone_from(&mut self, source: &Self) {
        let mut fresh = source.clone();
        self.swap(&mut fresh);
    }
}

impl<T: Copy> ShallowCopy for StripedArray<T> {
    /// Share the storage; the copy must never be dropped
    unsafe fn shallow_copy(&self, _tag: Shallow) -> Self {
        std::ptr::read(self)
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for StripedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Copy> Drop for StripedArray<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.get() {
            if let Err(err) = self.machine().free(ptr.addr()) {
                tracing::error!(%err, "failed to free striped array");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_write_read_back() {
        let machine = Machine::with_partitions(8).unwrap();
        let mut a = StripedArray::<i64>::with_len(&machine, 1000);

        for i in 0..1000 {
            a[i] = i as i64 * 2;
        }
        for i in 0..1000 {
            assert_eq!(a[i], i as i64 * 2);
        }
        assert_eq!(a.front(), Some(&0));
        assert_eq!(a.back(), Some(&1998));
    }

    #[test]
    fn test_elements_live_on_their_partition() {
        let machine = Machine::with_partitions(4).unwrap();
        let a = StripedArray::<u32>::with_len(&machine, 10);

        for i in 0..10 {
            assert_eq!(a.partition_of(i), i % 4);
            assert_eq!(machine.partition_of(&a[i] as *const u32), Some(i % 4));
        }
    }

    #[test]
    fn test_writes_from_any_partition() {
        let machine = Machine::with_partitions(4).unwrap();
        let mut a = StripedArray::<u64>::with_len(&machine, 16);

        for i in 0..16 {
            machine.on_partition((i * 3) % 4, || a[i] = i as u64 + 100);
        }
        for p in 0..4 {
            machine.on_partition(p, || {
                assert!(a.iter().enumerate().all(|(i, &v)| v == i as u64 + 100));
            });
        }
    }

    #[test]
    fn test_apply_local_stays_on_partition() {
        let machine = Machine::with_partitions(4).unwrap();
        let mut a = StripedArray::<usize>::with_len(&machine, 37);
        let remote = AtomicUsize::new(0);

        a.apply_local(ExecutionPolicy::parallel(1), |i, slot| {
            if machine.current_partition() != i % 4 {
                remote.fetch_add(1, Ordering::SeqCst);
            }
            *slot = i + 1;
        });

        assert_eq!(remote.load(Ordering::SeqCst), 0);
        assert!(a.iter().enumerate().all(|(i, &v)| v == i + 1));
    }

    #[test]
    fn test_resize_and_clear() {
        let machine = Machine::with_partitions(3).unwrap();
        let mut a = StripedArray::<i32>::with_len(&machine, 5);
        for i in 0..5 {
            a[i] = -(i as i32);
        }

        a.resize(11);
        assert_eq!(a.size(), 11);
        assert_eq!(
            a.iter().copied().collect::<Vec<_>>(),
            vec![0, -1, -2, -3, -4, 0, 0, 0, 0, 0, 0]
        );

        a.resize(3);
        assert_eq!(a.size(), 11);

        a.clear();
        assert!(a.is_empty());
        assert_eq!(a.front(), None);
        assert_eq!(a.get(0), None);
    }

    #[test]
    fn test_clone_take_swap() {
        let machine = Machine::with_partitions(2).unwrap();
        let mut a = StripedArray::<u8>::with_len(&machine, 4);
        a[3] = 9;

        let mut b = a.clone();
        b[3] = 1;
        assert_eq!(a[3], 9);

        let c = b.take();
        assert!(b.is_empty());
        assert_eq!(format!("{:?}", c), "[0, 0, 0, 1]");

        let mut d = StripedArray::new(&machine);
        d.clone_from(&a);
        assert_eq!(d[3], 9);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let machine = Machine::with_partitions(2).unwrap();
        let a = StripedArray::<u64>::with_len(&machine, 3);
        let _value = a[3];
    }
}
