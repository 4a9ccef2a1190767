//! Replicated values
//!
//! A replicated object is one logical object stored as one physical copy
//! per partition, all at congruent addresses. The [`Replicated`] trait is
//! the read side shared by every wrapper kind; [`ReplicatedValue`] is the
//! simplest wrapper, a scalar whose every assignment is broadcast.

use crate::alloc::ReplPtr;
use crate::error::Result;
use crate::machine::{out_of_memory, Machine};
use crate::partition::PartitionId;
use crate::shallow::{Shallow, ShallowCopy};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// An object with one copy per partition
pub trait Replicated {
    /// Type of each copy
    type Target;

    /// Machine the copies live on
    fn machine(&self) -> &Arc<Machine>;

    /// The copy stored on `partition`
    ///
    /// Meant for setup and diagnostics; hot paths should use [`local`].
    ///
    /// [`local`]: Replicated::local
    fn get_nth(&self, partition: PartitionId) -> &Self::Target;

    /// The copy on the partition the caller runs on
    fn local(&self) -> &Self::Target {
        self.get_nth(self.machine().current_partition())
    }

    /// The copy on the partition that holds `other`
    fn get_localto<U: ?Sized>(&self, other: *const U) -> &Self::Target {
        self.get_nth(self.machine().partition_local_to(other))
    }
}

/// A replicated object whose copies may be mutated one by one
pub trait ReplicatedMut: Replicated {
    /// Mutable access to the copy on `partition`
    fn get_nth_mut(&mut self, partition: PartitionId) -> &mut Self::Target;

    /// Every copy, indexed by partition
    fn copies_mut(&mut self) -> Vec<&mut Self::Target>;
}

/// A `Copy` value broadcast to every partition
///
/// All copies hold the same value at all times: the only write path is
/// [`set`](ReplicatedValue::set), which rewrites every copy before
/// returning.
pub struct ReplicatedValue<T: Copy> {
    machine: Arc<Machine>,
    ptr: ReplPtr<T>,
}

impl<T: Copy> ReplicatedValue<T> {
    /// Replicate `value` onto every partition
    ///
    /// Aborts the process if the machine is out of memory.
    pub fn new(machine: &Arc<Machine>, value: T) -> Self {
        Self::try_new(machine, value).unwrap_or_else(|err| out_of_memory(err))
    }

    /// Replicate `value` onto every partition
    pub fn try_new(machine: &Arc<Machine>, value: T) -> Result<Self> {
        let ptr = machine.allocate_replicated::<T>(1)?;
        debug_assert!(machine.is_replicated(ptr.nth(0).as_ptr()));

        for partition in 0..machine.partition_count() {
            // SAFETY: fresh allocation, one slot per partition.
            unsafe { ptr.nth(partition).as_ptr().write(value) };
        }

        Ok(Self {
            machine: Arc::clone(machine),
            ptr,
        })
    }

    /// Overwrite every copy with `value`
    pub fn set(&mut self, value: T) {
        for partition in 0..self.ptr.partitions() {
            // SAFETY: `&mut self` excludes readers of every copy.
            unsafe { self.ptr.nth(partition).as_ptr().write(value) };
        }
    }

    /// Value of the local copy
    pub fn get(&self) -> T {
        *self.local()
    }

    /// Exchange contents with `other`, copy by copy
    pub fn swap(&mut self, other: &mut Self) {
        debug_assert!(Arc::ptr_eq(&self.machine, &other.machine));
        for partition in 0..self.ptr.partitions() {
            // SAFETY: both values are exclusively borrowed and distinct.
            unsafe {
                std::ptr::swap(
                    self.ptr.nth(partition).as_ptr(),
                    other.ptr.nth(partition).as_ptr(),
                )
            };
        }
    }
}

impl<T: Copy> Replicated for ReplicatedValue<T> {
    type Target = T;

    fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    fn get_nth(&self, partition: PartitionId) -> &T {
        // SAFETY: every copy was initialized in try_new.
        unsafe { &*self.ptr.nth(partition).as_ptr() }
    }
}

impl<T: Copy> Deref for ReplicatedValue<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.local()
    }
}

impl<T: Copy> Clone for ReplicatedValue<T> {
    fn clone(&self) -> Self {
        let ptr = self
            .machine
            .allocate_replicated::<T>(1)
            .unwrap_or_else(|err| out_of_memory(err));
        for partition in 0..self.ptr.partitions() {
            // SAFETY: fresh allocation, one slot per partition.
            unsafe { ptr.nth(partition).as_ptr().write(*self.get_nth(partition)) };
        }

        Self {
            machine: Arc::clone(&self.machine),
            ptr,
        }
    }
}

impl<T: Copy> ShallowCopy for ReplicatedValue<T> {
    /// Alias the same storage; the copy must never be dropped
    unsafe fn shallow_copy(&self, _tag: Shallow) -> Self {
        std::ptr::read(self)
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for ReplicatedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedValue")
            .field("local", self.local())
            .field("partitions", &self.ptr.partitions())
            .finish()
    }
}

impl<T: Copy> Drop for ReplicatedValue<T> {
    fn drop(&mut self) {
        if let Err(err) = self.machine.free(self.ptr.addr()) {
            tracing::error!(%err, "failed to free replicated value");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_on_construct_and_assign() {
        let machine = Machine::with_partitions(4).unwrap();
        let mut v = ReplicatedValue::new(&machine, 42i64);

        for partition in 0..4 {
            assert_eq!(*v.get_nth(partition), 42);
        }

        v.set(7);
        for partition in 0..4 {
            assert_eq!(*v.get_nth(partition), 7);
            machine.on_partition(partition, || assert_eq!(*v, 7));
        }
    }

    #[test]
    fn test_local_follows_migration() {
        let machine = Machine::with_partitions(4).unwrap();
        let v = ReplicatedValue::new(&machine, 1u32);

        let local = machine.on_partition(3, || v.local() as *const u32);
        assert_eq!(machine.partition_of(local), Some(3));
        assert_eq!(v.get_localto(local) as *const u32, local);
    }

    #[test]
    fn test_swap_and_clone() {
        let machine = Machine::with_partitions(3).unwrap();
        let mut a = ReplicatedValue::new(&machine, 1u64);
        let mut b = ReplicatedValue::new(&machine, 2u64);

        a.swap(&mut b);
        assert_eq!(a.get(), 2);
        assert_eq!(*b.get_nth(2), 1);

        let c = a.clone();
        a.set(10);
        assert_eq!(*c.get_nth(1), 2);
        assert_eq!(format!("{:?}", c), "ReplicatedValue { local: 2, partitions: 3 }");
    }

    #[test]
    fn test_drop_frees_storage() {
        let machine = Machine::with_partitions(2).unwrap();
        {
            let _v = ReplicatedValue::new(&machine, 0u8);
            assert_eq!(machine.live_allocations(), 1);
        }
        assert_eq!(machine.live_allocations(), 0);
    }
}
