//! Replication by shallow copy
//!
//! [`ShallowReplica<T>`] constructs `T` once on the calling partition (the
//! *origin*) and then duplicates its representation onto every other
//! partition. What "duplicate" means depends on how the replica is built:
//!
//! - [`ShallowReplica::new_trivial`] requires `T: Copy` and copies bytes.
//! - [`ShallowReplica::new`] requires [`ShallowCopy`] and lets `T` decide,
//!   for example by sharing a buffer handle instead of copying the buffer.
//!
//! Only the origin copy is ever dropped. Non-origin copies are released
//! without running their destructor, so a `T` whose shallow copies own
//! resources of their own will leak them. That is the caller's contract;
//! nothing here detects it.

use crate::alloc::ReplPtr;
use crate::error::Result;
use crate::machine::{out_of_memory, Machine};
use crate::partition::PartitionId;
use crate::replicated::{Replicated, ReplicatedMut};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Marker passed to [`ShallowCopy::shallow_copy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shallow {
    /// Partition the copy is being made for
    pub dest: PartitionId,
}

/// Types that know how to make a shallow copy of themselves
pub trait ShallowCopy: Sized {
    /// Duplicate `self` without taking ownership of its resources
    ///
    /// # Safety
    ///
    /// The result may alias resources owned by `self`. The caller must
    /// never drop it, and must not use it once `self` has been dropped.
    unsafe fn shallow_copy(&self, tag: Shallow) -> Self;
}

type CopyFn<T> = unsafe fn(&T, Shallow) -> T;

unsafe fn copy_bytes<T: Copy>(src: &T, _tag: Shallow) -> T {
    *src
}

unsafe fn copy_shallow<T: ShallowCopy>(src: &T, tag: Shallow) -> T {
    src.shallow_copy(tag)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Bytes,
    Shallow,
}

/// A `T` constructed once and shallow-copied onto every partition
pub struct ShallowReplica<T> {
    machine: Arc<Machine>,
    ptr: ReplPtr<T>,
    origin: PartitionId,
    strategy: Strategy,
    copy: CopyFn<T>,
    _owns: PhantomData<T>,
}

impl<T: ShallowCopy> ShallowReplica<T> {
    /// Replicate `value` using `T`'s shallow copy
    ///
    /// Aborts the process if the machine is out of memory.
    pub fn new(machine: &Arc<Machine>, value: T) -> Self {
        Self::try_new(machine, value).unwrap_or_else(|err| out_of_memory(err))
    }

    /// Replicate `value` using `T`'s shallow copy
    pub fn try_new(machine: &Arc<Machine>, value: T) -> Result<Self> {
        Self::build(machine, value, copy_shallow::<T>, Strategy::Shallow)
    }
}

impl<T: Copy> ShallowReplica<T> {
    /// Replicate `value` by copying its bytes
    ///
    /// Aborts the process if the machine is out of memory.
    pub fn new_trivial(machine: &Arc<Machine>, value: T) -> Self {
        Self::try_new_trivial(machine, value).unwrap_or_else(|err| out_of_memory(err))
    }

    /// Replicate `value` by copying its bytes
    pub fn try_new_trivial(machine: &Arc<Machine>, value: T) -> Result<Self> {
        Self::build(machine, value, copy_bytes::<T>, Strategy::Bytes)
    }
}

impl<T> ShallowReplica<T> {
    fn build(
        machine: &Arc<Machine>,
        value: T,
        copy: CopyFn<T>,
        strategy: Strategy,
    ) -> Result<Self> {
        let ptr = machine.allocate_replicated::<T>(1)?;
        let origin = machine.current_partition();

        // SAFETY: fresh allocation, one slot per partition.
        unsafe { ptr.nth(origin).as_ptr().write(value) };
        let replica = Self {
            machine: Arc::clone(machine),
            ptr,
            origin,
            strategy,
            copy,
            _owns: PhantomData,
        };
        replica.copy_origin_out();

        Ok(replica)
    }

    /// Shallow-copy the origin over every other partition's slot
    ///
    /// Old contents of those slots are overwritten without being dropped.
    fn copy_origin_out(&self) {
        let origin = self.ptr.nth(self.origin).as_ptr();
        for dest in 0..self.ptr.partitions() {
            if dest == self.origin {
                continue;
            }
            // SAFETY: the copy lives in this replica, which drops the
            // origin last and never drops the copy.
            unsafe {
                let copy = (self.copy)(&*origin, Shallow { dest });
                self.ptr.nth(dest).as_ptr().write(copy);
            }
        }
    }

    /// Partition holding the copy that will be dropped
    pub fn origin_partition(&self) -> PartitionId {
        self.origin
    }

    /// Replace the origin with `value` and re-copy it everywhere
    pub fn set(&mut self, value: T) {
        // SAFETY: the origin is initialized and exclusively borrowed.
        unsafe { *self.ptr.nth(self.origin).as_ptr() = value };
        self.copy_origin_out();
    }

    /// Exchange contents with `other`
    pub fn swap(&mut self, other: &mut Self) {
        debug_assert!(Arc::ptr_eq(&self.machine, &other.machine));
        std::mem::swap(&mut self.ptr, &mut other.ptr);
        std::mem::swap(&mut self.origin, &mut other.origin);
        std::mem::swap(&mut self.strategy, &mut other.strategy);
        std::mem::swap(&mut self.copy, &mut other.copy);
    }
}

impl<T> Replicated for ShallowReplica<T> {
    type Target = T;

    fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    fn get_nth(&self, partition: PartitionId) -> &T {
        // SAFETY: every slot is initialized from construction on.
        unsafe { &*self.ptr.nth(partition).as_ptr() }
    }
}

impl<T> ReplicatedMut for ShallowReplica<T> {
    fn get_nth_mut(&mut self, partition: PartitionId) -> &mut T {
        // SAFETY: initialized, and `&mut self` makes the access exclusive.
        unsafe { &mut *self.ptr.nth(partition).as_ptr() }
    }

    fn copies_mut(&mut self) -> Vec<&mut T> {
        (0..self.ptr.partitions())
            // SAFETY: each partition's slot is a distinct object.
            .map(|partition| unsafe { &mut *self.ptr.nth(partition).as_ptr() })
            .collect()
    }
}

impl<T> Deref for ShallowReplica<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.local()
    }
}

impl<T> DerefMut for ShallowReplica<T> {
    fn deref_mut(&mut self) -> &mut T {
        let partition = self.machine.current_partition();
        self.get_nth_mut(partition)
    }
}

impl<T: Clone> Clone for ShallowReplica<T> {
    fn clone(&self) -> Self {
        let ptr = self
            .machine
            .allocate_replicated::<T>(1)
            .unwrap_or_else(|err| out_of_memory(err));

        match self.strategy {
            Strategy::Bytes => {
                for partition in 0..ptr.partitions() {
                    // SAFETY: byte copies own nothing.
                    unsafe {
                        let tag = Shallow { dest: partition };
                        let copy = (self.copy)(self.get_nth(partition), tag);
                        ptr.nth(partition).as_ptr().write(copy);
                    }
                }
            }
            Strategy::Shallow => {
                // the new origin owns its own resources; the rest borrow them
                let origin = self.get_nth(self.origin).clone();
                // SAFETY: fresh slot.
                unsafe { ptr.nth(self.origin).as_ptr().write(origin) };
            }
        }

        let replica = Self {
            machine: Arc::clone(&self.machine),
            ptr,
            origin: self.origin,
            strategy: self.strategy,
            copy: self.copy,
            _owns: PhantomData,
        };
        if replica.strategy == Strategy::Shallow {
            replica.copy_origin_out();
        }
        replica
    }
}

impl<T: fmt::Debug> fmt::Debug for ShallowReplica<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShallowReplica")
            .field("origin", &self.origin)
            .field("value", self.get_nth(self.origin))
            .finish()
    }
}

impl<T> Drop for ShallowReplica<T> {
    fn drop(&mut self) {
        // SAFETY: the origin is initialized and dropped exactly once here.
        unsafe { std::ptr::drop_in_place(self.ptr.nth(self.origin).as_ptr()) };

        if let Err(err) = self.machine.free(self.ptr.addr()) {
            tracing::error!(%err, "failed to free shallow replica");
        }
    }
}
