//! Per-partition arrays
//!
//! A [`DistributedArray<T>`] gives every partition its own buffer of the
//! same length. The length and the buffer handle are themselves
//! [`ReplicatedValue`]s, so any partition reads them locally, and the array
//! can be shallow-replicated as a whole.

use crate::alloc::ReplPtr;
use crate::error::Result;
use crate::machine::{out_of_memory, Machine};
use crate::partition::PartitionId;
use crate::replicated::{Replicated, ReplicatedValue};
use crate::shallow::{Shallow, ShallowCopy};
use crate::walk::for_each_partition;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// One buffer of `size()` elements on every partition
pub struct DistributedArray<T: Copy> {
    data: ReplicatedValue<Option<ReplPtr<T>>>,
    size: ReplicatedValue<usize>,
}

impl<T> DistributedArray<T>
where
    T: Copy + Default + Send + Sync,
{
    /// Create an empty array
    pub fn new(machine: &Arc<Machine>) -> Self {
        Self {
            data: ReplicatedValue::new(machine, None),
            size: ReplicatedValue::new(machine, 0),
        }
    }

    /// Create an array with `len` default elements on every partition
    ///
    /// Aborts the process if the machine is out of memory.
    pub fn with_len(machine: &Arc<Machine>, len: usize) -> Self {
        Self::try_with_len(machine, len).unwrap_or_else(|err| out_of_memory(err))
    }

    /// Create an array with `len` default elements on every partition
    pub fn try_with_len(machine: &Arc<Machine>, len: usize) -> Result<Self> {
        let mut array = Self {
            data: ReplicatedValue::try_new(machine, None)?,
            size: ReplicatedValue::try_new(machine, 0)?,
        };
        array.data.set(Some(Self::allocate(machine, len, None)?));
        array.size.set(len);
        Ok(array)
    }

    /// Allocate `len` elements per partition, copying `old` over its prefix
    fn allocate(
        machine: &Arc<Machine>,
        len: usize,
        old: Option<(ReplPtr<T>, usize)>,
    ) -> Result<ReplPtr<T>> {
        let ptr = machine.allocate_replicated::<T>(len)?;
        for_each_partition(machine, machine.default_policy(), |partition| {
            let dst = ptr.nth(partition).as_ptr();
            let kept = match old {
                Some((src, old_len)) => {
                    // SAFETY: regions are distinct and `old_len <= len`.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src.nth(partition).as_ptr(), dst, old_len)
                    };
                    old_len
                }
                None => 0,
            };
            for slot in kept..len {
                // SAFETY: slot < len, inside this partition's copy.
                unsafe { dst.add(slot).write(T::default()) };
            }
        });
        Ok(ptr)
    }

    /// Grow every partition's buffer to `new_size`
    ///
    /// Existing elements are preserved and new slots are `T::default()`.
    /// Does nothing when `new_size <= size()`.
    pub fn resize(&mut self, new_size: usize) {
        let size = self.size();
        if new_size <= size {
            return;
        }

        let machine = Arc::clone(self.machine());
        let old = self.data.get().map(|ptr| (ptr, size));
        let ptr = Self::allocate(&machine, new_size, old).unwrap_or_else(|err| out_of_memory(err));

        self.free_storage();
        self.data.set(Some(ptr));
        self.size.set(new_size);
    }

    /// Free every buffer and reset the length to zero
    pub fn clear(&mut self) {
        self.free_storage();
        self.size.set(0);
    }

    fn free_storage(&mut self) {
        if let Some(ptr) = self.data.get() {
            if let Err(err) = self.machine().free(ptr.addr()) {
                tracing::error!(%err, "failed to free distributed array");
            }
            self.data.set(None);
        }
    }

    /// Move the contents out, leaving an empty array behind
    pub fn take(&mut self) -> Self {
        let mut taken = Self::new(self.machine());
        self.swap(&mut taken);
        taken
    }
}

impl<T: Copy> DistributedArray<T> {
    /// Machine the buffers live on
    pub fn machine(&self) -> &Arc<Machine> {
        self.size.machine()
    }

    /// Elements per partition
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Whether every buffer is empty
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Exchange contents with `other`
    pub fn swap(&mut self, other: &mut Self) {
        self.data.swap(&mut other.data);
        self.size.swap(&mut other.size);
    }

    /// The buffer on `partition`
    pub fn get_nth(&self, partition: PartitionId) -> &[T] {
        match self.data.get() {
            // SAFETY: every slot in [0, size) is initialized.
            Some(ptr) => unsafe {
                std::slice::from_raw_parts(ptr.nth(partition).as_ptr(), self.size())
            },
            None => &[],
        }
    }

    /// Mutable buffer on `partition`
    pub fn get_nth_mut(&mut self, partition: PartitionId) -> &mut [T] {
        match self.data.get() {
            // SAFETY: initialized, and `&mut self` makes the access exclusive.
            Some(ptr) => unsafe {
                std::slice::from_raw_parts_mut(ptr.nth(partition).as_ptr(), self.size())
            },
            None => &mut [],
        }
    }

    /// The buffer on the partition that holds `other`
    pub fn get_localto<U: ?Sized>(&self, other: *const U) -> &[T] {
        self.get_nth(self.machine().partition_local_to(other))
    }

    /// The buffer on the caller's partition
    pub fn local(&self) -> &[T] {
        self.get_nth(self.machine().current_partition())
    }

    /// Mutable buffer on the caller's partition
    pub fn local_mut(&mut self) -> &mut [T] {
        let partition = self.machine().current_partition();
        self.get_nth_mut(partition)
    }
}

impl<T: Copy> Index<usize> for DistributedArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.local()[index]
    }
}

impl<T: Copy> IndexMut<usize> for DistributedArray<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.local_mut()[index]
    }
}

impl<T> Clone for DistributedArray<T>
where
    T: Copy + Default + Send + Sync,
{
    fn clone(&self) -> Self {
        let machine = self.machine();
        let size = self.size();
        match self.data.get() {
            Some(src) => {
                let ptr = Self::allocate(machine, size, Some((src, size)))
                    .unwrap_or_else(|err| out_of_memory(err));
                Self {
                    data: ReplicatedValue::new(machine, Some(ptr)),
                    size: ReplicatedValue::new(machine, size),
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

impl<T: Copy> ShallowCopy for DistributedArray<T> {
    /// Share the buffers; the copy must never be dropped
    unsafe fn shallow_copy(&self, _tag: Shallow) -> Self {
        std::ptr::read(self)
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for DistributedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedArray")
            .field("size", &self.size())
            .field("local", &self.local())
            .finish()
    }
}

impl<T: Copy> Drop for DistributedArray<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.data.get() {
            if let Err(err) = self.machine().free(ptr.addr()) {
                tracing::error!(%err, "failed to free distributed array");
            }
        }
    }
}
