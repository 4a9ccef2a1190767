//! Typed handles to replicated and striped allocations
//!
//! Handles are plain addresses: they are `Copy`, never free anything on
//! their own, and must be given back to [`Machine::free`] by whoever owns
//! the allocation. Memory behind a fresh handle is uninitialized.
//!
//! [`Machine::free`]: crate::machine::Machine::free

use crate::partition::PartitionId;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// `len` elements of `T` on every partition, at congruent addresses
pub struct ReplPtr<T> {
    base: NonNull<u8>,
    stride: usize,
    partitions: usize,
    len: usize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: a ReplPtr is an address; moving or sharing it moves or shares
// access to the `T`s it names, hence the bounds on `T`.
unsafe impl<T: Send> Send for ReplPtr<T> {}
unsafe impl<T: Sync> Sync for ReplPtr<T> {}

impl<T> Clone for ReplPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ReplPtr<T> {}

impl<T> PartialEq for ReplPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

impl<T> Eq for ReplPtr<T> {}

impl<T> fmt::Debug for ReplPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplPtr")
            .field("base", &self.base)
            .field("stride", &self.stride)
            .field("partitions", &self.partitions)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> ReplPtr<T> {
    pub(crate) fn new(base: NonNull<u8>, stride: usize, partitions: usize, len: usize) -> Self {
        Self {
            base,
            stride,
            partitions,
            len,
            _marker: PhantomData,
        }
    }

    /// First element of `partition`'s copy
    pub fn nth(&self, partition: PartitionId) -> NonNull<T> {
        assert!(
            partition < self.partitions,
            "partition {} out of range ({} partitions)",
            partition,
            self.partitions
        );
        // SAFETY: partition < partitions keeps the offset inside the region.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(partition * self.stride).cast()) }
    }

    /// Elements per partition
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether each copy is zero elements long
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of copies
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Address of partition 0's copy, the key the machine frees by
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

/// `len` elements of `T` interleaved round-robin over every partition
///
/// Element `i` lives on partition `i % partitions` at local slot
/// `i / partitions`.
pub struct StripedPtr<T> {
    base: NonNull<u8>,
    stride: usize,
    partitions: usize,
    len: usize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: see ReplPtr.
unsafe impl<T: Send> Send for StripedPtr<T> {}
unsafe impl<T: Sync> Sync for StripedPtr<T> {}

impl<T> Clone for StripedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StripedPtr<T> {}

impl<T> PartialEq for StripedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

impl<T> Eq for StripedPtr<T> {}

impl<T> fmt::Debug for StripedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedPtr")
            .field("base", &self.base)
            .field("stride", &self.stride)
            .field("partitions", &self.partitions)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> StripedPtr<T> {
    pub(crate) fn new(base: NonNull<u8>, stride: usize, partitions: usize, len: usize) -> Self {
        Self {
            base,
            stride,
            partitions,
            len,
            _marker: PhantomData,
        }
    }

    /// Partition holding logical element `index`
    pub fn partition_of(&self, index: usize) -> PartitionId {
        index % self.partitions
    }

    /// Address of logical element `index`
    pub fn element(&self, index: usize) -> NonNull<T> {
        assert!(index < self.len, "index {} out of bounds for length {}", index, self.len);
        let partition = index % self.partitions;
        let slot = index / self.partitions;
        // SAFETY: slot < ceil(len / partitions), which the chunk was sized for.
        unsafe {
            let chunk = self.base.as_ptr().add(partition * self.stride);
            NonNull::new_unchecked(chunk.cast::<T>().add(slot))
        }
    }

    /// Number of logical elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the sequence is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of partitions the sequence is striped over
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Address of the region, the key the machine frees by
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}
