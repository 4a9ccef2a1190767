//! Partition addressing for the emulated machine
//!
//! Every allocation the machine hands out is a *region*: `partitions`
//! equally sized chunks laid out back to back, `stride` bytes apart. Chunk
//! `p` is the storage that physically lives on partition `p`, so an address
//! inside one chunk maps to the congruent address inside any other chunk by
//! a pure offset transform:
//!
//! ```text
//!  base            base + stride      base + 2*stride
//!  ├── partition 0 ──┼── partition 1 ──┼── partition 2 ──┤
//!  │ x               │ x'              │ x''             │
//!  └─────────────────┴─────────────────┴─────────────────┘
//!    x' = x + (1 - 0) * stride
//! ```
//!
//! Replicated regions hold one copy of an object per chunk. Striped regions
//! interleave a single logical sequence over the chunks.

use crate::error::{Error, Result};
use std::alloc::Layout;
use std::cell::Cell;
use std::collections::BTreeMap;

/// Stable identifier of a partition, in `[0, partition_count)`
pub type PartitionId = usize;

/// Cache line size used to pad per-partition chunks
pub const CACHE_LINE_SIZE: usize = 64;

thread_local! {
    /// Partition the current task is running on
    static CURRENT_PARTITION: Cell<PartitionId> = const { Cell::new(0) };
}

/// Partition the calling task currently runs on (unchecked)
pub(crate) fn current() -> PartitionId {
    CURRENT_PARTITION.with(Cell::get)
}

/// Relocate the calling task, returning the partition it left
pub(crate) fn set_current(partition: PartitionId) -> PartitionId {
    CURRENT_PARTITION.with(|cell| cell.replace(partition))
}

/// How a region's chunks are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// One copy of the same object per partition
    Replicated,

    /// One logical sequence interleaved over the partitions
    Striped,
}

/// A live allocation on the machine
#[derive(Debug, Clone)]
pub struct Region {
    /// Address of partition 0's chunk
    pub base: usize,

    /// Bytes between congruent addresses of neighbouring partitions
    pub stride: usize,

    /// Number of chunks
    pub partitions: usize,

    /// Replicated or striped
    pub kind: RegionKind,

    /// Layout the backing memory was obtained with
    pub layout: Layout,
}

impl Region {
    /// One past the last byte of the region
    pub fn end(&self) -> usize {
        self.base + self.stride * self.partitions
    }

    /// Whether `addr` falls inside this region
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Partition whose chunk holds `addr`
    pub fn partition_of(&self, addr: usize) -> PartitionId {
        (addr - self.base) / self.stride
    }

    /// Congruent address of `addr` inside `partition`'s chunk
    pub fn resolve(&self, addr: usize, partition: PartitionId) -> usize {
        let offset = (addr - self.base) % self.stride;
        self.base + partition * self.stride + offset
    }
}

/// Registry of live regions plus per-partition byte accounting
#[derive(Debug)]
pub(crate) struct MemoryMap {
    regions: BTreeMap<usize, Region>,
    used: Vec<usize>,
    capacity: Option<usize>,
}

impl MemoryMap {
    pub(crate) fn new(partitions: usize, capacity: Option<usize>) -> Self {
        Self {
            regions: BTreeMap::new(),
            used: vec![0; partitions],
            capacity,
        }
    }

    /// Region containing `addr`, if any
    pub(crate) fn lookup(&self, addr: usize) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Reserve `stride` bytes on every partition
    pub(crate) fn reserve(&mut self, stride: usize) -> Result<()> {
        if let Some(capacity) = self.capacity {
            if self.used.iter().any(|used| used + stride > capacity) {
                return Err(Error::OutOfMemory {
                    bytes: stride * self.used.len(),
                    partitions: self.used.len(),
                });
            }
        }
        for used in &mut self.used {
            *used += stride;
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, region: Region) {
        self.regions.insert(region.base, region);
    }

    /// Forget the region starting at `base` and give its bytes back
    pub(crate) fn remove(&mut self, base: usize) -> Result<Region> {
        let region = self
            .regions
            .remove(&base)
            .ok_or(Error::UnknownAllocation(base))?;
        self.release(region.stride);
        Ok(region)
    }

    /// Undo a `reserve(stride)`
    pub(crate) fn release(&mut self, stride: usize) {
        for used in &mut self.used {
            *used -= stride;
        }
    }

    /// Bytes reserved on `partition`
    pub(crate) fn used(&self, partition: PartitionId) -> usize {
        self.used.get(partition).copied().unwrap_or(0)
    }

    pub(crate) fn live_regions(&self) -> usize {
        self.regions.len()
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
pub(crate) fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: usize, stride: usize, partitions: usize) -> Region {
        Region {
            base,
            stride,
            partitions,
            kind: RegionKind::Replicated,
            layout: Layout::from_size_align(stride * partitions, CACHE_LINE_SIZE).unwrap(),
        }
    }

    #[test]
    fn test_region_resolve_is_congruent() {
        let r = region(0x1000, 128, 4);
        let addr = 0x1000 + 128 + 24; // partition 1, offset 24

        assert_eq!(r.partition_of(addr), 1);
        assert_eq!(r.resolve(addr, 0), 0x1000 + 24);
        assert_eq!(r.resolve(addr, 3), 0x1000 + 3 * 128 + 24);
        assert_eq!(r.partition_of(r.resolve(addr, 2)), 2);
    }

    #[test]
    fn test_memory_map_lookup() {
        let mut map = MemoryMap::new(4, None);
        map.insert(region(0x1000, 64, 4));
        map.insert(region(0x4000, 64, 4));

        assert!(map.lookup(0x0fff).is_none());
        assert_eq!(map.lookup(0x1000).map(|r| r.base), Some(0x1000));
        assert_eq!(map.lookup(0x10ff).map(|r| r.base), Some(0x1000));
        assert!(map.lookup(0x1100).is_none());
        assert_eq!(map.lookup(0x4080).map(|r| r.base), Some(0x4000));
    }

    #[test]
    fn test_memory_map_capacity() {
        let mut map = MemoryMap::new(2, Some(256));
        map.reserve(128).unwrap();
        map.reserve(128).unwrap();
        assert_eq!(map.used(0), 256);

        let err = map.reserve(64).unwrap_err();
        assert_eq!(
            err,
            Error::OutOfMemory {
                bytes: 128,
                partitions: 2
            }
        );

        map.insert(region(0x1000, 128, 2));
        map.remove(0x1000).unwrap();
        assert_eq!(map.used(1), 128);
        assert_eq!(map.remove(0x1000).unwrap_err(), Error::UnknownAllocation(0x1000));
    }

    #[test]
    fn test_current_partition_is_per_thread() {
        let prev = set_current(3);
        assert_eq!(current(), 3);

        std::thread::spawn(|| assert_eq!(current(), 0))
            .join()
            .unwrap();

        set_current(prev);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }
}
