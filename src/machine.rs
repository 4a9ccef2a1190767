//! The emulated partitioned machine
//!
//! A [`Machine`] stands in for the hardware platform: it knows how many
//! partitions exist, hands out replicated and striped allocations at
//! congruent addresses, resolves addresses between partitions, and tracks
//! which partition the calling task currently runs on. Every wrapper in the
//! crate takes an `&Arc<Machine>` explicitly; nothing allocates through
//! hidden global state.

use crate::alloc::{ReplPtr, StripedPtr};
use crate::error::{Error, Result};
use crate::partition::{self, MemoryMap, PartitionId, Region, RegionKind, CACHE_LINE_SIZE};
use crate::walk::ExecutionPolicy;
use parking_lot::RwLock;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Environment variable prefix read by [`MachineConfig::load`]
pub const ENV_PREFIX: &str = "DISTMEM";

/// Machine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct MachineConfig {
    /// Number of partitions
    pub partitions: usize,

    /// Bytes each partition can hold (None = unbounded)
    pub capacity_per_partition: Option<usize>,

    /// Grain used by [`Machine::default_policy`]
    pub default_grain: usize,

    /// Pin migrated tasks to a core chosen by partition id
    pub pin_tasks: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            partitions: num_cpus::get(),
            capacity_per_partition: None,
            default_grain: 1,
            pin_tasks: false,
        }
    }
}

impl MachineConfig {
    /// Create a new machine configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of partitions
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    /// Bound the bytes each partition can hold
    pub fn with_capacity_per_partition(mut self, bytes: usize) -> Self {
        self.capacity_per_partition = Some(bytes);
        self
    }

    /// Set the default traversal grain
    pub fn with_default_grain(mut self, grain: usize) -> Self {
        self.default_grain = grain;
        self
    }

    /// Pin migrated tasks to cores
    pub fn with_pin_tasks(mut self, pin: bool) -> Self {
        self.pin_tasks = pin;
        self
    }

    /// Check the configuration describes a usable machine
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::InvalidConfig("partitions must be at least 1".into()));
        }
        if self.default_grain == 0 {
            return Err(Error::InvalidConfig("default_grain must be at least 1".into()));
        }
        if self.capacity_per_partition == Some(0) {
            return Err(Error::InvalidConfig(
                "capacity_per_partition must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Defaults overlaid with `DISTMEM_*` environment variables
    #[cfg(feature = "serialization")]
    pub fn load() -> Result<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Defaults overlaid with a TOML document
    #[cfg(feature = "serialization")]
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }
}

/// Counters for machine activity
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct MachineStats {
    /// Successful allocations
    pub allocations: AtomicU64,

    /// Regions given back
    pub frees: AtomicU64,

    /// Task migrations
    pub migrations: AtomicU64,

    /// Tasks spawned by partition walks
    pub spawns: AtomicU64,

    /// Migrations whose core pinning was refused by the OS
    pub pin_failures: AtomicU64,
}

impl MachineStats {
    /// Get the number of allocations
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of frees
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Get the number of migrations
    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    /// Get the number of spawned tasks
    pub fn spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Get the number of failed core pins
    pub fn pin_failures(&self) -> u64 {
        self.pin_failures.load(Ordering::Relaxed)
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.migrations.store(0, Ordering::Relaxed);
        self.spawns.store(0, Ordering::Relaxed);
        self.pin_failures.store(0, Ordering::Relaxed);
    }
}

/// An emulated partitioned-memory machine
#[derive(Debug)]
pub struct Machine {
    config: MachineConfig,
    memory: RwLock<MemoryMap>,
    stats: MachineStats,
    cores: Option<Vec<core_affinity::CoreId>>,
}

impl Machine {
    /// Create a machine from a configuration
    pub fn new(config: MachineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let cores = if config.pin_tasks {
            let cores = core_affinity::get_core_ids().filter(|ids| !ids.is_empty());
            if cores.is_none() {
                tracing::warn!("core ids unavailable, migrated tasks will not be pinned");
            }
            cores
        } else {
            None
        };

        tracing::debug!(
            partitions = config.partitions,
            capacity = ?config.capacity_per_partition,
            "machine created"
        );

        Ok(Arc::new(Self {
            memory: RwLock::new(MemoryMap::new(
                config.partitions,
                config.capacity_per_partition,
            )),
            config,
            stats: MachineStats::default(),
            cores,
        }))
    }

    /// Create a machine with `partitions` partitions and default settings
    pub fn with_partitions(partitions: usize) -> Result<Arc<Self>> {
        Self::new(MachineConfig::new().with_partitions(partitions))
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.config.partitions
    }

    /// Machine configuration
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Activity counters
    pub fn stats(&self) -> &MachineStats {
        &self.stats
    }

    /// Parallel policy with the configured grain
    pub fn default_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Parallel {
            grain: self.config.default_grain,
        }
    }

    /// Check `partition` names a partition of this machine
    pub fn check_partition(&self, partition: PartitionId) -> Result<()> {
        if partition < self.config.partitions {
            Ok(())
        } else {
            Err(Error::PartitionOutOfRange {
                partition,
                count: self.config.partitions,
            })
        }
    }

    /// Partition the calling task runs on
    pub fn current_partition(&self) -> PartitionId {
        let partition = partition::current();
        if partition < self.config.partitions {
            partition
        } else {
            0
        }
    }

    /// Relocate the calling task's continuation to `partition`
    ///
    /// One-way, like a migration hint: code after the call runs "on"
    /// `partition` until the next migration.
    pub fn migrate_to(&self, partition: PartitionId) {
        debug_assert!(partition < self.config.partitions);
        let from = partition::set_current(partition);
        self.stats.migrations.fetch_add(1, Ordering::Relaxed);

        if let Some(cores) = &self.cores {
            let core = cores[partition % cores.len()];
            if !core_affinity::set_for_current(core) {
                self.stats.pin_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(partition, core = core.id, "failed to pin task to core");
            }
        }

        tracing::trace!(from, to = partition, "migrated");
    }

    /// Migrate to the partition holding `ptr`
    pub fn migrate_to_address<T: ?Sized>(&self, ptr: *const T) {
        self.migrate_to(self.partition_local_to(ptr));
    }

    /// Run `f` on `partition`, then return to the current partition
    pub fn on_partition<R>(&self, partition: PartitionId, f: impl FnOnce() -> R) -> R {
        struct Restore(PartitionId);

        impl Drop for Restore {
            fn drop(&mut self) {
                partition::set_current(self.0);
            }
        }

        let _restore = Restore(partition::current());
        self.migrate_to(partition);
        f()
    }

    /// Allocate `len` elements of `T` on every partition
    pub fn allocate_replicated<T>(&self, len: usize) -> Result<ReplPtr<T>> {
        let (base, stride) = self.allocate_region::<T>(len, RegionKind::Replicated)?;
        Ok(ReplPtr::new(base, stride, self.config.partitions, len))
    }

    /// Allocate `len` elements of `T` striped over every partition
    pub fn allocate_striped<T>(&self, len: usize) -> Result<StripedPtr<T>> {
        let per_partition = len.div_ceil(self.config.partitions);
        let (base, stride) = self.allocate_region::<T>(per_partition, RegionKind::Striped)?;
        Ok(StripedPtr::new(base, stride, self.config.partitions, len))
    }

    fn allocate_region<T>(
        &self,
        per_partition: usize,
        kind: RegionKind,
    ) -> Result<(NonNull<u8>, usize)> {
        let partitions = self.config.partitions;
        let align = std::mem::align_of::<T>().max(CACHE_LINE_SIZE);
        let oom = || Error::OutOfMemory {
            bytes: per_partition
                .saturating_mul(std::mem::size_of::<T>())
                .saturating_mul(partitions),
            partitions,
        };

        let bytes = per_partition
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(oom)?;
        let stride = partition::round_up(bytes.max(1), align);
        let total = stride.checked_mul(partitions).ok_or_else(oom)?;
        let layout = Layout::from_size_align(total, align).map_err(|_| oom())?;

        let mut memory = self.memory.write();
        memory.reserve(stride)?;

        // SAFETY: layout has non-zero size.
        let base = match NonNull::new(unsafe { std::alloc::alloc(layout) }) {
            Some(base) => base,
            None => {
                memory.release(stride);
                return Err(oom());
            }
        };

        memory.insert(Region {
            base: base.as_ptr() as usize,
            stride,
            partitions,
            kind,
            layout,
        });
        drop(memory);

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(?kind, stride, partitions, "allocated region");

        Ok((base, stride))
    }

    /// Give back the region whose partition-0 address is `addr`
    ///
    /// Elements stored in the region are not dropped.
    pub fn free(&self, addr: usize) -> Result<()> {
        let region = self.memory.write().remove(addr)?;
        // SAFETY: region was allocated by allocate_region with this layout
        // and has just been removed from the registry, so it is freed once.
        unsafe { std::alloc::dealloc(region.base as *mut u8, region.layout) };

        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = ?region.kind, stride = region.stride, "freed region");
        Ok(())
    }

    /// Congruent address of `ptr` on `partition`
    ///
    /// `None` if `ptr` is not inside a machine allocation.
    pub fn resolve<T>(&self, ptr: *const T, partition: PartitionId) -> Option<*const T> {
        if partition >= self.config.partitions {
            return None;
        }
        let memory = self.memory.read();
        memory
            .lookup(ptr as usize)
            .map(|region| region.resolve(ptr as usize, partition) as *const T)
    }

    /// Whether `ptr` points into a replicated allocation
    pub fn is_replicated<T: ?Sized>(&self, ptr: *const T) -> bool {
        let memory = self.memory.read();
        memory
            .lookup(ptr.cast::<u8>() as usize)
            .is_some_and(|region| region.kind == RegionKind::Replicated)
    }

    /// Partition physically holding `ptr`, if it is machine memory
    pub fn partition_of<T: ?Sized>(&self, ptr: *const T) -> Option<PartitionId> {
        let addr = ptr.cast::<u8>() as usize;
        let memory = self.memory.read();
        memory.lookup(addr).map(|region| region.partition_of(addr))
    }

    /// Partition local to `ptr`
    ///
    /// Addresses outside machine memory (stack, heap) are local to whatever
    /// partition the caller runs on.
    pub fn partition_local_to<T: ?Sized>(&self, ptr: *const T) -> PartitionId {
        self.partition_of(ptr)
            .unwrap_or_else(|| self.current_partition())
    }

    /// The copy of `ptr` local to the calling task
    pub fn resolve_local<T>(&self, ptr: *const T) -> *const T {
        self.resolve(ptr, self.current_partition()).unwrap_or(ptr)
    }

    /// Bytes reserved on `partition`
    pub fn bytes_in_use(&self, partition: PartitionId) -> usize {
        self.memory.read().used(partition)
    }

    /// Number of live regions
    pub fn live_allocations(&self) -> usize {
        self.memory.read().live_regions()
    }
}

/// Report an allocation failure and terminate the process
pub(crate) fn out_of_memory(err: Error) -> ! {
    tracing::error!(%err, "allocation failed");
    let bytes = match err {
        Error::OutOfMemory { bytes, .. } => bytes,
        _ => 0,
    };
    let layout = Layout::from_size_align(bytes.max(1), 1).unwrap_or(Layout::new::<u8>());
    std::alloc::handle_alloc_error(layout)
}
