//! # distmem
//!
//! Replicated objects, distributed arrays and deferred reductions for a
//! partitioned distributed-memory machine.
//!
//! ## Key Features
//!
//! - **Replication wrappers**: one logical object, one physical copy per
//!   partition, read locally from wherever the caller runs
//! - **Distributed arrays**: per-partition buffers and element-striped
//!   sequences
//! - **Partition walks**: fork-join traversal that visits every partition once
//! - **Deferred reductions**: local-first accumulators folded at end of scope
//! - **Emulated host**: a [`Machine`] providing congruent allocation, address
//!   resolution and migration on an ordinary multi-core host
//!
//! ## Architecture
//!
//! ```text
//!   partition 0        partition 1        partition 2
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │ copy @ base │    │ copy @ base │    │ copy @ base │   replicated
//! │   + 0*S     │    │   + 1*S     │    │   + 2*S     │   (congruent)
//! ├─────────────┤    ├─────────────┤    ├─────────────┤
//! │ a[0] a[3].. │    │ a[1] a[4].. │    │ a[2] a[5].. │   striped
//! └─────────────┘    └─────────────┘    └─────────────┘
//!        ▲                  ▲                  ▲
//!        └──── tasks migrate to the data they touch ───┘
//! ```
//!
//! ## Example
//!
//! ```
//! use distmem::prelude::*;
//!
//! let machine = Machine::with_partitions(4).unwrap();
//!
//! let mut v = ReplicatedValue::new(&machine, 42i64);
//! v.set(7);
//! assert!((0..4).all(|p| *v.get_nth(p) == 7));
//!
//! let mut a = StripedArray::<i64>::with_len(&machine, 1000);
//! a.apply_local(machine.default_policy(), |i, x| *x = 2 * i as i64);
//! assert_eq!(a[999], 1998);
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod alloc;
pub mod array;
pub mod atomic;
pub mod deep;
pub mod error;
pub mod machine;
pub mod mutex;
pub mod partition;
pub mod reducer;
pub mod replicated;
pub mod shallow;
pub mod striped;
pub mod walk;

// Re-exports
pub use crate::alloc::{ReplPtr, StripedPtr};
pub use array::DistributedArray;
pub use atomic::{AtomicF32, AtomicF64, RemoteAdd};
pub use deep::{DeepBuildError, DeepReplica};
pub use error::{Error, Result};
pub use machine::{Machine, MachineConfig, MachineStats};
pub use mutex::{SpinMutex, SpinMutexGuard};
pub use partition::PartitionId;
pub use reducer::{Monoid, OpAdd, OpMax, OpMin, ReductionArena, Reducer, SlotHandle};
pub use replicated::{Replicated, ReplicatedMut, ReplicatedValue};
pub use shallow::{Shallow, ShallowCopy, ShallowReplica};
pub use striped::StripedArray;
pub use walk::{for_each_partition, repl_for_each, repl_for_each_mut, repl_reduce, ExecutionPolicy};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::array::DistributedArray;
    pub use crate::deep::DeepReplica;
    pub use crate::error::{Error, Result};
    pub use crate::machine::{Machine, MachineConfig};
    pub use crate::mutex::SpinMutex;
    pub use crate::reducer::{Monoid, OpAdd, ReductionArena, Reducer};
    pub use crate::replicated::{Replicated, ReplicatedMut, ReplicatedValue};
    pub use crate::shallow::{Shallow, ShallowCopy, ShallowReplica};
    pub use crate::striped::StripedArray;
    pub use crate::walk::{for_each_partition, ExecutionPolicy};
}
