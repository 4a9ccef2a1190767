//! Replication by independent construction
//!
//! [`DeepReplica<T>`] builds one fully independent `T` per partition from
//! the same constructor, and drops every one of them. Nothing is shared
//! between copies; mutating one never shows up in another.

use crate::alloc::ReplPtr;
use crate::error::Error;
use crate::machine::{out_of_memory, Machine};
use crate::partition::PartitionId;
use crate::replicated::{Replicated, ReplicatedMut};
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// One independently constructed `T` per partition
pub struct DeepReplica<T> {
    machine: Arc<Machine>,
    ptr: ReplPtr<T>,
    origin: PartitionId,
    _owns: PhantomData<T>,
}

/// Copies built so far; destroys them and the storage unless disarmed
struct PartialBuild<'a, T> {
    machine: &'a Machine,
    ptr: ReplPtr<T>,
    built: Vec<PartitionId>,
}

impl<T> PartialBuild<'_, T> {
    fn disarm(mut self) -> ReplPtr<T> {
        self.built.clear();
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl<T> Drop for PartialBuild<'_, T> {
    fn drop(&mut self) {
        for &partition in &self.built {
            // SAFETY: only partitions whose write completed are recorded.
            unsafe { std::ptr::drop_in_place(self.ptr.nth(partition).as_ptr()) };
        }
        if let Err(err) = self.machine.free(self.ptr.addr()) {
            tracing::error!(%err, "failed to free partially built deep replica");
        }
    }
}

impl<T> DeepReplica<T> {
    /// Build one `T` per partition by calling `ctor` once for each
    ///
    /// The origin copy (the calling partition's) is built first. Aborts the
    /// process if the machine is out of memory.
    pub fn new<F>(machine: &Arc<Machine>, ctor: F) -> Self
    where
        F: Fn() -> T,
    {
        let result: Result<Self, Error> = Self::try_new(machine, || Ok::<T, Infallible>(ctor()))
            .map_err(|err| match err {
                DeepBuildError::Alloc(err) => err,
                DeepBuildError::Ctor(never) => match never {},
            });
        result.unwrap_or_else(|err| out_of_memory(err))
    }

    /// Build one `T` per partition by calling a fallible `ctor` once for each
    ///
    /// If the origin fails nothing else is built. If a later copy fails (or
    /// `ctor` panics) every copy built so far is dropped and the storage is
    /// freed before the error is returned.
    pub fn try_new<F, E>(machine: &Arc<Machine>, ctor: F) -> Result<Self, DeepBuildError<E>>
    where
        F: Fn() -> Result<T, E>,
    {
        let ptr = machine
            .allocate_replicated::<T>(1)
            .map_err(DeepBuildError::Alloc)?;
        let origin = machine.current_partition();

        let order = std::iter::once(origin)
            .chain((0..machine.partition_count()).filter(|&p| p != origin));

        let mut build = PartialBuild {
            machine,
            ptr,
            built: Vec::with_capacity(machine.partition_count()),
        };
        for partition in order {
            let value = ctor().map_err(DeepBuildError::Ctor)?;
            // SAFETY: fresh slot, written once.
            unsafe { ptr.nth(partition).as_ptr().write(value) };
            build.built.push(partition);
        }

        Ok(Self {
            machine: Arc::clone(machine),
            ptr: build.disarm(),
            origin,
            _owns: PhantomData,
        })
    }

    /// Give every partition its own clone of `value`
    pub fn from_value(machine: &Arc<Machine>, value: T) -> Self
    where
        T: Clone,
    {
        Self::new(machine, || value.clone())
    }

    /// Partition whose copy was built first
    pub fn origin_partition(&self) -> PartitionId {
        self.origin
    }
}

/// Failure while building a [`DeepReplica`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeepBuildError<E> {
    /// The machine could not allocate storage
    #[error("{0}")]
    Alloc(Error),

    /// The constructor failed on some partition
    #[error("constructor failed: {0}")]
    Ctor(E),
}

impl<T> Replicated for DeepReplica<T> {
    type Target = T;

    fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    fn get_nth(&self, partition: PartitionId) -> &T {
        // SAFETY: every slot was built in try_new.
        unsafe { &*self.ptr.nth(partition).as_ptr() }
    }
}

impl<T> ReplicatedMut for DeepReplica<T> {
    fn get_nth_mut(&mut self, partition: PartitionId) -> &mut T {
        // SAFETY: built, and `&mut self` makes the access exclusive.
        unsafe { &mut *self.ptr.nth(partition).as_ptr() }
    }

    fn copies_mut(&mut self) -> Vec<&mut T> {
        (0..self.ptr.partitions())
            // SAFETY: each partition's slot is a distinct object.
            .map(|partition| unsafe { &mut *self.ptr.nth(partition).as_ptr() })
            .collect()
    }
}

impl<T> Deref for DeepReplica<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.local()
    }
}

impl<T> DerefMut for DeepReplica<T> {
    fn deref_mut(&mut self) -> &mut T {
        let partition = self.machine.current_partition();
        self.get_nth_mut(partition)
    }
}

impl<T: Clone> Clone for DeepReplica<T> {
    fn clone(&self) -> Self {
        let ptr = self
            .machine
            .allocate_replicated::<T>(1)
            .unwrap_or_else(|err| out_of_memory(err));

        let mut build = PartialBuild {
            machine: &self.machine,
            ptr,
            built: Vec::with_capacity(ptr.partitions()),
        };
        for partition in 0..ptr.partitions() {
            let value = self.get_nth(partition).clone();
            // SAFETY: fresh slot, written once.
            unsafe { ptr.nth(partition).as_ptr().write(value) };
            build.built.push(partition);
        }

        Self {
            machine: Arc::clone(&self.machine),
            ptr: build.disarm(),
            origin: self.origin,
            _owns: PhantomData,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for DeepReplica<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let copies: Vec<&T> = (0..self.ptr.partitions())
            .map(|partition| self.get_nth(partition))
            .collect();
        f.debug_struct("DeepReplica")
            .field("origin", &self.origin)
            .field("copies", &copies)
            .finish()
    }
}

impl<T> Drop for DeepReplica<T> {
    fn drop(&mut self) {
        for partition in 0..self.ptr.partitions() {
            if partition == self.origin {
                continue;
            }
            // SAFETY: each remote copy is dropped exactly once.
            unsafe { std::ptr::drop_in_place(self.ptr.nth(partition).as_ptr()) };
        }
        // SAFETY: origin goes last, exactly once.
        unsafe { std::ptr::drop_in_place(self.ptr.nth(self.origin).as_ptr()) };

        if let Err(err) = self.machine.free(self.ptr.addr()) {
            tracing::error!(%err, "failed to free deep replica");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_copies_are_independent() {
        let machine = Machine::with_partitions(4).unwrap();
        let mut replica = DeepReplica::new(&machine, || vec![1, 2, 3]);

        replica.get_nth_mut(2).push(4);
        machine.on_partition(1, || replica.clear());

        assert_eq!(replica.get_nth(0), &vec![1, 2, 3]);
        assert!(replica.get_nth(1).is_empty());
        assert_eq!(replica.get_nth(2), &vec![1, 2, 3, 4]);
        assert_eq!(replica.get_nth(3), &vec![1, 2, 3]);

        // buffers are not shared
        assert_ne!(replica.get_nth(0).as_ptr(), replica.get_nth(3).as_ptr());
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_every_copy_dropped() {
        let machine = Machine::with_partitions(5).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        let replica = DeepReplica::new(&machine, || Counted(Arc::clone(&drops)));
        drop(replica);

        assert_eq!(drops.load(Ordering::SeqCst), 5);
        assert_eq!(machine.live_allocations(), 0);
    }

    #[test]
    fn test_origin_failure_builds_nothing() {
        let machine = Machine::with_partitions(4).unwrap();
        let calls = AtomicUsize::new(0);

        let result = DeepReplica::<u32>::try_new(&machine, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("no")
        });

        assert_eq!(result.unwrap_err(), DeepBuildError::Ctor("no"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.live_allocations(), 0);
    }

    #[test]
    fn test_build_error_display_and_source() {
        let ctor: DeepBuildError<&str> = DeepBuildError::Ctor("bad input");
        assert_eq!(ctor.to_string(), "constructor failed: bad input");

        let alloc: DeepBuildError<&str> = DeepBuildError::Alloc(Error::OutOfMemory {
            bytes: 64,
            partitions: 2,
        });
        assert_eq!(
            alloc.to_string(),
            "out of memory: requested 64 bytes across 2 partitions"
        );

        let boxed: Box<dyn std::error::Error> = Box::new(ctor);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn test_remote_failure_unwinds_built_copies() {
        let machine = Machine::with_partitions(4).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let calls = AtomicUsize::new(0);

        let result = DeepReplica::try_new(&machine, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                Err("third copy")
            } else {
                Ok(Counted(Arc::clone(&drops)))
            }
        });

        assert!(matches!(result, Err(DeepBuildError::Ctor("third copy"))));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(machine.live_allocations(), 0);
    }

    #[test]
    fn test_panicking_ctor_unwinds_built_copies() {
        let machine = Machine::with_partitions(3).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let calls = AtomicUsize::new(0);

        let result = catch_unwind(AssertUnwindSafe(|| {
            DeepReplica::new(&machine, || {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    panic!("boom");
                }
                Counted(Arc::clone(&drops))
            })
        }));

        assert!(result.is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(machine.live_allocations(), 0);
    }

    #[test]
    fn test_clone_is_deep() {
        let machine = Machine::with_partitions(2).unwrap();
        let replica = DeepReplica::from_value(&machine, String::from("x"));
        let mut cloned = replica.clone();

        cloned.get_nth_mut(0).push('y');
        assert_eq!(replica.get_nth(0), "x");
        assert_eq!(cloned.get_nth(0), "xy");
    }
}
