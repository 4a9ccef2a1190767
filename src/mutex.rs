//! Partition-local spin lock
//!
//! [`SpinMutex`] is a test-and-test-and-set lock: contenders spin on a plain
//! read of the lock word and only attempt the compare-and-swap once the word
//! reads free, so a held lock does not turn every waiter into a writer of
//! the same cache line.
//!
//! # Liveness
//!
//! The lock is only deadlock free while both of these hold:
//!
//! 1. A holder never gives up its execution slot (migrates to another
//!    partition, blocks in a system call) while holding the lock.
//! 2. The number of tasks contending on one lock stays below the number of
//!    execution contexts per partition ([`EXECUTION_CONTEXTS_PER_PARTITION`]).
//!    Otherwise spinning tasks can occupy every context and keep the holder,
//!    or a task that would release the lock, from migrating in.
//!
//! There is no fairness guarantee.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Concurrent execution contexts available on one partition
pub const EXECUTION_CONTEXTS_PER_PARTITION: usize = 64;

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

/// A spin lock protecting a `T`
pub struct SpinMutex<T: ?Sized> {
    word: AtomicU64,
    spinners: AtomicUsize,
    warned: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock word serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Create an unlocked mutex
    pub const fn new(data: T) -> Self {
        Self {
            word: AtomicU64::new(UNLOCKED),
            spinners: AtomicUsize::new(0),
            warned: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the mutex, returning the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Block until the lock is held
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        if self.try_acquire() {
            return SpinMutexGuard { mutex: self };
        }

        let spinners = self.spinners.fetch_add(1, Ordering::Relaxed) + 1;
        if spinners > EXECUTION_CONTEXTS_PER_PARTITION
            && !self.warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                spinners,
                limit = EXECUTION_CONTEXTS_PER_PARTITION,
                "spin lock contention exceeds execution contexts per partition"
            );
        }

        let backoff = Backoff::new();
        loop {
            // spin without attempting the exchange
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                backoff.snooze();
            }
            if self.try_acquire() {
                break;
            }
        }

        self.spinners.fetch_sub(1, Ordering::Relaxed);
        SpinMutexGuard { mutex: self }
    }

    /// Take the lock if it is free
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.try_acquire() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Whether some task holds the lock
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }

    /// Mutable access without locking; `&mut self` proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinMutex").field("data", &&*guard).finish(),
            None => f.debug_struct("SpinMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Holds a [`SpinMutex`] until dropped
#[must_use = "dropping the guard releases the lock immediately"]
pub struct SpinMutexGuard<'a, T: ?Sized> {
    mutex: &'a SpinMutex<T>,
}

impl<T: ?Sized> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
