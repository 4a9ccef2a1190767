//! Remote atomic add and compare-and-swap intrinsics
//!
//! Integer atomics support a single-instruction remote add. Floating point
//! values have no atomic add primitive; they are stored as raw bits and
//! updated with compare-and-swap.

use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicU16, AtomicU32, AtomicU64,
    AtomicU8, AtomicUsize, Ordering,
};

/// Atomic storage that supports a fire-and-forget add
pub trait RemoteAdd: Send + Sync {
    /// Plain value type
    type Value: Copy;

    /// Create a cell holding `value`
    fn with_value(value: Self::Value) -> Self;

    /// Read the current value
    fn load_value(&self) -> Self::Value;

    /// Add `delta` in one atomic step, wrapping on overflow
    fn remote_add(&self, delta: Self::Value);
}

macro_rules! impl_remote_add {
    ($($atomic:ty => $int:ty),* $(,)?) => {
        $(
            impl RemoteAdd for $atomic {
                type Value = $int;

                fn with_value(value: $int) -> Self {
                    <$atomic>::new(value)
                }

                fn load_value(&self) -> $int {
                    self.load(Ordering::Acquire)
                }

                fn remote_add(&self, delta: $int) {
                    self.fetch_add(delta, Ordering::AcqRel);
                }
            }
        )*
    };
}

impl_remote_add!(
    AtomicI8 => i8,
    AtomicI16 => i16,
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicIsize => isize,
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
);

macro_rules! atomic_float {
    ($(#[$meta:meta])* $name:ident, $float:ty, $bits:ty) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name($bits);

        impl $name {
            /// Create a cell holding `value`
            pub fn new(value: $float) -> Self {
                Self(<$bits>::new(value.to_bits()))
            }

            /// Read the current value
            pub fn load(&self, order: Ordering) -> $float {
                <$float>::from_bits(self.0.load(order))
            }

            /// Overwrite the current value
            pub fn store(&self, value: $float, order: Ordering) {
                self.0.store(value.to_bits(), order)
            }

            /// Replace `current` with `new` if the cell still holds `current`
            ///
            /// Returns the value observed before the attempt. Comparison is
            /// bitwise, so a stored NaN still matches itself.
            pub fn compare_and_swap(&self, current: $float, new: $float) -> $float {
                match self.0.compare_exchange(
                    current.to_bits(),
                    new.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(bits) | Err(bits) => <$float>::from_bits(bits),
                }
            }

            /// Add `delta` with a compare-and-swap retry loop
            pub fn fetch_add(&self, delta: $float) -> $float {
                let mut old = self.load(Ordering::Acquire);
                loop {
                    let seen = self.compare_and_swap(old, old + delta);
                    if seen.to_bits() == old.to_bits() {
                        return old;
                    }
                    old = seen;
                }
            }
        }
    };
}

atomic_float!(
    /// `f64` stored as atomic bits
    AtomicF64, f64, AtomicU64
);

atomic_float!(
    /// `f32` stored as atomic bits
    AtomicF32, f32, AtomicU32
);
