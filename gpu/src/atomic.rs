//! Atomic "store max" used to aggregate capability limits across devices.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Atomics that support a lock-free "raise to at least `value`" update.
pub trait AtomicMax {
    type Value: Copy + PartialOrd;

    /// Raise the stored value to `value` if `value` is larger.
    ///
    /// Returns the value observed before the update. When `value` does not
    /// exceed the current value the atomic is left untouched.
    fn store_max(&self, value: Self::Value) -> Self::Value;
}

macro_rules! impl_atomic_max {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl AtomicMax for $atomic {
                type Value = $value;

                fn store_max(&self, value: $value) -> $value {
                    let mut current = self.load(Ordering::Acquire);
                    while value > current {
                        match self.compare_exchange_weak(
                            current,
                            value,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(previous) => return previous,
                            Err(actual) => current = actual,
                        }
                    }
                    current
                }
            }
        )*
    };
}

impl_atomic_max! {
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
    AtomicI32 => i32,
    AtomicI64 => i64,
}

/// Free-function form of [`AtomicMax::store_max`].
pub fn atomic_max<A: AtomicMax>(atomic: &A, value: A::Value) -> A::Value {
    atomic.store_max(value)
}
