//! Abstracts over the runtime used by the crate, so that all atomic
//! operations, unsafe cells, and synchronization primitives can be replaced
//! with `loom`'s simulated versions when running loom models.
pub(crate) use self::inner::*;


#[cfg(not(all(test, loom)))]
mod inner {
    #![allow(dead_code)]

    pub(crate) mod hint {
        #[inline(always)]
        pub(crate) fn spin_loop() {
            core::hint::spin_loop()
        }
    }

    pub(crate) mod sync {
        #[cfg(feature = "alloc")]
        pub(crate) use alloc::sync::*;

        #[cfg(feature = "std")]
        pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};

        // `portable-atomic` provides the pointer-width atomics on every
        // target, and the 128-bit atomic that backs the counted-reference
        // pairs.
        pub(crate) mod atomic {
            pub(crate) use portable_atomic::*;
        }
    }

    #[cfg(any(feature = "std", test))]
    pub(crate) use std::thread;

    pub(crate) mod cell {
        #[derive(Debug)]
        pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub(crate) const fn new(data: T) -> UnsafeCell<T> {
                UnsafeCell(core::cell::UnsafeCell::new(data))
            }

            #[inline(always)]
            pub(crate) fn with<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*const T) -> R,
            {
                f(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn with_mut<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*mut T) -> R,
            {
                f(self.0.get())
            }
        }
    }

    pub(crate) mod alloc {
        /// Track allocations, detecting leaks
        ///
        /// When not running under loom, this is a no-op wrapper; the real leak
        /// checking only happens in simulated executions.
        #[derive(Debug, Default)]
        pub(crate) struct Track<T> {
            value: T,
        }

        impl<T> Track<T> {
            /// Track a value for leaks
            #[inline(always)]
            pub(crate) fn new(value: T) -> Track<T> {
                Track { value }
            }

            /// Get a reference to the value
            #[inline(always)]
            pub(crate) fn get_ref(&self) -> &T {
                &self.value
            }

            /// Stop tracking the value for leaks
            #[inline(always)]
            pub(crate) fn into_inner(self) -> T {
                self.value
            }
        }
    }
}
