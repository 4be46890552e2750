//! A module which decides which synchronization primitives to use throughout the rest of the crate
//! depending on features and configuration options

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
        pub(crate) use loom::sync::Arc;

        /// Give up the processor while spinning on another thread's progress.
        pub(crate) fn relax() {
            loom::thread::yield_now();
        }
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
        pub(crate) use shuttle::sync::Arc;

        /// Give up the processor while spinning on another thread's progress.
        pub(crate) fn relax() {
            shuttle::thread::yield_now();
        }
    } else if #[cfg(feature = "std")] {
        pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
        pub(crate) use std::sync::Arc;

        /// Give up the processor while spinning on another thread's progress.
        pub(crate) fn relax() {
            core::hint::spin_loop();
            std::thread::yield_now();
        }
    } else {
        pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
        pub(crate) use alloc::sync::Arc;

        /// Give up the processor while spinning on another thread's progress.
        pub(crate) fn relax() {
            core::hint::spin_loop();
        }
    }
}
