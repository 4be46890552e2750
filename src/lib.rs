//! Read-Log-Update: readers traverse shared structures without blocking while writers lock
//! objects into private per-thread logs and publish all of a section's changes at once after
//! every concurrent reader has moved on.
//!
//! Objects are allocated with [alloc] and referred to through copyable [RluPtr]s. Each thread
//! registers with a shared [Rlu] instance and works inside sections:
//!
//! ```
//! use rlu::{Config, Rlu, RluPtr};
//!
//! let rlu: Rlu<4> = Rlu::new(Config::default()).unwrap();
//! let mut handle = rlu.register().unwrap();
//! let counter: RluPtr<u64> = rlu::alloc(0).unwrap();
//!
//! handle.execute(|section| {
//!     let mut ptr: RluPtr<u64> = counter;
//!     unsafe { section.update(&mut ptr, |value| *value += 1) }
//! });
//! assert_eq!(handle.read(|section| unsafe { section.get(counter) }), 1);
//!
//! drop(handle);
//! unsafe { rlu::free_unprotected(counter) };
//! ```
//!
//! # Safety
//!
//! An [RluPtr] is a plain address. Nothing ties it to the lifetime of the object behind it, so
//! every operation that follows one is `unsafe` and the caller promises the object is still
//! allocated. Inside a section that holds for any pointer read from a shared structure in the
//! same section, since objects unlinked by other threads are released only after this section
//! ends.
//!
//! ```compile_fail,E0133
//! use rlu::{Rlu, RluPtr};
//!
//! let rlu: Rlu<1> = Rlu::default();
//! let mut handle = rlu.register().unwrap();
//! let object: RluPtr<u64> = rlu::alloc(0).unwrap();
//! handle.read(|section| section.deref(object));
//! ```
//!
//! ```compile_fail,E0133
//! use rlu::{Rlu, RluPtr};
//!
//! let rlu: Rlu<1> = Rlu::default();
//! let mut handle = rlu.register().unwrap();
//! let object: RluPtr<u64> = rlu::alloc(0).unwrap();
//! handle.execute(|section| {
//!     section.free(object);
//!     Ok(())
//! });
//! ```
//!
//! ```compile_fail,E0133
//! let object: rlu::RluPtr<u64> = rlu::alloc(0).unwrap();
//! assert!(!object.is_copy());
//! ```
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod config;
mod context;
pub mod err;
mod handle;
mod object;
mod rlu;
mod stats;
mod sync;
mod types;
mod write_set;

pub use crate::config::{Config, Mode};
pub use crate::err::{ConfigError, Contention, Error, NoThreadSlotAvailableError};
pub use crate::handle::{ArcThreadHandle, RefThreadHandle, Section, ThreadHandle};
pub use crate::object::{alloc, assign_pointer, cmp_ptrs, free_unprotected, RluPtr};
pub use crate::rlu::{Rlu, MAX_NESTED_WRITER_LOCKS, MAX_WRITER_LOCKS};
pub use crate::stats::Stats;
pub use crate::types::WriterLockId;
