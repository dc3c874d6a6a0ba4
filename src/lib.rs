//! # spec-exec-rt
//!
//! A runtime library for thread-level speculative (TLS) loop execution.
//!
//! Given a sequential loop body exposed as an executor callback, this
//! crate runs successive iterations in parallel across worker threads,
//! optimistically assuming they are independent. It detects data-dependence
//! violations between iterations at run time, rolls back offending
//! iterations, and commits results to memory in sequential order. The
//! guarantee to the caller is *sequential equivalence*: the visible side
//! effects on memory — modulo the restricted shared-access interface —
//! are those of running the iterations one after another in program order.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`cc`] - Bit manipulation and branch-hint primitives
//! - [`pr`] - Atomic primitives and memory barriers
//! - [`malloc`] - Memory allocator abstraction
//! - [`backoff`] - Exponential backoff for contention management
//!
//! ### Locks
//! - [`spinlock`] - Fetch-and-store and ticket spinlocks
//! - [`rwlock`] - Reader-writer lock (guards the sequencer's rollback path)
//! - [`barrier`] - Thread rendezvous barriers (drives the worker pool)
//!
//! ### Speculative execution core
//! - [`bits`] - Circular bit-range masks over the epoch ring
//! - [`slots`] - Per-worker single-writer slot storage
//! - [`recordpool`] - Per-worker pooled allocation of address records
//! - [`record`] - The per-address read/write/commit metadata
//! - [`map`] - Lock-free concurrent address-to-record map
//! - [`sequencer`] - The epoch state machine and commit/rollback cursors
//! - [`tracker`] - Violation detection and load forwarding
//! - [`workers`] - The CPU-pinned worker pool
//! - [`driver`] - The top-level `Runtime` and `exec_simple` entry point
//!
//! ### Ambient
//! - [`config`] - Runtime configuration
//! - [`error`] - The runtime's error taxonomy
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use spec_exec_rt::config::RuntimeConfig;
//! use spec_exec_rt::driver::{ExecOutcome, Runtime};
//!
//! let rt = Runtime::new(RuntimeConfig::new().with_thread_count(4)).unwrap();
//!
//! let i = AtomicU64::new(0);
//! let a = AtomicU64::new(0);
//! let i_addr = &i as *const AtomicU64 as usize;
//! let a_addr = &a as *const AtomicU64 as usize;
//!
//! rt.exec_simple(
//!     |pool_id, _user_data| {
//!         let mut cur = unsafe { rt.dep_load(pool_id, i_addr) };
//!         cur += 1;
//!         unsafe { rt.dep_store(pool_id, cur, i_addr) };
//!         if cur > 100 {
//!             return ExecOutcome::Break;
//!         }
//!         let mut sum = unsafe { rt.dep_load(pool_id, a_addr) };
//!         sum += cur;
//!         unsafe { rt.dep_store(pool_id, sum, a_addr) };
//!         ExecOutcome::Continue
//!     },
//!     std::ptr::null_mut(),
//! )
//! .unwrap();
//!
//! assert_eq!(i.load(Ordering::Acquire), 101);
//! assert_eq!(a.load(Ordering::Acquire), 5050);
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

/// Bit manipulation and branch-hint primitives.
pub mod cc;

/// Memory allocator abstraction.
pub mod malloc;

/// Atomic primitives and memory barriers.
pub mod pr;

/// Exponential backoff for contention management.
pub mod backoff;

/// Various spinlock implementations.
pub mod spinlock;

/// Reader-writer lock.
pub mod rwlock;

/// Execution barriers.
pub mod barrier;

/// Circular bit-range masks over the epoch ring.
pub mod bits;

/// Per-thread, single-writer slot storage.
pub mod slots;

/// Pooled per-worker allocation of fixed-size objects.
pub mod recordpool;

/// The per-address read/write/commit metadata record.
pub mod record;

/// Lock-free concurrent address-to-record map.
pub mod map;

/// The epoch sequencer: assignment, lifecycle, rollback cascade, commit order.
pub mod sequencer;

/// The dependency tracker: violation detection and load forwarding.
pub mod tracker;

/// The fixed-size, CPU-pinned worker pool.
pub mod workers;

/// Runtime configuration.
pub mod config;

/// The runtime's error taxonomy.
pub mod error;

/// The top-level driver: `Runtime` and `exec_simple`.
pub mod driver;

pub use config::RuntimeConfig;
pub use driver::{destroy, init, ExecOutcome, Executor, Runtime};
pub use error::RuntimeError;
