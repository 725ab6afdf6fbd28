#![forbid(unsafe_code)]
//! Host-side synchronization support shared by the inode lock manager and
//! the write-suspension barrier.
//!
//! - [`CancelToken`]: external cancellation and deadline budgets for
//!   blocking waits.
//! - [`LockObserver`]: optional instrumentation hook fired on lock state
//!   transitions.
//! - [`LockRegistry`]: per-mount registry of lock groups (debug categories,
//!   grant policy, statistics) with an explicit init/teardown lifecycle.

pub mod cancel;
pub mod observer;
pub mod registry;

pub use cancel::{ArmedWait, CancelToken, WakerRegistration};
pub use observer::{LockEvent, LockObserver, LockOp, TracingObserver};
pub use registry::{LockGroup, LockGroupStats, LockPolicy, LockRegistry};
