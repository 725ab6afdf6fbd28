#![forbid(unsafe_code)]
//! FFS concurrency core public API facade.
//!
//! Re-exports the mount and dispatch layer from `ffs-core` together with the
//! lock manager, barrier and vocabulary types it is built from. This is the
//! crate that downstream consumers (the operation layer and the harness)
//! depend on.

pub use ffs_core::*;
pub use ffs_error::{FfsError, Result, Violation};
pub use ffs_inode::{
    InodeCondition, InodeGuard, InodeLock, InodeTable, OwnedInodeGuard, PairGuard, PairKind,
    acquire_pair, lock_pair, lock_pair_owned, release_pair,
};
pub use ffs_suspend::{BarrierSnapshot, MountBarrier, SuspendListener, WriteGuard};
pub use ffs_sync::{
    CancelToken, LockEvent, LockGroup, LockGroupStats, LockObserver, LockOp, LockPolicy,
    LockRegistry, TracingObserver,
};
pub use ffs_types::{
    BarrierPhase, InodeNumber, LockFlags, LockMode, LockStatus, OwnerId, ResumeFlags,
    SuspendFlags, WriteFlags,
};
