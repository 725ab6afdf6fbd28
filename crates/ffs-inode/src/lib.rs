#![forbid(unsafe_code)]
//! Inode lock manager.
//!
//! Per-inode reader/writer locks with upgrade, downgrade, recursion,
//! cancellation and condition notification, plus ordered two-inode
//! acquisition and the inode table that creates and reclaims lock objects.

mod guard;
mod lock;
mod pair;
mod table;

pub use guard::{InodeGuard, OwnedInodeGuard};
pub use lock::{InodeCondition, InodeLock};
pub use pair::{PairGuard, PairKind, acquire_pair, lock_pair, lock_pair_owned, release_pair};
pub use table::InodeTable;
