#![forbid(unsafe_code)]
//! Mount record and operation dispatch.
//!
//! A [`Mount`] ties together the pieces of the concurrency core for one
//! filesystem instance: the lock-group registry, the inode table and the
//! write-suspension barrier. Filesystem operations run through
//! [`Mount::run`], which takes the barrier and the inode locks an operation
//! needs, in that order, and releases them on every return path.

mod config;
mod mount;

pub use config::MountConfig;
pub use mount::{Mount, MountStats, RequestScope, UnmountReport};

use ffs_types::{InodeNumber, LockMode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// VFS operation kind.
///
/// The kind decides the lock mode taken on the target inodes and whether
/// the operation passes the write-suspension barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOp {
    Lookup,
    Getattr,
    Read,
    Create,
    Write,
    Truncate,
    Setattr,
    Sync,
    Rename,
    Link,
    Remove,
}

impl RequestOp {
    pub const ALL: [Self; 11] = [
        Self::Lookup,
        Self::Getattr,
        Self::Read,
        Self::Create,
        Self::Write,
        Self::Truncate,
        Self::Setattr,
        Self::Sync,
        Self::Rename,
        Self::Link,
        Self::Remove,
    ];

    /// Whether the operation mutates on-disk state.
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Lookup | Self::Getattr | Self::Read)
    }

    #[must_use]
    pub const fn lock_mode(self) -> LockMode {
        if self.is_write() {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }

    /// Operations that normally name two inodes (source and destination).
    #[must_use]
    pub const fn is_pairwise(self) -> bool {
        matches!(self, Self::Rename | Self::Link)
    }
}

impl fmt::Display for RequestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lookup => "lookup",
            Self::Getattr => "getattr",
            Self::Read => "read",
            Self::Create => "create",
            Self::Write => "write",
            Self::Truncate => "truncate",
            Self::Setattr => "setattr",
            Self::Sync => "sync",
            Self::Rename => "rename",
            Self::Link => "link",
            Self::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Inodes an operation locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTarget {
    /// Only take the barrier (for example a mount-wide sync).
    None,
    One(InodeNumber),
    Pair(InodeNumber, InodeNumber),
}

impl RequestTarget {
    #[must_use]
    pub fn inodes(&self) -> Vec<InodeNumber> {
        match *self {
            Self::None => Vec::new(),
            Self::One(ino) => vec![ino],
            Self::Pair(a, b) => vec![a, b],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_class_ops_are_shared_and_skip_barrier() {
        for op in [RequestOp::Lookup, RequestOp::Getattr, RequestOp::Read] {
            assert!(!op.is_write(), "{op}");
            assert_eq!(op.lock_mode(), LockMode::Shared, "{op}");
        }
    }

    #[test]
    fn write_class_ops_are_exclusive() {
        let writes: Vec<RequestOp> = RequestOp::ALL
            .into_iter()
            .filter(|op| op.is_write())
            .collect();
        assert_eq!(writes.len(), 8);
        assert!(writes.iter().all(|op| op.lock_mode() == LockMode::Exclusive));
        assert!(RequestOp::Rename.is_pairwise());
        assert!(!RequestOp::Write.is_pairwise());
    }

    #[test]
    fn ops_serialize_snake_case() {
        let json = serde_json::to_string(&RequestOp::Setattr).expect("serialize");
        assert_eq!(json, "\"setattr\"");
        let target = RequestTarget::Pair(InodeNumber(5), InodeNumber(9));
        assert_eq!(target.inodes(), vec![InodeNumber(5), InodeNumber(9)]);
        assert!(RequestTarget::None.inodes().is_empty());
    }
}
