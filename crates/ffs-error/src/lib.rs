#![forbid(unsafe_code)]
//! Error types for the FFS concurrency core.
//!
//! # Error Taxonomy
//!
//! Two classes of failure exist and they never mix:
//!
//! | Class | Type | Handling |
//! |-------|------|----------|
//! | Recoverable | [`FfsError`] | Returned to the immediate caller (the operation dispatcher) |
//! | Contract violation | [`Violation`] | Reported through [`fatal`], which never returns |
//!
//! Recoverable errors describe operational outcomes: a non-blocking request
//! could not proceed, a wait was cancelled, the object or mount changed state
//! underneath the caller. The dispatcher decides whether to retry or to fail
//! the filesystem call.
//!
//! Violations mean the lock model itself has been broken (unmatched release,
//! destroy while held, barrier exit without enter). Continuing would risk
//! silent corruption, so they stop the thread with a panic after logging at
//! ERROR. Tests observe them with `#[should_panic]`.
//!
//! ## errno Mapping
//!
//! Every `FfsError` variant maps to exactly one POSIX errno via
//! [`FfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `WouldBlock` | `EAGAIN` |
//! | `Interrupted` | `EINTR` |
//! | `Recursion` | `EDEADLK` |
//! | `LockGone` | `ENOENT` |
//! | `AlreadySuspended` | `EALREADY` |
//! | `Unmounting` | `EBUSY` |
//! | `NotFound` | `ENOENT` |
//! | `Config` | `EINVAL` |
//! | `Io` | raw OS error or `EIO` |

use std::fmt;
use thiserror::Error;
use tracing::error;

/// Recoverable error for lock, barrier, and mount operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// A non-blocking request could not proceed without waiting.
    #[error("operation would block")]
    WouldBlock,

    /// A blocking wait was cancelled before it was satisfied.
    #[error("wait interrupted")]
    Interrupted,

    /// The caller already holds the lock exclusively and did not ask for a
    /// recursive hold.
    #[error("recursive acquisition of inode {ino} refused")]
    Recursion { ino: u64 },

    /// The object was destroyed or revoked while the caller waited for it.
    #[error("inode {ino} lock is gone")]
    LockGone { ino: u64 },

    /// Another thread already owns write suspension on this mount.
    #[error("mount is already suspended")]
    AlreadySuspended,

    /// The mount is being torn down.
    #[error("mount is unmounting")]
    Unmounting,

    /// Named object is not present (inode table lookup, config file).
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or out-of-range configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FfsError {
    /// Convert this error into a POSIX errno for the host's syscall reply.
    ///
    /// Policy notes:
    /// - `LockGone` → `ENOENT`: a revoked inode looks like a vanished file.
    /// - `Recursion` → `EDEADLK`: the request would deadlock its own thread.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::WouldBlock => libc::EAGAIN,
            Self::Interrupted => libc::EINTR,
            Self::Recursion { .. } => libc::EDEADLK,
            Self::LockGone { .. } | Self::NotFound(_) => libc::ENOENT,
            Self::AlreadySuspended => libc::EALREADY,
            Self::Unmounting => libc::EBUSY,
            Self::Config(_) => libc::EINVAL,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether retrying the same request later can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::AlreadySuspended)
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

// ── Fatal contract violations ───────────────────────────────────────────────

/// A broken lock or barrier contract.
///
/// These are programming errors in the caller, not operational conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `release` by a thread that holds no hold on the lock.
    ReleaseNotHeld { ino: u64, owner: u64 },
    /// `downgrade` by a thread that is not the exclusive owner.
    DowngradeNotOwner { ino: u64, owner: u64 },
    /// `upgrade` by a thread that holds no shared hold.
    UpgradeNotShared { ino: u64, owner: u64 },
    /// `notify` or `clear_condition` without the exclusive lock.
    NotifyWithoutExclusive { ino: u64, owner: u64 },
    /// `revoke` without the exclusive lock.
    RevokeWithoutExclusive { ino: u64, owner: u64 },
    /// Object destroyed while a hold is outstanding.
    DestroyWhileHeld { ino: u64 },
    /// Object destroyed while threads are queued on it.
    DestroyWithWaiters { ino: u64, waiters: u32 },
    /// Object destroyed a second time.
    DoubleDestroy { ino: u64 },
    /// Barrier exit with no write in flight.
    ExitWithoutEnter,
    /// Barrier torn down while writes are in flight or suspended.
    TeardownWhileActive { in_flight: u64, phase: String },
    /// Lock registry torn down while locks of a group are alive.
    RegistryInUse { group: String, live: u64 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleaseNotHeld { ino, owner } => {
                write!(f, "release of inode {ino} by owner#{owner}, which holds no lock")
            }
            Self::DowngradeNotOwner { ino, owner } => {
                write!(f, "downgrade of inode {ino} by non-owner owner#{owner}")
            }
            Self::UpgradeNotShared { ino, owner } => {
                write!(f, "upgrade of inode {ino} by owner#{owner} without a shared hold")
            }
            Self::NotifyWithoutExclusive { ino, owner } => {
                write!(f, "notify on inode {ino} by owner#{owner} without the exclusive lock")
            }
            Self::RevokeWithoutExclusive { ino, owner } => {
                write!(f, "revoke of inode {ino} by owner#{owner} without the exclusive lock")
            }
            Self::DestroyWhileHeld { ino } => write!(f, "destroy of inode {ino} while held"),
            Self::DestroyWithWaiters { ino, waiters } => {
                write!(f, "destroy of inode {ino} with {waiters} waiters")
            }
            Self::DoubleDestroy { ino } => write!(f, "double destroy of inode {ino}"),
            Self::ExitWithoutEnter => f.write_str("write exit without matching enter"),
            Self::TeardownWhileActive { in_flight, phase } => write!(
                f,
                "barrier teardown with {in_flight} writes in flight in phase {phase}"
            ),
            Self::RegistryInUse { group, live } => {
                write!(f, "lock registry teardown with {live} live locks in group {group}")
            }
        }
    }
}

/// Report a contract violation and stop the calling thread.
///
/// Never returns. The violation is logged at ERROR before panicking so that
/// the event is visible even when the panic is caught by a host runtime.
#[track_caller]
pub fn fatal(violation: Violation) -> ! {
    error!(target: "ffs::fatal", violation = %violation, "lock invariant violated");
    panic!("fatal lock invariant violation: {violation}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::WouldBlock, libc::EAGAIN),
            (FfsError::Interrupted, libc::EINTR),
            (FfsError::Recursion { ino: 5 }, libc::EDEADLK),
            (FfsError::LockGone { ino: 5 }, libc::ENOENT),
            (FfsError::AlreadySuspended, libc::EALREADY),
            (FfsError::Unmounting, libc::EBUSY),
            (FfsError::NotFound("inode 9".into()), libc::ENOENT),
            (FfsError::Config("bad".into()), libc::EINVAL),
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let ffs = FfsError::Io(raw);
        assert_eq!(ffs.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            FfsError::Recursion { ino: 12 }.to_string(),
            "recursive acquisition of inode 12 refused"
        );
        assert_eq!(FfsError::LockGone { ino: 3 }.to_string(), "inode 3 lock is gone");
        assert_eq!(FfsError::Unmounting.to_string(), "mount is unmounting");
        assert_eq!(
            Violation::DestroyWithWaiters { ino: 4, waiters: 2 }.to_string(),
            "destroy of inode 4 with 2 waiters"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(FfsError::WouldBlock.is_transient());
        assert!(FfsError::AlreadySuspended.is_transient());
        assert!(!FfsError::Interrupted.is_transient());
        assert!(!FfsError::LockGone { ino: 1 }.is_transient());
    }

    #[test]
    #[should_panic(expected = "fatal lock invariant violation: double destroy of inode 7")]
    fn fatal_panics_with_violation() {
        fatal(Violation::DoubleDestroy { ino: 7 });
    }
}
