#![forbid(unsafe_code)]
//! Shared vocabulary for the FFS concurrency core.
//!
//! Value types only: identities, lock modes, request flags, and the
//! observable state of locks and mount barriers. Nothing in this crate
//! blocks or allocates shared state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable inode identity.
///
/// Used for lock ordering and diagnostics only, never for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Owner identity ──────────────────────────────────────────────────────────

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_OWNER: OwnerId = OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed));
}

/// Identity of the thread holding or requesting a lock.
///
/// Ids are assigned lazily, once per thread, and are never reused within a
/// process. `OwnerId(0)` is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl OwnerId {
    /// The id of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_OWNER.with(|id| *id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

// ── Lock vocabulary ─────────────────────────────────────────────────────────

/// Requested hold on an inode lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Options for a single lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockFlags {
    /// Fail with `WouldBlock` instead of waiting.
    pub try_only: bool,
    /// Let the exclusive owner take the lock again (recursive hold).
    pub allow_recurse: bool,
}

impl LockFlags {
    pub const BLOCKING: Self = Self {
        try_only: false,
        allow_recurse: false,
    };

    pub const TRY: Self = Self {
        try_only: true,
        allow_recurse: false,
    };

    #[must_use]
    pub const fn recursive(self) -> Self {
        Self {
            allow_recurse: true,
            ..self
        }
    }
}

/// Observable state of one inode lock.
///
/// `waiters` counts queued acquirers, including a pending upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked { waiters: u32 },
    Shared { count: u32, waiters: u32 },
    Exclusive { owner: OwnerId, waiters: u32 },
}

impl LockStatus {
    #[must_use]
    pub fn waiters(&self) -> u32 {
        match *self {
            Self::Unlocked { waiters }
            | Self::Shared { waiters, .. }
            | Self::Exclusive { waiters, .. } => waiters,
        }
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked { .. })
    }

    #[must_use]
    pub fn shared_count(&self) -> u32 {
        match *self {
            Self::Shared { count, .. } => count,
            _ => 0,
        }
    }

    #[must_use]
    pub fn exclusive_owner(&self) -> Option<OwnerId> {
        match *self {
            Self::Exclusive { owner, .. } => Some(owner),
            _ => None,
        }
    }
}

// ── Write-suspension vocabulary ─────────────────────────────────────────────

/// Options for entering a write-class operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFlags {
    /// Block while the mount is suspended; otherwise fail with `WouldBlock`.
    pub wait: bool,
    /// Secondary write (metadata flush on behalf of a suspension) that may
    /// proceed while suspended.
    pub secondary: bool,
}

impl WriteFlags {
    pub const WAIT: Self = Self {
        wait: true,
        secondary: false,
    };

    pub const NOWAIT: Self = Self {
        wait: false,
        secondary: false,
    };

    pub const SECONDARY: Self = Self {
        wait: true,
        secondary: true,
    };
}

#[allow(clippy::derivable_impls)]
impl Default for WriteFlags {
    fn default() -> Self {
        Self::WAIT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuspendFlags {
    /// Caller expects unmount may be racing it. A suspend that finds
    /// unmount started is refused with `Unmounting` either way; the flag
    /// only marks the refusal as anticipated in the trace.
    pub skip_if_unmounting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeFlags {
    /// Only clear barrier bookkeeping; skip the filesystem's resume hook.
    pub clear_only: bool,
}

/// Phase of a mount's write-suspension state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPhase {
    Normal,
    SuspendPending,
    Suspended,
}

impl fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::SuspendPending => f.write_str("suspend-pending"),
            Self::Suspended => f.write_str("suspended"),
        }
    }
}
