//! Two-inode acquisition in a globally consistent order.
//!
//! Operations like rename and link need two inodes at once. Two threads
//! taking the same pair in opposite orders would deadlock, so pairs are
//! always taken lowest identity first (inode number, then object address as
//! a tie-break). The second lock is only *tried*; if it is busy, the first
//! is released, the thread waits for the second to become free, and the
//! whole round starts over.
//!
//! This is an ordering convention, not a deadlock detector. It protects
//! pairs taken through this module against each other and against holders
//! that need the lower inode while holding the higher one. It cannot see
//! cycles that involve a third lock, a barrier, or a pending
//! [`upgrade`](crate::InodeLock::upgrade).
//!
//! # Logging
//!
//! - **DEBUG** `ffs::inode::pair`: `inode_pair_backoff` (second lock busy)

use crate::guard::{InodeGuard, OwnedInodeGuard};
use crate::lock::InodeLock;
use ffs_error::{FfsError, Result};
use ffs_sync::CancelToken;
use ffs_types::{LockFlags, LockMode};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Whether a pair call referred to one object or two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    /// Both references are the same object, locked once.
    Same,
    Distinct,
}

fn ordered<'a>(a: &'a InodeLock, b: &'a InodeLock) -> (&'a InodeLock, &'a InodeLock) {
    let key = |l: &InodeLock| (l.ino(), std::ptr::from_ref(l) as usize);
    if key(a) <= key(b) { (a, b) } else { (b, a) }
}

/// Acquire both `a` and `b` in `mode`.
///
/// If `a` and `b` are the same object it is acquired exactly once and
/// [`PairKind::Same`] is returned; the caller must then release it once.
///
/// # Errors
///
/// `Interrupted` if `cancel` fires while waiting; any error from the
/// underlying acquisitions. On error neither lock is held.
pub fn acquire_pair(
    a: &InodeLock,
    b: &InodeLock,
    mode: LockMode,
    cancel: &CancelToken,
) -> Result<PairKind> {
    if std::ptr::eq(a, b) {
        a.acquire(mode, LockFlags::BLOCKING, cancel)?;
        return Ok(PairKind::Same);
    }

    let (first, second) = ordered(a, b);
    let policy = first.policy();
    let mut rounds: u32 = 0;
    loop {
        first.acquire(mode, LockFlags::BLOCKING, cancel)?;
        match second.acquire(mode, LockFlags::TRY, cancel) {
            Ok(()) => return Ok(PairKind::Distinct),
            Err(FfsError::WouldBlock) => {
                first.release();
                rounds = rounds.saturating_add(1);
                debug!(
                    target: "ffs::inode::pair",
                    first = first.ino().0,
                    second = second.ino().0,
                    %mode,
                    rounds,
                    "inode_pair_backoff"
                );
                // Wait until the second lock is obtainable, then start over
                // from the lower one.
                second.acquire(mode, LockFlags::BLOCKING, cancel)?;
                second.release();
                if policy.pair_retry_yield {
                    std::thread::yield_now();
                }
                cancel.checkpoint()?;
            }
            Err(err) => {
                first.release();
                return Err(err);
            }
        }
    }
}

/// Release a pair taken with [`acquire_pair`], higher identity first.
///
/// Both references are released even when they name the same object; the
/// manager does not deduplicate. Callers that got [`PairKind::Same`] release
/// the object once themselves.
pub fn release_pair(a: &InodeLock, b: &InodeLock) {
    let (first, second) = ordered(a, b);
    second.release();
    first.release();
}

/// Two holds taken together, released in reverse acquisition order on drop.
#[must_use = "the locks are released when the guard drops"]
pub struct PairGuard<'a> {
    // Fields drop in declaration order: the later acquisition goes first.
    second: Option<InodeGuard<'a>>,
    first: InodeGuard<'a>,
}

impl fmt::Debug for PairGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairGuard")
            .field("first", &self.first.lock().ino())
            .field("second", &self.second.as_ref().map(|g| g.lock().ino()))
            .finish()
    }
}

impl PairGuard<'_> {
    #[must_use]
    pub fn kind(&self) -> PairKind {
        if self.second.is_some() {
            PairKind::Distinct
        } else {
            PairKind::Same
        }
    }

    pub fn unlock(self) {}
}

/// Scoped [`acquire_pair`].
pub fn lock_pair<'a>(
    a: &'a InodeLock,
    b: &'a InodeLock,
    mode: LockMode,
    cancel: &CancelToken,
) -> Result<PairGuard<'a>> {
    match acquire_pair(a, b, mode, cancel)? {
        PairKind::Same => Ok(PairGuard {
            second: None,
            first: InodeGuard::adopt(a, mode),
        }),
        PairKind::Distinct => {
            let (first, second) = ordered(a, b);
            Ok(PairGuard {
                second: Some(InodeGuard::adopt(second, mode)),
                first: InodeGuard::adopt(first, mode),
            })
        }
    }
}

/// [`acquire_pair`] returning owned guards in acquisition order. The second
/// entry is `None` when both references name the same object.
pub fn lock_pair_owned(
    a: &Arc<InodeLock>,
    b: &Arc<InodeLock>,
    mode: LockMode,
    cancel: &CancelToken,
) -> Result<(OwnedInodeGuard, Option<OwnedInodeGuard>)> {
    match acquire_pair(a, b, mode, cancel)? {
        PairKind::Same => Ok((OwnedInodeGuard::adopt(Arc::clone(a), mode), None)),
        PairKind::Distinct => {
            let (first, second) = if std::ptr::eq(ordered(a, b).0, &**a) {
                (a, b)
            } else {
                (b, a)
            };
            Ok((
                OwnedInodeGuard::adopt(Arc::clone(first), mode),
                Some(OwnedInodeGuard::adopt(Arc::clone(second), mode)),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_sync::{LockGroup, LockPolicy};
    use ffs_types::InodeNumber;
    use std::thread;
    use std::time::{Duration, Instant};

    fn locks(inos: &[u64]) -> Vec<Arc<InodeLock>> {
        let group = LockGroup::detached("inode", LockPolicy::default());
        inos.iter()
            .map(|ino| Arc::new(InodeLock::new(InodeNumber(*ino), Arc::clone(&group))))
            .collect()
    }

    #[test]
    fn same_object_is_locked_once() {
        let l = locks(&[4]);
        let cancel = CancelToken::new();
        let kind = acquire_pair(&l[0], &l[0], LockMode::Exclusive, &cancel).expect("pair");
        assert_eq!(kind, PairKind::Same);
        assert!(l[0].status().exclusive_owner().is_some());
        l[0].release();
        assert!(l[0].status().is_unlocked());
    }

    #[test]
    fn release_pair_releases_both() {
        let l = locks(&[9, 5]);
        let cancel = CancelToken::new();
        let kind = acquire_pair(&l[0], &l[1], LockMode::Shared, &cancel).expect("pair");
        assert_eq!(kind, PairKind::Distinct);
        assert_eq!(l[0].held_by_current(), Some(LockMode::Shared));
        assert_eq!(l[1].held_by_current(), Some(LockMode::Shared));
        release_pair(&l[0], &l[1]);
        assert!(l[0].status().is_unlocked());
        assert!(l[1].status().is_unlocked());
    }

    #[test]
    fn pair_guard_drops_both() {
        let l = locks(&[2, 3]);
        {
            let guard = lock_pair(&l[1], &l[0], LockMode::Exclusive, &CancelToken::new())
                .expect("pair");
            assert_eq!(guard.kind(), PairKind::Distinct);
        }
        assert!(l[0].status().is_unlocked());
        assert!(l[1].status().is_unlocked());
    }

    #[test]
    fn owned_pair_is_in_acquisition_order() {
        let l = locks(&[8, 3]);
        let cancel = CancelToken::new();
        let (first, second) =
            lock_pair_owned(&l[0], &l[1], LockMode::Shared, &cancel).expect("pair");
        assert_eq!(first.ino(), InodeNumber(3));
        assert_eq!(second.as_ref().map(OwnedInodeGuard::ino), Some(InodeNumber(8)));
        drop(second);
        drop(first);

        let (only, none) = lock_pair_owned(&l[0], &l[0], LockMode::Shared, &cancel).expect("same");
        assert!(none.is_none());
        only.unlock();
        assert!(l[0].status().is_unlocked() && l[1].status().is_unlocked());
    }

    #[test]
    fn backs_off_when_second_is_busy() {
        let l = locks(&[5, 9]);
        let holder_cancel = CancelToken::new();
        // Hold the higher inode from another thread for a short while.
        let (lo, hi) = (Arc::clone(&l[0]), Arc::clone(&l[1]));
        let started = Arc::new(std::sync::Barrier::new(2));
        let holder = {
            let hi = Arc::clone(&hi);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                hi.acquire(LockMode::Exclusive, LockFlags::BLOCKING, &holder_cancel)
                    .expect("holder");
                started.wait();
                thread::sleep(Duration::from_millis(30));
                hi.release();
            })
        };
        started.wait();
        let begin = Instant::now();
        acquire_pair(&lo, &hi, LockMode::Exclusive, &CancelToken::new()).expect("pair");
        assert!(begin.elapsed() >= Duration::from_millis(10));
        holder.join().expect("holder thread");
        release_pair(&lo, &hi);
        assert!(lo.status().is_unlocked() && hi.status().is_unlocked());
    }

    #[test]
    fn cancelled_pair_holds_nothing() {
        let l = locks(&[5, 9]);
        let cancel = CancelToken::new();
        l[1].acquire(LockMode::Exclusive, LockFlags::BLOCKING, &cancel)
            .expect("hold second");
        let token = CancelToken::new();
        let waiter = {
            let (lo, hi, token) = (Arc::clone(&l[0]), Arc::clone(&l[1]), token.clone());
            thread::spawn(move || acquire_pair(&lo, &hi, LockMode::Shared, &token))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while l[1].status().waiters() == 0 {
            assert!(Instant::now() < deadline, "pair never blocked");
            thread::sleep(Duration::from_millis(1));
        }
        token.cancel();
        assert!(matches!(
            waiter.join().expect("waiter thread"),
            Err(FfsError::Interrupted)
        ));
        assert!(l[0].status().is_unlocked());
        l[1].release();
    }
}
