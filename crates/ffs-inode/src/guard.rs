//! Scoped holds on inode locks.

use crate::lock::InodeLock;
use ffs_error::Result;
use ffs_sync::CancelToken;
use ffs_types::{InodeNumber, LockFlags, LockMode, OwnerId};
use std::fmt;
use std::sync::Arc;

/// A hold on one inode lock, released on drop.
#[must_use = "the lock is released when the guard drops"]
pub struct InodeGuard<'a> {
    lock: &'a InodeLock,
    mode: LockMode,
    owner: OwnerId,
    held: bool,
}

impl fmt::Debug for InodeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeGuard")
            .field("ino", &self.lock.ino())
            .field("mode", &self.mode)
            .field("held", &self.held)
            .finish()
    }
}

impl<'a> InodeGuard<'a> {
    pub(crate) fn adopt(lock: &'a InodeLock, mode: LockMode) -> Self {
        Self {
            lock,
            mode,
            owner: OwnerId::current(),
            held: true,
        }
    }

    #[must_use]
    pub fn lock(&self) -> &'a InodeLock {
        self.lock
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Upgrade a shared guard to exclusive.
    ///
    /// On error the guard holds nothing and dropping it is a no-op.
    pub fn upgrade(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.mode == LockMode::Exclusive {
            return Ok(());
        }
        match self.lock.upgrade_as(self.owner, cancel) {
            Ok(()) => {
                self.mode = LockMode::Exclusive;
                Ok(())
            }
            Err(err) => {
                self.held = false;
                Err(err)
            }
        }
    }

    /// Downgrade an exclusive guard to shared.
    pub fn downgrade(&mut self) {
        if self.mode == LockMode::Exclusive {
            self.lock.downgrade_as(self.owner);
            self.mode = LockMode::Shared;
        }
    }

    /// Release now instead of at end of scope.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.lock.release_as(self.owner);
        }
    }
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Like [`InodeGuard`], but keeps the lock alive through an `Arc` so it can
/// be stored next to other request state.
///
/// The hold belongs to the thread that took it; it is released on that
/// thread's behalf wherever the guard is dropped.
#[must_use = "the lock is released when the guard drops"]
pub struct OwnedInodeGuard {
    lock: Arc<InodeLock>,
    mode: LockMode,
    owner: OwnerId,
    held: bool,
}

impl fmt::Debug for OwnedInodeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedInodeGuard")
            .field("ino", &self.lock.ino())
            .field("mode", &self.mode)
            .field("held", &self.held)
            .finish()
    }
}

impl OwnedInodeGuard {
    pub(crate) fn adopt(lock: Arc<InodeLock>, mode: LockMode) -> Self {
        Self {
            lock,
            mode,
            owner: OwnerId::current(),
            held: true,
        }
    }

    #[must_use]
    pub fn lock(&self) -> &Arc<InodeLock> {
        &self.lock
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.lock.ino()
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.lock.release_as(self.owner);
        }
    }
}

impl Drop for OwnedInodeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl InodeLock {
    /// Acquire `mode` and return a guard that releases on drop.
    pub fn lock(&self, mode: LockMode, cancel: &CancelToken) -> Result<InodeGuard<'_>> {
        self.acquire(mode, LockFlags::BLOCKING, cancel)?;
        Ok(InodeGuard::adopt(self, mode))
    }

    /// Non-blocking [`lock`](Self::lock).
    pub fn try_lock(&self, mode: LockMode) -> Result<InodeGuard<'_>> {
        self.acquire(mode, LockFlags::TRY, &CancelToken::new())?;
        Ok(InodeGuard::adopt(self, mode))
    }

    /// [`lock`](Self::lock) returning a guard that owns a reference to the
    /// lock.
    pub fn lock_owned(
        self: &Arc<Self>,
        mode: LockMode,
        cancel: &CancelToken,
    ) -> Result<OwnedInodeGuard> {
        self.acquire(mode, LockFlags::BLOCKING, cancel)?;
        Ok(OwnedInodeGuard::adopt(Arc::clone(self), mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_error::FfsError;
    use ffs_sync::{LockGroup, LockPolicy};

    fn lock(ino: u64) -> InodeLock {
        InodeLock::new(InodeNumber(ino), LockGroup::detached("inode", LockPolicy::default()))
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = lock(1);
        {
            let guard = lock.lock(LockMode::Exclusive, &CancelToken::new()).expect("lock");
            assert_eq!(guard.mode(), LockMode::Exclusive);
            assert!(matches!(
                lock.try_lock(LockMode::Shared),
                Err(FfsError::Recursion { ino: 1 })
            ));
        }
        assert!(lock.status().is_unlocked());
    }

    #[test]
    fn guard_upgrade_and_downgrade() {
        let lock = lock(2);
        let cancel = CancelToken::new();
        let mut guard = lock.lock(LockMode::Shared, &cancel).expect("lock");
        guard.upgrade(&cancel).expect("upgrade");
        assert_eq!(lock.held_by_current(), Some(LockMode::Exclusive));
        guard.downgrade();
        assert_eq!(lock.held_by_current(), Some(LockMode::Shared));
        guard.unlock();
        assert!(lock.status().is_unlocked());
    }

    #[test]
    fn owned_guard_releases_for_taking_thread() {
        let lock = Arc::new(lock(4));
        let guard = lock
            .lock_owned(LockMode::Exclusive, &CancelToken::new())
            .expect("lock");
        assert_eq!(guard.ino(), InodeNumber(4));
        // Dropping on another thread still releases this thread's hold.
        std::thread::spawn(move || drop(guard))
            .join()
            .expect("dropper thread");
        assert!(lock.status().is_unlocked());
    }

    #[test]
    fn failed_upgrade_leaves_nothing_to_release() {
        let lock = lock(3);
        let cancel = CancelToken::new();
        let mut guard = lock.lock(LockMode::Shared, &cancel).expect("lock");
        let other = std::thread::scope(|s| {
            s.spawn(|| lock.acquire(LockMode::Shared, LockFlags::BLOCKING, &CancelToken::new()))
                .join()
                .expect("other reader")
        });
        other.expect("second shared hold");
        // The other thread's hold blocks the upgrade; cancel it up front.
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(guard.upgrade(&token), Err(FfsError::Interrupted)));
        drop(guard);
        assert_eq!(lock.status().shared_count(), 1);
    }
}
