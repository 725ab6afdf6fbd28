//! In-memory inode table: one lock object per referenced inode.
//!
//! Lookup-or-create hands out shared references to the inode's lock.
//! Reclaim destroys the lock (which must be idle) and forgets the entry.
//!
//! # Logging
//!
//! - **DEBUG** `ffs::inode::table`: `inode_created`, `inode_reclaimed`

use crate::lock::InodeLock;
use ffs_error::{FfsError, Result};
use ffs_sync::LockGroup;
use ffs_types::InodeNumber;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct InodeTable {
    group: Arc<LockGroup>,
    inodes: Mutex<HashMap<InodeNumber, Arc<InodeLock>>>,
}

impl InodeTable {
    #[must_use]
    pub fn new(group: Arc<LockGroup>) -> Self {
        Self {
            group,
            inodes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn group(&self) -> &Arc<LockGroup> {
        &self.group
    }

    /// Look up `ino`, creating its lock on first reference.
    pub fn get_or_create(&self, ino: InodeNumber) -> Arc<InodeLock> {
        let mut inodes = self.inodes.lock();
        if let Some(lock) = inodes.get(&ino) {
            return Arc::clone(lock);
        }
        let lock = Arc::new(InodeLock::new(ino, Arc::clone(&self.group)));
        inodes.insert(ino, Arc::clone(&lock));
        drop(inodes);
        debug!(target: "ffs::inode::table", ino = ino.0, "inode_created");
        lock
    }

    #[must_use]
    pub fn get(&self, ino: InodeNumber) -> Option<Arc<InodeLock>> {
        self.inodes.lock().get(&ino).cloned()
    }

    /// Destroy the lock of `ino` and drop it from the table.
    ///
    /// The lock must be unlocked with no waiters; otherwise this is a fatal
    /// violation. Outstanding `Arc` references see `LockGone` afterwards.
    ///
    /// # Errors
    ///
    /// `NotFound` if `ino` is not in the table.
    pub fn reclaim(&self, ino: InodeNumber) -> Result<()> {
        let mut inodes = self.inodes.lock();
        let lock = inodes
            .get(&ino)
            .cloned()
            .ok_or_else(|| FfsError::NotFound(format!("inode {ino}")))?;
        lock.destroy();
        inodes.remove(&ino);
        drop(inodes);
        debug!(target: "ffs::inode::table", ino = ino.0, "inode_reclaimed");
        Ok(())
    }

    /// Reclaim every inode, lowest number first. Returns how many were
    /// reclaimed.
    pub fn reclaim_all(&self) -> usize {
        let mut inodes = self.inodes.lock();
        let mut drained: Vec<(InodeNumber, Arc<InodeLock>)> = inodes.drain().collect();
        drop(inodes);
        drained.sort_by_key(|(ino, _)| *ino);
        for (_, lock) in &drained {
            lock.destroy();
        }
        drained.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.lock().is_empty()
    }
}
