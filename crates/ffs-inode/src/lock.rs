//! Per-inode reader/writer lock.
//!
//! # State
//!
//! All lock state sits behind a meta-lock (`parking_lot::Mutex`) that is
//! distinct from the logical lock it implements. Every transition happens
//! with the meta-lock held; blocked callers park on a `Condvar`, which drops
//! the meta-lock while parked.
//!
//! Waiters are served by direct handoff: the releasing thread decides who
//! gets the lock, applies the new holders to the state, and marks their
//! tickets granted. Woken threads only collect their grant, so a newcomer can
//! never steal a lock that was handed to a queued waiter.
//!
//! # Grant policy
//!
//! 1. A pending upgrade has absolute priority and is granted as soon as the
//!    upgrader holds every remaining shared hold.
//! 2. When the lock is free, the oldest exclusive waiter wins, unless shared
//!    waiters queued ahead of it have already been bypassed
//!    `max_writer_bypass` consecutive times. Then the shared waiters queued
//!    ahead of that writer are admitted as one batch.
//! 3. While held shared, shared waiters queued ahead of the oldest exclusive
//!    waiter are admitted.
//!
//! New shared arrivals never overtake a queued writer. A thread that already
//! holds shared holds is always admitted again, since making it wait behind a
//! writer that waits for it would deadlock.
//!
//! # Logging
//!
//! - **TRACE** `ffs::inode::lock`: `inode_lock_acquired`, `inode_lock_released`
//! - **DEBUG** `ffs::inode::lock`: `inode_lock_blocked`, `inode_upgrade_lost_shared`
//! - **WARN**  `ffs::inode::lock`: `inode_lock_interrupted`
//!
//! Transitions are also reported to the lock group's observer, if any.

use bitflags::bitflags;
use ffs_error::{FfsError, Result, Violation, fatal};
use ffs_sync::{CancelToken, LockEvent, LockGroup, LockOp, LockPolicy};
use ffs_types::{InodeNumber, LockFlags, LockMode, LockStatus, OwnerId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

bitflags! {
    /// Application-level conditions published through [`InodeLock::notify`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InodeCondition: u32 {
        /// In-memory metadata has been written back.
        const METADATA_FLUSHED = 1 << 0;
        /// Dirty data pages have been written back.
        const DATA_FLUSHED = 1 << 1;
        /// Pending truncation finished.
        const TRUNCATE_DONE = 1 << 2;
        /// Snapshot copy-on-write of this inode is complete.
        const SNAPSHOT_COPIED = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    ticket: u64,
    owner: OwnerId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: Option<OwnerId>,
    /// Extra exclusive holds beyond the first.
    recursion: u32,
    /// Total shared holds.
    shared: u32,
    /// Shared holds per owner.
    readers: Vec<(OwnerId, u32)>,
    queue: VecDeque<Waiter>,
    upgrader: Option<(u64, OwnerId)>,
    /// Tickets that have been handed the lock but not collected yet.
    granted: Vec<u64>,
    next_ticket: u64,
    writer_bypass: u32,
    conditions: InodeCondition,
    cond_waiters: u32,
    /// Revoked or destroyed: new acquisitions fail with `LockGone`.
    gone: bool,
    destroyed: bool,
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl LockState {
    fn status(&self) -> LockStatus {
        let waiters = saturating_u32(self.queue.len() + usize::from(self.upgrader.is_some()));
        if let Some(owner) = self.exclusive {
            LockStatus::Exclusive { owner, waiters }
        } else if self.shared > 0 {
            LockStatus::Shared {
                count: self.shared,
                waiters,
            }
        } else {
            LockStatus::Unlocked { waiters }
        }
    }

    fn reader_holds(&self, owner: OwnerId) -> u32 {
        self.readers
            .iter()
            .find(|(o, _)| *o == owner)
            .map_or(0, |(_, n)| *n)
    }

    fn holds(&self, owner: OwnerId) -> Option<LockMode> {
        if self.exclusive == Some(owner) {
            Some(LockMode::Exclusive)
        } else if self.reader_holds(owner) > 0 {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    fn add_reader(&mut self, owner: OwnerId, holds: u32) {
        self.shared += holds;
        if let Some(entry) = self.readers.iter_mut().find(|(o, _)| *o == owner) {
            entry.1 += holds;
        } else {
            self.readers.push((owner, holds));
        }
    }

    /// Drop `holds` shared holds of `owner`. Caller checked they exist.
    fn remove_reader(&mut self, owner: OwnerId, holds: u32) {
        if let Some(idx) = self.readers.iter().position(|(o, _)| *o == owner) {
            let entry = &mut self.readers[idx];
            let holds = holds.min(entry.1);
            entry.1 -= holds;
            self.shared -= holds;
            if entry.1 == 0 {
                self.readers.swap_remove(idx);
            }
        }
    }

    /// Drop every hold `owner` has, shared or exclusive.
    fn drop_all_holds(&mut self, owner: OwnerId) {
        if self.exclusive == Some(owner) {
            self.exclusive = None;
            self.recursion = 0;
        }
        let holds = self.reader_holds(owner);
        self.remove_reader(owner, holds);
    }

    fn can_grant_now(&self, owner: OwnerId, mode: LockMode) -> bool {
        if self.exclusive.is_some() {
            return false;
        }
        match mode {
            LockMode::Shared => {
                self.reader_holds(owner) > 0 || (self.upgrader.is_none() && self.queue.is_empty())
            }
            LockMode::Exclusive => {
                self.shared == 0 && self.upgrader.is_none() && self.queue.is_empty()
            }
        }
    }

    fn grant(&mut self, owner: OwnerId, mode: LockMode) {
        match mode {
            LockMode::Shared => self.add_reader(owner, 1),
            LockMode::Exclusive => {
                self.exclusive = Some(owner);
                self.recursion = 0;
            }
        }
    }

    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        ticket
    }

    fn enqueue(&mut self, owner: OwnerId, mode: LockMode) -> u64 {
        let ticket = self.take_ticket();
        self.queue.push_back(Waiter {
            ticket,
            owner,
            mode,
        });
        ticket
    }

    /// Remove an ungranted ticket from the queue or the upgrade slot.
    fn withdraw(&mut self, ticket: u64) {
        if self.upgrader.is_some_and(|(t, _)| t == ticket) {
            self.upgrader = None;
        } else {
            self.queue.retain(|w| w.ticket != ticket);
        }
    }

    fn collect_grant(&mut self, ticket: u64) -> bool {
        if let Some(pos) = self.granted.iter().position(|t| *t == ticket) {
            self.granted.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Hand the lock to waiters according to the grant policy.
    ///
    /// Returns `true` when at least one waiter was granted.
    fn grant_waiters(&mut self, policy: LockPolicy) -> bool {
        if self.exclusive.is_some() {
            return false;
        }

        if let Some((ticket, owner)) = self.upgrader {
            let mine = self.reader_holds(owner);
            if mine == 0 || self.shared != mine {
                return false;
            }
            self.remove_reader(owner, mine);
            self.exclusive = Some(owner);
            self.recursion = mine - 1;
            self.upgrader = None;
            self.granted.push(ticket);
            return true;
        }

        let oldest_writer = self
            .queue
            .iter()
            .position(|w| w.mode == LockMode::Exclusive);

        if self.shared > 0 {
            let admit = oldest_writer.unwrap_or(self.queue.len());
            for waiter in self.queue.drain(..admit).collect::<Vec<_>>() {
                self.add_reader(waiter.owner, 1);
                self.granted.push(waiter.ticket);
            }
            return admit > 0;
        }

        let readers_ahead = match oldest_writer {
            Some(idx) => idx > 0,
            None => !self.queue.is_empty(),
        };

        match oldest_writer {
            Some(idx) if !readers_ahead || self.writer_bypass < policy.max_writer_bypass => {
                let Some(waiter) = self.queue.remove(idx) else {
                    return false;
                };
                if readers_ahead {
                    self.writer_bypass += 1;
                } else {
                    self.writer_bypass = 0;
                }
                self.exclusive = Some(waiter.owner);
                self.recursion = 0;
                self.granted.push(waiter.ticket);
                true
            }
            // Shared waiters queued behind the oldest writer stay queued.
            _ => {
                let admit = oldest_writer.unwrap_or(self.queue.len());
                for waiter in self.queue.drain(..admit).collect::<Vec<_>>() {
                    self.add_reader(waiter.owner, 1);
                    self.granted.push(waiter.ticket);
                }
                if admit > 0 {
                    self.writer_bypass = 0;
                }
                admit > 0
            }
        }
    }
}

struct LockCore {
    state: Mutex<LockState>,
    /// Lock waiters park here.
    grants: Condvar,
    /// Condition waiters park here.
    conditions: Condvar,
}

impl LockCore {
    fn wake_all(&self) {
        self.grants.notify_all();
        self.conditions.notify_all();
    }
}

/// The lockable object: one inode's reader/writer lock.
///
/// Created by the inode table on first reference and destroyed when the
/// inode is reclaimed.
pub struct InodeLock {
    ino: InodeNumber,
    group: Arc<LockGroup>,
    core: Arc<LockCore>,
}

impl fmt::Debug for InodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeLock")
            .field("ino", &self.ino)
            .field("group", &self.group.name())
            .field("status", &self.status())
            .finish()
    }
}

impl InodeLock {
    #[must_use]
    pub fn new(ino: InodeNumber, group: Arc<LockGroup>) -> Self {
        group.record_created();
        Self {
            ino,
            group,
            core: Arc::new(LockCore {
                state: Mutex::new(LockState::default()),
                grants: Condvar::new(),
                conditions: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn group(&self) -> &Arc<LockGroup> {
        &self.group
    }

    #[must_use]
    pub fn policy(&self) -> LockPolicy {
        self.group.policy()
    }

    #[must_use]
    pub fn status(&self) -> LockStatus {
        self.core.state.lock().status()
    }

    /// The hold the calling thread has on this lock, if any.
    #[must_use]
    pub fn held_by_current(&self) -> Option<LockMode> {
        self.core.state.lock().holds(OwnerId::current())
    }

    /// Whether the object has been revoked or destroyed.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.core.state.lock().gone
    }

    #[must_use]
    pub fn conditions(&self) -> InodeCondition {
        self.core.state.lock().conditions
    }

    fn emit(&self, st: &LockState, op: LockOp, mode: Option<LockMode>, owner: OwnerId) {
        self.group.observe(|| LockEvent {
            ino: self.ino,
            op,
            mode,
            owner,
            status: st.status(),
        });
    }

    fn waker(&self) -> Arc<dyn Fn() + Send + Sync> {
        let core = Arc::clone(&self.core);
        Arc::new(move || {
            let _st = core.state.lock();
            core.wake_all();
        })
    }

    // ── Acquire / release ───────────────────────────────────────────────

    /// Acquire the lock in `mode` for the calling thread.
    ///
    /// Blocks until the grant policy hands the lock over, unless
    /// `flags.try_only` is set.
    ///
    /// # Errors
    ///
    /// - `WouldBlock`: `try_only` and the lock is unavailable.
    /// - `Recursion`: the caller already holds the lock exclusively and
    ///   `allow_recurse` is unset, or it holds it shared and asks for
    ///   exclusive (use [`upgrade`](Self::upgrade) instead).
    /// - `LockGone`: the object was revoked or destroyed.
    /// - `Interrupted`: `cancel` fired while waiting; nothing is held.
    pub fn acquire(&self, mode: LockMode, flags: LockFlags, cancel: &CancelToken) -> Result<()> {
        self.acquire_as(OwnerId::current(), mode, flags, cancel)
    }

    pub(crate) fn acquire_as(
        &self,
        owner: OwnerId,
        mode: LockMode,
        flags: LockFlags,
        cancel: &CancelToken,
    ) -> Result<()> {
        let ino = self.ino.0;
        let mut st = self.core.state.lock();
        if st.gone {
            return Err(FfsError::LockGone { ino });
        }

        if st.exclusive == Some(owner) {
            if !flags.allow_recurse {
                return Err(FfsError::Recursion { ino });
            }
            st.recursion += 1;
            self.group.record_acquired(false);
            self.emit(&st, LockOp::Acquire, Some(mode), owner);
            return Ok(());
        }

        if mode == LockMode::Exclusive && st.reader_holds(owner) > 0 {
            return Err(FfsError::Recursion { ino });
        }

        if st.can_grant_now(owner, mode) {
            st.grant(owner, mode);
            self.group.record_acquired(false);
            self.emit(&st, LockOp::Acquire, Some(mode), owner);
            trace!(target: "ffs::inode::lock", ino, %mode, owner = owner.0, "inode_lock_acquired");
            return Ok(());
        }

        if flags.try_only {
            return Err(FfsError::WouldBlock);
        }

        let ticket = st.enqueue(owner, mode);
        let st = self.wait_for_grant(st, ticket, owner, mode, cancel)?;
        trace!(target: "ffs::inode::lock", ino, %mode, owner = owner.0, "inode_lock_acquired");
        drop(st);
        Ok(())
    }

    /// Park until `ticket` is granted.
    ///
    /// On success the meta-lock is returned still held. On failure the
    /// ticket is withdrawn and nothing is held by `owner` for this ticket.
    fn wait_for_grant<'a>(
        &'a self,
        mut st: MutexGuard<'a, LockState>,
        ticket: u64,
        owner: OwnerId,
        mode: LockMode,
        cancel: &CancelToken,
    ) -> Result<MutexGuard<'a, LockState>> {
        let ino = self.ino.0;
        self.emit(&st, LockOp::Block, Some(mode), owner);
        debug!(
            target: "ffs::inode::lock",
            ino,
            %mode,
            owner = owner.0,
            waiters = st.status().waiters(),
            "inode_lock_blocked"
        );

        let wait = cancel.arm(self.waker());
        loop {
            if st.collect_grant(ticket) {
                break;
            }
            if cancel.is_cancelled() {
                st.withdraw(ticket);
                let woke = st.grant_waiters(self.policy());
                self.group.record_interrupted();
                self.emit(&st, LockOp::Interrupt, Some(mode), owner);
                drop(st);
                if woke {
                    self.core.grants.notify_all();
                }
                warn!(target: "ffs::inode::lock", ino, %mode, owner = owner.0, "inode_lock_interrupted");
                return Err(FfsError::Interrupted);
            }
            wait.park(&self.core.grants, &mut st);
        }

        if st.gone {
            st.drop_all_holds(owner);
            let woke = st.grant_waiters(self.policy());
            self.emit(&st, LockOp::Release, Some(mode), owner);
            drop(st);
            if woke {
                self.core.grants.notify_all();
            }
            return Err(FfsError::LockGone { ino });
        }

        self.group.record_acquired(true);
        self.emit(&st, LockOp::Acquire, Some(mode), owner);
        Ok(st)
    }

    /// Release one hold of the calling thread.
    ///
    /// Releasing a lock the caller does not hold is a fatal violation.
    pub fn release(&self) {
        self.release_as(OwnerId::current());
    }

    pub(crate) fn release_as(&self, owner: OwnerId) {
        let mut st = self.core.state.lock();
        let mode = if st.exclusive == Some(owner) {
            if st.recursion > 0 {
                st.recursion -= 1;
            } else {
                st.exclusive = None;
            }
            LockMode::Exclusive
        } else if st.reader_holds(owner) > 0 {
            st.remove_reader(owner, 1);
            LockMode::Shared
        } else {
            drop(st);
            fatal(Violation::ReleaseNotHeld {
                ino: self.ino.0,
                owner: owner.0,
            });
        };

        let woke = st.grant_waiters(self.policy());
        self.emit(&st, LockOp::Release, Some(mode), owner);
        drop(st);
        trace!(target: "ffs::inode::lock", ino = self.ino.0, %mode, owner = owner.0, "inode_lock_released");
        if woke {
            self.core.grants.notify_all();
        }
    }

    // ── Upgrade / downgrade ─────────────────────────────────────────────

    /// Convert the caller's shared hold into an exclusive hold.
    ///
    /// Immediate when the caller holds every shared hold. Otherwise waits,
    /// keeping the shared hold, until the other holders release. If another
    /// thread is already waiting to upgrade, the caller's shared hold is
    /// dropped and it queues as an ordinary exclusive waiter.
    ///
    /// Upgrade does not detect deadlocks that span several inodes; callers
    /// needing two inodes use [`acquire_pair`](crate::acquire_pair).
    ///
    /// # Errors
    ///
    /// `LockGone` or `Interrupted`. On any error the caller no longer holds
    /// the lock at all. Calling without a shared hold is a fatal violation.
    pub fn upgrade(&self, cancel: &CancelToken) -> Result<()> {
        self.upgrade_as(OwnerId::current(), cancel)
    }

    pub(crate) fn upgrade_as(&self, owner: OwnerId, cancel: &CancelToken) -> Result<()> {
        let ino = self.ino.0;
        let mut st = self.core.state.lock();
        let mine = st.reader_holds(owner);
        if mine == 0 {
            drop(st);
            fatal(Violation::UpgradeNotShared { ino, owner: owner.0 });
        }

        if st.gone {
            st.drop_all_holds(owner);
            let woke = st.grant_waiters(self.policy());
            drop(st);
            if woke {
                self.core.grants.notify_all();
            }
            return Err(FfsError::LockGone { ino });
        }

        if st.upgrader.is_none() && st.shared == mine {
            st.remove_reader(owner, mine);
            st.exclusive = Some(owner);
            st.recursion = mine - 1;
            self.emit(&st, LockOp::Upgrade, Some(LockMode::Exclusive), owner);
            return Ok(());
        }

        if st.upgrader.is_some() {
            st.remove_reader(owner, mine);
            let woke = st.grant_waiters(self.policy());
            if woke {
                self.core.grants.notify_all();
            }
            debug!(target: "ffs::inode::lock", ino, owner = owner.0, "inode_upgrade_lost_shared");
            if st.can_grant_now(owner, LockMode::Exclusive) {
                st.grant(owner, LockMode::Exclusive);
                st.recursion = mine - 1;
                self.group.record_acquired(false);
                self.emit(&st, LockOp::Upgrade, Some(LockMode::Exclusive), owner);
                return Ok(());
            }
            let ticket = st.enqueue(owner, LockMode::Exclusive);
            let mut st = self.wait_for_grant(st, ticket, owner, LockMode::Exclusive, cancel)?;
            st.recursion = mine - 1;
            self.emit(&st, LockOp::Upgrade, Some(LockMode::Exclusive), owner);
            return Ok(());
        }

        let ticket = st.take_ticket();
        st.upgrader = Some((ticket, owner));
        match self.wait_for_grant(st, ticket, owner, LockMode::Exclusive, cancel) {
            Ok(st) => {
                self.emit(&st, LockOp::Upgrade, Some(LockMode::Exclusive), owner);
                Ok(())
            }
            Err(FfsError::Interrupted) => {
                // The shared hold is still ours; the error contract drops it.
                let mut st = self.core.state.lock();
                st.drop_all_holds(owner);
                let woke = st.grant_waiters(self.policy());
                drop(st);
                if woke {
                    self.core.grants.notify_all();
                }
                Err(FfsError::Interrupted)
            }
            Err(err) => Err(err),
        }
    }

    /// Non-blocking upgrade. On `WouldBlock` or `LockGone` the shared hold
    /// is kept.
    pub fn try_upgrade(&self) -> Result<()> {
        let owner = OwnerId::current();
        let ino = self.ino.0;
        let mut st = self.core.state.lock();
        let mine = st.reader_holds(owner);
        if mine == 0 {
            drop(st);
            fatal(Violation::UpgradeNotShared { ino, owner: owner.0 });
        }
        if st.gone {
            return Err(FfsError::LockGone { ino });
        }
        if st.upgrader.is_some() || st.shared != mine {
            return Err(FfsError::WouldBlock);
        }
        st.remove_reader(owner, mine);
        st.exclusive = Some(owner);
        st.recursion = mine - 1;
        self.emit(&st, LockOp::Upgrade, Some(LockMode::Exclusive), owner);
        Ok(())
    }

    /// Convert the caller's exclusive hold into shared holds and admit
    /// compatible shared waiters. Recursive exclusive holds become the same
    /// number of shared holds.
    ///
    /// Calling without the exclusive hold is a fatal violation.
    pub fn downgrade(&self) {
        self.downgrade_as(OwnerId::current());
    }

    pub(crate) fn downgrade_as(&self, owner: OwnerId) {
        let mut st = self.core.state.lock();
        if st.exclusive != Some(owner) {
            drop(st);
            fatal(Violation::DowngradeNotOwner {
                ino: self.ino.0,
                owner: owner.0,
            });
        }
        let holds = st.recursion + 1;
        st.exclusive = None;
        st.recursion = 0;
        st.add_reader(owner, holds);
        let woke = st.grant_waiters(self.policy());
        self.emit(&st, LockOp::Downgrade, Some(LockMode::Shared), owner);
        drop(st);
        if woke {
            self.core.grants.notify_all();
        }
    }

    // ── Conditions ──────────────────────────────────────────────────────

    /// Publish `condition` and wake threads waiting for it.
    ///
    /// The caller must hold the lock exclusively so the flag change is
    /// observed atomically with the wake.
    pub fn notify(&self, condition: InodeCondition) {
        let owner = OwnerId::current();
        let mut st = self.core.state.lock();
        if st.exclusive != Some(owner) {
            drop(st);
            fatal(Violation::NotifyWithoutExclusive {
                ino: self.ino.0,
                owner: owner.0,
            });
        }
        st.conditions |= condition;
        self.emit(&st, LockOp::Notify, None, owner);
        drop(st);
        self.core.conditions.notify_all();
    }

    /// Clear `condition`. Requires the exclusive lock.
    pub fn clear_condition(&self, condition: InodeCondition) {
        let owner = OwnerId::current();
        let mut st = self.core.state.lock();
        if st.exclusive != Some(owner) {
            drop(st);
            fatal(Violation::NotifyWithoutExclusive {
                ino: self.ino.0,
                owner: owner.0,
            });
        }
        st.conditions.remove(condition);
    }

    /// Wait until every bit of `condition` has been published.
    ///
    /// # Errors
    ///
    /// - `Recursion`: the caller holds the lock, so no one could notify.
    /// - `LockGone`: the object was revoked or destroyed meanwhile.
    /// - `Interrupted`: `cancel` fired.
    pub fn wait_condition(&self, condition: InodeCondition, cancel: &CancelToken) -> Result<()> {
        let owner = OwnerId::current();
        let ino = self.ino.0;
        let mut st = self.core.state.lock();
        if st.holds(owner).is_some() {
            return Err(FfsError::Recursion { ino });
        }

        let wait = cancel.arm(self.waker());
        st.cond_waiters += 1;
        let outcome = loop {
            if st.conditions.contains(condition) {
                break Ok(());
            }
            if st.gone {
                break Err(FfsError::LockGone { ino });
            }
            if cancel.is_cancelled() {
                break Err(FfsError::Interrupted);
            }
            wait.park(&self.core.conditions, &mut st);
        };
        st.cond_waiters -= 1;
        outcome
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Mark the object gone while holding it exclusively.
    ///
    /// Queued waiters and later acquirers get `LockGone`; condition waiters
    /// are woken with `LockGone`. The caller still releases its hold.
    pub fn revoke(&self) {
        let owner = OwnerId::current();
        let mut st = self.core.state.lock();
        if st.exclusive != Some(owner) {
            drop(st);
            fatal(Violation::RevokeWithoutExclusive {
                ino: self.ino.0,
                owner: owner.0,
            });
        }
        st.gone = true;
        self.emit(&st, LockOp::Revoke, None, owner);
        drop(st);
        debug!(target: "ffs::inode::lock", ino = self.ino.0, "inode_lock_revoked");
        self.core.conditions.notify_all();
    }

    /// Destroy the lock state when the inode is reclaimed.
    ///
    /// The lock must be unlocked with nothing queued; anything else, or a
    /// second destroy, is a fatal violation.
    pub fn destroy(&self) {
        let ino = self.ino.0;
        let mut st = self.core.state.lock();
        if st.destroyed {
            drop(st);
            fatal(Violation::DoubleDestroy { ino });
        }
        if st.exclusive.is_some() || st.shared > 0 {
            drop(st);
            fatal(Violation::DestroyWhileHeld { ino });
        }
        let waiters = saturating_u32(st.queue.len() + usize::from(st.upgrader.is_some()))
            .saturating_add(st.cond_waiters);
        if waiters > 0 {
            drop(st);
            fatal(Violation::DestroyWithWaiters { ino, waiters });
        }
        st.destroyed = true;
        st.gone = true;
        self.emit(&st, LockOp::Destroy, None, OwnerId::current());
        drop(st);
        self.group.record_destroyed();
    }
}

impl Drop for InodeLock {
    fn drop(&mut self) {
        if !self.core.state.lock().destroyed {
            self.group.record_destroyed();
        }
    }
}
