//! The mount record: registry, inode table, barrier and request gate.
//!
//! # Logging
//!
//! - **TRACE** `ffs::core::mount`: `request_done`
//! - **DEBUG** `ffs::core::mount`: `request_failed`, `write_relock`
//! - **INFO**  `ffs::core::mount`: `mount_created`, `mount_unmounted`

use crate::config::MountConfig;
use crate::{RequestOp, RequestTarget};
use ffs_error::{FfsError, Result};
use ffs_inode::{InodeLock, InodeTable, OwnedInodeGuard, lock_pair_owned};
use ffs_suspend::{BarrierSnapshot, MountBarrier, SuspendListener, WriteGuard};
use ffs_sync::{CancelToken, LockGroupStats, LockRegistry, TracingObserver};
use ffs_types::{BarrierPhase, InodeNumber, ResumeFlags, SuspendFlags, WriteFlags};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace};

// ── Request gate ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    active: u64,
    closed: bool,
}

/// Counts requests in progress so unmount can wait for them.
#[derive(Debug, Default)]
struct RequestGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl RequestGate {
    fn enter(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(FfsError::Unmounting);
        }
        st.active += 1;
        Ok(())
    }

    fn leave(&self) {
        let mut st = self.state.lock();
        st.active = st.active.saturating_sub(1);
        if st.active == 0 {
            drop(st);
            self.idle.notify_all();
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn active(&self) -> u64 {
        self.state.lock().active
    }

    fn wait_idle(self: &Arc<Self>, cancel: &CancelToken) -> Result<()> {
        let mut st = self.state.lock();
        let gate = Arc::clone(self);
        let wait = cancel.arm(Arc::new(move || {
            let _st = gate.state.lock();
            gate.idle.notify_all();
        }));
        while st.active > 0 {
            if cancel.is_cancelled() {
                return Err(FfsError::Interrupted);
            }
            wait.park(&self.idle, &mut st);
        }
        Ok(())
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Diagnostics for a live mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStats {
    pub name: String,
    pub barrier: BarrierSnapshot,
    pub inodes: usize,
    pub active_requests: u64,
    pub groups: Vec<LockGroupStats>,
}

/// Outcome of [`Mount::unmount`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountReport {
    pub name: String,
    pub inodes_reclaimed: usize,
    pub suspensions: u64,
    /// Whether unmount had to lift a suspension left in place.
    pub resumed_suspension: bool,
    /// Final lock-group counters.
    pub groups: Vec<LockGroupStats>,
}

// ── Mount ───────────────────────────────────────────────────────────────────

pub struct Mount {
    config: MountConfig,
    registry: LockRegistry,
    inodes: InodeTable,
    barrier: MountBarrier,
    gate: Arc<RequestGate>,
    torn_down: AtomicBool,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("name", &self.config.name)
            .field("inodes", &self.inodes.len())
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

impl Mount {
    /// Create a mount with its lock registry, inode table and barrier.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration does not validate.
    pub fn new(config: MountConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// [`new`](Self::new) with a listener for suspend and resume.
    pub fn with_listener(config: MountConfig, listener: Arc<dyn SuspendListener>) -> Result<Self> {
        Self::build(config, Some(listener))
    }

    fn build(config: MountConfig, listener: Option<Arc<dyn SuspendListener>>) -> Result<Self> {
        config.validate()?;
        let mut registry = LockRegistry::new(config.lock);
        if config.trace_transitions {
            registry = registry.with_observer(Arc::new(TracingObserver));
        }
        let inodes = InodeTable::new(registry.group("inode")?);
        let mut barrier = MountBarrier::new(&config.name).with_group(registry.group("mount-barrier")?);
        if let Some(listener) = listener {
            barrier = barrier.with_listener(listener);
        }
        info!(
            target: "ffs::core::mount",
            mount = %config.name,
            max_writer_bypass = config.lock.max_writer_bypass,
            trace_transitions = config.trace_transitions,
            "mount_created"
        );
        Ok(Self {
            config,
            registry,
            inodes,
            barrier,
            gate: Arc::new(RequestGate::default()),
            torn_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    #[must_use]
    pub fn barrier(&self) -> &MountBarrier {
        &self.barrier
    }

    #[must_use]
    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Look up or create the lock object of `ino`.
    pub fn inode(&self, ino: InodeNumber) -> Result<Arc<InodeLock>> {
        if self.gate.is_closed() {
            return Err(FfsError::Unmounting);
        }
        Ok(self.inodes.get_or_create(ino))
    }

    /// Reclaim an idle inode. See [`InodeTable::reclaim`].
    pub fn reclaim(&self, ino: InodeNumber) -> Result<()> {
        self.inodes.reclaim(ino)
    }

    #[must_use]
    pub fn stats(&self) -> MountStats {
        MountStats {
            name: self.config.name.clone(),
            barrier: self.barrier.snapshot(),
            inodes: self.inodes.len(),
            active_requests: self.gate.active(),
            groups: self.registry.stats(),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Take what `op` needs on `target`: the barrier for write-class
    /// operations, then the inode locks (pairs in identity order).
    ///
    /// # Errors
    ///
    /// `Interrupted` if `cancel` has already fired or its deadline passed.
    /// `Unmounting` once unmount has started, plus any barrier or lock
    /// error. Nothing is held on error.
    pub fn begin(
        &self,
        op: RequestOp,
        target: RequestTarget,
        cancel: &CancelToken,
    ) -> Result<RequestScope<'_>> {
        cancel.checkpoint()?;
        self.gate.enter()?;
        let mut scope = RequestScope {
            mount: self,
            op,
            target,
            locks: Vec::new(),
            write: None,
        };
        if op.is_write() {
            scope.write = Some(self.barrier.enter_write(WriteFlags::WAIT, cancel)?);
        }
        scope.lock_target(cancel)?;
        Ok(scope)
    }

    /// Run `body` with the barrier and locks `op` needs on `target`.
    ///
    /// Everything taken is released when `body` returns, whether or not it
    /// succeeded.
    pub fn run<T>(
        &self,
        op: RequestOp,
        target: RequestTarget,
        cancel: &CancelToken,
        body: impl FnOnce(&RequestScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let outcome = self.begin(op, target, cancel).and_then(|scope| body(&scope));
        match &outcome {
            Ok(_) => trace!(target: "ffs::core::mount", %op, inodes = ?target, "request_done"),
            Err(err) => debug!(
                target: "ffs::core::mount",
                %op,
                inodes = ?target,
                error = %err,
                errno = err.to_errno(),
                "request_failed"
            ),
        }
        outcome
    }

    /// Enter the barrier from a scope that already holds inode locks.
    ///
    /// Blocking in the barrier while holding inode locks could stall the
    /// suspending thread's own flush, so the entry is first tried without
    /// waiting. If the mount is suspended, the scope's locks are dropped,
    /// the barrier is entered with waiting, and the locks are taken again.
    /// Callers must revalidate anything they read under the old locks.
    pub fn start_write_locked<'m>(
        &'m self,
        mut scope: RequestScope<'m>,
        cancel: &CancelToken,
    ) -> Result<RequestScope<'m>> {
        if scope.write.is_some() {
            return Ok(scope);
        }
        match self.barrier.enter_write(WriteFlags::NOWAIT, cancel) {
            Ok(guard) => {
                scope.write = Some(guard);
                Ok(scope)
            }
            Err(FfsError::WouldBlock) => {
                debug!(
                    target: "ffs::core::mount",
                    op = %scope.op,
                    inodes = ?scope.target,
                    "write_relock"
                );
                scope.unlock_target();
                scope.write = Some(self.barrier.enter_write(WriteFlags::WAIT, cancel)?);
                scope.lock_target(cancel)?;
                Ok(scope)
            }
            Err(err) => Err(err),
        }
    }

    /// Suspend writes, run `body` at the quiesce point, then resume.
    ///
    /// The suspension is lifted when `body` fails or unwinds, too.
    pub fn quiesce<T>(&self, cancel: &CancelToken, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.barrier.suspend(
            SuspendFlags {
                skip_if_unmounting: true,
            },
            cancel,
        )?;
        let _resume = ResumeOnDrop(&self.barrier);
        body()
    }

    // ── Unmount ─────────────────────────────────────────────────────────

    /// Tear the mount down.
    ///
    /// New requests fail with `Unmounting`. Requests and writes in progress
    /// are waited for, a suspension left in place is lifted, every inode is
    /// reclaimed, and the barrier and lock registry are torn down.
    ///
    /// # Errors
    ///
    /// `Interrupted` if `cancel` fires while waiting for requests; the mount
    /// stays closed and unmount may be retried. `Unmounting` if already
    /// unmounted.
    pub fn unmount(&self, cancel: &CancelToken) -> Result<UnmountReport> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(FfsError::Unmounting);
        }
        self.gate.close();
        self.barrier.begin_unmount();
        self.gate.wait_idle(cancel)?;
        self.barrier.wait_drained(cancel)?;

        let resumed_suspension = self.barrier.phase() == BarrierPhase::Suspended
            && self.barrier.resume(ResumeFlags::default());
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Err(FfsError::Unmounting);
        }

        let inodes_reclaimed = self.inodes.reclaim_all();
        let suspensions = self.barrier.snapshot().suspensions;
        self.barrier.teardown();
        let groups = self.registry.teardown();
        info!(
            target: "ffs::core::mount",
            mount = %self.config.name,
            inodes_reclaimed,
            suspensions,
            resumed_suspension,
            "mount_unmounted"
        );
        Ok(UnmountReport {
            name: self.config.name.clone(),
            inodes_reclaimed,
            suspensions,
            resumed_suspension,
            groups,
        })
    }
}

/// Lifts the suspension taken by [`Mount::quiesce`].
struct ResumeOnDrop<'a>(&'a MountBarrier);

impl Drop for ResumeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.resume(ResumeFlags::default());
    }
}

// ── Request scope ───────────────────────────────────────────────────────────

/// Barrier entry and inode locks held for one operation.
///
/// Dropping the scope releases the locks (last taken first), then exits the
/// barrier.
#[must_use = "the request's locks are released when the scope drops"]
pub struct RequestScope<'m> {
    mount: &'m Mount,
    op: RequestOp,
    target: RequestTarget,
    locks: Vec<OwnedInodeGuard>,
    write: Option<WriteGuard<'m>>,
}

impl fmt::Debug for RequestScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("mount", &self.mount.config.name)
            .field("op", &self.op)
            .field("target", &self.target)
            .field("locked", &self.locked_inodes())
            .field("write", &self.write.is_some())
            .finish()
    }
}

impl RequestScope<'_> {
    #[must_use]
    pub fn op(&self) -> RequestOp {
        self.op
    }

    #[must_use]
    pub fn target(&self) -> RequestTarget {
        self.target
    }

    /// Whether the scope has entered the write barrier.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.write.is_some()
    }

    /// Locked inodes in acquisition order.
    #[must_use]
    pub fn locked_inodes(&self) -> Vec<InodeNumber> {
        self.locks.iter().map(OwnedInodeGuard::ino).collect()
    }

    /// The held lock of `ino`, if this scope holds it.
    #[must_use]
    pub fn lock_of(&self, ino: InodeNumber) -> Option<&Arc<InodeLock>> {
        self.locks.iter().find(|g| g.ino() == ino).map(OwnedInodeGuard::lock)
    }

    fn lock_target(&mut self, cancel: &CancelToken) -> Result<()> {
        let mode = self.op.lock_mode();
        match self.target {
            RequestTarget::None => {}
            RequestTarget::One(ino) => {
                let lock = self.mount.inodes.get_or_create(ino);
                self.locks.push(lock.lock_owned(mode, cancel)?);
            }
            RequestTarget::Pair(a, b) => {
                let a = self.mount.inodes.get_or_create(a);
                let b = self.mount.inodes.get_or_create(b);
                let (first, second) = lock_pair_owned(&a, &b, mode, cancel)?;
                self.locks.push(first);
                self.locks.extend(second);
            }
        }
        Ok(())
    }

    fn unlock_target(&mut self) {
        while let Some(guard) = self.locks.pop() {
            guard.unlock();
        }
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        self.unlock_target();
        drop(self.write.take());
        self.mount.gate.leave();
    }
}
