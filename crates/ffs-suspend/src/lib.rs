#![forbid(unsafe_code)]
//! Mount-wide write-suspension barrier.
//!
//! Every mutating operation brackets its on-disk work with
//! [`MountBarrier::enter_write`] (returning a [`WriteGuard`]). A snapshot or
//! checkpoint driver calls [`MountBarrier::suspend`] to stop new writers and
//! wait for the in-flight ones to drain, and [`MountBarrier::resume`] to let
//! them go again.
//!
//! ```text
//!            suspend()                 in_flight == 0
//!   Normal ───────────▶ SuspendPending ───────────────▶ Suspended
//!     ▲                      │ cancelled                    │
//!     └──────────────────────┴──────────── resume() ────────┘
//! ```
//!
//! While the phase is not `Normal` only the suspending thread, `secondary`
//! writes, and threads that already have a write in flight may enter.
//!
//! # Logging
//!
//! - **DEBUG** `ffs::suspend`: `write_blocked`, `suspend_draining`
//! - **INFO**  `ffs::suspend`: `mount_suspended`, `mount_resumed`, `unmount_started`
//! - **WARN**  `ffs::suspend`: `write_interrupted`, `suspend_interrupted`,
//!   `suspend_hook_failed`

use ffs_error::{FfsError, Result, Violation, fatal};
use ffs_sync::{CancelToken, LockGroup};
use ffs_types::{BarrierPhase, OwnerId, ResumeFlags, SuspendFlags, WriteFlags};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Filesystem-specific work bound to suspension.
///
/// `on_suspended` runs once the writers have drained, before `suspend`
/// returns; it may issue writes, which pass the barrier because they come
/// from the suspending thread. `on_resume` runs from [`MountBarrier::resume`]
/// unless `clear_only` is set.
pub trait SuspendListener: Send + Sync + fmt::Debug {
    fn on_suspended(&self) -> Result<()> {
        Ok(())
    }

    fn on_resume(&self) {}
}

/// Point-in-time view of the barrier for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSnapshot {
    pub name: String,
    pub phase: BarrierPhase,
    pub in_flight: u64,
    pub owner: Option<OwnerId>,
    pub unmounting: bool,
    /// Writers currently parked in `enter_write`.
    pub blocked: u32,
    /// Completed suspensions since mount.
    pub suspensions: u64,
}

#[derive(Debug)]
struct BarrierState {
    phase: BarrierPhase,
    in_flight: u64,
    /// Writes in flight per entering thread, for nested entry and exit checks.
    per_owner: HashMap<OwnerId, u64>,
    owner: Option<OwnerId>,
    unmounting: bool,
    torn_down: bool,
    blocked: u32,
    suspensions: u64,
}

impl Default for BarrierState {
    fn default() -> Self {
        Self {
            phase: BarrierPhase::Normal,
            in_flight: 0,
            per_owner: HashMap::new(),
            owner: None,
            unmounting: false,
            torn_down: false,
            blocked: 0,
            suspensions: 0,
        }
    }
}

impl BarrierState {
    fn admits(&self, who: OwnerId, flags: WriteFlags) -> bool {
        self.phase == BarrierPhase::Normal
            || flags.secondary
            || self.owner == Some(who)
            || self.per_owner.get(&who).is_some_and(|n| *n > 0)
    }

    fn enter(&mut self, who: OwnerId) {
        self.in_flight += 1;
        *self.per_owner.entry(who).or_insert(0) += 1;
    }

    fn rollback(&mut self) {
        self.phase = BarrierPhase::Normal;
        self.owner = None;
    }
}

struct BarrierCore {
    state: Mutex<BarrierState>,
    /// Writers waiting for `Normal`.
    writers: Condvar,
    /// Suspender and unmount waiting for the drain.
    drained: Condvar,
}

impl BarrierCore {
    fn wake_all(&self) {
        self.writers.notify_all();
        self.drained.notify_all();
    }
}

/// The write-suspension state machine of one mount.
pub struct MountBarrier {
    name: String,
    core: Arc<BarrierCore>,
    listener: Option<Arc<dyn SuspendListener>>,
    group: Option<Arc<LockGroup>>,
}

impl fmt::Debug for MountBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountBarrier")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl MountBarrier {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            core: Arc::new(BarrierCore {
                state: Mutex::new(BarrierState::default()),
                writers: Condvar::new(),
                drained: Condvar::new(),
            }),
            listener: None,
            group: None,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn SuspendListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Account the barrier in `group`. The group sees one live object until
    /// [`teardown`](Self::teardown).
    #[must_use]
    pub fn with_group(mut self, group: Arc<LockGroup>) -> Self {
        group.record_created();
        self.group = Some(group);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn phase(&self) -> BarrierPhase {
        self.core.state.lock().phase
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.core.state.lock().in_flight
    }

    #[must_use]
    pub fn snapshot(&self) -> BarrierSnapshot {
        let st = self.core.state.lock();
        BarrierSnapshot {
            name: self.name.clone(),
            phase: st.phase,
            in_flight: st.in_flight,
            owner: st.owner,
            unmounting: st.unmounting,
            blocked: st.blocked,
            suspensions: st.suspensions,
        }
    }

    fn waker(&self) -> Arc<dyn Fn() + Send + Sync> {
        let core = Arc::clone(&self.core);
        Arc::new(move || {
            let _st = core.state.lock();
            core.wake_all();
        })
    }

    // ── Writers ─────────────────────────────────────────────────────────

    /// Register a write-class operation with the barrier.
    ///
    /// The returned guard performs the matching exit on every path, so the
    /// in-flight count cannot drift.
    ///
    /// # Errors
    ///
    /// - `WouldBlock`: the mount is suspended and `flags.wait` is unset.
    /// - `Interrupted`: `cancel` fired while waiting.
    /// - `Unmounting`: unmount has started.
    pub fn enter_write(&self, flags: WriteFlags, cancel: &CancelToken) -> Result<WriteGuard<'_>> {
        let who = OwnerId::current();
        let mut st = self.core.state.lock();
        let nested = st.per_owner.get(&who).is_some_and(|n| *n > 0);
        if st.unmounting && !nested {
            return Err(FfsError::Unmounting);
        }
        if st.admits(who, flags) {
            st.enter(who);
            drop(st);
            if let Some(group) = &self.group {
                group.record_acquired(false);
            }
            return Ok(WriteGuard::new(self, who));
        }
        if !flags.wait {
            return Err(FfsError::WouldBlock);
        }

        debug!(
            target: "ffs::suspend",
            mount = %self.name,
            phase = %st.phase,
            owner = who.0,
            "write_blocked"
        );
        let wait = cancel.arm(self.waker());
        st.blocked += 1;
        let outcome = loop {
            if st.unmounting {
                break Err(FfsError::Unmounting);
            }
            if st.admits(who, flags) {
                st.enter(who);
                break Ok(());
            }
            if cancel.is_cancelled() {
                break Err(FfsError::Interrupted);
            }
            wait.park(&self.core.writers, &mut st);
        };
        st.blocked -= 1;
        drop(st);

        match outcome {
            Ok(()) => {
                if let Some(group) = &self.group {
                    group.record_acquired(true);
                }
                Ok(WriteGuard::new(self, who))
            }
            Err(err) => {
                if matches!(err, FfsError::Interrupted) {
                    if let Some(group) = &self.group {
                        group.record_interrupted();
                    }
                    warn!(target: "ffs::suspend", mount = %self.name, owner = who.0, "write_interrupted");
                }
                Err(err)
            }
        }
    }

    fn exit_write(&self, who: OwnerId) {
        let mut st = self.core.state.lock();
        let mine = st.per_owner.get(&who).copied().unwrap_or(0);
        if st.in_flight == 0 || mine == 0 {
            drop(st);
            fatal(Violation::ExitWithoutEnter);
        }
        st.in_flight -= 1;
        if mine == 1 {
            st.per_owner.remove(&who);
        } else {
            st.per_owner.insert(who, mine - 1);
        }
        if st.in_flight == 0 {
            if st.phase == BarrierPhase::SuspendPending {
                st.phase = BarrierPhase::Suspended;
            }
            drop(st);
            self.core.drained.notify_all();
        }
    }

    // ── Suspension ──────────────────────────────────────────────────────

    /// Stop new writers and wait until in-flight ones have exited.
    ///
    /// # Errors
    ///
    /// - `AlreadySuspended`: a suspension is active or pending.
    /// - `Unmounting`: unmount has started. This holds with or without
    ///   `skip_if_unmounting`, since unmount lifts any suspension itself
    ///   and the barrier must stay `Normal` until teardown.
    /// - `Interrupted`: `cancel` had already fired, or fired while
    ///   draining; the barrier is back to `Normal` and blocked writers are
    ///   released.
    /// - Any error from [`SuspendListener::on_suspended`], with the same
    ///   rollback.
    pub fn suspend(&self, flags: SuspendFlags, cancel: &CancelToken) -> Result<()> {
        cancel.checkpoint()?;
        let who = OwnerId::current();
        let mut st = self.core.state.lock();
        if st.owner.is_some() || st.phase != BarrierPhase::Normal {
            return Err(FfsError::AlreadySuspended);
        }
        if st.unmounting {
            debug!(
                target: "ffs::suspend",
                mount = %self.name,
                skip_if_unmounting = flags.skip_if_unmounting,
                "suspend_refused_unmounting"
            );
            return Err(FfsError::Unmounting);
        }

        st.owner = Some(who);
        if st.in_flight == 0 {
            st.phase = BarrierPhase::Suspended;
        } else {
            st.phase = BarrierPhase::SuspendPending;
            debug!(
                target: "ffs::suspend",
                mount = %self.name,
                in_flight = st.in_flight,
                "suspend_draining"
            );
            let wait = cancel.arm(self.waker());
            while st.phase == BarrierPhase::SuspendPending {
                if cancel.is_cancelled() {
                    st.rollback();
                    drop(st);
                    self.core.writers.notify_all();
                    warn!(target: "ffs::suspend", mount = %self.name, "suspend_interrupted");
                    return Err(FfsError::Interrupted);
                }
                wait.park(&self.core.drained, &mut st);
            }
        }
        drop(st);

        if let Some(listener) = &self.listener {
            if let Err(err) = listener.on_suspended() {
                let mut st = self.core.state.lock();
                st.rollback();
                drop(st);
                self.core.writers.notify_all();
                warn!(target: "ffs::suspend", mount = %self.name, error = %err, "suspend_hook_failed");
                return Err(err);
            }
        }

        self.core.state.lock().suspensions += 1;
        info!(target: "ffs::suspend", mount = %self.name, owner = who.0, "mount_suspended");
        Ok(())
    }

    /// Lift a suspension and wake every blocked writer.
    ///
    /// Returns `false` if the mount was not suspended. A suspension still
    /// draining is left to its owner.
    pub fn resume(&self, flags: ResumeFlags) -> bool {
        let mut st = self.core.state.lock();
        if st.phase != BarrierPhase::Suspended {
            return false;
        }
        st.rollback();
        drop(st);
        if !flags.clear_only {
            if let Some(listener) = &self.listener {
                listener.on_resume();
            }
        }
        self.core.writers.notify_all();
        info!(target: "ffs::suspend", mount = %self.name, clear_only = flags.clear_only, "mount_resumed");
        true
    }

    // ── Unmount ─────────────────────────────────────────────────────────

    /// Refuse new writers from now on and release blocked ones with
    /// `Unmounting`. Writes already in flight may finish, including nested
    /// entries from the same threads.
    pub fn begin_unmount(&self) {
        let mut st = self.core.state.lock();
        if st.unmounting {
            return;
        }
        st.unmounting = true;
        drop(st);
        self.core.wake_all();
        info!(target: "ffs::suspend", mount = %self.name, "unmount_started");
    }

    #[must_use]
    pub fn is_unmounting(&self) -> bool {
        self.core.state.lock().unmounting
    }

    /// Wait until no writes are in flight.
    pub fn wait_drained(&self, cancel: &CancelToken) -> Result<()> {
        let mut st = self.core.state.lock();
        if st.in_flight == 0 {
            return Ok(());
        }
        let wait = cancel.arm(self.waker());
        while st.in_flight > 0 {
            if cancel.is_cancelled() {
                return Err(FfsError::Interrupted);
            }
            wait.park(&self.core.drained, &mut st);
        }
        Ok(())
    }

    /// Final check before the barrier goes away with its mount.
    ///
    /// The phase must be `Normal` with nothing in flight; anything else is a
    /// fatal violation. Repeated calls are no-ops.
    pub fn teardown(&self) {
        let mut st = self.core.state.lock();
        if st.torn_down {
            return;
        }
        if st.in_flight > 0 || st.phase != BarrierPhase::Normal {
            let violation = Violation::TeardownWhileActive {
                in_flight: st.in_flight,
                phase: st.phase.to_string(),
            };
            drop(st);
            fatal(violation);
        }
        st.torn_down = true;
        st.unmounting = true;
        drop(st);
        if let Some(group) = &self.group {
            group.record_destroyed();
        }
    }
}

// ── Scoped entry ────────────────────────────────────────────────────────────

/// An in-flight write. Exits the barrier when dropped.
#[must_use = "the write exits the barrier when this guard drops"]
pub struct WriteGuard<'a> {
    barrier: &'a MountBarrier,
    owner: OwnerId,
    active: bool,
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("mount", &self.barrier.name)
            .field("owner", &self.owner)
            .field("active", &self.active)
            .finish()
    }
}

impl<'a> WriteGuard<'a> {
    fn new(barrier: &'a MountBarrier, owner: OwnerId) -> Self {
        Self {
            barrier,
            owner,
            active: true,
        }
    }

    #[must_use]
    pub fn barrier(&self) -> &'a MountBarrier {
        self.barrier
    }

    /// Exit now instead of at end of scope.
    pub fn exit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if std::mem::take(&mut self.active) {
            self.barrier.exit_write(self.owner);
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_sync::LockPolicy;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn writers_pass_while_normal() {
        let barrier = MountBarrier::new("t");
        let cancel = CancelToken::new();
        let a = barrier.enter_write(WriteFlags::WAIT, &cancel).expect("a");
        let b = barrier.enter_write(WriteFlags::NOWAIT, &cancel).expect("b");
        assert_eq!(barrier.in_flight(), 2);
        drop(a);
        b.exit();
        assert_eq!(barrier.in_flight(), 0);
    }

    #[test]
    fn suspend_with_nothing_in_flight_is_immediate() {
        let barrier = MountBarrier::new("t");
        let cancel = CancelToken::new();
        barrier.suspend(SuspendFlags::default(), &cancel).expect("suspend");
        assert_eq!(barrier.phase(), BarrierPhase::Suspended);
        assert_eq!(barrier.snapshot().owner, Some(OwnerId::current()));
        assert!(barrier.resume(ResumeFlags::default()));
        assert_eq!(barrier.phase(), BarrierPhase::Normal);
        assert!(!barrier.resume(ResumeFlags::default()));
        assert_eq!(barrier.snapshot().suspensions, 1);
    }

    #[test]
    fn suspended_mount_rejects_nonblocking_writer() {
        let barrier = Arc::new(MountBarrier::new("t"));
        barrier
            .suspend(SuspendFlags::default(), &CancelToken::new())
            .expect("suspend");
        let outcome = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier
                    .enter_write(WriteFlags::NOWAIT, &CancelToken::new())
                    .map(WriteGuard::exit)
            })
            .join()
            .expect("writer thread")
        };
        assert!(matches!(outcome, Err(FfsError::WouldBlock)));
        barrier.resume(ResumeFlags::default());
    }

    #[test]
    fn owner_and_secondary_writes_pass_while_suspended() {
        let barrier = Arc::new(MountBarrier::new("t"));
        let cancel = CancelToken::new();
        barrier.suspend(SuspendFlags::default(), &cancel).expect("suspend");

        let own = barrier.enter_write(WriteFlags::NOWAIT, &cancel).expect("owner write");
        own.exit();

        let secondary = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier
                    .enter_write(WriteFlags::SECONDARY, &CancelToken::new())
                    .map(WriteGuard::exit)
            })
            .join()
            .expect("secondary thread")
        };
        assert!(secondary.is_ok());
        assert_eq!(barrier.phase(), BarrierPhase::Suspended);
        barrier.resume(ResumeFlags::default());
    }

    #[test]
    fn suspend_waits_for_drain_and_blocks_new_writers() {
        let barrier = Arc::new(MountBarrier::new("t"));
        let cancel = CancelToken::new();
        let inflight = barrier.enter_write(WriteFlags::WAIT, &cancel).expect("in flight");

        let suspended = Arc::new(AtomicBool::new(false));
        let suspender = {
            let barrier = Arc::clone(&barrier);
            let suspended = Arc::clone(&suspended);
            thread::spawn(move || {
                barrier
                    .suspend(SuspendFlags::default(), &CancelToken::new())
                    .expect("suspend");
                suspended.store(true, Ordering::SeqCst);
            })
        };
        wait_until("suspend pending", || barrier.phase() == BarrierPhase::SuspendPending);
        assert!(!suspended.load(Ordering::SeqCst));

        // This thread already has a write in flight, so nesting is allowed.
        let nested = barrier.enter_write(WriteFlags::NOWAIT, &cancel).expect("nested");
        nested.exit();

        let late = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier
                    .enter_write(WriteFlags::WAIT, &CancelToken::new())
                    .map(WriteGuard::exit)
            })
        };
        wait_until("late writer blocked", || barrier.snapshot().blocked == 1);

        drop(inflight);
        suspender.join().expect("suspender thread");
        assert!(suspended.load(Ordering::SeqCst));
        assert_eq!(barrier.phase(), BarrierPhase::Suspended);
        assert_eq!(barrier.snapshot().blocked, 1);

        assert!(barrier.resume(ResumeFlags::default()));
        late.join().expect("late thread").expect("late writer proceeds");
        assert_eq!(barrier.in_flight(), 0);
    }

    #[test]
    fn second_suspend_is_refused() {
        let barrier = Arc::new(MountBarrier::new("t"));
        barrier
            .suspend(SuspendFlags::default(), &CancelToken::new())
            .expect("suspend");
        let other = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.suspend(SuspendFlags::default(), &CancelToken::new()))
                .join()
                .expect("other thread")
        };
        assert!(matches!(other, Err(FfsError::AlreadySuspended)));
        barrier.resume(ResumeFlags::default());
    }

    #[test]
    fn cancelled_suspend_rolls_back() {
        let barrier = Arc::new(MountBarrier::new("t"));
        let cancel = CancelToken::new();
        let inflight = barrier.enter_write(WriteFlags::WAIT, &cancel).expect("in flight");

        let token = CancelToken::new();
        let suspender = {
            let barrier = Arc::clone(&barrier);
            let token = token.clone();
            thread::spawn(move || barrier.suspend(SuspendFlags::default(), &token))
        };
        wait_until("suspend pending", || barrier.phase() == BarrierPhase::SuspendPending);
        token.cancel();
        assert!(matches!(
            suspender.join().expect("suspender thread"),
            Err(FfsError::Interrupted)
        ));
        assert_eq!(barrier.phase(), BarrierPhase::Normal);
        assert_eq!(barrier.snapshot().owner, None);
        drop(inflight);
    }

    #[test]
    fn suspend_with_spent_budget_never_starts() {
        let barrier = MountBarrier::new("t");
        let spent = CancelToken::with_deadline(Duration::ZERO);
        assert!(matches!(
            barrier.suspend(SuspendFlags::default(), &spent),
            Err(FfsError::Interrupted)
        ));
        assert_eq!(barrier.phase(), BarrierPhase::Normal);
        assert_eq!(barrier.snapshot().owner, None);
    }

    #[test]
    fn drain_wait_gives_up_at_deadline() {
        let barrier = Arc::new(MountBarrier::new("t"));
        let inflight = barrier
            .enter_write(WriteFlags::WAIT, &CancelToken::new())
            .expect("in flight");
        let suspender = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let budget = CancelToken::with_deadline(Duration::from_millis(30));
                barrier.suspend(SuspendFlags::default(), &budget)
            })
        };
        assert!(matches!(
            suspender.join().expect("suspender thread"),
            Err(FfsError::Interrupted)
        ));
        assert_eq!(barrier.phase(), BarrierPhase::Normal);
        drop(inflight);
    }

    #[test]
    fn blocked_writer_is_interruptible() {
        let barrier = Arc::new(MountBarrier::new("t"));
        barrier
            .suspend(SuspendFlags::default(), &CancelToken::new())
            .expect("suspend");
        let token = CancelToken::new();
        let writer = {
            let barrier = Arc::clone(&barrier);
            let token = token.clone();
            thread::spawn(move || barrier.enter_write(WriteFlags::WAIT, &token).map(WriteGuard::exit))
        };
        wait_until("writer blocked", || barrier.snapshot().blocked == 1);
        token.cancel();
        assert!(matches!(
            writer.join().expect("writer thread"),
            Err(FfsError::Interrupted)
        ));
        assert_eq!(barrier.in_flight(), 0);
        barrier.resume(ResumeFlags::default());
    }

    #[derive(Debug, Default)]
    struct CountingListener {
        suspended: AtomicUsize,
        resumed: AtomicUsize,
        fail: AtomicBool,
    }

    impl SuspendListener for CountingListener {
        fn on_suspended(&self) -> Result<()> {
            self.suspended.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FfsError::Io(std::io::Error::other("flush failed")));
            }
            Ok(())
        }

        fn on_resume(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_hooks_run_unless_clear_only() {
        let listener = Arc::new(CountingListener::default());
        let barrier = MountBarrier::new("t").with_listener(Arc::clone(&listener) as Arc<dyn SuspendListener>);
        let cancel = CancelToken::new();

        barrier.suspend(SuspendFlags::default(), &cancel).expect("suspend");
        barrier.resume(ResumeFlags::default());
        barrier.suspend(SuspendFlags::default(), &cancel).expect("suspend");
        barrier.resume(ResumeFlags { clear_only: true });

        assert_eq!(listener.suspended.load(Ordering::SeqCst), 2);
        assert_eq!(listener.resumed.load(Ordering::SeqCst), 1);

        listener.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            barrier.suspend(SuspendFlags::default(), &cancel),
            Err(FfsError::Io(_))
        ));
        assert_eq!(barrier.phase(), BarrierPhase::Normal);
    }

    #[test]
    fn unmount_refuses_writers_and_every_suspend() {
        let barrier = MountBarrier::new("t");
        let cancel = CancelToken::new();
        let inflight = barrier.enter_write(WriteFlags::WAIT, &cancel).expect("in flight");
        barrier.begin_unmount();
        assert!(barrier.is_unmounting());

        // Same thread nests; new writers are refused.
        let nested = barrier.enter_write(WriteFlags::WAIT, &cancel).expect("nested");
        nested.exit();
        drop(inflight);
        assert!(matches!(
            barrier.enter_write(WriteFlags::WAIT, &cancel),
            Err(FfsError::Unmounting)
        ));
        assert!(matches!(
            barrier.suspend(SuspendFlags { skip_if_unmounting: true }, &cancel),
            Err(FfsError::Unmounting)
        ));
        assert!(matches!(
            barrier.suspend(SuspendFlags::default(), &cancel),
            Err(FfsError::Unmounting)
        ));
        assert_eq!(barrier.phase(), BarrierPhase::Normal);
        barrier.wait_drained(&cancel).expect("drained");
        barrier.teardown();
        barrier.teardown();
    }

    #[test]
    fn barrier_counts_in_its_group() {
        let group = LockGroup::detached("mount-barrier", LockPolicy::default());
        let barrier = MountBarrier::new("t").with_group(Arc::clone(&group));
        let cancel = CancelToken::new();
        barrier.enter_write(WriteFlags::WAIT, &cancel).expect("write").exit();
        assert_eq!(group.stats().live, 1);
        assert_eq!(group.stats().acquisitions, 1);
        barrier.teardown();
        assert_eq!(group.stats().live, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let barrier = MountBarrier::new("snap");
        let json = serde_json::to_string(&barrier.snapshot()).expect("serialize");
        assert!(json.contains("\"phase\":\"normal\""));
        assert!(json.contains("\"name\":\"snap\""));
    }

    #[test]
    #[should_panic(expected = "write exit without matching enter")]
    fn exit_without_enter_is_fatal() {
        let barrier = MountBarrier::new("t");
        barrier.exit_write(OwnerId::current());
    }

    #[test]
    #[should_panic(expected = "phase suspended")]
    fn teardown_while_suspended_is_fatal() {
        let barrier = MountBarrier::new("t");
        barrier
            .suspend(SuspendFlags::default(), &CancelToken::new())
            .expect("suspend");
        barrier.teardown();
    }
}
