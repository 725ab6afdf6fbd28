//! Cancellation tokens for blocking lock and barrier waits.
//!
//! A thread parked on a condition variable cannot observe a flag flip by
//! itself. Before parking, the waiter registers a waker with its token; the
//! waker re-acquires the waiter's meta-lock and broadcasts the condition, so
//! a cancel can never slip in between the waiter's last flag check and its
//! park.
//!
//! A token may also carry a deadline budget, like a request context built
//! with a time budget. Once the deadline passes the token reads as cancelled,
//! and armed waits park no later than the deadline so they notice it.
//!
//! Entry points call [`CancelToken::checkpoint`] before doing any work.
//! Blocking waits follow this protocol under the meta-lock:
//!
//! 1. `let wait = token.arm(waker);`
//! 2. check `token.is_cancelled()`
//! 3. `wait.park(&cond, &mut guard)`, re-check on wake
//!
//! [`CancelToken::cancel`] snapshots the wakers and calls them after dropping
//! its own mutex, so wakers may freely take other locks.

use ffs_error::{FfsError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Wakers {
    next_id: u64,
    entries: Vec<(u64, Waker)>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    wakers: Mutex<Wakers>,
}

/// Shared cancellation signal.
///
/// Cloning yields another handle to the same signal and deadline. Once
/// cancelled, a token stays cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .field("wakers", &self.inner.wakers.lock().entries.len())
            .finish()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `budget` has elapsed.
    #[must_use]
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                deadline: Instant::now().checked_add(budget),
                ..CancelInner::default()
            }),
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Request cancellation and wake every registered waiter.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let wakers: Vec<Waker> = {
            let guard = self.inner.wakers.lock();
            guard.entries.iter().map(|(_, w)| Arc::clone(w)).collect()
        };
        debug!(target: "ffs::sync::cancel", wakers = wakers.len(), "cancel requested");
        for waker in wakers {
            waker();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`FfsError::Interrupted`] if cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FfsError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Prepare a blocking wait: register `waker` for explicit cancels and
    /// carry the deadline for [`ArmedWait::park`].
    pub fn arm(&self, waker: Arc<dyn Fn() + Send + Sync>) -> ArmedWait<'_> {
        ArmedWait {
            registration: self.register(waker),
            deadline: self.inner.deadline,
        }
    }

    /// Register `waker` to run on cancellation. Unregistered on drop.
    pub fn register(&self, waker: Arc<dyn Fn() + Send + Sync>) -> WakerRegistration<'_> {
        let mut guard = self.inner.wakers.lock();
        let id = guard.next_id;
        guard.next_id = guard.next_id.wrapping_add(1);
        guard.entries.push((id, waker));
        drop(guard);
        WakerRegistration { token: self, id }
    }

    fn unregister(&self, id: u64) {
        self.inner.wakers.lock().entries.retain(|(entry, _)| *entry != id);
    }
}

/// Scoped waker registration returned by [`CancelToken::register`].
#[must_use = "the waker is unregistered when this guard drops"]
pub struct WakerRegistration<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl fmt::Debug for WakerRegistration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakerRegistration").field("id", &self.id).finish()
    }
}

impl Drop for WakerRegistration<'_> {
    fn drop(&mut self) {
        self.token.unregister(self.id);
    }
}

/// A blocking wait armed against a token, returned by [`CancelToken::arm`].
#[must_use = "the waker is unregistered when this guard drops"]
pub struct ArmedWait<'a> {
    registration: WakerRegistration<'a>,
    deadline: Option<Instant>,
}

impl fmt::Debug for ArmedWait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmedWait")
            .field("registration", &self.registration)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl ArmedWait<'_> {
    /// Park on `cond`, waking no later than the token's deadline.
    ///
    /// Wakeups may be spurious; callers re-check their condition and the
    /// token after every return.
    pub fn park<T: ?Sized>(&self, cond: &Condvar, guard: &mut MutexGuard<'_, T>) {
        match self.deadline {
            Some(deadline) => {
                let _ = cond.wait_until(guard, deadline);
            }
            None => cond.wait(guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_runs_registered_wakers_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let _reg = token.register(Arc::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_is_not_woken() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits2 = Arc::clone(&hits);
            let _reg = token.register(Arc::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }));
        }
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn checkpoint_reports_interrupted() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.clone().cancel();
        assert!(matches!(token.checkpoint(), Err(FfsError::Interrupted)));
    }

    #[test]
    fn deadline_budget_expires_into_interrupted() {
        let token = CancelToken::with_deadline(Duration::from_millis(10));
        assert!(token.deadline().is_some());
        assert!(token.checkpoint().is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert!(token.is_cancelled());
        assert!(matches!(token.clone().checkpoint(), Err(FfsError::Interrupted)));
        assert!(CancelToken::new().deadline().is_none());
    }

    #[test]
    fn armed_wait_wakes_at_deadline_without_notify() {
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let token = CancelToken::with_deadline(Duration::from_millis(15));
        let started = Instant::now();
        let mut guard = lock.lock();
        let wait = token.arm(Arc::new(|| {}));
        while !token.is_cancelled() {
            wait.park(&cond, &mut guard);
        }
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancel_wakes_parked_thread() {
        let pair = Arc::new((Mutex::new(()), Condvar::new()));
        let token = CancelToken::new();

        let waiter = {
            let pair = Arc::clone(&pair);
            let token = token.clone();
            std::thread::spawn(move || {
                let (lock, cond) = &*pair;
                let mut guard = lock.lock();
                let waker_pair = Arc::clone(&pair);
                let wait = token.arm(Arc::new(move || {
                    let (lock, cond) = &*waker_pair;
                    let _g = lock.lock();
                    cond.notify_all();
                }));
                while !token.is_cancelled() {
                    wait.park(cond, &mut guard);
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        waiter.join().expect("waiter exits after cancel");
    }
}
