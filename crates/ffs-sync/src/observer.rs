//! Instrumentation hook for lock state transitions.
//!
//! The lock manager reports every transition to the observer attached to its
//! lock group. Observers see the state *after* the transition. They run
//! under the lock's meta-lock and must not call back into the lock.

use ffs_types::{InodeNumber, LockMode, LockStatus, OwnerId};
use serde::Serialize;
use std::fmt;
use tracing::trace;

/// Kind of transition being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOp {
    Acquire,
    Release,
    Upgrade,
    Downgrade,
    /// Caller queued behind the current holders.
    Block,
    /// Queued caller gave up after cancellation.
    Interrupt,
    Revoke,
    Destroy,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockEvent {
    pub ino: InodeNumber,
    pub op: LockOp,
    pub mode: Option<LockMode>,
    pub owner: OwnerId,
    pub status: LockStatus,
}

pub trait LockObserver: Send + Sync + fmt::Debug {
    fn on_transition(&self, group: &str, event: &LockEvent);
}

/// Observer that logs every transition at TRACE.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LockObserver for TracingObserver {
    fn on_transition(&self, group: &str, event: &LockEvent) {
        trace!(
            target: "ffs::sync::observer",
            group,
            ino = event.ino.0,
            op = ?event.op,
            mode = ?event.mode,
            owner = event.owner.0,
            status = ?event.status,
            "lock_transition"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recording(Mutex<Vec<(String, LockOp)>>);

    impl LockObserver for Recording {
        fn on_transition(&self, group: &str, event: &LockEvent) {
            self.0.lock().push((group.to_owned(), event.op));
        }
    }

    #[test]
    fn observers_receive_group_and_event() {
        let rec = Recording::default();
        let event = LockEvent {
            ino: InodeNumber(5),
            op: LockOp::Acquire,
            mode: Some(LockMode::Shared),
            owner: OwnerId(1),
            status: LockStatus::Shared {
                count: 1,
                waiters: 0,
            },
        };
        rec.on_transition("inode", &event);
        TracingObserver.on_transition("inode", &event);
        assert_eq!(rec.0.lock().as_slice(), &[("inode".to_owned(), LockOp::Acquire)]);
    }

    #[test]
    fn events_serialize_for_diagnostics() {
        let event = LockEvent {
            ino: InodeNumber(9),
            op: LockOp::Downgrade,
            mode: Some(LockMode::Shared),
            owner: OwnerId(3),
            status: LockStatus::Shared {
                count: 1,
                waiters: 2,
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"op\":\"downgrade\""));
        assert!(json.contains("\"count\":1"));
    }
}
