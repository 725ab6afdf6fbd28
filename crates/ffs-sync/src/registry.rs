//! Lock-group registry.
//!
//! Every lock belongs to a named group ("inode", "mount-barrier", ...). A
//! group carries the grant policy and observer for its locks and keeps
//! counters for diagnostics. The registry is an explicit object owned by the
//! mount: it is created at mount time and torn down at unmount, after which
//! no new groups can be handed out.
//!
//! # Logging
//!
//! - **DEBUG** `ffs::sync::registry`: `lock_group_created`
//! - **INFO**  `ffs::sync::registry`: `lock_registry_teardown`

use crate::observer::{LockEvent, LockObserver};
use ffs_error::{FfsError, Result, Violation, fatal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Grant policy shared by the locks of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// How many consecutive exclusive grants may bypass queued shared
    /// waiters before the shared waiters get a turn. `0` disables writer
    /// preference (queued readers are admitted at the next opportunity).
    pub max_writer_bypass: u32,
    /// Yield the CPU between rounds of the pairwise acquisition protocol.
    pub pair_retry_yield: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_writer_bypass: 8,
            pair_retry_yield: true,
        }
    }
}

/// Point-in-time counters for one lock group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGroupStats {
    pub name: String,
    pub live: u64,
    pub created: u64,
    pub acquisitions: u64,
    pub contended: u64,
    pub interrupted: u64,
}

/// A debug category of locks.
pub struct LockGroup {
    name: String,
    policy: LockPolicy,
    observer: Option<Arc<dyn LockObserver>>,
    live: AtomicU64,
    created: AtomicU64,
    acquisitions: AtomicU64,
    contended: AtomicU64,
    interrupted: AtomicU64,
}

impl fmt::Debug for LockGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGroup")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("observed", &self.observer.is_some())
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LockGroup {
    /// A group that is not attached to any registry.
    #[must_use]
    pub fn detached(name: &str, policy: LockPolicy) -> Arc<Self> {
        Arc::new(Self::build(name, policy, None))
    }

    fn build(name: &str, policy: LockPolicy, observer: Option<Arc<dyn LockObserver>>) -> Self {
        Self {
            name: name.to_owned(),
            policy,
            observer,
            live: AtomicU64::new(0),
            created: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Report a transition to the observer, if any.
    ///
    /// The event is only built when an observer is attached.
    #[inline]
    pub fn observe(&self, event: impl FnOnce() -> LockEvent) {
        if let Some(observer) = &self.observer {
            observer.on_transition(&self.name, &event());
        }
    }

    pub fn record_created(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        // Saturate so a stray double count cannot wrap the gauge.
        let _ = self
            .live
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn record_acquired(&self, contended: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> LockGroupStats {
        LockGroupStats {
            name: self.name.clone(),
            live: self.live.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Per-mount registry of lock groups.
pub struct LockRegistry {
    policy: LockPolicy,
    observer: Option<Arc<dyn LockObserver>>,
    groups: Mutex<BTreeMap<String, Arc<LockGroup>>>,
    torn_down: AtomicBool,
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("policy", &self.policy)
            .field("groups", &self.groups.lock().keys().collect::<Vec<_>>())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl LockRegistry {
    #[must_use]
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            observer: None,
            groups: Mutex::new(BTreeMap::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Attach an observer to every group created from now on.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Look up or create the group called `name`.
    ///
    /// Fails with `Unmounting` once the registry has been torn down.
    pub fn group(&self, name: &str) -> Result<Arc<LockGroup>> {
        if self.is_torn_down() {
            return Err(FfsError::Unmounting);
        }
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(name) {
            return Ok(Arc::clone(group));
        }
        let group = Arc::new(LockGroup::build(name, self.policy, self.observer.clone()));
        groups.insert(name.to_owned(), Arc::clone(&group));
        drop(groups);
        debug!(target: "ffs::sync::registry", group = name, "lock_group_created");
        Ok(group)
    }

    #[must_use]
    pub fn stats(&self) -> Vec<LockGroupStats> {
        self.groups.lock().values().map(|g| g.stats()).collect()
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Tear the registry down and return the final counters.
    ///
    /// Every group must have zero live locks; a live lock at teardown is a
    /// fatal violation. Tearing down twice returns an empty list.
    pub fn teardown(&self) -> Vec<LockGroupStats> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let groups = std::mem::take(&mut *self.groups.lock());
        let stats: Vec<LockGroupStats> = groups.values().map(|g| g.stats()).collect();
        if let Some(busy) = stats.iter().find(|s| s.live > 0) {
            fatal(Violation::RegistryInUse {
                group: busy.name.clone(),
                live: busy.live,
            });
        }
        info!(
            target: "ffs::sync::registry",
            groups = stats.len(),
            "lock_registry_teardown"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_lookup_is_idempotent() {
        let registry = LockRegistry::new(LockPolicy::default());
        let a = registry.group("inode").expect("group");
        let b = registry.group("inode").expect("group");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "inode");
        assert_eq!(a.policy().max_writer_bypass, 8);
    }

    #[test]
    fn counters_track_lifecycle() {
        let group = LockGroup::detached("inode", LockPolicy::default());
        group.record_created();
        group.record_created();
        group.record_acquired(false);
        group.record_acquired(true);
        group.record_interrupted();
        group.record_destroyed();

        let stats = group.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.contended, 1);
        assert_eq!(stats.interrupted, 1);
    }

    #[test]
    fn teardown_closes_registry() {
        let registry = LockRegistry::new(LockPolicy::default());
        let group = registry.group("inode").expect("group");
        group.record_created();
        group.record_destroyed();

        let stats = registry.teardown();
        assert_eq!(stats.len(), 1);
        assert!(registry.is_torn_down());
        assert!(matches!(registry.group("inode"), Err(FfsError::Unmounting)));
        assert!(registry.teardown().is_empty());
    }

    #[test]
    #[should_panic(expected = "live locks in group inode")]
    fn teardown_with_live_locks_is_fatal() {
        let registry = LockRegistry::new(LockPolicy::default());
        registry.group("inode").expect("group").record_created();
        let _ = registry.teardown();
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: LockPolicy =
            serde_json::from_str(r#"{"max_writer_bypass": 2}"#).expect("policy");
        assert_eq!(policy.max_writer_bypass, 2);
        assert!(policy.pair_retry_yield);
    }
}
