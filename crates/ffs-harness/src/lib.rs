#![forbid(unsafe_code)]
//! Threaded scenario runner for the FFS concurrency core.
//!
//! Each scenario drives a real [`Mount`] from several threads and returns a
//! serializable report. Scenarios guard against hangs with a watchdog that
//! cancels every blocked wait once the deadline passes, so a deadlock shows
//! up as a failed report instead of a stuck process.

use anyhow::{Context, Result, bail};
use ffs::{
    BarrierPhase, CancelToken, FfsError, InodeNumber, LockGroupStats, LockMode, Mount,
    MountConfig, RequestOp, RequestTarget, ResumeFlags, SuspendFlags, WriteFlags, acquire_pair,
    release_pair,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub passed: bool,
    pub threads: usize,
    pub operations: u64,
    pub elapsed_ms: u64,
    /// Failed checks, empty when `passed`.
    pub failures: Vec<String>,
    pub groups: Vec<LockGroupStats>,
}

impl ScenarioReport {
    fn finish(
        scenario: &str,
        threads: usize,
        operations: u64,
        started: Instant,
        failures: Vec<String>,
        groups: Vec<LockGroupStats>,
    ) -> Self {
        Self {
            scenario: scenario.to_owned(),
            passed: failures.is_empty(),
            threads,
            operations,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            failures,
            groups,
        }
    }
}

/// Knobs shared by all scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub threads: usize,
    pub iterations: u32,
    /// Watchdog deadline for the whole scenario.
    pub timeout_ms: u64,
    pub mount: MountConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 200,
            timeout_ms: 10_000,
            mount: MountConfig::default(),
        }
    }
}

impl ScenarioConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub const SCENARIOS: [&str; 4] = [
    "pair-cross-order",
    "suspend-drain",
    "reader-writer-mix",
    "quiesce-cycles",
];

/// Run scenario `name`.
pub fn run_scenario(name: &str, config: &ScenarioConfig) -> Result<ScenarioReport> {
    match name {
        "pair-cross-order" => run_pair_cross_order(config),
        "suspend-drain" => run_suspend_drain(config),
        "reader-writer-mix" => run_reader_writer_mix(config),
        "quiesce-cycles" => run_quiesce_cycles(config),
        other => bail!("unknown scenario: {other}"),
    }
}

/// Read a scenario configuration from a JSON file.
pub fn load_scenario_config(path: &Path) -> Result<ScenarioConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: ScenarioConfig = serde_json::from_str(&text)
        .with_context(|| format!("invalid scenario config {}", path.display()))?;
    config.mount.validate()?;
    if config.threads == 0 {
        bail!("threads must be at least 1");
    }
    Ok(config)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Cancels `token` unless stopped before `timeout`.
struct Watchdog {
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<bool>,
}

impl Watchdog {
    fn arm(token: CancelToken, timeout: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            if stopped.recv_timeout(timeout) == Err(mpsc::RecvTimeoutError::Timeout) {
                token.cancel();
                true
            } else {
                false
            }
        });
        Self { stop, handle }
    }

    /// Returns whether the watchdog fired.
    fn disarm(self) -> bool {
        let _ = self.stop.send(());
        self.handle.join().unwrap_or(true)
    }
}

fn join_all(handles: Vec<thread::JoinHandle<Result<u64>>>, failures: &mut Vec<String>) -> u64 {
    let mut total = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(ops)) => total += ops,
            Ok(Err(err)) => failures.push(format!("{err:#}")),
            Err(_) => failures.push("worker panicked".to_owned()),
        }
    }
    total
}

// ── Scenarios ───────────────────────────────────────────────────────────────

/// Threads take the same two inodes in opposite argument orders.
///
/// Passes if every thread finishes all iterations before the watchdog fires.
pub fn run_pair_cross_order(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let started = Instant::now();
    let mount = Arc::new(Mount::new(config.mount.clone())?);
    let cancel = CancelToken::new();
    let watchdog = Watchdog::arm(cancel.clone(), config.timeout());

    let handles: Vec<_> = (0..config.threads)
        .map(|idx| {
            let mount = Arc::clone(&mount);
            let cancel = cancel.clone();
            let iterations = config.iterations;
            thread::spawn(move || -> Result<u64> {
                let five = mount.inode(InodeNumber(5))?;
                let nine = mount.inode(InodeNumber(9))?;
                let (a, b) = if idx % 2 == 0 { (&five, &nine) } else { (&nine, &five) };
                let mode = if idx % 4 < 2 { LockMode::Exclusive } else { LockMode::Shared };
                for _ in 0..iterations {
                    acquire_pair(a, b, mode, &cancel)?;
                    let both = a.held_by_current() == Some(mode) && b.held_by_current() == Some(mode);
                    release_pair(a, b);
                    if !both {
                        bail!("pair not fully held in {mode} mode");
                    }
                }
                Ok(u64::from(iterations))
            })
        })
        .collect();

    let mut failures = Vec::new();
    let operations = join_all(handles, &mut failures);
    if watchdog.disarm() {
        failures.push("watchdog fired: pair acquisition did not finish".to_owned());
    }
    let groups = mount.unmount(&CancelToken::new())?.groups;
    Ok(ScenarioReport::finish(
        "pair-cross-order",
        config.threads,
        operations,
        started,
        failures,
        groups,
    ))
}

/// `threads` writers are in flight when a suspend starts; suspend must wait
/// for all of them, and a later writer must wait for resume.
pub fn run_suspend_drain(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let started = Instant::now();
    let timeout = config.timeout();
    let mount = Arc::new(Mount::new(config.mount.clone())?);
    let writers = config.threads;
    let release = Arc::new(AtomicBool::new(false));
    let mut failures = Vec::new();

    let handles: Vec<_> = (0..writers)
        .map(|_| {
            let mount = Arc::clone(&mount);
            let release = Arc::clone(&release);
            thread::spawn(move || -> Result<u64> {
                let guard = mount
                    .barrier()
                    .enter_write(WriteFlags::WAIT, &CancelToken::new())?;
                wait_until("release signal", timeout, || release.load(Ordering::SeqCst))?;
                guard.exit();
                Ok(1)
            })
        })
        .collect();
    let in_flight = u64::try_from(writers).unwrap_or(u64::MAX);
    wait_until("writers in flight", timeout, || {
        mount.barrier().in_flight() == in_flight
    })?;

    let suspended = Arc::new(AtomicBool::new(false));
    let suspender = {
        let mount = Arc::clone(&mount);
        let suspended = Arc::clone(&suspended);
        thread::spawn(move || -> Result<()> {
            mount
                .barrier()
                .suspend(SuspendFlags::default(), &CancelToken::new())?;
            suspended.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    wait_until("suspend pending", timeout, || {
        mount.barrier().phase() == BarrierPhase::SuspendPending
    })?;
    if suspended.load(Ordering::SeqCst) {
        failures.push("suspend returned with writers in flight".to_owned());
    }

    release.store(true, Ordering::SeqCst);
    let operations = join_all(handles, &mut failures);
    match suspender.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => failures.push(format!("suspend failed: {err:#}")),
        Err(_) => failures.push("suspender panicked".to_owned()),
    }
    if mount.barrier().phase() != BarrierPhase::Suspended {
        failures.push("barrier not suspended after drain".to_owned());
    }

    let late_done = Arc::new(AtomicBool::new(false));
    let late = {
        let mount = Arc::clone(&mount);
        let late_done = Arc::clone(&late_done);
        thread::spawn(move || -> Result<()> {
            mount.run(
                RequestOp::Write,
                RequestTarget::One(InodeNumber(12)),
                &CancelToken::new(),
                |_| Ok(()),
            )?;
            late_done.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    wait_until("late writer blocked", timeout, || mount.barrier().snapshot().blocked == 1)?;
    if late_done.load(Ordering::SeqCst) {
        failures.push("writer entered a suspended mount".to_owned());
    }
    mount.barrier().resume(ResumeFlags::default());
    match late.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => failures.push(format!("late writer failed: {err:#}")),
        Err(_) => failures.push("late writer panicked".to_owned()),
    }
    if mount.barrier().in_flight() != 0 {
        failures.push("in-flight count changed across suspend/resume".to_owned());
    }

    let groups = mount.unmount(&CancelToken::new())?.groups;
    Ok(ScenarioReport::finish(
        "suspend-drain",
        writers + 2,
        operations + 1,
        started,
        failures,
        groups,
    ))
}

/// Readers and writers hammer one inode through the dispatcher. Passes if
/// both classes make progress.
pub fn run_reader_writer_mix(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let started = Instant::now();
    let mount = Arc::new(Mount::new(config.mount.clone())?);
    let cancel = CancelToken::new();
    let watchdog = Watchdog::arm(cancel.clone(), config.timeout());
    let reads = Arc::new(AtomicU64::new(0));
    let writes = Arc::new(AtomicU64::new(0));
    let threads = config.threads.max(2);

    let handles: Vec<_> = (0..threads)
        .map(|idx| {
            let mount = Arc::clone(&mount);
            let cancel = cancel.clone();
            let counter = Arc::clone(if idx % 2 == 0 { &reads } else { &writes });
            let op = if idx % 2 == 0 { RequestOp::Read } else { RequestOp::Write };
            let iterations = config.iterations;
            thread::spawn(move || -> Result<u64> {
                for _ in 0..iterations {
                    let held = mount.run(op, RequestTarget::One(InodeNumber::ROOT), &cancel, |scope| {
                        Ok(scope
                            .lock_of(InodeNumber::ROOT)
                            .and_then(|lock| lock.held_by_current()))
                    })?;
                    if held != Some(op.lock_mode()) {
                        bail!("{op} ran holding {held:?} on the root inode");
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(u64::from(iterations))
            })
        })
        .collect();

    let mut failures = Vec::new();
    let operations = join_all(handles, &mut failures);
    if watchdog.disarm() {
        failures.push("watchdog fired: a lock class starved".to_owned());
    }
    if reads.load(Ordering::Relaxed) == 0 || writes.load(Ordering::Relaxed) == 0 {
        failures.push("one lock class made no progress".to_owned());
    }
    let groups = mount.unmount(&CancelToken::new())?.groups;
    Ok(ScenarioReport::finish(
        "reader-writer-mix",
        threads,
        operations,
        started,
        failures,
        groups,
    ))
}

/// Writers run continuously while a driver quiesces the mount repeatedly;
/// no write may be in flight at any quiesce point.
pub fn run_quiesce_cycles(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let started = Instant::now();
    let mount = Arc::new(Mount::new(config.mount.clone())?);
    let cancel = CancelToken::new();
    let watchdog = Watchdog::arm(cancel.clone(), config.timeout());
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..config.threads)
        .map(|idx| {
            let mount = Arc::clone(&mount);
            let cancel = cancel.clone();
            let stop = Arc::clone(&stop);
            let ino = InodeNumber(100 + u64::try_from(idx).unwrap_or(0));
            thread::spawn(move || -> Result<u64> {
                let mut ops = 0;
                while !stop.load(Ordering::Relaxed) {
                    match mount.run(RequestOp::Setattr, RequestTarget::One(ino), &cancel, |_| Ok(())) {
                        Ok(()) => ops += 1,
                        Err(FfsError::Interrupted) => break,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(ops)
            })
        })
        .collect();

    let mut failures = Vec::new();
    let mut quiesced = 0_u64;
    for _ in 0..config.iterations.min(50) {
        let drained = mount.quiesce(&cancel, || Ok(mount.barrier().in_flight() == 0));
        match drained {
            Ok(true) => quiesced += 1,
            Ok(false) => failures.push("write in flight at quiesce point".to_owned()),
            Err(err) => {
                failures.push(format!("quiesce failed: {err}"));
                break;
            }
        }
    }
    stop.store(true, Ordering::Relaxed);
    let operations = join_all(handles, &mut failures);
    if watchdog.disarm() {
        failures.push("watchdog fired during quiesce cycles".to_owned());
    }
    let report = mount.unmount(&CancelToken::new())?;
    if report.suspensions != quiesced {
        failures.push(format!(
            "{} suspensions recorded for {quiesced} quiesce points",
            report.suspensions
        ));
    }
    Ok(ScenarioReport::finish(
        "quiesce-cycles",
        config.threads + 1,
        operations,
        started,
        failures,
        report.groups,
    ))
}
