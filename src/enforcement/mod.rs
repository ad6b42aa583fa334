//! Process enforcement: block-list kills, whitelist sweep, and the two
//! continuous process watches.
//!
//! Respawn suppression is polling-based. A block-listed process that restarts
//! faster than the poll interval may run briefly before it is terminated again.

mod protected;
mod watch;

pub use protected::ProtectedProcesses;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{AuditKind, Auditor};
use crate::platform::{PlatformResult, ProcessInfo, ProcessTable};
use crate::poller::{LoopSettings, PollLoop};
use crate::policy::{ProcessMatcher, normalize_process_name};
use watch::{NewProcessTracker, RespawnTracker};

/// Runtime record of one observed block-listed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredProcessHandle {
    /// Block-list name the process matched.
    pub name: String,
    pub pid: u32,
    pub first_seen_at: DateTime<Utc>,
    /// Termination attempts made against this PID.
    pub kill_count: u32,
}

/// Passed to the respawn callback for every newly observed matching PID.
#[derive(Debug, Clone)]
pub struct RespawnEvent {
    pub name: String,
    pub process: ProcessInfo,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnAction {
    Terminate,
    Allow,
}

pub type RespawnCallback = Arc<dyn Fn(&RespawnEvent) -> RespawnAction + Send + Sync>;
pub type BlockedCallback = Arc<dyn Fn(&ProcessInfo) + Send + Sync>;

/// Result of terminating every instance of one block-listed name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub name: String,
    pub matched: usize,
    pub terminated: Vec<u32>,
    pub failures: Vec<(u32, String)>,
}

impl BlockOutcome {
    /// At least one process existed and every termination went through.
    pub fn succeeded(&self) -> bool {
        self.matched > 0 && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub terminated: Vec<(u32, String)>,
    pub failures: Vec<(u32, String, String)>,
    pub spared: usize,
}

impl SweepReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Running processes sharing one name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    pub name: String,
    pub instances: usize,
    pub path: Option<PathBuf>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct RespawnWatch {
    tracker: Arc<RespawnTracker>,
    poll: PollLoop,
}

pub struct ProcessEnforcer {
    table: Arc<dyn ProcessTable>,
    protected: ProtectedProcesses,
    settings: LoopSettings,
    respawn: Mutex<Option<RespawnWatch>>,
    new_processes: Mutex<Option<PollLoop>>,
}

impl ProcessEnforcer {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        protected: ProtectedProcesses,
        settings: LoopSettings,
    ) -> Self {
        Self {
            table,
            protected,
            settings,
            respawn: Mutex::new(None),
            new_processes: Mutex::new(None),
        }
    }

    fn auditor(&self) -> &Auditor {
        &self.settings.auditor
    }

    /// Terminate every running process named `name`. Failures are reported, not retried.
    pub fn block_process(&self, name: &str, context: &str) -> PlatformResult<BlockOutcome> {
        let target = normalize_process_name(name);
        let mut outcome = BlockOutcome {
            name: target.clone(),
            ..BlockOutcome::default()
        };

        for process in self.table.snapshot()? {
            if normalize_process_name(&process.name) != target {
                continue;
            }
            if self.protected.is_critical(&process) {
                self.auditor().warning(
                    AuditKind::ProcessKillFailed,
                    format!(
                        "Refusing to terminate protected process '{}' (pid {})",
                        process.name, process.pid
                    ),
                );
                continue;
            }
            outcome.matched += 1;
            match self.table.terminate(process.pid) {
                Ok(()) => {
                    outcome.terminated.push(process.pid);
                    self.auditor().warning(
                        AuditKind::ProcessKilled,
                        format!(
                            "[{}] Terminated blocked process '{}' (pid {})",
                            context, target, process.pid
                        ),
                    );
                }
                Err(e) if e.is_gone() => outcome.terminated.push(process.pid),
                Err(e) => {
                    self.auditor().error(
                        AuditKind::ProcessKillFailed,
                        format!(
                            "[{}] Failed to terminate '{}' (pid {}): {}",
                            context, target, process.pid, e
                        ),
                    );
                    outcome.failures.push((process.pid, e.to_string()));
                }
            }
        }

        if outcome.matched == 0 {
            debug!("[{}] No running process named '{}'", context, target);
        }
        Ok(outcome)
    }

    /// Register `name` with the respawn watch, starting the watch on first use.
    ///
    /// `on_respawn` is called once per newly observed matching PID; its answer
    /// decides whether that PID is terminated.
    pub fn monitor_process(&self, name: &str, on_respawn: RespawnCallback) {
        let name = normalize_process_name(name);
        let mut slot = lock(&self.respawn);
        let watch = slot.get_or_insert_with(|| {
            let tracker = Arc::new(RespawnTracker::new(
                self.table.clone(),
                self.protected.clone(),
                self.settings.auditor.clone(),
            ));
            let ticking = tracker.clone();
            let poll = PollLoop::spawn("respawn-watch", &self.settings, move || ticking.tick());
            RespawnWatch { tracker, poll }
        });
        debug!("Watching '{}' for respawns", name);
        watch.tracker.watch(name, on_respawn);
    }

    /// Terminate every user process not matched by `whitelist`. Best-effort:
    /// one failure does not stop the rest.
    pub fn kill_all_except_whitelist(&self, whitelist: &ProcessMatcher) -> PlatformResult<SweepReport> {
        let mut report = SweepReport::default();
        for process in self.table.snapshot()? {
            if self.protected.is_protected(&process, self.table.as_ref())
                || whitelist.matches(&process)
            {
                report.spared += 1;
                continue;
            }
            match self.table.terminate(process.pid) {
                Ok(()) => {
                    debug!("Sweep terminated '{}' (pid {})", process.name, process.pid);
                    report.terminated.push((process.pid, process.name));
                }
                Err(e) if e.is_gone() => report.terminated.push((process.pid, process.name)),
                Err(e) => {
                    self.auditor().error(
                        AuditKind::ProcessKillFailed,
                        format!(
                            "Sweep failed to terminate '{}' (pid {}): {}",
                            process.name, process.pid, e
                        ),
                    );
                    report.failures.push((process.pid, process.name, e.to_string()));
                }
            }
        }

        self.auditor().info(
            AuditKind::SweepCompleted,
            format!(
                "Whitelist sweep: {} terminated, {} failed, {} spared",
                report.terminated.len(),
                report.failures.len(),
                report.spared
            ),
        );
        Ok(report)
    }

    /// Watch for processes started from now on; anything not whitelisted is
    /// reported to `on_blocked` and terminated. Replaces a running watch.
    pub async fn monitor_new_processes(
        &self,
        whitelist: ProcessMatcher,
        on_blocked: BlockedCallback,
    ) -> PlatformResult<()> {
        let tracker = Arc::new(NewProcessTracker::new(
            self.table.clone(),
            self.protected.clone(),
            self.settings.auditor.clone(),
            whitelist,
            on_blocked,
        )?);
        let poll = PollLoop::spawn("new-process-watch", &self.settings, move || tracker.tick());
        let previous = lock(&self.new_processes).replace(poll);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(())
    }

    pub async fn stop_respawn_monitoring(&self) {
        let watch = lock(&self.respawn).take();
        if let Some(watch) = watch {
            watch.poll.stop().await;
            let names = watch.tracker.watched_names();
            watch.tracker.clear();
            info!("Respawn watch stopped ({} names)", names.len());
        }
    }

    pub async fn stop_new_process_monitoring(&self) {
        let poll = lock(&self.new_processes).take();
        if let Some(poll) = poll {
            poll.stop().await;
            info!("New-process watch stopped");
        }
    }

    /// Cancel every watch and clear tracked handles. Idempotent.
    pub async fn stop_monitoring(&self) {
        self.stop_respawn_monitoring().await;
        self.stop_new_process_monitoring().await;
    }

    pub fn is_monitoring_respawns(&self) -> bool {
        lock(&self.respawn).as_ref().is_some_and(|w| w.poll.is_running())
    }

    pub fn is_monitoring_new_processes(&self) -> bool {
        lock(&self.new_processes)
            .as_ref()
            .is_some_and(PollLoop::is_running)
    }

    /// Snapshot copy of the respawn handle table.
    pub fn tracked(&self) -> Vec<MonitoredProcessHandle> {
        lock(&self.respawn)
            .as_ref()
            .map(|w| w.tracker.snapshot())
            .unwrap_or_default()
    }

    /// Running non-system processes grouped by name.
    pub fn inventory(&self) -> PlatformResult<Vec<InventoryEntry>> {
        let mut grouped: BTreeMap<String, InventoryEntry> = BTreeMap::new();
        for process in self.table.snapshot()? {
            if self.protected.is_protected(&process, self.table.as_ref()) {
                continue;
            }
            let name = normalize_process_name(&process.name);
            let entry = grouped.entry(name.clone()).or_insert_with(|| InventoryEntry {
                name,
                instances: 0,
                path: None,
            });
            entry.instances += 1;
            if entry.path.is_none() {
                entry.path = process.path;
            }
        }
        Ok(grouped.into_values().collect())
    }

    /// Block-listed names that currently have a running process.
    pub fn running_blocked(&self, blocked: &ProcessMatcher) -> PlatformResult<Vec<String>> {
        let mut names: Vec<String> = self
            .table
            .snapshot()?
            .iter()
            .filter(|p| blocked.matches(p))
            .map(|p| normalize_process_name(&p.name))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
