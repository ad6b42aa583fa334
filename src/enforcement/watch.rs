//! Per-tick state of the two process watches.
//!
//! Both trackers are driven by a [`PollLoop`](crate::poller::PollLoop); every
//! `tick` takes one process-table snapshot and acts on it. An entry that vanishes
//! between enumeration and termination is treated as already gone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use super::protected::ProtectedProcesses;
use super::{BlockedCallback, MonitoredProcessHandle, RespawnAction, RespawnCallback, RespawnEvent};
use crate::audit::{AuditKind, Auditor};
use crate::platform::{PlatformError, ProcessInfo, ProcessTable};
use crate::policy::{ProcessMatcher, normalize_process_name};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Tracked {
    handle: MonitoredProcessHandle,
    action: RespawnAction,
    terminated: bool,
}

/// Respawn suppression for block-listed names.
pub(crate) struct RespawnTracker {
    table: Arc<dyn ProcessTable>,
    protected: ProtectedProcesses,
    auditor: Auditor,
    watched: Mutex<BTreeMap<String, RespawnCallback>>,
    handles: Mutex<HashMap<u32, Tracked>>,
    published: watch::Sender<Vec<MonitoredProcessHandle>>,
}

impl RespawnTracker {
    pub(crate) fn new(
        table: Arc<dyn ProcessTable>,
        protected: ProtectedProcesses,
        auditor: Auditor,
    ) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            table,
            protected,
            auditor,
            watched: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(HashMap::new()),
            published,
        }
    }

    /// Add or replace the callback for `name` (already normalized).
    pub(crate) fn watch(&self, name: String, on_respawn: RespawnCallback) {
        lock(&self.watched).insert(name, on_respawn);
    }

    pub(crate) fn watched_names(&self) -> Vec<String> {
        lock(&self.watched).keys().cloned().collect()
    }

    /// Copy of the handle table as of the last tick.
    pub(crate) fn snapshot(&self) -> Vec<MonitoredProcessHandle> {
        self.published.borrow().clone()
    }

    pub(crate) fn tick(&self) {
        let processes = match self.table.snapshot() {
            Ok(processes) => processes,
            Err(e) => {
                debug!("Respawn watch: process snapshot failed: {}", e);
                return;
            }
        };
        let watched = lock(&self.watched).clone();
        let mut handles = lock(&self.handles);

        let live: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        handles.retain(|pid, _| live.contains(pid));

        for process in &processes {
            let name = normalize_process_name(&process.name);
            let Some(on_respawn) = watched.get(&name) else {
                continue;
            };
            if self.protected.is_critical(process) {
                continue;
            }

            let tracked = handles.entry(process.pid).or_insert_with(|| {
                let handle = MonitoredProcessHandle {
                    name: name.clone(),
                    pid: process.pid,
                    first_seen_at: Utc::now(),
                    kill_count: 0,
                };
                let event = RespawnEvent {
                    name: name.clone(),
                    process: process.clone(),
                    first_seen_at: handle.first_seen_at,
                };
                let action = on_respawn(&event);
                Tracked {
                    handle,
                    action,
                    terminated: false,
                }
            });

            if tracked.action == RespawnAction::Terminate && !tracked.terminated {
                tracked.handle.kill_count += 1;
                match self.table.terminate(process.pid) {
                    Ok(()) => {
                        tracked.terminated = true;
                        self.auditor.warning(
                            AuditKind::ProcessRespawned,
                            format!(
                                "Terminated respawned blocked process '{}' (pid {})",
                                name, process.pid
                            ),
                        );
                    }
                    Err(e) if e.is_gone() => tracked.terminated = true,
                    Err(e) => {
                        // Retried on the next tick while the process lives.
                        if tracked.handle.kill_count == 1 {
                            self.auditor.error(
                                AuditKind::ProcessKillFailed,
                                format!(
                                    "Failed to terminate blocked process '{}' (pid {}): {}",
                                    name, process.pid, e
                                ),
                            );
                        } else {
                            debug!("Retry terminate {} (pid {}) failed: {}", name, process.pid, e);
                        }
                    }
                }
            }
        }

        let mut published: Vec<MonitoredProcessHandle> =
            handles.values().map(|t| t.handle.clone()).collect();
        published.sort_by_key(|h| h.pid);
        self.published.send_replace(published);
    }

    pub(crate) fn clear(&self) {
        lock(&self.watched).clear();
        lock(&self.handles).clear();
        self.published.send_replace(Vec::new());
    }
}

/// Termination of processes launched after the session started.
pub(crate) struct NewProcessTracker {
    table: Arc<dyn ProcessTable>,
    protected: ProtectedProcesses,
    auditor: Auditor,
    whitelist: ProcessMatcher,
    on_blocked: BlockedCallback,
    seen: Mutex<HashSet<u32>>,
    /// Blocked PIDs still to be terminated, with failed attempts so far.
    pending: Mutex<HashMap<u32, (ProcessInfo, u32)>>,
}

impl NewProcessTracker {
    pub(crate) fn new(
        table: Arc<dyn ProcessTable>,
        protected: ProtectedProcesses,
        auditor: Auditor,
        whitelist: ProcessMatcher,
        on_blocked: BlockedCallback,
    ) -> Result<Self, PlatformError> {
        let baseline = table.snapshot()?.into_iter().map(|p| p.pid).collect();
        Ok(Self {
            table,
            protected,
            auditor,
            whitelist,
            on_blocked,
            seen: Mutex::new(baseline),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn tick(&self) {
        let processes = match self.table.snapshot() {
            Ok(processes) => processes,
            Err(e) => {
                debug!("New-process watch: process snapshot failed: {}", e);
                return;
            }
        };
        let live: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        let mut seen = lock(&self.seen);
        let mut pending = lock(&self.pending);
        seen.retain(|pid| live.contains(pid));
        pending.retain(|pid, _| live.contains(pid));

        for process in processes {
            if !seen.insert(process.pid) {
                continue;
            }
            if self.protected.is_protected(&process, self.table.as_ref())
                || self.whitelist.matches(&process)
            {
                continue;
            }
            (self.on_blocked)(&process);
            self.auditor.warning(
                AuditKind::ProcessBlocked,
                format!(
                    "Unapproved process '{}' (pid {}) launched during exam",
                    process.name, process.pid
                ),
            );
            pending.insert(process.pid, (process, 0));
        }

        pending.retain(|pid, (process, failures)| match self.table.terminate(*pid) {
            Ok(()) => {
                self.auditor.info(
                    AuditKind::ProcessKilled,
                    format!("Terminated '{}' (pid {})", process.name, pid),
                );
                false
            }
            Err(e) if e.is_gone() => false,
            Err(e) => {
                *failures += 1;
                if *failures == 1 {
                    self.auditor.error(
                        AuditKind::ProcessKillFailed,
                        format!("Failed to terminate '{}' (pid {}): {}", process.name, pid, e),
                    );
                }
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::platform::fake::FakeProcesses;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn respawn_tracker(
        table: &Arc<FakeProcesses>,
        sink: &Arc<MemoryAuditSink>,
    ) -> RespawnTracker {
        RespawnTracker::new(
            table.clone(),
            ProtectedProcesses::default(),
            Auditor::new(sink.clone()),
        )
    }

    #[test]
    fn callback_fires_once_per_new_pid() {
        let table = Arc::new(FakeProcesses::default());
        let sink = Arc::new(MemoryAuditSink::default());
        let tracker = respawn_tracker(&table, &sink);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        tracker.watch(
            "notepad".into(),
            Arc::new(move |_: &RespawnEvent| {
                c.fetch_add(1, Ordering::SeqCst);
                RespawnAction::Allow
            }),
        );

        let pid = table.spawn("notepad.exe");
        tracker.tick();
        tracker.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_running(pid));
        assert_eq!(tracker.snapshot().len(), 1);
        assert_eq!(tracker.snapshot()[0].kill_count, 0);

        table.spawn("notepad.exe");
        tracker.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn respawned_process_is_terminated_and_handle_dropped() {
        let table = Arc::new(FakeProcesses::default());
        let sink = Arc::new(MemoryAuditSink::default());
        let tracker = respawn_tracker(&table, &sink);
        tracker.watch("taskmgr".into(), Arc::new(|_: &RespawnEvent| RespawnAction::Terminate));

        let pid = table.spawn("Taskmgr.exe");
        tracker.tick();
        assert!(!table.is_running(pid));
        assert_eq!(tracker.snapshot()[0].kill_count, 1);
        let events = sink.snapshot();
        assert!(events.iter().any(|e| e.kind == AuditKind::ProcessRespawned
            && e.message.contains("taskmgr")));

        tracker.tick();
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn failed_kill_is_retried_but_reported_once() {
        let table = Arc::new(FakeProcesses::default());
        let sink = Arc::new(MemoryAuditSink::default());
        let tracker = respawn_tracker(&table, &sink);
        tracker.watch("anydesk".into(), Arc::new(|_: &RespawnEvent| RespawnAction::Terminate));
        table.deny_termination("AnyDesk.exe");

        let pid = table.spawn("AnyDesk.exe");
        for _ in 0..3 {
            tracker.tick();
        }
        assert!(table.is_running(pid));
        assert_eq!(table.attempts_for(pid), 3);
        assert_eq!(sink.count(AuditKind::ProcessKillFailed), 1);
    }

    #[test]
    fn snapshot_failure_skips_tick() {
        let table = Arc::new(FakeProcesses::default());
        let sink = Arc::new(MemoryAuditSink::default());
        let tracker = respawn_tracker(&table, &sink);
        tracker.watch("cmd".into(), Arc::new(|_: &RespawnEvent| RespawnAction::Terminate));
        let pid = table.spawn("cmd.exe");

        table.fail_snapshots(true);
        tracker.tick();
        assert!(table.is_running(pid));

        table.fail_snapshots(false);
        tracker.tick();
        assert!(!table.is_running(pid));
    }

    #[test]
    fn new_process_tracker_ignores_baseline_and_whitelist() {
        let table = Arc::new(FakeProcesses::default());
        let sink = Arc::new(MemoryAuditSink::default());
        let before = table.spawn("chrome.exe");
        let blocked = Arc::new(Mutex::new(Vec::new()));
        let b = blocked.clone();
        let tracker = NewProcessTracker::new(
            table.clone(),
            ProtectedProcesses::default(),
            Auditor::new(sink.clone()),
            ProcessMatcher::new(["notepad"]),
            Arc::new(move |p: &ProcessInfo| b.lock().unwrap().push(p.name.clone())),
        )
        .unwrap();

        let allowed = table.spawn("notepad.exe");
        let system = table.spawn_system("svc-helper");
        let intruder = table.spawn("discord.exe");
        tracker.tick();

        assert!(table.is_running(before));
        assert!(table.is_running(allowed));
        assert!(table.is_running(system));
        assert!(!table.is_running(intruder));
        assert_eq!(*blocked.lock().unwrap(), vec!["discord.exe".to_string()]);
        assert_eq!(sink.count(AuditKind::ProcessBlocked), 1);
    }

    #[test]
    fn new_process_tracker_retries_failed_kills() {
        let table = Arc::new(FakeProcesses::default());
        let sink = Arc::new(MemoryAuditSink::default());
        let tracker = NewProcessTracker::new(
            table.clone(),
            ProtectedProcesses::default(),
            Auditor::new(sink.clone()),
            ProcessMatcher::default(),
            Arc::new(|_: &ProcessInfo| {}),
        )
        .unwrap();
        table.deny_termination("teamviewer.exe");
        let pid = table.spawn("teamviewer.exe");

        tracker.tick();
        tracker.tick();
        assert_eq!(table.attempts_for(pid), 2);
        assert_eq!(sink.count(AuditKind::ProcessBlocked), 1);
        assert_eq!(sink.count(AuditKind::ProcessKillFailed), 1);
    }
}
