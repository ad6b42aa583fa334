//! Processes the engine must never terminate.

use std::collections::HashSet;

use crate::platform::{self, ProcessInfo, ProcessTable};
use crate::policy::normalize_process_name;

/// Core OS processes whose termination destabilizes or logs off the session.
const CRITICAL_PROCESSES: &[&str] = &[
    "system",
    "idle",
    "system idle process",
    "registry",
    "memory compression",
    "smss",
    "csrss",
    "wininit",
    "winlogon",
    "services",
    "lsass",
    "svchost",
    "dwm",
    "fontdrvhost",
    "sihost",
    "ctfmon",
    "conhost",
    "explorer",
    "audiodg",
    "spoolsv",
    "taskhostw",
    "runtimebroker",
];

#[derive(Debug, Clone)]
pub struct ProtectedProcesses {
    names: HashSet<String>,
    own_pid: u32,
    /// The shell or launcher chain above this engine.
    ancestors: HashSet<u32>,
}

impl Default for ProtectedProcesses {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

impl ProtectedProcesses {
    /// Built-in critical names plus `extra` (already-running exam tooling, etc.).
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: HashSet<String> = CRITICAL_PROCESSES.iter().map(|n| n.to_string()).collect();
        names.extend(extra.into_iter().map(|n| normalize_process_name(n.as_ref())));
        Self {
            names,
            own_pid: std::process::id(),
            ancestors: platform::ancestor_pids().into_iter().collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ancestors(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.ancestors.extend(pids);
        self
    }

    /// PID 0/4 (idle/system), this engine, and every process it was launched from.
    pub fn is_reserved_pid(&self, pid: u32) -> bool {
        pid == 0 || pid == 4 || pid == self.own_pid || self.ancestors.contains(&pid)
    }

    /// Guard applied to explicit block-list terminations.
    pub fn is_critical(&self, process: &ProcessInfo) -> bool {
        self.is_reserved_pid(process.pid) || self.names.contains(&normalize_process_name(&process.name))
    }

    /// Guard applied to sweeps: critical, or judged part of the system by the OS backend.
    pub fn is_protected(&self, process: &ProcessInfo, table: &dyn ProcessTable) -> bool {
        self.is_critical(process) || table.is_system_process(process)
    }
}
