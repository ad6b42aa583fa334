pub mod audit;
pub mod check;
pub mod config;
pub mod processes;
pub mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::audit::{AuditSink, Auditor, JsonlAuditSink};
use crate::config::Config;
use crate::enforcement::ProtectedProcesses;
use crate::policy::LockdownPolicy;

#[derive(Parser)]
#[command(name = "examguard")]
#[command(author, version, about = "Workstation lockdown for monitored exam sessions")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check for virtual machines and extra displays
    Check(check::CheckArgs),

    /// List running processes as the engine sees them
    Processes(processes::ProcessesArgs),

    /// Run a lockdown session driven by JSON events on stdin
    Session(session::SessionArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Inspect the audit log
    Audit(audit::AuditArgs),
}

/// Policy from `--policy`, else from `lockdown.policy_file`, else none.
pub(crate) fn load_policy(
    explicit: Option<&Path>,
    config: &Config,
) -> Result<Option<LockdownPolicy>> {
    let path: Option<PathBuf> = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => config.policy_path(),
    };
    Ok(path.map(|p| LockdownPolicy::load(&p)).transpose()?)
}

pub(crate) fn protected_processes(config: &Config) -> ProtectedProcesses {
    ProtectedProcesses::new(config.enforcement.protected_processes.iter())
}

/// Auditor writing to the configured JSONL log, if auditing is enabled.
pub(crate) fn file_auditor(config: &Config) -> Result<(Auditor, Option<Arc<JsonlAuditSink>>)> {
    let Some(path) = config.audit_log_path() else {
        return Ok((Auditor::null(), None));
    };
    let sink = Arc::new(
        JsonlAuditSink::open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?,
    );
    let auditor = Auditor::new(sink.clone() as Arc<dyn AuditSink>);
    Ok((auditor, Some(sink)))
}
