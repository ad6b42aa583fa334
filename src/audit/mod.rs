//! Structured audit trail for enforcement actions.
//!
//! Every action the engine takes against the workstation (a process killed, a
//! key combination swallowed, a hook that failed to install, the environment
//! verdict) is reported through an [`Auditor`]. The auditor emits a `tracing`
//! event and forwards an [`AuditEvent`] to the injected [`AuditSink`]s; where the
//! events end up (memory, a hash-chained JSONL file, a log-shipping channel) is
//! the sink's business.

mod jsonl;

pub use jsonl::{AuditRecord, JsonlAuditSink, read_audit_log, verify_audit_chain};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of action an audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Pre-flight virtualization / display verdict.
    EnvironmentVerdict,
    /// Session refused to start because of the environment.
    EnvironmentRejected,
    /// Lifecycle state transition.
    SessionState,
    /// A lockdown step produced a non-applied outcome.
    StepOutcome,
    /// Running processes recorded at session start.
    ProcessInventory,
    ProcessKilled,
    ProcessKillFailed,
    /// A block-listed process came back after being terminated.
    ProcessRespawned,
    /// A process outside the whitelist was launched during the session.
    ProcessBlocked,
    SweepCompleted,
    ComboBlocked,
    MouseButtonBlocked,
    HookInstalled,
    HookInstallFailed,
    HookUninstalled,
    HookUninstallFailed,
    TouchpadChanged,
    ScreenLockChanged,
    WindowPinned,
    FocusReasserted,
    DisplayChanged,
    /// A background loop iteration failed, timed out or panicked.
    LoopFailure,
    /// The audit log itself started a new chain segment.
    ChainRecovery,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnvironmentVerdict => "environment_verdict",
            Self::EnvironmentRejected => "environment_rejected",
            Self::SessionState => "session_state",
            Self::StepOutcome => "step_outcome",
            Self::ProcessInventory => "process_inventory",
            Self::ProcessKilled => "process_killed",
            Self::ProcessKillFailed => "process_kill_failed",
            Self::ProcessRespawned => "process_respawned",
            Self::ProcessBlocked => "process_blocked",
            Self::SweepCompleted => "sweep_completed",
            Self::ComboBlocked => "combo_blocked",
            Self::MouseButtonBlocked => "mouse_button_blocked",
            Self::HookInstalled => "hook_installed",
            Self::HookInstallFailed => "hook_install_failed",
            Self::HookUninstalled => "hook_uninstalled",
            Self::HookUninstallFailed => "hook_uninstall_failed",
            Self::TouchpadChanged => "touchpad_changed",
            Self::ScreenLockChanged => "screen_lock_changed",
            Self::WindowPinned => "window_pinned",
            Self::FocusReasserted => "focus_reasserted",
            Self::DisplayChanged => "display_changed",
            Self::LoopFailure => "loop_failure",
            Self::ChainRecovery => "chain_recovery",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub level: AuditLevel,
    pub kind: AuditKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(level: AuditLevel, kind: AuditKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit events.
///
/// `record` may be called from a keyboard hook callback and must return without
/// blocking on I/O.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Handle passed to every component that reports enforcement actions.
#[derive(Clone)]
pub struct Auditor {
    sinks: Arc<Vec<Arc<dyn AuditSink>>>,
}

impl fmt::Debug for Auditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auditor")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::with_sinks(vec![sink])
    }

    pub fn with_sinks(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// Tracing output only.
    pub fn null() -> Self {
        Self::with_sinks(Vec::new())
    }

    pub fn record(&self, level: AuditLevel, kind: AuditKind, message: impl Into<String>) {
        let event = AuditEvent::new(level, kind, message);
        match level {
            AuditLevel::Debug => debug!(kind = %kind, "{}", event.message),
            AuditLevel::Info => info!(kind = %kind, "{}", event.message),
            AuditLevel::Warning => warn!(kind = %kind, "{}", event.message),
            AuditLevel::Error => error!(kind = %kind, "{}", event.message),
        }
        for sink in self.sinks.iter() {
            sink.record(&event);
        }
    }

    pub fn debug(&self, kind: AuditKind, message: impl Into<String>) {
        self.record(AuditLevel::Debug, kind, message);
    }

    pub fn info(&self, kind: AuditKind, message: impl Into<String>) {
        self.record(AuditLevel::Info, kind, message);
    }

    pub fn warning(&self, kind: AuditKind, message: impl Into<String>) {
        self.record(AuditLevel::Warning, kind, message);
    }

    pub fn error(&self, kind: AuditKind, message: impl Into<String>) {
        self.record(AuditLevel::Error, kind, message);
    }
}

/// Discards everything.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Bounded in-memory ring buffer of the most recent events.
pub struct MemoryAuditSink {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl MemoryAuditSink {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// The last `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let all = self.snapshot();
        let skip = all.len().saturating_sub(n);
        all.into_iter().skip(skip).collect()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.snapshot().iter().filter(|e| e.kind == kind).count()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Forwards events to an async consumer (e.g. a log-shipping task).
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: &AuditEvent) {
        // Receiver gone: nobody is shipping logs any more.
        let _ = self.tx.send(event.clone());
    }
}
