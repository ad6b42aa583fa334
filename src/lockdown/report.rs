//! Session state and the per-step reports produced by apply and reset.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::environment::EnvironmentVerdict;

/// Lifecycle of one lockdown session.
///
/// `Idle → Validating → Applying → Active → Resetting → Idle`; `Faulted` is
/// reachable from any non-idle state and leaves only through a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Validating,
    Applying,
    Active,
    Resetting,
    Faulted,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Applying => "applying",
            Self::Active => "active",
            Self::Resetting => "resetting",
            Self::Faulted => "faulted",
        }
    }

    /// States in which mitigations may be installed and must later be torn down.
    pub fn holds_mitigations(self) -> bool {
        matches!(self, Self::Applying | Self::Active | Self::Faulted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mitigation, in the order it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockdownStep {
    KillBlocked,
    MonitorRespawns,
    WhitelistSweep,
    MonitorNewProcesses,
    KeyboardHook,
    MouseHook,
    TouchpadGestures,
    ScreenLock,
    WindowPin,
    DisplayWatch,
}

impl LockdownStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KillBlocked => "kill_blocked",
            Self::MonitorRespawns => "monitor_respawns",
            Self::WhitelistSweep => "whitelist_sweep",
            Self::MonitorNewProcesses => "monitor_new_processes",
            Self::KeyboardHook => "keyboard_hook",
            Self::MouseHook => "mouse_hook",
            Self::TouchpadGestures => "touchpad_gestures",
            Self::ScreenLock => "screen_lock",
            Self::WindowPin => "window_pin",
            Self::DisplayWatch => "display_watch",
        }
    }
}

impl fmt::Display for LockdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Skipped(String),
    Failed(String),
    Panicked(String),
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Skipped(reason) => write!(f, "skipped ({})", reason),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::Panicked(reason) => write!(f, "panicked: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: LockdownStep,
    pub outcome: StepOutcome,
}

impl StepReport {
    pub fn new(step: LockdownStep, outcome: StepOutcome) -> Self {
        Self { step, outcome }
    }
}

fn find(steps: &[StepReport], step: LockdownStep) -> Option<&StepOutcome> {
    steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
}

/// What `initialize` did, step by step.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub session_id: Uuid,
    pub verdict: EnvironmentVerdict,
    pub steps: Vec<StepReport>,
    /// Final state: `Active`, or `Faulted` when a step panicked.
    pub state: SessionState,
}

impl ApplyReport {
    pub fn outcome(&self, step: LockdownStep) -> Option<&StepOutcome> {
        find(&self.steps, step)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// What `reset` tore down. Empty when the session was already idle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    pub session_id: Option<Uuid>,
    pub steps: Vec<StepReport>,
}

impl ResetReport {
    /// Whether a teardown ran at all.
    pub fn performed(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn outcome(&self, step: LockdownStep) -> Option<&StepOutcome> {
        find(&self.steps, step)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|r| r.outcome.is_failure())
    }
}
