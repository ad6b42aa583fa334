//! Error types surfaced by the lockdown engine.

use crate::environment::EnvironmentVerdict;
use crate::lockdown::SessionState;
use crate::platform::PlatformError;

#[derive(Debug, thiserror::Error)]
pub enum LockdownError {
    /// Pre-flight checks found an environment the policy forbids. Nothing was installed.
    #[error("exam environment rejected: {reason}")]
    EnvironmentRejected {
        reason: String,
        verdict: EnvironmentVerdict,
    },

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// A step panicked or the session was faulted from outside; a reset is required.
    #[error("lockdown faulted: {0}")]
    Faulted(String),

    #[error("invalid key combination '{input}': {reason}")]
    InvalidKeyCombo { input: String, reason: String },

    #[error("invalid policy: {0}")]
    Policy(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

pub type Result<T> = std::result::Result<T, LockdownError>;
