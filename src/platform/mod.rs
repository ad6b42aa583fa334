//! OS boundary for the lockdown engine.
//!
//! Everything the engine does to the workstation goes through one of the traits
//! below. The engine itself never calls an OS API directly, which keeps the
//! enforcement logic platform-neutral and lets tests substitute an in-memory
//! platform.
//!
//! Backends:
//! - Windows: Toolhelp / Win32 hooks / registry / power APIs via the `windows` crate
//! - Unix: `/proc` process table and sysfs probes; input, window and power control
//!   are reported as unsupported
//! - Anything else: every operation is unsupported

use std::path::PathBuf;
use std::sync::Arc;

use crate::policy::KeyCombo;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(any(windows, test))]
mod settings;
#[cfg(not(windows))]
mod unsupported;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win32;

/// Errors reported by platform backends.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("process {pid} no longer exists")]
    ProcessNotFound { pid: u32 },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("{call} failed: {message}")]
    Os { call: &'static str, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    pub(crate) fn os(call: &'static str, message: impl Into<String>) -> Self {
        Self::Os {
            call,
            message: message.into(),
        }
    }

    /// The target already went away; callers treat this as a completed termination.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ProcessNotFound { .. })
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// One entry of a process-table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable file name as reported by the OS (e.g. `taskmgr.exe`).
    pub name: String,
    /// Full image path, when the process could be opened for query.
    pub path: Option<PathBuf>,
}

/// Running processes and their termination.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>>;

    fn terminate(&self, pid: u32) -> PlatformResult<()>;

    /// Whether the OS considers this process part of the system (never terminated).
    fn is_system_process(&self, process: &ProcessInfo) -> bool;
}

/// Read-only hardware and firmware facts used for virtualization fingerprinting.
pub trait SystemProbe: Send + Sync {
    /// System manufacturer and model strings.
    fn system_identity(&self) -> PlatformResult<(String, String)>;

    /// Disk enumeration descriptor (Windows `Services\Disk\Enum` value, sysfs model on Linux).
    fn disk_signature(&self) -> PlatformResult<Option<String>>;

    /// MAC addresses of the network adapters, in any textual form.
    fn mac_addresses(&self) -> PlatformResult<Vec<String>>;
}

/// Number of active displays.
pub trait DisplayProbe: Send + Sync {
    fn display_count(&self) -> PlatformResult<usize>;
}

/// What a hook callback tells the OS to do with an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Forward,
    Suppress,
}

/// A key-down observed by the keyboard hook, with the modifiers held at that moment.
pub type KeyEvent = KeyCombo;

/// Mouse buttons the mouse hook reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    /// XButton1, browser "back".
    Back,
    /// XButton2, browser "forward".
    Forward,
}

pub type KeyboardHandler = Arc<dyn Fn(KeyEvent) -> HookDecision + Send + Sync>;
pub type MouseHandler = Arc<dyn Fn(MouseButton) -> HookDecision + Send + Sync>;

/// Process-global low-level input hooks.
///
/// Handlers run synchronously on the hook's dispatch thread and must return
/// without blocking.
pub trait InputHooks: Send + Sync {
    fn install_keyboard(&self, handler: KeyboardHandler) -> PlatformResult<()>;
    fn uninstall_keyboard(&self) -> PlatformResult<()>;
    fn install_mouse(&self, handler: MouseHandler) -> PlatformResult<()>;
    fn uninstall_mouse(&self) -> PlatformResult<()>;
}

/// Previous per-setting values captured when gestures are disabled.
pub type TouchpadSnapshot = Vec<(String, Option<u32>)>;

/// OS-level precision-touchpad gesture recognition.
pub trait TouchpadControl: Send + Sync {
    /// Turn gestures off, returning what each setting was before.
    fn disable_gestures(&self) -> PlatformResult<TouchpadSnapshot>;

    /// Restore settings captured by `disable_gestures`.
    fn restore_gestures(&self, previous: &TouchpadSnapshot) -> PlatformResult<()>;
}

/// Opaque native window handle (an `HWND` value on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

pub trait WindowControl: Send + Sync {
    fn set_topmost(&self, window: WindowHandle, topmost: bool) -> PlatformResult<()>;
    fn is_foreground(&self, window: WindowHandle) -> PlatformResult<bool>;
    fn bring_to_foreground(&self, window: WindowHandle) -> PlatformResult<()>;
}

/// Screen-saver values captured before they were overridden.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenSaverSnapshot {
    pub timeout: Option<String>,
    pub active: Option<String>,
}

pub trait PowerControl: Send + Sync {
    /// Reset the display/system idle timers once.
    fn signal_awake(&self) -> PlatformResult<()>;

    /// Drop any outstanding keep-awake request.
    fn release(&self) -> PlatformResult<()>;

    fn disable_screen_saver(&self) -> PlatformResult<ScreenSaverSnapshot>;
    fn restore_screen_saver(&self, previous: &ScreenSaverSnapshot) -> PlatformResult<()>;
}

/// PIDs of the processes this engine was launched from, nearest first.
pub fn ancestor_pids() -> Vec<u32> {
    #[cfg(windows)]
    {
        win32::ancestor_pids()
    }

    #[cfg(unix)]
    {
        unix::ancestor_pids()
    }

    #[cfg(not(any(windows, unix)))]
    {
        Vec::new()
    }
}

/// Follow `parent_of` upward from `start` until the root, a repeat, or a missing entry.
pub(crate) fn ancestor_chain(start: u32, parent_of: impl Fn(u32) -> Option<u32>) -> Vec<u32> {
    let mut chain = Vec::new();
    let mut pid = start;
    while pid != 0 && !chain.contains(&pid) {
        chain.push(pid);
        match parent_of(pid) {
            Some(parent) => pid = parent,
            None => break,
        }
    }
    chain
}

/// Bundle of platform services handed to the engine's components.
#[derive(Clone)]
pub struct Platform {
    pub processes: Arc<dyn ProcessTable>,
    pub probe: Arc<dyn SystemProbe>,
    pub displays: Arc<dyn DisplayProbe>,
    pub hooks: Arc<dyn InputHooks>,
    pub touchpad: Arc<dyn TouchpadControl>,
    pub windows: Arc<dyn WindowControl>,
    pub power: Arc<dyn PowerControl>,
}

impl Platform {
    /// Services backed by the running operating system.
    pub fn native() -> Self {
        #[cfg(windows)]
        {
            win32::platform()
        }

        #[cfg(unix)]
        {
            unix::platform()
        }

        #[cfg(not(any(windows, unix)))]
        {
            unsupported::platform()
        }
    }

    /// Human-readable name of the compiled-in backend.
    pub fn backend_name() -> &'static str {
        if cfg!(windows) {
            "windows"
        } else if cfg!(unix) {
            "unix"
        } else {
            "unsupported"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn ancestor_chain_stops_at_root_and_cycles() {
        let parents: HashMap<u32, u32> = [(40, 30), (30, 1), (1, 0)].into();
        assert_eq!(ancestor_chain(40, |p| parents.get(&p).copied()), vec![40, 30, 1]);

        let looped: HashMap<u32, u32> = [(7, 8), (8, 7)].into();
        assert_eq!(ancestor_chain(7, |p| looped.get(&p).copied()), vec![7, 8]);

        assert_eq!(ancestor_chain(12, |_| None), vec![12]);
    }
}
