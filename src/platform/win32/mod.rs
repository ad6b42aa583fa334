//! Windows backend built on the `windows` crate.

mod hooks;
mod power;
mod probe;
mod process;
mod registry;
mod touchpad;
mod window;

use std::sync::Arc;

use super::Platform;

pub fn platform() -> Platform {
    let probe = Arc::new(probe::Win32Probe);
    Platform {
        processes: Arc::new(process::Toolhelp),
        probe: probe.clone(),
        displays: probe,
        hooks: Arc::new(hooks::LowLevelHooks::default()),
        touchpad: Arc::new(touchpad::PrecisionTouchpad),
        windows: Arc::new(window::Win32Windows),
        power: Arc::new(power::ExecutionState),
    }
}

pub(super) use process::ancestor_pids;

pub(super) fn to_wide(s: &str) -> Vec<u16> {
    let mut wide: Vec<u16> = s.encode_utf16().collect();
    wide.push(0);
    wide
}
