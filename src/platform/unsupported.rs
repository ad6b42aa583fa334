//! Services that have no implementation on the current target.

use std::sync::Arc;

#[cfg(not(unix))]
use super::{Platform, ProcessInfo, ProcessTable, SystemProbe};
use super::{
    DisplayProbe, InputHooks, KeyboardHandler, MouseHandler, PlatformError, PlatformResult,
    PowerControl, ScreenSaverSnapshot, TouchpadControl, TouchpadSnapshot, WindowControl,
    WindowHandle,
};

/// Reports every operation as unsupported.
pub struct Unsupported;

impl DisplayProbe for Unsupported {
    fn display_count(&self) -> PlatformResult<usize> {
        Err(PlatformError::Unsupported("display enumeration"))
    }
}

impl InputHooks for Unsupported {
    fn install_keyboard(&self, _handler: KeyboardHandler) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("low-level keyboard hook"))
    }

    fn uninstall_keyboard(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn install_mouse(&self, _handler: MouseHandler) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("low-level mouse hook"))
    }

    fn uninstall_mouse(&self) -> PlatformResult<()> {
        Ok(())
    }
}

impl TouchpadControl for Unsupported {
    fn disable_gestures(&self) -> PlatformResult<TouchpadSnapshot> {
        Err(PlatformError::Unsupported("precision touchpad settings"))
    }

    fn restore_gestures(&self, _previous: &TouchpadSnapshot) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("precision touchpad settings"))
    }
}

impl WindowControl for Unsupported {
    fn set_topmost(&self, _window: WindowHandle, _topmost: bool) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("topmost windows"))
    }

    fn is_foreground(&self, _window: WindowHandle) -> PlatformResult<bool> {
        Err(PlatformError::Unsupported("foreground window query"))
    }

    fn bring_to_foreground(&self, _window: WindowHandle) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("foreground activation"))
    }
}

impl PowerControl for Unsupported {
    fn signal_awake(&self) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("idle timer reset"))
    }

    fn release(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn disable_screen_saver(&self) -> PlatformResult<ScreenSaverSnapshot> {
        Err(PlatformError::Unsupported("screen saver settings"))
    }

    fn restore_screen_saver(&self, _previous: &ScreenSaverSnapshot) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("screen saver settings"))
    }
}

#[cfg(not(unix))]
impl ProcessTable for Unsupported {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>> {
        Err(PlatformError::Unsupported("process enumeration"))
    }

    fn terminate(&self, _pid: u32) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("process termination"))
    }

    fn is_system_process(&self, _process: &ProcessInfo) -> bool {
        true
    }
}

#[cfg(not(unix))]
impl SystemProbe for Unsupported {
    fn system_identity(&self) -> PlatformResult<(String, String)> {
        Err(PlatformError::Unsupported("system identity"))
    }

    fn disk_signature(&self) -> PlatformResult<Option<String>> {
        Err(PlatformError::Unsupported("disk enumeration"))
    }

    fn mac_addresses(&self) -> PlatformResult<Vec<String>> {
        Err(PlatformError::Unsupported("network adapters"))
    }
}

#[cfg(not(unix))]
pub fn platform() -> Platform {
    let unsupported = Arc::new(Unsupported);
    Platform {
        processes: unsupported.clone(),
        probe: unsupported.clone(),
        displays: unsupported.clone(),
        hooks: unsupported.clone(),
        touchpad: unsupported.clone(),
        windows: unsupported.clone(),
        power: unsupported,
    }
}

/// Shared handle used by backends that only cover part of the surface.
#[cfg(unix)]
pub fn shared() -> Arc<Unsupported> {
    Arc::new(Unsupported)
}
