use std::ffi::c_void;

use windows::Win32::Foundation::HWND;
use windows::Win32::UI::WindowsAndMessaging::{
    GetForegroundWindow, HWND_NOTOPMOST, HWND_TOPMOST, SWP_NOMOVE, SWP_NOSIZE, SWP_SHOWWINDOW,
    SetForegroundWindow, SetWindowPos,
};

use crate::platform::{PlatformError, PlatformResult, WindowControl, WindowHandle};

fn hwnd(window: WindowHandle) -> HWND {
    HWND(window.0 as *mut c_void)
}

pub struct Win32Windows;

impl WindowControl for Win32Windows {
    fn set_topmost(&self, window: WindowHandle, topmost: bool) -> PlatformResult<()> {
        let after = if topmost { HWND_TOPMOST } else { HWND_NOTOPMOST };
        // SAFETY: an invalid handle is reported as an error.
        unsafe {
            SetWindowPos(
                hwnd(window),
                Some(after),
                0,
                0,
                0,
                0,
                SWP_NOMOVE | SWP_NOSIZE | SWP_SHOWWINDOW,
            )
        }
        .map_err(|e| PlatformError::os("SetWindowPos", e.message()))
    }

    fn is_foreground(&self, window: WindowHandle) -> PlatformResult<bool> {
        // SAFETY: no preconditions.
        let foreground = unsafe { GetForegroundWindow() };
        Ok(foreground == hwnd(window))
    }

    fn bring_to_foreground(&self, window: WindowHandle) -> PlatformResult<()> {
        // SAFETY: an invalid handle makes the call return false.
        if unsafe { SetForegroundWindow(hwnd(window)) }.as_bool() {
            Ok(())
        } else {
            Err(PlatformError::os(
                "SetForegroundWindow",
                format!("window {:#x} was not activated", window.0),
            ))
        }
    }
}
