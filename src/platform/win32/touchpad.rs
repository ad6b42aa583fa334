use windows::Win32::Foundation::{LPARAM, WPARAM};
use windows::Win32::System::Registry::HKEY_CURRENT_USER;
use windows::Win32::UI::WindowsAndMessaging::{
    HWND_BROADCAST, SMTO_ABORTIFHUNG, SendMessageTimeoutW, WM_SETTINGCHANGE,
};

use super::{registry, to_wide};
use crate::platform::{PlatformResult, TouchpadControl, TouchpadSnapshot};

const PRECISION_TOUCHPAD_KEY: &str =
    r"Software\Microsoft\Windows\CurrentVersion\PrecisionTouchPad";

const GESTURE_VALUES: [&str; 5] = [
    "ThreeFingerSlideEnabled",
    "ThreeFingerTapEnabled",
    "FourFingerSlideEnabled",
    "FourFingerTapEnabled",
    "EdgeSwipe",
];

/// Tell Explorer the touchpad settings changed.
fn broadcast_change() {
    let area = to_wide(PRECISION_TOUCHPAD_KEY);
    // SAFETY: `area` outlives the call; the timeout bounds hung windows.
    unsafe {
        SendMessageTimeoutW(
            HWND_BROADCAST,
            WM_SETTINGCHANGE,
            WPARAM(0),
            LPARAM(area.as_ptr() as isize),
            SMTO_ABORTIFHUNG,
            100,
            None,
        );
    }
}

/// Gesture switches under the current user's PrecisionTouchPad key.
pub struct PrecisionTouchpad;

impl TouchpadControl for PrecisionTouchpad {
    fn disable_gestures(&self) -> PlatformResult<TouchpadSnapshot> {
        let mut previous = Vec::with_capacity(GESTURE_VALUES.len());
        for name in GESTURE_VALUES {
            previous.push((
                name.to_string(),
                registry::get_dword(HKEY_CURRENT_USER, PRECISION_TOUCHPAD_KEY, name)?,
            ));
        }
        for name in GESTURE_VALUES {
            if let Err(e) = registry::set_dword(HKEY_CURRENT_USER, PRECISION_TOUCHPAD_KEY, name, 0) {
                let _ = self.restore_gestures(&previous);
                return Err(e);
            }
        }
        broadcast_change();
        Ok(previous)
    }

    fn restore_gestures(&self, previous: &TouchpadSnapshot) -> PlatformResult<()> {
        let mut first_error = None;
        for (name, value) in previous {
            let result = match value {
                Some(value) => {
                    registry::set_dword(HKEY_CURRENT_USER, PRECISION_TOUCHPAD_KEY, name, *value)
                }
                None => registry::delete_value(HKEY_CURRENT_USER, PRECISION_TOUCHPAD_KEY, name),
            };
            if let Err(e) = result
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        broadcast_change();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
