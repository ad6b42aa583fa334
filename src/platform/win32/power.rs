use windows::Win32::System::Power::{
    ES_CONTINUOUS, ES_DISPLAY_REQUIRED, ES_SYSTEM_REQUIRED, EXECUTION_STATE,
    SetThreadExecutionState,
};
use windows::Win32::System::Registry::HKEY_CURRENT_USER;

use super::registry;
use crate::platform::settings::{self, SettingStore};
use crate::platform::{PlatformError, PlatformResult, PowerControl, ScreenSaverSnapshot};

const DESKTOP_KEY: &str = r"Control Panel\Desktop";
const TIMEOUT_VALUE: &str = "ScreenSaveTimeOut";
const ACTIVE_VALUE: &str = "ScreenSaveActive";

/// String values under `HKCU\Control Panel\Desktop`.
struct DesktopKey;

impl SettingStore for DesktopKey {
    fn get(&self, name: &str) -> PlatformResult<Option<String>> {
        registry::get_string(HKEY_CURRENT_USER, DESKTOP_KEY, name)
    }

    fn set(&self, name: &str, value: &str) -> PlatformResult<()> {
        registry::set_string(HKEY_CURRENT_USER, DESKTOP_KEY, name, value)
    }

    fn delete(&self, name: &str) -> PlatformResult<()> {
        registry::delete_value(HKEY_CURRENT_USER, DESKTOP_KEY, name)
    }
}

fn set_state(flags: EXECUTION_STATE) -> PlatformResult<()> {
    // SAFETY: no preconditions; zero means the call failed.
    let previous = unsafe { SetThreadExecutionState(flags) };
    if previous.0 == 0 {
        return Err(PlatformError::os(
            "SetThreadExecutionState",
            format!("flags {:#x} rejected", flags.0),
        ));
    }
    Ok(())
}

/// Idle timers via `SetThreadExecutionState`; screen saver via the registry.
///
/// The keep-awake loop runs on pool threads, so each tick resets the idle
/// timers once instead of holding a continuous per-thread request.
pub struct ExecutionState;

impl PowerControl for ExecutionState {
    fn signal_awake(&self) -> PlatformResult<()> {
        set_state(ES_DISPLAY_REQUIRED | ES_SYSTEM_REQUIRED)
    }

    fn release(&self) -> PlatformResult<()> {
        set_state(ES_CONTINUOUS)
    }

    fn disable_screen_saver(&self) -> PlatformResult<ScreenSaverSnapshot> {
        let mut saved =
            settings::override_all(&DesktopKey, &[(TIMEOUT_VALUE, "0"), (ACTIVE_VALUE, "0")])?
                .into_iter()
                .map(|(_, value)| value);
        Ok(ScreenSaverSnapshot {
            timeout: saved.next().flatten(),
            active: saved.next().flatten(),
        })
    }

    fn restore_screen_saver(&self, previous: &ScreenSaverSnapshot) -> PlatformResult<()> {
        settings::restore_all(
            &DesktopKey,
            &[
                (TIMEOUT_VALUE.to_string(), previous.timeout.clone()),
                (ACTIVE_VALUE.to_string(), previous.active.clone()),
            ],
        )
    }
}
