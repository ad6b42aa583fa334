//! In-memory platform used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    DisplayProbe, HookDecision, InputHooks, KeyEvent, KeyboardHandler, MouseButton, MouseHandler,
    Platform, PlatformError, PlatformResult, PowerControl, ProcessInfo, ProcessTable,
    ScreenSaverSnapshot, SystemProbe, TouchpadControl, TouchpadSnapshot, WindowControl,
    WindowHandle,
};

#[derive(Default)]
struct ProcessState {
    running: BTreeMap<u32, ProcessInfo>,
    next_pid: u32,
    deny: HashSet<String>,
    attempts: Vec<(u32, String)>,
    snapshot_error: bool,
}

/// First simulated PID; above Linux `pid_max` so it never collides with the test process.
const FIRST_PID: u32 = 10_000_001;

/// Simulated process table. Entries without a path are system processes.
#[derive(Default)]
pub struct FakeProcesses {
    state: Mutex<ProcessState>,
}

impl FakeProcesses {
    pub fn spawn(&self, name: &str) -> u32 {
        self.spawn_at(name, Some(PathBuf::from(format!("C:\\Apps\\{}", name))))
    }

    pub fn spawn_at(&self, name: &str, path: Option<PathBuf>) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_pid = state.next_pid.max(FIRST_PID - 1) + 1;
        let pid = state.next_pid;
        state.running.insert(
            pid,
            ProcessInfo {
                pid,
                name: name.to_string(),
                path,
            },
        );
        pid
    }

    pub fn spawn_system(&self, name: &str) -> u32 {
        self.spawn_at(name, None)
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.state.lock().unwrap().running.contains_key(&pid)
    }

    pub fn running_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.running.values().map(|p| p.name.clone()).collect()
    }

    /// Every terminate call, in order, as `(pid, name)`.
    pub fn attempts(&self) -> Vec<(u32, String)> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn attempts_for(&self, pid: u32) -> usize {
        let state = self.state.lock().unwrap();
        state.attempts.iter().filter(|(p, _)| *p == pid).count()
    }

    /// Terminating processes with this file name fails with access denied.
    pub fn deny_termination(&self, name: &str) {
        self.state.lock().unwrap().deny.insert(name.to_string());
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.state.lock().unwrap().snapshot_error = fail;
    }
}

impl ProcessTable for FakeProcesses {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>> {
        let state = self.state.lock().unwrap();
        if state.snapshot_error {
            return Err(PlatformError::AccessDenied("snapshot denied".into()));
        }
        Ok(state.running.values().cloned().collect())
    }

    fn terminate(&self, pid: u32) -> PlatformResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(info) = state.running.get(&pid).cloned() else {
            state.attempts.push((pid, String::new()));
            return Err(PlatformError::ProcessNotFound { pid });
        };
        state.attempts.push((pid, info.name.clone()));
        if state.deny.contains(&info.name) {
            return Err(PlatformError::AccessDenied(format!("cannot open {}", pid)));
        }
        state.running.remove(&pid);
        Ok(())
    }

    fn is_system_process(&self, process: &ProcessInfo) -> bool {
        process.path.is_none()
    }
}

/// Simulated hardware identity.
pub struct FakeProbe {
    pub identity: Mutex<Option<(String, String)>>,
    pub disk: Mutex<Option<String>>,
    pub macs: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    /// Thread of the most recent identity query.
    pub queried_on: Mutex<Option<std::thread::ThreadId>>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            identity: Mutex::new(Some(("Dell Inc.".into(), "Latitude 7420".into()))),
            disk: Mutex::new(Some("SCSI\\Disk&Ven_NVMe&Prod_Samsung_SSD_980".into())),
            macs: Mutex::new(vec!["3C-52-82-11-22-33".into()]),
            fail: AtomicBool::new(false),
            panic: AtomicBool::new(false),
            queried_on: Mutex::new(None),
        }
    }
}

impl FakeProbe {
    fn check(&self) -> PlatformResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(PlatformError::AccessDenied("probe denied".into()))
        } else {
            Ok(())
        }
    }
}

impl SystemProbe for FakeProbe {
    fn system_identity(&self) -> PlatformResult<(String, String)> {
        *self.queried_on.lock().unwrap() = Some(std::thread::current().id());
        if self.panic.load(Ordering::SeqCst) {
            panic!("firmware table unreadable");
        }
        self.check()?;
        self.identity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PlatformError::os("Win32_ComputerSystem", "no instance"))
    }

    fn disk_signature(&self) -> PlatformResult<Option<String>> {
        self.check()?;
        Ok(self.disk.lock().unwrap().clone())
    }

    fn mac_addresses(&self) -> PlatformResult<Vec<String>> {
        self.check()?;
        Ok(self.macs.lock().unwrap().clone())
    }
}

pub struct FakeDisplays {
    pub count: AtomicUsize,
}

impl Default for FakeDisplays {
    fn default() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }
}

impl DisplayProbe for FakeDisplays {
    fn display_count(&self) -> PlatformResult<usize> {
        Ok(self.count.load(Ordering::SeqCst))
    }
}

/// Simulated hooks. Tests dispatch synthetic events through the installed handlers.
#[derive(Default)]
pub struct FakeHooks {
    keyboard: Mutex<Option<KeyboardHandler>>,
    mouse: Mutex<Option<MouseHandler>>,
    pub keyboard_installs: AtomicUsize,
    pub keyboard_uninstalls: AtomicUsize,
    pub mouse_installs: AtomicUsize,
    pub mouse_uninstalls: AtomicUsize,
    pub fail_keyboard: AtomicBool,
    pub fail_keyboard_uninstall: AtomicBool,
}

impl FakeHooks {
    pub fn keyboard_installed(&self) -> bool {
        self.keyboard.lock().unwrap().is_some()
    }

    pub fn mouse_installed(&self) -> bool {
        self.mouse.lock().unwrap().is_some()
    }

    /// Deliver a key-down. `None` means no hook saw it (it reaches applications).
    pub fn press(&self, event: KeyEvent) -> Option<HookDecision> {
        let handler = self.keyboard.lock().unwrap().clone();
        handler.map(|h| h(event))
    }

    pub fn click(&self, button: MouseButton) -> Option<HookDecision> {
        let handler = self.mouse.lock().unwrap().clone();
        handler.map(|h| h(button))
    }
}

impl InputHooks for FakeHooks {
    fn install_keyboard(&self, handler: KeyboardHandler) -> PlatformResult<()> {
        if self.fail_keyboard.load(Ordering::SeqCst) {
            return Err(PlatformError::os("SetWindowsHookExW", "hook install denied"));
        }
        self.keyboard_installs.fetch_add(1, Ordering::SeqCst);
        *self.keyboard.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn uninstall_keyboard(&self) -> PlatformResult<()> {
        self.keyboard_uninstalls.fetch_add(1, Ordering::SeqCst);
        if self.fail_keyboard_uninstall.load(Ordering::SeqCst) {
            return Err(PlatformError::os("UnhookWindowsHookEx", "invalid hook handle"));
        }
        *self.keyboard.lock().unwrap() = None;
        Ok(())
    }

    fn install_mouse(&self, handler: MouseHandler) -> PlatformResult<()> {
        self.mouse_installs.fetch_add(1, Ordering::SeqCst);
        *self.mouse.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn uninstall_mouse(&self) -> PlatformResult<()> {
        self.mouse_uninstalls.fetch_add(1, Ordering::SeqCst);
        *self.mouse.lock().unwrap() = None;
        Ok(())
    }
}

pub struct FakeTouchpad {
    pub settings: Mutex<HashMap<String, u32>>,
    pub fail_disable: AtomicBool,
}

impl Default for FakeTouchpad {
    fn default() -> Self {
        let settings = ["ThreeFingerSlideEnabled", "EdgeSwipe"]
            .into_iter()
            .map(|k| (k.to_string(), 1))
            .collect();
        Self {
            settings: Mutex::new(settings),
            fail_disable: AtomicBool::new(false),
        }
    }
}

impl FakeTouchpad {
    pub fn gestures_enabled(&self) -> bool {
        self.settings.lock().unwrap().values().all(|v| *v != 0)
    }
}

impl TouchpadControl for FakeTouchpad {
    fn disable_gestures(&self) -> PlatformResult<TouchpadSnapshot> {
        if self.fail_disable.load(Ordering::SeqCst) {
            return Err(PlatformError::AccessDenied("HKCU write denied".into()));
        }
        let mut settings = self.settings.lock().unwrap();
        let previous = settings.iter().map(|(k, v)| (k.clone(), Some(*v))).collect();
        for value in settings.values_mut() {
            *value = 0;
        }
        Ok(previous)
    }

    fn restore_gestures(&self, previous: &TouchpadSnapshot) -> PlatformResult<()> {
        let mut settings = self.settings.lock().unwrap();
        for (name, value) in previous {
            settings.insert(name.clone(), value.unwrap_or(1));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWindows {
    topmost: Mutex<HashSet<WindowHandle>>,
    foreground: Mutex<Option<WindowHandle>>,
    pub activations: AtomicUsize,
    pub fail_topmost: AtomicBool,
    callers: Mutex<HashSet<Option<String>>>,
}

impl FakeWindows {
    pub fn is_topmost(&self, window: WindowHandle) -> bool {
        self.topmost.lock().unwrap().contains(&window)
    }

    /// Another application takes the foreground.
    pub fn steal_focus(&self, thief: WindowHandle) {
        *self.foreground.lock().unwrap() = Some(thief);
    }

    pub fn foreground(&self) -> Option<WindowHandle> {
        *self.foreground.lock().unwrap()
    }

    /// Names of the threads that made window calls.
    pub fn calling_threads(&self) -> Vec<Option<String>> {
        self.callers.lock().unwrap().iter().cloned().collect()
    }

    fn record_caller(&self) {
        let name = std::thread::current().name().map(str::to_string);
        self.callers.lock().unwrap().insert(name);
    }
}

impl WindowControl for FakeWindows {
    fn set_topmost(&self, window: WindowHandle, topmost: bool) -> PlatformResult<()> {
        self.record_caller();
        if self.fail_topmost.load(Ordering::SeqCst) {
            return Err(PlatformError::os("SetWindowPos", "invalid window handle"));
        }
        let mut set = self.topmost.lock().unwrap();
        if topmost {
            set.insert(window);
        } else {
            set.remove(&window);
        }
        Ok(())
    }

    fn is_foreground(&self, window: WindowHandle) -> PlatformResult<bool> {
        self.record_caller();
        Ok(*self.foreground.lock().unwrap() == Some(window))
    }

    fn bring_to_foreground(&self, window: WindowHandle) -> PlatformResult<()> {
        self.record_caller();
        self.activations.fetch_add(1, Ordering::SeqCst);
        *self.foreground.lock().unwrap() = Some(window);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePower {
    pub awake_signals: AtomicUsize,
    pub releases: AtomicUsize,
    pub screen_saver_disabled: AtomicBool,
    pub fail_signal: AtomicBool,
}

impl PowerControl for FakePower {
    fn signal_awake(&self) -> PlatformResult<()> {
        if self.fail_signal.load(Ordering::SeqCst) {
            return Err(PlatformError::os("SetThreadExecutionState", "returned NULL"));
        }
        self.awake_signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> PlatformResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable_screen_saver(&self) -> PlatformResult<ScreenSaverSnapshot> {
        self.screen_saver_disabled.store(true, Ordering::SeqCst);
        Ok(ScreenSaverSnapshot {
            timeout: Some("600".into()),
            active: Some("1".into()),
        })
    }

    fn restore_screen_saver(&self, _previous: &ScreenSaverSnapshot) -> PlatformResult<()> {
        self.screen_saver_disabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// All fakes together, each still reachable for assertions.
#[derive(Default, Clone)]
pub struct FakePlatform {
    pub processes: Arc<FakeProcesses>,
    pub probe: Arc<FakeProbe>,
    pub displays: Arc<FakeDisplays>,
    pub hooks: Arc<FakeHooks>,
    pub touchpad: Arc<FakeTouchpad>,
    pub windows: Arc<FakeWindows>,
    pub power: Arc<FakePower>,
}

impl FakePlatform {
    pub fn platform(&self) -> Platform {
        Platform {
            processes: self.processes.clone(),
            probe: self.probe.clone(),
            displays: self.displays.clone(),
            hooks: self.hooks.clone(),
            touchpad: self.touchpad.clone(),
            windows: self.windows.clone(),
            power: self.power.clone(),
        }
    }
}
