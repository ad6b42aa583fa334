//! Keyboard, mouse and touchpad restrictions.
//!
//! The hooks are process-global OS resources. This type owns them: each is
//! installed at most once and uninstalled at most once per install, so a reset
//! after a partial apply is always safe.
//!
//! Hook callbacks only look up the block set and queue what they suppressed;
//! auditing happens on a reporter thread so a slow sink never delays the hook.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::audit::{AuditKind, Auditor};
use crate::platform::{
    HookDecision, InputHooks, KeyEvent, MouseButton, PlatformResult, TouchpadControl,
    TouchpadSnapshot,
};
use crate::policy::BlockedCombinations;

/// Queued reports beyond this are dropped rather than waited for.
const REPORT_QUEUE: usize = 256;

enum BlockedInput {
    Combo(KeyEvent),
    Mouse(MouseButton),
}

fn spawn_reporter(auditor: Auditor) -> PlatformResult<mpsc::Sender<BlockedInput>> {
    let (tx, mut rx) = mpsc::channel(REPORT_QUEUE);
    std::thread::Builder::new()
        .name("examguard-input-audit".into())
        .spawn(move || {
            while let Some(blocked) = rx.blocking_recv() {
                match blocked {
                    BlockedInput::Combo(combo) => auditor.info(
                        AuditKind::ComboBlocked,
                        format!("Blocked key combination {}", combo),
                    ),
                    BlockedInput::Mouse(button) => auditor.debug(
                        AuditKind::MouseButtonBlocked,
                        format!("Blocked mouse {:?} button", button),
                    ),
                }
            }
        })?;
    Ok(tx)
}

#[derive(Default)]
struct HookState {
    /// Install was attempted and no uninstall has been attempted since.
    keyboard_armed: bool,
    keyboard_installed: bool,
    mouse_armed: bool,
    mouse_installed: bool,
    touchpad: Option<TouchpadSnapshot>,
}

pub struct InputRestriction {
    hooks: Arc<dyn InputHooks>,
    touchpad: Arc<dyn TouchpadControl>,
    auditor: Auditor,
    combos: Arc<RwLock<BlockedCombinations>>,
    state: Mutex<HookState>,
    reports: Mutex<Option<mpsc::Sender<BlockedInput>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl InputRestriction {
    pub fn new(
        hooks: Arc<dyn InputHooks>,
        touchpad: Arc<dyn TouchpadControl>,
        auditor: Auditor,
    ) -> Self {
        Self {
            hooks,
            touchpad,
            auditor,
            combos: Arc::new(RwLock::new(BlockedCombinations::default())),
            state: Mutex::new(HookState::default()),
            reports: Mutex::new(None),
        }
    }

    /// Sender to the reporter thread, started on first use.
    fn reports(&self) -> PlatformResult<mpsc::Sender<BlockedInput>> {
        let mut slot = lock(&self.reports);
        if let Some(tx) = slot.as_ref() {
            return Ok(tx.clone());
        }
        let tx = spawn_reporter(self.auditor.clone())?;
        *slot = Some(tx.clone());
        Ok(tx)
    }

    /// Replace the active block set. Takes effect immediately, hook installed or not.
    pub fn set_blocked_combinations(&self, combos: BlockedCombinations) {
        debug!("Blocking {} key combinations", combos.len());
        match self.combos.write() {
            Ok(mut guard) => *guard = combos,
            Err(poisoned) => *poisoned.into_inner() = combos,
        }
    }

    pub fn blocked_combinations(&self) -> BlockedCombinations {
        match self.combos.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install the keyboard hook. A second call while installed is a no-op.
    pub fn start_keyboard(&self) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        if state.keyboard_installed {
            return Ok(());
        }
        state.keyboard_armed = true;

        let combos = self.combos.clone();
        let reports = self.reports()?;
        let handler = Arc::new(move |event: KeyEvent| {
            let blocked = match combos.read() {
                Ok(guard) => guard.matches(&event),
                Err(poisoned) => poisoned.into_inner().matches(&event),
            };
            if blocked {
                let _ = reports.try_send(BlockedInput::Combo(event));
                HookDecision::Suppress
            } else {
                HookDecision::Forward
            }
        });

        match self.hooks.install_keyboard(handler) {
            Ok(()) => {
                state.keyboard_installed = true;
                self.auditor
                    .info(AuditKind::HookInstalled, "Keyboard hook installed");
                Ok(())
            }
            Err(e) => {
                self.auditor.error(
                    AuditKind::HookInstallFailed,
                    format!("Keyboard hook install failed: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Uninstall the keyboard hook if an install was attempted. Idempotent.
    pub fn stop_keyboard(&self) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        if !state.keyboard_armed {
            return Ok(());
        }
        state.keyboard_armed = false;
        state.keyboard_installed = false;
        match self.hooks.uninstall_keyboard() {
            Ok(()) => {
                self.auditor
                    .info(AuditKind::HookUninstalled, "Keyboard hook uninstalled");
                Ok(())
            }
            Err(e) => {
                self.auditor.error(
                    AuditKind::HookUninstallFailed,
                    format!("Keyboard hook uninstall failed: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Install the mouse hook that swallows the browser back/forward buttons.
    pub fn start_mouse(&self) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        if state.mouse_installed {
            return Ok(());
        }
        state.mouse_armed = true;

        let reports = self.reports()?;
        let handler = Arc::new(move |button: MouseButton| match button {
            MouseButton::Back | MouseButton::Forward => {
                let _ = reports.try_send(BlockedInput::Mouse(button));
                HookDecision::Suppress
            }
            _ => HookDecision::Forward,
        });

        match self.hooks.install_mouse(handler) {
            Ok(()) => {
                state.mouse_installed = true;
                self.auditor.info(AuditKind::HookInstalled, "Mouse hook installed");
                Ok(())
            }
            Err(e) => {
                self.auditor.error(
                    AuditKind::HookInstallFailed,
                    format!("Mouse hook install failed: {}", e),
                );
                Err(e)
            }
        }
    }

    pub fn stop_mouse(&self) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        if !state.mouse_armed {
            return Ok(());
        }
        state.mouse_armed = false;
        state.mouse_installed = false;
        match self.hooks.uninstall_mouse() {
            Ok(()) => {
                self.auditor
                    .info(AuditKind::HookUninstalled, "Mouse hook uninstalled");
                Ok(())
            }
            Err(e) => {
                self.auditor.error(
                    AuditKind::HookUninstallFailed,
                    format!("Mouse hook uninstall failed: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Turn precision-touchpad gestures off, remembering the previous settings.
    ///
    /// Failure leaves gestures as they were; callers log it and carry on.
    pub fn disable_touchpad_gestures(&self) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        if state.touchpad.is_some() {
            return Ok(());
        }
        match self.touchpad.disable_gestures() {
            Ok(previous) => {
                self.auditor.info(
                    AuditKind::TouchpadChanged,
                    format!("Touchpad gestures disabled ({} settings)", previous.len()),
                );
                state.touchpad = Some(previous);
                Ok(())
            }
            Err(e) => {
                self.auditor.warning(
                    AuditKind::TouchpadChanged,
                    format!("Could not disable touchpad gestures: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Restore the settings captured by [`Self::disable_touchpad_gestures`].
    pub fn enable_touchpad_gestures(&self) -> PlatformResult<()> {
        let Some(previous) = lock(&self.state).touchpad.take() else {
            return Ok(());
        };
        match self.touchpad.restore_gestures(&previous) {
            Ok(()) => {
                self.auditor
                    .info(AuditKind::TouchpadChanged, "Touchpad gestures restored");
                Ok(())
            }
            Err(e) => {
                self.auditor.error(
                    AuditKind::TouchpadChanged,
                    format!("Could not restore touchpad gestures: {}", e),
                );
                Err(e)
            }
        }
    }

    pub fn is_keyboard_hooked(&self) -> bool {
        lock(&self.state).keyboard_installed
    }

    pub fn is_mouse_hooked(&self) -> bool {
        lock(&self.state).mouse_installed
    }

    pub fn are_gestures_disabled(&self) -> bool {
        lock(&self.state).touchpad.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::platform::fake::FakePlatform;
    use crate::audit::{AuditEvent, AuditSink};
    use crate::policy::KeyCombo;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn restriction(fake: &FakePlatform) -> (InputRestriction, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let input = InputRestriction::new(
            fake.hooks.clone(),
            fake.touchpad.clone(),
            Auditor::new(sink.clone()),
        );
        (input, sink)
    }

    fn combos(list: &[&str]) -> BlockedCombinations {
        BlockedCombinations::new(list.iter().map(|s| s.parse::<KeyCombo>().unwrap()))
    }

    fn key(s: &str) -> KeyEvent {
        s.parse().unwrap()
    }

    /// Reports arrive from the reporter thread; give it a moment.
    fn wait_for_count(sink: &MemoryAuditSink, kind: AuditKind, expected: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let count = sink.count(kind);
            if count >= expected || Instant::now() > deadline {
                return count;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Sink that stalls every write until released.
    struct StalledSink {
        gate: Mutex<()>,
    }

    impl AuditSink for StalledSink {
        fn record(&self, _event: &AuditEvent) {
            let _held = self.gate.lock();
        }
    }

    #[test]
    fn blocked_combo_is_suppressed_while_hooked() {
        let fake = FakePlatform::default();
        let (input, sink) = restriction(&fake);
        input.set_blocked_combinations(combos(&["Ctrl+Shift+Esc", "Alt+Tab"]));
        input.start_keyboard().unwrap();

        assert_eq!(fake.hooks.press(key("Shift+Ctrl+Escape")), Some(HookDecision::Suppress));
        assert_eq!(fake.hooks.press(key("Ctrl+Esc")), Some(HookDecision::Forward));
        assert_eq!(fake.hooks.press(key("A")), Some(HookDecision::Forward));
        assert_eq!(wait_for_count(&sink, AuditKind::ComboBlocked, 1), 1);

        input.stop_keyboard().unwrap();
        assert_eq!(fake.hooks.press(key("Ctrl+Shift+Esc")), None);
    }

    #[test]
    fn stalled_audit_sink_does_not_delay_the_hook() {
        let fake = FakePlatform::default();
        let stalled = Arc::new(StalledSink {
            gate: Mutex::new(()),
        });
        let input = InputRestriction::new(
            fake.hooks.clone(),
            fake.touchpad.clone(),
            Auditor::new(stalled.clone()),
        );
        input.set_blocked_combinations(combos(&["Alt+Tab"]));
        input.start_keyboard().unwrap();
        input.start_mouse().unwrap();

        let held = stalled.gate.lock().unwrap();
        let started = Instant::now();
        for _ in 0..(REPORT_QUEUE * 2) {
            assert_eq!(fake.hooks.press(key("Alt+Tab")), Some(HookDecision::Suppress));
        }
        assert_eq!(fake.hooks.click(MouseButton::Back), Some(HookDecision::Suppress));
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(held);
    }

    #[test]
    fn mouse_reports_reach_the_auditor() {
        let fake = FakePlatform::default();
        let (input, sink) = restriction(&fake);
        input.start_mouse().unwrap();
        fake.hooks.click(MouseButton::Forward);
        assert_eq!(wait_for_count(&sink, AuditKind::MouseButtonBlocked, 1), 1);
    }

    #[test]
    fn combos_can_change_after_start() {
        let fake = FakePlatform::default();
        let (input, _) = restriction(&fake);
        input.start_keyboard().unwrap();
        assert_eq!(fake.hooks.press(key("Alt+F4")), Some(HookDecision::Forward));

        input.set_blocked_combinations(combos(&["Alt+F4"]));
        assert_eq!(fake.hooks.press(key("Alt+F4")), Some(HookDecision::Suppress));
    }

    #[test]
    fn double_install_and_uninstall_are_noops() {
        let fake = FakePlatform::default();
        let (input, _) = restriction(&fake);
        input.start_keyboard().unwrap();
        input.start_keyboard().unwrap();
        input.stop_keyboard().unwrap();
        input.stop_keyboard().unwrap();

        assert_eq!(fake.hooks.keyboard_installs.load(Ordering::SeqCst), 1);
        assert_eq!(fake.hooks.keyboard_uninstalls.load(Ordering::SeqCst), 1);
        assert!(!input.is_keyboard_hooked());
    }

    #[test]
    fn stop_without_start_touches_nothing() {
        let fake = FakePlatform::default();
        let (input, _) = restriction(&fake);
        input.stop_keyboard().unwrap();
        input.stop_mouse().unwrap();
        input.enable_touchpad_gestures().unwrap();
        assert_eq!(fake.hooks.keyboard_uninstalls.load(Ordering::SeqCst), 0);
        assert_eq!(fake.hooks.mouse_uninstalls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_install_still_gets_one_uninstall_attempt() {
        let fake = FakePlatform::default();
        let (input, sink) = restriction(&fake);
        fake.hooks.fail_keyboard.store(true, Ordering::SeqCst);

        assert!(input.start_keyboard().is_err());
        assert!(!input.is_keyboard_hooked());
        assert_eq!(sink.count(AuditKind::HookInstallFailed), 1);

        input.stop_keyboard().unwrap();
        input.stop_keyboard().unwrap();
        assert_eq!(fake.hooks.keyboard_uninstalls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uninstall_failure_is_reported_once() {
        let fake = FakePlatform::default();
        let (input, sink) = restriction(&fake);
        input.start_keyboard().unwrap();
        fake.hooks.fail_keyboard_uninstall.store(true, Ordering::SeqCst);

        assert!(input.stop_keyboard().is_err());
        input.stop_keyboard().unwrap();
        assert_eq!(sink.count(AuditKind::HookUninstallFailed), 1);
    }

    #[test]
    fn mouse_hook_blocks_navigation_buttons_only() {
        let fake = FakePlatform::default();
        let (input, _) = restriction(&fake);
        input.start_mouse().unwrap();
        assert!(input.is_mouse_hooked());

        assert_eq!(fake.hooks.click(MouseButton::Back), Some(HookDecision::Suppress));
        assert_eq!(fake.hooks.click(MouseButton::Forward), Some(HookDecision::Suppress));
        assert_eq!(fake.hooks.click(MouseButton::Left), Some(HookDecision::Forward));

        input.stop_mouse().unwrap();
        assert!(!fake.hooks.mouse_installed());
    }

    #[test]
    fn touchpad_round_trip_restores_previous_values() {
        let fake = FakePlatform::default();
        let (input, _) = restriction(&fake);
        input.disable_touchpad_gestures().unwrap();
        assert!(!fake.touchpad.gestures_enabled());
        assert!(input.are_gestures_disabled());

        input.enable_touchpad_gestures().unwrap();
        assert!(fake.touchpad.gestures_enabled());
        assert!(!input.are_gestures_disabled());
    }

    #[test]
    fn touchpad_failure_is_non_fatal() {
        let fake = FakePlatform::default();
        fake.touchpad.fail_disable.store(true, Ordering::SeqCst);
        let (input, _) = restriction(&fake);
        assert!(input.disable_touchpad_gestures().is_err());
        assert!(!input.are_gestures_disabled());
        input.enable_touchpad_gestures().unwrap();
        assert!(fake.touchpad.gestures_enabled());
    }
}
