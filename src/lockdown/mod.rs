//! Lockdown lifecycle manager.
//!
//! One manager owns every mitigation component and the session state. Apply
//! and reset are serialized by an operation lock: a reset requested while an
//! apply is in flight waits for it to reach `Active` or `Faulted`.
//!
//! Apply runs every step even when earlier ones fail; reset attempts every
//! teardown even when the matching apply step failed or never ran. Each step is
//! isolated with `catch_unwind`, and a panicking step (or a panicking loop
//! iteration reported through the [`FaultReporter`]) moves the session to
//! `Faulted`.

mod report;

pub use report::{
    ApplyReport, LockdownStep, ResetReport, SessionState, StepOutcome, StepReport,
};

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditKind, Auditor};
use crate::config::Timings;
use crate::display::{DisplayWatcher, ScreenLockGuard, WindowGuard};
use crate::enforcement::{ProcessEnforcer, ProtectedProcesses, RespawnAction, RespawnEvent};
use crate::environment::EnvironmentValidator;
use crate::error::{LockdownError, Result};
use crate::input::InputRestriction;
use crate::platform::{Platform, ProcessInfo, WindowHandle};
use crate::poller::{FaultReporter, LoopSettings};
use crate::policy::LockdownPolicy;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn completed<E: fmt::Display>(result: std::result::Result<(), E>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Completed,
        Err(e) => StepOutcome::Failed(e.to_string()),
    }
}

fn completed_unless(failures: Vec<String>) -> StepOutcome {
    if failures.is_empty() {
        StepOutcome::Completed
    } else {
        StepOutcome::Failed(failures.join("; "))
    }
}

/// Move a live session to `Faulted`. Returns false when the session was not live.
fn enter_faulted(state: &watch::Sender<SessionState>, auditor: &Auditor, reason: &str) -> bool {
    let changed = state.send_if_modified(|s| {
        if matches!(
            *s,
            SessionState::Validating | SessionState::Applying | SessionState::Active
        ) {
            *s = SessionState::Faulted;
            true
        } else {
            false
        }
    });
    if changed {
        auditor.error(AuditKind::SessionState, format!("Session faulted: {}", reason));
    }
    changed
}

pub struct LockdownManager {
    auditor: Auditor,
    timings: Timings,
    validator: Arc<EnvironmentValidator>,
    enforcer: ProcessEnforcer,
    input: InputRestriction,
    window: WindowGuard,
    screen: ScreenLockGuard,
    displays: DisplayWatcher,
    faults: FaultReporter,
    state: Arc<watch::Sender<SessionState>>,
    op: tokio::sync::Mutex<()>,
    session: Mutex<Option<Uuid>>,
    fault_watch: Mutex<Option<JoinHandle<()>>>,
}

impl LockdownManager {
    pub fn new(
        platform: Platform,
        auditor: Auditor,
        timings: Timings,
        protected: ProtectedProcesses,
    ) -> Self {
        let faults = FaultReporter::new();
        let base = LoopSettings::new(timings.poll_interval, timings.iteration_timeout, auditor.clone())
            .with_faults(faults.clone());
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            validator: Arc::new(EnvironmentValidator::new(platform.clone(), auditor.clone())),
            enforcer: ProcessEnforcer::new(platform.processes.clone(), protected, base.clone()),
            input: InputRestriction::new(
                platform.hooks.clone(),
                platform.touchpad.clone(),
                auditor.clone(),
            ),
            window: WindowGuard::new(
                platform.windows.clone(),
                base.with_interval(timings.focus_interval),
            ),
            screen: ScreenLockGuard::new(
                platform.power.clone(),
                base.with_interval(timings.keepalive_interval),
            ),
            displays: DisplayWatcher::new(
                platform.displays.clone(),
                base.with_interval(timings.monitor_poll_interval),
            ),
            auditor,
            timings,
            faults,
            state: Arc::new(state),
            op: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            fault_watch: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        *lock(&self.session)
    }

    pub fn enforcer(&self) -> &ProcessEnforcer {
        &self.enforcer
    }

    pub fn input(&self) -> &InputRestriction {
        &self.input
    }

    pub fn window_guard(&self) -> &WindowGuard {
        &self.window
    }

    pub fn screen_lock(&self) -> &ScreenLockGuard {
        &self.screen
    }

    pub fn display_watcher(&self) -> &DisplayWatcher {
        &self.displays
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        self.auditor.info(
            AuditKind::SessionState,
            format!("Session state {} -> {}", previous, next),
        );
    }

    /// Report an unhandled failure from outside the engine (UI crash handler, etc.).
    pub fn fault(&self, reason: &str) -> bool {
        enter_faulted(&self.state, &self.auditor, reason)
    }

    /// Validate the environment and apply every mitigation the policy asks for.
    ///
    /// Returns `EnvironmentRejected` before anything is installed when the
    /// environment is forbidden. Otherwise the session ends up `Active`, or
    /// `Faulted` when a step panicked; step failures are in the report.
    pub async fn initialize(
        &self,
        policy: &LockdownPolicy,
        window: Option<WindowHandle>,
    ) -> Result<ApplyReport> {
        let _op = self.op.lock().await;
        let current = self.state();
        if current != SessionState::Idle {
            return Err(LockdownError::InvalidState {
                operation: "initialize",
                state: current,
            });
        }

        self.faults.clear();
        self.set_state(SessionState::Validating);
        let validator = self.validator.clone();
        let verdict = match tokio::task::spawn_blocking(move || validator.validate()).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let reason = if e.is_panic() {
                    format!(
                        "environment validation panicked: {}",
                        panic_message(e.into_panic().as_ref())
                    )
                } else {
                    format!("environment validation did not finish: {}", e)
                };
                enter_faulted(&self.state, &self.auditor, &reason);
                return Err(LockdownError::Faulted(reason));
            }
        };

        if let Some(reason) = verdict.abort_reason(policy) {
            self.auditor.warning(
                AuditKind::EnvironmentRejected,
                format!("Session aborted: {} ({})", reason, verdict.summary()),
            );
            self.set_state(SessionState::Idle);
            return Err(LockdownError::EnvironmentRejected {
                reason: reason.to_string(),
                verdict,
            });
        }

        let session_id = Uuid::new_v4();
        *lock(&self.session) = Some(session_id);
        self.set_state(SessionState::Applying);
        self.spawn_fault_watch();
        info!("Applying lockdown session {}", session_id);
        self.audit_inventory();

        let steps = self.apply_steps(policy, window).await;

        self.state.send_if_modified(|s| {
            if *s == SessionState::Applying {
                *s = SessionState::Active;
                true
            } else {
                false
            }
        });
        let state = self.state();
        let failed = steps.iter().filter(|r| r.outcome.is_failure()).count();
        self.auditor.info(
            AuditKind::SessionState,
            format!(
                "Session {} {} ({} of {} steps failed)",
                session_id,
                state,
                failed,
                steps.len()
            ),
        );

        Ok(ApplyReport {
            session_id,
            verdict,
            steps,
            state,
        })
    }

    async fn apply_steps(&self, policy: &LockdownPolicy, window: Option<WindowHandle>) -> Vec<StepReport> {
        let whitelist = policy.whitelist_matcher();
        let mut steps = Vec::with_capacity(10);

        steps.push(
            self.run_step(LockdownStep::KillBlocked, async {
                if policy.blocked_processes.is_empty() {
                    return StepOutcome::Skipped("no blocked processes".into());
                }
                let mut failures = Vec::new();
                for name in &policy.blocked_processes {
                    match self.enforcer.block_process(name, "Initial") {
                        Ok(outcome) => failures.extend(
                            outcome
                                .failures
                                .iter()
                                .map(|(pid, e)| format!("{} (pid {}): {}", name, pid, e)),
                        ),
                        Err(e) => failures.push(format!("{}: {}", name, e)),
                    }
                }
                completed_unless(failures)
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::MonitorRespawns, async {
                if policy.blocked_processes.is_empty() {
                    return StepOutcome::Skipped("no blocked processes".into());
                }
                for name in &policy.blocked_processes {
                    self.enforcer.monitor_process(
                        name,
                        Arc::new(|_: &RespawnEvent| RespawnAction::Terminate),
                    );
                }
                StepOutcome::Completed
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::WhitelistSweep, async {
                if whitelist.is_empty() {
                    return StepOutcome::Skipped("no whitelist".into());
                }
                match self.enforcer.kill_all_except_whitelist(&whitelist) {
                    Ok(report) => completed_unless(
                        report
                            .failures
                            .iter()
                            .map(|(pid, name, e)| format!("{} (pid {}): {}", name, pid, e))
                            .collect(),
                    ),
                    Err(e) => StepOutcome::Failed(e.to_string()),
                }
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::MonitorNewProcesses, async {
                if whitelist.is_empty() {
                    return StepOutcome::Skipped("no whitelist".into());
                }
                let on_blocked = Arc::new(|process: &ProcessInfo| {
                    debug!("Blocking new process '{}' (pid {})", process.name, process.pid);
                });
                completed(
                    self.enforcer
                        .monitor_new_processes(whitelist.clone(), on_blocked)
                        .await,
                )
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::KeyboardHook, async {
                let combos = policy.blocked_combinations();
                if combos.is_empty() {
                    return StepOutcome::Skipped("no key combinations".into());
                }
                self.input.set_blocked_combinations(combos);
                completed(self.input.start_keyboard())
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::MouseHook, async { completed(self.input.start_mouse()) })
                .await,
        );

        steps.push(
            self.run_step(LockdownStep::TouchpadGestures, async {
                if !policy.disable_touchpad_gestures {
                    return StepOutcome::Skipped("disabled by policy".into());
                }
                completed(self.input.disable_touchpad_gestures())
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::ScreenLock, async {
                if !policy.prevent_screen_lock {
                    return StepOutcome::Skipped("disabled by policy".into());
                }
                completed(self.screen.prevent())
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::WindowPin, async {
                match window {
                    Some(window) => completed(self.window.lock_to_foreground(window).await),
                    None => StepOutcome::Skipped("no window".into()),
                }
            })
            .await,
        );

        steps.push(
            self.run_step(LockdownStep::DisplayWatch, async {
                self.displays.start();
                StepOutcome::Completed
            })
            .await,
        );

        steps
    }

    /// Tear down every mitigation and return to `Idle`.
    ///
    /// A no-op returning an empty report when already idle. Teardown failures
    /// are recorded and never stop later teardown steps.
    pub async fn reset(&self) -> ResetReport {
        let _op = self.op.lock().await;
        if self.state() == SessionState::Idle {
            debug!("Reset requested while idle");
            return ResetReport::default();
        }

        self.set_state(SessionState::Resetting);
        if let Some(task) = lock(&self.fault_watch).take() {
            task.abort();
        }
        let session_id = lock(&self.session).take();

        let mut steps = Vec::with_capacity(8);
        steps.push(
            self.run_step(LockdownStep::KeyboardHook, async { completed(self.input.stop_keyboard()) })
                .await,
        );
        steps.push(
            self.run_step(LockdownStep::MonitorRespawns, async {
                self.enforcer.stop_respawn_monitoring().await;
                StepOutcome::Completed
            })
            .await,
        );
        steps.push(
            self.run_step(LockdownStep::TouchpadGestures, async {
                completed(self.input.enable_touchpad_gestures())
            })
            .await,
        );
        steps.push(
            self.run_step(LockdownStep::WindowPin, async {
                self.window.unlock().await;
                StepOutcome::Completed
            })
            .await,
        );
        steps.push(
            self.run_step(LockdownStep::ScreenLock, async { completed(self.screen.allow().await) })
                .await,
        );
        steps.push(
            self.run_step(LockdownStep::MouseHook, async { completed(self.input.stop_mouse()) })
                .await,
        );
        steps.push(
            self.run_step(LockdownStep::MonitorNewProcesses, async {
                self.enforcer.stop_new_process_monitoring().await;
                StepOutcome::Completed
            })
            .await,
        );
        steps.push(
            self.run_step(LockdownStep::DisplayWatch, async {
                self.displays.stop().await;
                StepOutcome::Completed
            })
            .await,
        );

        // Let asynchronous OS cleanup settle before reporting idle.
        tokio::time::sleep(self.timings.reset_grace).await;
        self.faults.clear();
        self.set_state(SessionState::Idle);
        ResetReport { session_id, steps }
    }

    async fn run_step<F>(&self, step: LockdownStep, work: F) -> StepReport
    where
        F: Future<Output = StepOutcome>,
    {
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                enter_faulted(
                    &self.state,
                    &self.auditor,
                    &format!("{} panicked: {}", step, message),
                );
                StepOutcome::Panicked(message)
            }
        };

        let message = format!("{}: {}", step, outcome);
        match &outcome {
            StepOutcome::Completed => debug!("{}", message),
            StepOutcome::Skipped(_) => self.auditor.debug(AuditKind::StepOutcome, message),
            StepOutcome::Failed(_) => self.auditor.warning(AuditKind::StepOutcome, message),
            StepOutcome::Panicked(_) => self.auditor.error(AuditKind::StepOutcome, message),
        }
        StepReport::new(step, outcome)
    }

    fn spawn_fault_watch(&self) {
        let mut faults = self.faults.subscribe();
        let state = self.state.clone();
        let auditor = self.auditor.clone();
        let task = tokio::spawn(async move {
            while faults.changed().await.is_ok() {
                let reason = faults.borrow_and_update().clone();
                if let Some(reason) = reason {
                    enter_faulted(&state, &auditor, &reason);
                }
            }
        });
        if let Some(previous) = lock(&self.fault_watch).replace(task) {
            previous.abort();
        }
    }

    fn audit_inventory(&self) {
        match self.enforcer.inventory() {
            Ok(entries) => {
                let listing: Vec<String> = entries
                    .iter()
                    .map(|e| {
                        if e.instances > 1 {
                            format!("{} x{}", e.name, e.instances)
                        } else {
                            e.name.clone()
                        }
                    })
                    .collect();
                self.auditor.info(
                    AuditKind::ProcessInventory,
                    format!("{} applications running: {}", entries.len(), listing.join(", ")),
                );
            }
            Err(e) => debug!("Process inventory unavailable: {}", e),
        }
    }
}

impl Drop for LockdownManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.fault_watch).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLevel, MemoryAuditSink};
    use crate::platform::fake::FakePlatform;
    use crate::platform::{PlatformResult, TouchpadControl, TouchpadSnapshot};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const EXAM: WindowHandle = WindowHandle(0x42);

    fn fast_timings() -> Timings {
        Timings {
            poll_interval: Duration::from_millis(20),
            iteration_timeout: Duration::from_secs(1),
            focus_interval: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(20),
            monitor_poll_interval: Duration::from_millis(20),
            reset_grace: Duration::from_millis(10),
        }
    }

    fn manager_for(platform: Platform) -> (LockdownManager, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let manager = LockdownManager::new(
            platform,
            Auditor::new(sink.clone()),
            fast_timings(),
            ProtectedProcesses::default(),
        );
        (manager, sink)
    }

    fn full_policy() -> LockdownPolicy {
        LockdownPolicy::default()
            .with_blocked(["taskmgr", "obs64"])
            .with_whitelist(["examclient"])
            .with_combos(["Alt+Tab", "Ctrl+Shift+Esc", "Win+D"])
            .unwrap()
    }

    #[tokio::test]
    async fn respawned_blocked_process_is_killed_while_active() {
        let fake = FakePlatform::default();
        let (manager, sink) = manager_for(fake.platform());
        let policy = LockdownPolicy::default().with_blocked(["taskmgr"]);

        let report = manager.initialize(&policy, None).await.unwrap();
        assert_eq!(report.state, SessionState::Active);
        assert_eq!(manager.state(), SessionState::Active);

        let pid = fake.processes.spawn("taskmgr.exe");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fake.processes.is_running(pid));
        assert!(sink
            .snapshot()
            .iter()
            .any(|e| e.level == AuditLevel::Warning && e.message.contains("taskmgr")));

        manager.reset().await;
    }

    #[tokio::test]
    async fn initial_kill_and_sweep_run_before_active() {
        let fake = FakePlatform::default();
        let obs = fake.processes.spawn("obs64.exe");
        let exam = fake.processes.spawn("ExamClient.exe");
        let discord = fake.processes.spawn("Discord.exe");
        let winlogon = fake.processes.spawn("winlogon.exe");
        let (manager, _) = manager_for(fake.platform());

        let report = manager.initialize(&full_policy(), None).await.unwrap();
        assert_eq!(report.outcome(LockdownStep::KillBlocked), Some(&StepOutcome::Completed));
        assert_eq!(report.outcome(LockdownStep::WhitelistSweep), Some(&StepOutcome::Completed));
        assert!(!fake.processes.is_running(obs));
        assert!(!fake.processes.is_running(discord));
        assert!(fake.processes.is_running(exam));
        assert!(fake.processes.is_running(winlogon));
        assert_eq!(fake.processes.attempts_for(discord), 1);

        manager.reset().await;
    }

    #[tokio::test]
    async fn apply_then_reset_restores_every_subsystem() {
        let fake = FakePlatform::default();
        let (manager, _) = manager_for(fake.platform());

        let report = manager.initialize(&full_policy(), Some(EXAM)).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.steps);
        assert!(fake.hooks.keyboard_installed());
        assert!(fake.hooks.mouse_installed());
        assert!(!fake.touchpad.gestures_enabled());
        assert!(fake.power.screen_saver_disabled.load(Ordering::SeqCst));
        assert!(fake.windows.is_topmost(EXAM));
        assert!(manager.display_watcher().is_running());
        assert!(manager.enforcer().is_monitoring_respawns());
        assert!(manager.enforcer().is_monitoring_new_processes());

        let reset = manager.reset().await;
        assert!(reset.performed());
        assert_eq!(reset.session_id, Some(report.session_id));
        assert_eq!(manager.state(), SessionState::Idle);

        assert!(!fake.hooks.keyboard_installed());
        assert!(!fake.hooks.mouse_installed());
        assert!(!manager.input().is_keyboard_hooked());
        assert!(!manager.input().is_mouse_hooked());
        assert!(fake.touchpad.gestures_enabled());
        assert!(!manager.input().are_gestures_disabled());
        assert!(!manager.screen_lock().is_preventing());
        assert!(!fake.power.screen_saver_disabled.load(Ordering::SeqCst));
        assert!(!fake.windows.is_topmost(EXAM));
        assert!(!manager.window_guard().is_pinned());
        assert!(!manager.display_watcher().is_running());
        assert!(!manager.enforcer().is_monitoring_respawns());
        assert!(!manager.enforcer().is_monitoring_new_processes());
        assert!(manager.enforcer().tracked().is_empty());
    }

    #[tokio::test]
    async fn second_reset_is_a_noop() {
        let fake = FakePlatform::default();
        let (manager, _) = manager_for(fake.platform());
        assert!(!manager.reset().await.performed());

        manager.initialize(&full_policy(), Some(EXAM)).await.unwrap();
        assert!(manager.reset().await.performed());
        let second = manager.reset().await;
        assert!(!second.performed());
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(fake.hooks.keyboard_uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.power.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_runs_off_the_executor_thread() {
        let fake = FakePlatform::default();
        let (manager, _) = manager_for(fake.platform());
        manager.initialize(&full_policy(), None).await.unwrap();
        let probed_on = fake.probe.queried_on.lock().unwrap().unwrap();
        assert_ne!(probed_on, std::thread::current().id());
        manager.reset().await;
    }

    #[tokio::test]
    async fn panicking_validation_faults_without_applying() {
        let fake = FakePlatform::default();
        fake.probe.panic.store(true, Ordering::SeqCst);
        let blocked = fake.processes.spawn("taskmgr.exe");
        let (manager, _) = manager_for(fake.platform());

        let err = manager.initialize(&full_policy(), Some(EXAM)).await.unwrap_err();
        assert!(matches!(err, LockdownError::Faulted(ref reason) if reason.contains("firmware")));
        assert_eq!(manager.state(), SessionState::Faulted);
        assert!(fake.processes.is_running(blocked));
        assert!(!fake.hooks.keyboard_installed());
        manager.reset().await;
        assert_eq!(manager.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn virtual_machine_aborts_before_anything_is_installed() {
        let fake = FakePlatform::default();
        *fake.probe.identity.lock().unwrap() =
            Some(("innotek GmbH".into(), "VirtualBox".into()));
        let blocked = fake.processes.spawn("taskmgr.exe");
        let (manager, sink) = manager_for(fake.platform());

        let err = manager.initialize(&full_policy(), Some(EXAM)).await.unwrap_err();
        match err {
            LockdownError::EnvironmentRejected { verdict, .. } => {
                assert!(verdict.is_virtual_machine);
                assert!(!verdict.evidence.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.session_id().is_none());
        assert!(fake.processes.is_running(blocked));
        assert!(!fake.hooks.keyboard_installed());
        assert!(!fake.windows.is_topmost(EXAM));
        assert_eq!(sink.count(AuditKind::EnvironmentRejected), 1);
    }

    #[tokio::test]
    async fn extra_monitor_aborts_only_when_policy_blocks() {
        let fake = FakePlatform::default();
        fake.displays.count.store(2, Ordering::SeqCst);
        let (manager, _) = manager_for(fake.platform());

        let err = manager.initialize(&full_policy(), None).await.unwrap_err();
        assert!(matches!(err, LockdownError::EnvironmentRejected { .. }));

        let lenient = LockdownPolicy {
            block_virtual_machines: false,
            ..full_policy()
        };
        let report = manager.initialize(&lenient, None).await.unwrap();
        assert!(report.verdict.has_multiple_monitors);
        assert_eq!(manager.state(), SessionState::Active);
        manager.reset().await;
    }

    #[tokio::test]
    async fn failed_sweep_does_not_stop_later_steps() {
        let fake = FakePlatform::default();
        fake.processes.deny_termination("antivirus.exe");
        fake.processes.spawn("antivirus.exe");
        let (manager, _) = manager_for(fake.platform());

        let report = manager.initialize(&full_policy(), Some(EXAM)).await.unwrap();
        assert!(matches!(
            report.outcome(LockdownStep::WhitelistSweep),
            Some(StepOutcome::Failed(_))
        ));
        assert_eq!(report.outcome(LockdownStep::KeyboardHook), Some(&StepOutcome::Completed));
        assert_eq!(report.outcome(LockdownStep::WindowPin), Some(&StepOutcome::Completed));
        assert_eq!(manager.state(), SessionState::Active);

        manager.reset().await;
        assert!(!fake.hooks.keyboard_installed());
        assert!(!fake.windows.is_topmost(EXAM));
        assert!(fake.touchpad.gestures_enabled());
    }

    struct ExplodingTouchpad;

    impl TouchpadControl for ExplodingTouchpad {
        fn disable_gestures(&self) -> PlatformResult<TouchpadSnapshot> {
            panic!("touchpad driver exploded");
        }

        fn restore_gestures(&self, _previous: &TouchpadSnapshot) -> PlatformResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_step_faults_session_but_apply_continues() {
        let fake = FakePlatform::default();
        let mut platform = fake.platform();
        platform.touchpad = Arc::new(ExplodingTouchpad);
        let (manager, _) = manager_for(platform);

        let report = manager.initialize(&full_policy(), Some(EXAM)).await.unwrap();
        assert!(matches!(
            report.outcome(LockdownStep::TouchpadGestures),
            Some(StepOutcome::Panicked(msg)) if msg.contains("exploded")
        ));
        assert_eq!(report.outcome(LockdownStep::ScreenLock), Some(&StepOutcome::Completed));
        assert_eq!(report.outcome(LockdownStep::WindowPin), Some(&StepOutcome::Completed));
        assert_eq!(report.state, SessionState::Faulted);
        assert_eq!(manager.state(), SessionState::Faulted);

        let reset = manager.reset().await;
        assert!(reset.performed());
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(!fake.hooks.keyboard_installed());
        assert!(!fake.windows.is_topmost(EXAM));
    }

    #[tokio::test]
    async fn external_fault_requires_reset() {
        let fake = FakePlatform::default();
        let (manager, _) = manager_for(fake.platform());
        assert!(!manager.fault("nothing running"));

        manager.initialize(&full_policy(), None).await.unwrap();
        assert!(manager.fault("renderer crashed"));
        assert_eq!(manager.state(), SessionState::Faulted);

        let err = manager.initialize(&full_policy(), None).await.unwrap_err();
        assert!(matches!(
            err,
            LockdownError::InvalidState { state: SessionState::Faulted, .. }
        ));

        manager.reset().await;
        assert_eq!(manager.state(), SessionState::Idle);
        manager.initialize(&full_policy(), None).await.unwrap();
        manager.reset().await;
    }

    #[tokio::test]
    async fn optional_steps_are_skipped() {
        let fake = FakePlatform::default();
        let (manager, _) = manager_for(fake.platform());
        let policy = LockdownPolicy {
            disable_touchpad_gestures: false,
            prevent_screen_lock: false,
            ..LockdownPolicy::default()
        };

        let report = manager.initialize(&policy, None).await.unwrap();
        for step in [
            LockdownStep::KillBlocked,
            LockdownStep::MonitorRespawns,
            LockdownStep::WhitelistSweep,
            LockdownStep::MonitorNewProcesses,
            LockdownStep::KeyboardHook,
            LockdownStep::TouchpadGestures,
            LockdownStep::ScreenLock,
            LockdownStep::WindowPin,
        ] {
            assert!(
                matches!(report.outcome(step), Some(StepOutcome::Skipped(_))),
                "{step} was not skipped"
            );
        }
        assert_eq!(report.outcome(LockdownStep::MouseHook), Some(&StepOutcome::Completed));
        assert!(!fake.hooks.keyboard_installed());
        manager.reset().await;
    }

    #[tokio::test]
    async fn subscribers_see_state_transitions() {
        let fake = FakePlatform::default();
        let (manager, _) = manager_for(fake.platform());
        let mut states = manager.subscribe();
        assert_eq!(*states.borrow_and_update(), SessionState::Idle);

        manager.initialize(&full_policy(), None).await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Active);

        manager.reset().await;
        assert_eq!(*states.borrow_and_update(), SessionState::Idle);
    }
}
