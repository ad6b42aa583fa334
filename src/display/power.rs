use std::sync::{Arc, Mutex};

use tracing::debug;

use super::lock;
use crate::audit::AuditKind;
use crate::platform::{PlatformResult, PowerControl, ScreenSaverSnapshot};
use crate::poller::{LoopSettings, PollLoop};

struct Keepalive {
    poll: PollLoop,
    screen_saver: Option<ScreenSaverSnapshot>,
}

/// Keeps the display and system awake for the length of the exam.
pub struct ScreenLockGuard {
    power: Arc<dyn PowerControl>,
    settings: LoopSettings,
    active: Mutex<Option<Keepalive>>,
}

impl ScreenLockGuard {
    /// `settings.interval` is the keep-awake signal period.
    pub fn new(power: Arc<dyn PowerControl>, settings: LoopSettings) -> Self {
        Self {
            power,
            settings,
            active: Mutex::new(None),
        }
    }

    /// Start the periodic keep-awake signal and disable the screen saver.
    ///
    /// Fails only when the first signal is rejected; nothing is left running then.
    pub fn prevent(&self) -> PlatformResult<()> {
        let mut active = lock(&self.active);
        if active.is_some() {
            return Ok(());
        }
        if let Err(e) = self.power.signal_awake() {
            self.settings.auditor.error(
                AuditKind::ScreenLockChanged,
                format!("Keep-awake request rejected: {}", e),
            );
            return Err(e);
        }

        let screen_saver = match self.power.disable_screen_saver() {
            Ok(previous) => Some(previous),
            Err(e) => {
                self.settings.auditor.warning(
                    AuditKind::ScreenLockChanged,
                    format!("Could not disable screen saver: {}", e),
                );
                None
            }
        };

        let power = self.power.clone();
        let poll = PollLoop::spawn("keep-awake", &self.settings, move || {
            if let Err(e) = power.signal_awake() {
                debug!("Keep-awake signal failed: {}", e);
            }
        });
        *active = Some(Keepalive { poll, screen_saver });
        self.settings
            .auditor
            .info(AuditKind::ScreenLockChanged, "Screen lock prevented");
        Ok(())
    }

    /// Stop signalling and restore the screen saver. No-op when not preventing.
    pub async fn allow(&self) -> PlatformResult<()> {
        let keepalive = lock(&self.active).take();
        let Some(keepalive) = keepalive else {
            return Ok(());
        };
        keepalive.poll.stop().await;

        let mut result = self.power.release();
        if let Some(previous) = &keepalive.screen_saver
            && let Err(e) = self.power.restore_screen_saver(previous)
        {
            self.settings.auditor.warning(
                AuditKind::ScreenLockChanged,
                format!("Could not restore screen saver: {}", e),
            );
            result = result.and(Err(e));
        }
        match &result {
            Ok(()) => self
                .settings
                .auditor
                .info(AuditKind::ScreenLockChanged, "Screen lock allowed"),
            Err(e) => self.settings.auditor.warning(
                AuditKind::ScreenLockChanged,
                format!("Screen lock release incomplete: {}", e),
            ),
        }
        result
    }

    pub fn is_preventing(&self) -> bool {
        lock(&self.active).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Auditor;
    use crate::platform::fake::FakePower;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn guard(power: &Arc<FakePower>) -> ScreenLockGuard {
        let settings =
            LoopSettings::new(Duration::from_millis(20), Duration::from_secs(1), Auditor::null());
        ScreenLockGuard::new(power.clone(), settings)
    }

    #[tokio::test]
    async fn signals_periodically_until_allowed() {
        let power = Arc::new(FakePower::default());
        let guard = guard(&power);
        guard.prevent().unwrap();
        assert!(guard.is_preventing());
        assert!(power.screen_saver_disabled.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(power.awake_signals.load(Ordering::SeqCst) >= 3);

        guard.allow().await.unwrap();
        assert!(!guard.is_preventing());
        assert!(!power.screen_saver_disabled.load(Ordering::SeqCst));
        assert_eq!(power.releases.load(Ordering::SeqCst), 1);

        let after = power.awake_signals.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(power.awake_signals.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn rejected_signal_leaves_nothing_running() {
        let power = Arc::new(FakePower::default());
        power.fail_signal.store(true, Ordering::SeqCst);
        let guard = guard(&power);
        assert!(guard.prevent().is_err());
        assert!(!guard.is_preventing());
        assert!(!power.screen_saver_disabled.load(Ordering::SeqCst));

        guard.allow().await.unwrap();
        assert_eq!(power.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prevent_twice_keeps_one_loop() {
        let power = Arc::new(FakePower::default());
        let guard = guard(&power);
        guard.prevent().unwrap();
        guard.prevent().unwrap();
        guard.allow().await.unwrap();
        guard.allow().await.unwrap();
        assert_eq!(power.releases.load(Ordering::SeqCst), 1);
    }
}
