use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::lock;
use crate::audit::{AuditKind, Auditor};
use crate::platform::{PlatformError, PlatformResult, WindowControl, WindowHandle};
use crate::poller::{LoopSettings, PollLoop};

enum WindowCommand {
    Pin(WindowHandle, oneshot::Sender<PlatformResult<()>>),
    Reassert(WindowHandle),
    Unpin(WindowHandle, oneshot::Sender<PlatformResult<()>>),
}

/// Dedicated thread that performs every window and focus call.
///
/// Background loops never touch the window themselves; they post a
/// `Reassert` request, dropped when the thread is still busy with earlier ones.
struct WindowThread {
    commands: mpsc::Sender<WindowCommand>,
}

impl WindowThread {
    fn spawn(windows: Arc<dyn WindowControl>, auditor: Auditor) -> PlatformResult<Self> {
        let (commands, mut rx) = mpsc::channel(4);
        std::thread::Builder::new()
            .name("examguard-window".into())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        WindowCommand::Pin(window, reply) => {
                            let result = windows.set_topmost(window, true);
                            if let Err(e) = windows.bring_to_foreground(window) {
                                debug!("Initial foreground request failed: {}", e);
                            }
                            let _ = reply.send(result);
                        }
                        WindowCommand::Reassert(window) => {
                            reassert(windows.as_ref(), &auditor, window)
                        }
                        WindowCommand::Unpin(window, reply) => {
                            let _ = reply.send(windows.set_topmost(window, false));
                        }
                    }
                }
                debug!("Window thread exiting");
            })?;
        Ok(Self { commands })
    }

    async fn call(
        &self,
        command: impl FnOnce(oneshot::Sender<PlatformResult<()>>) -> WindowCommand,
    ) -> PlatformResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| PlatformError::os("window thread", "not running"))?;
        rx.await
            .map_err(|_| PlatformError::os("window thread", "exited before replying"))?
    }
}

fn reassert(windows: &dyn WindowControl, auditor: &Auditor, window: WindowHandle) {
    match windows.is_foreground(window) {
        Ok(true) => {}
        Ok(false) => match windows.bring_to_foreground(window) {
            Ok(()) => auditor.debug(
                AuditKind::FocusReasserted,
                format!("Exam window {:#x} regained the foreground", window.0),
            ),
            Err(e) => debug!("Foreground reassertion failed: {}", e),
        },
        Err(e) => debug!("Foreground query failed: {}", e),
    }
}

struct Pinned {
    window: WindowHandle,
    focus: PollLoop,
    thread: WindowThread,
}

/// Keeps the exam window on top and takes the foreground back when it is lost.
///
/// Reassertion is periodic; the OS can always switch away through privileged
/// paths (secure desktop, session switch).
pub struct WindowGuard {
    windows: Arc<dyn WindowControl>,
    settings: LoopSettings,
    pinned: Mutex<Option<Pinned>>,
}

impl WindowGuard {
    /// `settings.interval` is the focus reassertion period.
    pub fn new(windows: Arc<dyn WindowControl>, settings: LoopSettings) -> Self {
        Self {
            windows,
            settings,
            pinned: Mutex::new(None),
        }
    }

    /// Pin `window` always-on-top and start reasserting the foreground.
    ///
    /// The focus loop starts even when the topmost flag cannot be set; the
    /// error is still returned so the caller can record it.
    pub async fn lock_to_foreground(&self, window: WindowHandle) -> PlatformResult<()> {
        let current = lock(&self.pinned).as_ref().map(|p| p.window);
        match current {
            Some(w) if w == window => return Ok(()),
            Some(_) => self.unlock().await,
            None => {}
        }

        let thread = WindowThread::spawn(self.windows.clone(), self.settings.auditor.clone())?;
        let topmost = thread.call(|reply| WindowCommand::Pin(window, reply)).await;
        if let Err(e) = &topmost {
            self.settings.auditor.error(
                AuditKind::WindowPinned,
                format!("Could not pin window {:#x} on top: {}", window.0, e),
            );
        }

        let requests = thread.commands.clone();
        let focus = PollLoop::spawn("focus-reassert", &self.settings, move || {
            if requests.try_send(WindowCommand::Reassert(window)).is_err() {
                debug!("Window thread busy, reassertion deferred");
            }
        });

        *lock(&self.pinned) = Some(Pinned {
            window,
            focus,
            thread,
        });
        if topmost.is_ok() {
            self.settings.auditor.info(
                AuditKind::WindowPinned,
                format!("Window {:#x} pinned to foreground", window.0),
            );
        }
        topmost
    }

    /// Stop reasserting focus and drop the topmost flag. No-op when nothing is pinned.
    pub async fn unlock(&self) {
        let pinned = lock(&self.pinned).take();
        let Some(pinned) = pinned else {
            return;
        };
        pinned.focus.stop().await;
        let window = pinned.window;
        match pinned
            .thread
            .call(|reply| WindowCommand::Unpin(window, reply))
            .await
        {
            Ok(()) => self.settings.auditor.info(
                AuditKind::WindowPinned,
                format!("Window {:#x} unpinned", window.0),
            ),
            Err(e) => self.settings.auditor.warning(
                AuditKind::WindowPinned,
                format!("Could not unpin window {:#x}: {}", window.0, e),
            ),
        }
    }

    pub fn pinned_window(&self) -> Option<WindowHandle> {
        lock(&self.pinned).as_ref().map(|p| p.window)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_window().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Auditor, MemoryAuditSink};
    use crate::platform::fake::FakeWindows;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const EXAM: WindowHandle = WindowHandle(0x1234);
    const OTHER: WindowHandle = WindowHandle(0x9999);

    fn guard(windows: &Arc<FakeWindows>) -> WindowGuard {
        let settings = LoopSettings::new(
            Duration::from_millis(20),
            Duration::from_secs(1),
            Auditor::new(Arc::new(MemoryAuditSink::default())),
        );
        WindowGuard::new(windows.clone(), settings)
    }

    #[tokio::test]
    async fn pins_and_reasserts_focus() {
        let windows = Arc::new(FakeWindows::default());
        let guard = guard(&windows);
        guard.lock_to_foreground(EXAM).await.unwrap();
        assert!(windows.is_topmost(EXAM));
        assert_eq!(windows.foreground(), Some(EXAM));

        windows.steal_focus(OTHER);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(windows.foreground(), Some(EXAM));
        assert!(windows.activations.load(Ordering::SeqCst) >= 2);

        guard.unlock().await;
        assert!(!windows.is_topmost(EXAM));
        assert!(!guard.is_pinned());

        windows.steal_focus(OTHER);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(windows.foreground(), Some(OTHER));
    }

    #[tokio::test]
    async fn topmost_failure_is_reported_but_focus_loop_runs() {
        let windows = Arc::new(FakeWindows::default());
        windows.fail_topmost.store(true, Ordering::SeqCst);
        let guard = guard(&windows);

        assert!(guard.lock_to_foreground(EXAM).await.is_err());
        assert!(guard.is_pinned());
        windows.steal_focus(OTHER);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(windows.foreground(), Some(EXAM));

        guard.unlock().await;
        assert!(!guard.is_pinned());
    }

    #[tokio::test]
    async fn window_calls_run_on_one_dedicated_thread() {
        let windows = Arc::new(FakeWindows::default());
        let guard = guard(&windows);
        guard.lock_to_foreground(EXAM).await.unwrap();
        windows.steal_focus(OTHER);
        tokio::time::sleep(Duration::from_millis(80)).await;
        guard.unlock().await;

        let threads = windows.calling_threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].as_deref(), Some("examguard-window"));
    }

    #[tokio::test]
    async fn unlock_twice_is_harmless() {
        let windows = Arc::new(FakeWindows::default());
        let guard = guard(&windows);
        guard.unlock().await;
        guard.lock_to_foreground(EXAM).await.unwrap();
        guard.unlock().await;
        guard.unlock().await;
        assert!(!windows.is_topmost(EXAM));
    }
}
