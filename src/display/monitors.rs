use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::lock;
use crate::audit::{AuditKind, Auditor};
use crate::platform::DisplayProbe;
use crate::poller::{LoopSettings, PollLoop};

/// Last observed display count; 0 until the first successful poll.
struct Observed {
    count: AtomicUsize,
}

impl Observed {
    fn update(&self, count: usize, auditor: &Auditor) {
        let previous = self.count.swap(count, Ordering::SeqCst);
        if previous == 0 || previous == count {
            return;
        }
        if count > 1 {
            auditor.warning(
                AuditKind::DisplayChanged,
                format!(
                    "Extra monitor connected during exam ({} -> {} displays)",
                    previous, count
                ),
            );
        } else {
            auditor.info(
                AuditKind::DisplayChanged,
                format!("Display count changed ({} -> {})", previous, count),
            );
        }
    }
}

/// Audits display hot-plug while a session is active.
pub struct DisplayWatcher {
    displays: Arc<dyn DisplayProbe>,
    settings: LoopSettings,
    observed: Arc<Observed>,
    poll: Mutex<Option<PollLoop>>,
}

impl DisplayWatcher {
    pub fn new(displays: Arc<dyn DisplayProbe>, settings: LoopSettings) -> Self {
        Self {
            displays,
            settings,
            observed: Arc::new(Observed {
                count: AtomicUsize::new(0),
            }),
            poll: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut poll = lock(&self.poll);
        if poll.is_some() {
            return;
        }
        self.observed.count.store(0, Ordering::SeqCst);
        let displays = self.displays.clone();
        let observed = self.observed.clone();
        let auditor = self.settings.auditor.clone();
        *poll = Some(PollLoop::spawn("display-watch", &self.settings, move || {
            match displays.display_count() {
                Ok(count) => observed.update(count, &auditor),
                Err(e) => debug!("Display enumeration failed: {}", e),
            }
        }));
    }

    pub async fn stop(&self) {
        let poll = lock(&self.poll).take();
        if let Some(poll) = poll {
            poll.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.poll).as_ref().is_some_and(PollLoop::is_running)
    }

    /// Most recent display count, once one has been observed.
    pub fn last_count(&self) -> Option<usize> {
        match self.observed.count.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }
}
