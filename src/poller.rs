//! Cancellable fixed-interval background loops.
//!
//! Each iteration runs on the blocking pool (OS enumeration is synchronous) and
//! is bounded by a timeout. A slow iteration is abandoned and the next tick is
//! skipped while it is still running; a panicking iteration is reported and the
//! loop keeps going. Stopping a loop returns within one poll interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::debug;

use crate::audit::{AuditKind, Auditor};

/// Shared signal raised when a background iteration panics.
#[derive(Clone)]
pub struct FaultReporter {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for FaultReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn report(&self, reason: impl Into<String>) {
        self.tx.send_replace(Some(reason.into()));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    /// Forget a previous fault (start of a new session).
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }
}

/// Timing and reporting shared by every loop a component starts.
#[derive(Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub iteration_timeout: Duration,
    pub auditor: Auditor,
    pub faults: FaultReporter,
}

impl LoopSettings {
    pub fn new(interval: Duration, iteration_timeout: Duration, auditor: Auditor) -> Self {
        Self {
            interval,
            iteration_timeout,
            auditor,
            faults: FaultReporter::new(),
        }
    }

    pub fn with_interval(&self, interval: Duration) -> Self {
        Self {
            interval,
            ..self.clone()
        }
    }

    pub fn with_faults(mut self, faults: FaultReporter) -> Self {
        self.faults = faults;
        self
    }
}

/// A running loop. Dropping the handle also asks the loop to stop.
pub struct PollLoop {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollLoop {
    /// Start calling `iteration` every `settings.interval`, first call immediately.
    pub fn spawn<F>(name: &'static str, settings: &LoopSettings, iteration: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let iteration = Arc::new(iteration);
        let busy = Arc::new(AtomicBool::new(false));
        let settings = settings.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("{} loop started ({:?})", name, settings.interval);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                // A timed-out iteration may still be running on the blocking pool.
                if busy.swap(true, Ordering::SeqCst) {
                    debug!("{} loop: previous iteration still running, skipping tick", name);
                    continue;
                }

                let work = iteration.clone();
                let flag = busy.clone();
                let blocking = tokio::task::spawn_blocking(move || {
                    let _reset = BusyReset(flag);
                    work();
                });

                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    outcome = timeout(settings.iteration_timeout, blocking) => match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_panic() => {
                            let reason = format!("{} loop iteration panicked", name);
                            settings.auditor.error(AuditKind::LoopFailure, reason.clone());
                            settings.faults.report(reason);
                        }
                        Ok(Err(e)) => {
                            settings
                                .auditor
                                .warning(AuditKind::LoopFailure, format!("{} loop iteration failed: {}", name, e));
                        }
                        Err(_) => {
                            settings.auditor.warning(
                                AuditKind::LoopFailure,
                                format!(
                                    "{} loop iteration exceeded {:?}, skipped",
                                    name, settings.iteration_timeout
                                ),
                            );
                        }
                    }
                }
            }
            debug!("{} loop stopped", name);
        });

        Self {
            name,
            shutdown,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) {
        debug!("Stopping {} loop", self.name);
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Clears the busy flag even if the iteration panics.
struct BusyReset(Arc<AtomicBool>);

impl Drop for BusyReset {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
