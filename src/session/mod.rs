//! Drives a [`LockdownManager`] from the exam browser's lifecycle events.

mod event;
mod source;

pub use event::{EventError, ExamRef, SessionEvent};
#[cfg(test)]
pub use source::MockPolicySource;
pub use source::{FilePolicySource, PolicySource};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LockdownError;
use crate::lockdown::{LockdownManager, SessionState};
use crate::platform::WindowHandle;

/// What the UI is told about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Started {
        session_id: Uuid,
        exam: ExamRef,
    },
    /// The exam must not start; `message` is shown to the candidate.
    Aborted { message: String },
    Ended {
        session_id: Option<Uuid>,
        /// Teardown steps that failed.
        failures: usize,
    },
}

pub struct SessionOrchestrator {
    manager: Arc<LockdownManager>,
    policies: Arc<dyn PolicySource>,
    window: Option<WindowHandle>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionOrchestrator {
    pub fn new(
        manager: Arc<LockdownManager>,
        policies: Arc<dyn PolicySource>,
        window: Option<WindowHandle>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            manager,
            policies,
            window,
            notices,
        };
        (orchestrator, rx)
    }

    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Session notice dropped: no listener");
        }
    }

    /// Handle events until the stream ends, then make sure nothing stays locked down.
    pub async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        let mut states = self.manager.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    if state == SessionState::Faulted {
                        warn!("Lockdown faulted, forcing reset");
                        self.end().await;
                    }
                }
            }
        }
        if self.manager.state() != SessionState::Idle {
            info!("Session event stream closed, resetting lockdown");
            self.end().await;
        }
    }

    pub async fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::StartExam(exam) => self.start(exam).await,
            SessionEvent::SubmitExam | SessionEvent::Cancel => {
                info!("Session event {:?}", event);
                self.end().await;
            }
            SessionEvent::Token(_) => debug!("Ignoring token event"),
        }
    }

    async fn start(&self, exam: ExamRef) {
        let state = self.manager.state();
        if state != SessionState::Idle {
            warn!("Ignoring start-exam while session is {}", state);
            return;
        }

        let policy = match self.policies.fetch(&exam).await {
            Ok(policy) => policy,
            Err(e) => {
                warn!("Policy fetch failed: {:#}", e);
                self.notify(SessionNotice::Aborted {
                    message: format!("could not load the exam policy: {}", e),
                });
                return;
            }
        };

        match self.manager.initialize(&policy, self.window).await {
            Ok(report) => {
                for failure in report.failures() {
                    debug!("{}: {}", failure.step, failure.outcome);
                }
                self.notify(SessionNotice::Started {
                    session_id: report.session_id,
                    exam,
                });
                if report.state == SessionState::Faulted {
                    self.end().await;
                }
            }
            Err(LockdownError::EnvironmentRejected { reason, .. }) => {
                self.notify(SessionNotice::Aborted { message: reason });
            }
            Err(e) => {
                self.notify(SessionNotice::Aborted {
                    message: e.to_string(),
                });
                if self.manager.state() != SessionState::Idle {
                    self.end().await;
                }
            }
        }
    }

    async fn end(&self) {
        let report = self.manager.reset().await;
        if report.performed() {
            self.notify(SessionNotice::Ended {
                session_id: report.session_id,
                failures: report.failures().count(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Auditor;
    use crate::config::Timings;
    use crate::enforcement::ProtectedProcesses;
    use crate::platform::fake::FakePlatform;
    use crate::policy::LockdownPolicy;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn manager(fake: &FakePlatform) -> Arc<LockdownManager> {
        let timings = Timings {
            poll_interval: Duration::from_millis(20),
            iteration_timeout: Duration::from_secs(1),
            focus_interval: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(20),
            monitor_poll_interval: Duration::from_millis(20),
            reset_grace: Duration::from_millis(5),
        };
        Arc::new(LockdownManager::new(
            fake.platform(),
            Auditor::null(),
            timings,
            ProtectedProcesses::default(),
        ))
    }

    fn policy() -> LockdownPolicy {
        LockdownPolicy::default()
            .with_blocked(["taskmgr"])
            .with_combos(["Alt+Tab"])
            .unwrap()
    }

    fn source_returning(policy: LockdownPolicy) -> Arc<dyn PolicySource> {
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(move |_| Ok(policy.clone()));
        Arc::new(source)
    }

    fn start() -> SessionEvent {
        SessionEvent::StartExam(ExamRef {
            exam_id: Some("7".into()),
            student_exam_id: None,
        })
    }

    #[tokio::test]
    async fn start_then_submit() {
        let fake = FakePlatform::default();
        let manager = manager(&fake);
        let (orchestrator, mut notices) =
            SessionOrchestrator::new(manager.clone(), source_returning(policy()), None);
        let (tx, rx) = mpsc::channel(4);
        tx.send(start()).await.unwrap();
        tx.send(SessionEvent::Token("t".into())).await.unwrap();
        tx.send(SessionEvent::SubmitExam).await.unwrap();
        drop(tx);

        orchestrator.run(rx).await;

        assert!(matches!(notices.recv().await, Some(SessionNotice::Started { exam, .. }) if exam.exam_id.as_deref() == Some("7")));
        assert!(matches!(
            notices.recv().await,
            Some(SessionNotice::Ended { failures: 0, .. })
        ));
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(!fake.hooks.keyboard_installed());
    }

    #[tokio::test]
    async fn policy_failure_aborts_without_lockdown() {
        let fake = FakePlatform::default();
        let manager = manager(&fake);
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("backend unreachable")));
        let (orchestrator, mut notices) =
            SessionOrchestrator::new(manager.clone(), Arc::new(source), None);

        orchestrator.handle(start()).await;
        match notices.recv().await {
            Some(SessionNotice::Aborted { message }) => {
                assert!(message.contains("backend unreachable"))
            }
            other => panic!("unexpected notice: {other:?}"),
        }
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(fake.hooks.keyboard_installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn virtual_machine_is_reported_to_the_candidate() {
        let fake = FakePlatform::default();
        fake.processes.spawn("vmtoolsd.exe");
        let manager = manager(&fake);
        let (orchestrator, mut notices) =
            SessionOrchestrator::new(manager.clone(), source_returning(policy()), None);

        orchestrator.handle(start()).await;
        match notices.recv().await {
            Some(SessionNotice::Aborted { message }) => assert!(message.contains("virtual machine")),
            other => panic!("unexpected notice: {other:?}"),
        }
        assert_eq!(manager.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn closed_stream_resets_active_session() {
        let fake = FakePlatform::default();
        let manager = manager(&fake);
        let (orchestrator, mut notices) =
            SessionOrchestrator::new(manager.clone(), source_returning(policy()), None);
        let (tx, rx) = mpsc::channel(1);
        tx.send(start()).await.unwrap();
        drop(tx);

        orchestrator.run(rx).await;
        assert!(matches!(notices.recv().await, Some(SessionNotice::Started { .. })));
        assert!(matches!(notices.recv().await, Some(SessionNotice::Ended { .. })));
        assert_eq!(manager.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn fault_forces_reset() {
        let fake = FakePlatform::default();
        let manager = manager(&fake);
        let (orchestrator, mut notices) =
            SessionOrchestrator::new(manager.clone(), source_returning(policy()), None);
        let (tx, rx) = mpsc::channel(1);
        let running = tokio::spawn(orchestrator.run(rx));

        tx.send(start()).await.unwrap();
        assert!(matches!(notices.recv().await, Some(SessionNotice::Started { .. })));
        assert!(manager.fault("renderer crashed"));

        let ended = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap();
        assert!(matches!(ended, Some(SessionNotice::Ended { .. })));
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(!fake.hooks.keyboard_installed());

        drop(tx);
        running.await.unwrap();
    }

    #[tokio::test]
    async fn second_start_while_active_is_ignored() {
        let fake = FakePlatform::default();
        let manager = manager(&fake);
        let (orchestrator, mut notices) =
            SessionOrchestrator::new(manager.clone(), source_returning(policy()), None);

        orchestrator.handle(start()).await;
        orchestrator.handle(start()).await;
        orchestrator.handle(SessionEvent::Cancel).await;

        assert!(matches!(notices.recv().await, Some(SessionNotice::Started { .. })));
        assert!(matches!(notices.recv().await, Some(SessionNotice::Ended { .. })));
        assert!(notices.try_recv().is_err());
    }
}
