use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::concurrency::SessionLock;
use crate::config::Config;
use crate::lockdown::LockdownManager;
use crate::platform::{Platform, WindowHandle};
use crate::session::{FilePolicySource, SessionEvent, SessionNotice, SessionOrchestrator};

#[derive(Args)]
pub struct SessionArgs {
    /// Policy file applied when the exam starts (default: lockdown.policy_file)
    #[arg(short, long)]
    pub policy: Option<PathBuf>,

    /// Native handle of the exam window to pin, decimal or 0x-prefixed hex
    #[arg(short, long, value_parser = parse_window)]
    pub window: Option<WindowHandle>,
}

fn parse_window(s: &str) -> Result<WindowHandle, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => isize::from_str_radix(hex, 16),
        None => s.parse::<isize>(),
    };
    match parsed {
        Ok(0) => Err("window handle must not be zero".to_string()),
        Ok(raw) => Ok(WindowHandle(raw)),
        Err(e) => Err(format!("invalid window handle '{}': {}", s, e)),
    }
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::Started { session_id, exam } => println!(
            "Lockdown active (session {}, exam {})",
            session_id,
            exam.exam_id.as_deref().unwrap_or("-")
        ),
        SessionNotice::Aborted { message } => println!("Exam not started: {}", message),
        SessionNotice::Ended {
            session_id,
            failures,
        } => {
            let id = session_id.map(|id| id.to_string()).unwrap_or_default();
            if *failures == 0 {
                println!("Lockdown released (session {})", id);
            } else {
                println!(
                    "Lockdown released with {} failed teardown step(s) (session {})",
                    failures, id
                );
            }
        }
    }
}

/// Forward stdin lines from a plain thread so a pending read never holds up shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub async fn run(args: SessionArgs) -> Result<()> {
    let config = Config::load()?;
    let policy_path = args
        .policy
        .or_else(|| config.policy_path())
        .context("No policy given: pass --policy or set lockdown.policy_file")?;

    let lock = SessionLock::at(config.paths.session_lock())?;
    let Some(_guard) = lock.try_acquire()? else {
        match lock.holder_pid() {
            Some(pid) => anyhow::bail!("Another lockdown session is running (pid {})", pid),
            None => anyhow::bail!("Another lockdown session is running"),
        }
    };

    let (auditor, sink) = super::file_auditor(&config)?;
    let manager = Arc::new(LockdownManager::new(
        Platform::native(),
        auditor,
        config.timings()?,
        super::protected_processes(&config),
    ));
    let (orchestrator, mut notices) = SessionOrchestrator::new(
        manager.clone(),
        Arc::new(FilePolicySource::new(policy_path)),
        args.window,
    );

    let (events, rx) = mpsc::channel(16);
    let running = tokio::spawn(orchestrator.run(rx));
    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            print_notice(&notice);
        }
    });

    info!("Waiting for session events on stdin");
    let mut lines = stdin_lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match SessionEvent::from_json(&line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring input line: {}", e),
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, cancelling session");
                let _ = events.send(SessionEvent::Cancel).await;
                break;
            }
        }
    }

    drop(events);
    running.await.context("Session task failed")?;
    printer.await.context("Notice printer failed")?;
    if let Some(sink) = sink {
        sink.close();
    }
    info!("Session ended in state {}", manager.state());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_handle_accepts_hex_and_decimal() {
        assert_eq!(parse_window("0x1A2B").unwrap(), WindowHandle(0x1A2B));
        assert_eq!(parse_window("4242").unwrap(), WindowHandle(4242));
        assert!(parse_window("0").is_err());
        assert!(parse_window("hwnd").is_err());
    }
}
