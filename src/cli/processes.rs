use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::audit::Auditor;
use crate::config::Config;
use crate::enforcement::ProcessEnforcer;
use crate::platform::Platform;
use crate::poller::LoopSettings;

#[derive(Args)]
pub struct ProcessesArgs {
    /// Also report which block-listed processes are running
    #[arg(short, long)]
    pub policy: Option<PathBuf>,
}

pub async fn run(args: ProcessesArgs) -> Result<()> {
    let config = Config::load()?;
    let timings = config.timings()?;
    let policy = super::load_policy(args.policy.as_deref(), &config)?;

    let enforcer = ProcessEnforcer::new(
        Platform::native().processes,
        super::protected_processes(&config),
        LoopSettings::new(timings.poll_interval, timings.iteration_timeout, Auditor::null()),
    );

    let (inventory, blocked) = tokio::task::spawn_blocking(move || {
        let inventory = enforcer.inventory()?;
        let blocked = match &policy {
            Some(policy) => Some(enforcer.running_blocked(&policy.blocked_matcher())?),
            None => None,
        };
        anyhow::Ok((inventory, blocked))
    })
    .await??;

    println!("{:<40} {:>5}  PATH", "NAME", "COUNT");
    for entry in &inventory {
        let path = entry
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<40} {:>5}  {}", entry.name, entry.instances, path);
    }
    println!("\n{} distinct processes", inventory.len());

    if let Some(blocked) = blocked {
        if blocked.is_empty() {
            println!("No block-listed process is running.");
        } else {
            println!("Block-listed and running (will be closed when the exam starts):");
            for name in blocked {
                println!("  {}", name);
            }
        }
    }
    Ok(())
}
