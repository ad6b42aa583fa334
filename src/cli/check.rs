use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::audit::Auditor;
use crate::config::Config;
use crate::environment::EnvironmentValidator;
use crate::platform::Platform;

#[derive(Args)]
pub struct CheckArgs {
    /// Policy to judge the verdict against (default: lockdown.policy_file)
    #[arg(short, long)]
    pub policy: Option<PathBuf>,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CheckArgs) -> Result<()> {
    let config = Config::load()?;
    let policy = super::load_policy(args.policy.as_deref(), &config)?;

    let validator = EnvironmentValidator::new(Platform::native(), Auditor::null());
    let verdict = tokio::task::spawn_blocking(move || validator.validate()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        println!("Backend:          {}", Platform::backend_name());
        println!(
            "Virtual machine:  {}",
            if verdict.is_virtual_machine { "yes" } else { "no" }
        );
        match verdict.display_count {
            Some(n) => println!("Displays:         {}", n),
            None => println!("Displays:         unknown"),
        }
        for line in &verdict.evidence {
            println!("  - {}", line);
        }
    }

    if let Some(policy) = policy {
        match verdict.abort_reason(&policy) {
            Some(reason) => {
                println!("\nA session would be refused: {}", reason);
                std::process::exit(2);
            }
            None => println!("\nA session would be allowed."),
        }
    }
    Ok(())
}
