use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::audit::{read_audit_log, verify_audit_chain};
use crate::config::Config;

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print the most recent audit entries
    Show {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },

    /// Check the hash chain for edits or truncation
    Verify,
}

pub async fn run(args: AuditArgs) -> Result<()> {
    let config = Config::load()?;
    let path = config
        .audit_log_path()
        .context("Auditing is disabled (audit.enabled = false)")?;

    match args.command {
        AuditCommands::Show { lines } => {
            let records = read_audit_log(&path)?;
            let start = records.len().saturating_sub(lines);
            for record in &records[start..] {
                println!(
                    "{} {:<7} {:<20} {}",
                    record.ts,
                    record.level.as_str(),
                    record.kind.as_str(),
                    record.message
                );
            }
            if records.is_empty() {
                println!("No audit entries in {}", path.display());
            }
        }
        AuditCommands::Verify => {
            let broken = verify_audit_chain(&path)?;
            if broken.is_empty() {
                println!("Audit chain intact: {}", path.display());
            } else {
                for line in &broken {
                    println!("Chain broken at line {}", line + 1);
                }
                anyhow::bail!("{} broken link(s) in {}", broken.len(), path.display());
            }
        }
    }
    Ok(())
}
