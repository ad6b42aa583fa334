use anyhow::Result;
use clap::Parser;

use examguard::cli::{self, Cli, Commands};
use examguard::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // RUST_LOG wins, then --verbose, then the configured level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::load()
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check(args) => cli::check::run(args).await,
        Commands::Processes(args) => cli::processes::run(args).await,
        Commands::Session(args) => cli::session::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Audit(args) => cli::audit::run(args).await,
    }
}
