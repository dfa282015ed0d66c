//! Program Host daemon - builds, runs, and proxies to user programs via
//! their embedded Watcher API.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "program-hostd")]
#[command(about = "Multi-tenant user-program host daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("program_host={}", log_level).into()),
        )
        .init();

    let result = match cli.command {
        Some(cmd::Commands::Diagnostics) => cmd::diagnostics::run().await,
        Some(cmd::Commands::ConfigCheck) => cmd::config_check::run(&cli.config).await,
        None => cmd::root::run(&cli.config).await,
    };

    if let Err(err) = result {
        error!("daemon error: {}", err);
        std::process::exit(exit_code_for(&err));
    }

    Ok(())
}

/// Exit code 2 for an invalid port range, 1 for everything else.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<program_host::config::ConfigError>() {
        Some(program_host::config::ConfigError::InvalidPortRange(_)) => 2,
        _ => 1,
    }
}
