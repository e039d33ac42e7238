mod commands;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use commands::{run::RunCommand, schedule::ScheduleCommand, validate::ValidateCommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tierdump",
    about = "Tiered-retention PostgreSQL backups",
    long_about = "Tierdump dumps PostgreSQL databases on an hourly to yearly schedule, \
                  copies each dump to every configured destination and prunes old \
                  backups per tier"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, env = "TIERDUMP_CONFIG", default_value = "config.json", help = "Configuration file (JSON, or TOML by extension)")]
    config: PathBuf,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Back up every enabled database whose tiers are due")]
    Run(RunCommand),

    #[command(about = "Load and validate the configuration")]
    Validate(ValidateCommand),

    #[command(about = "Show which tiers are due without backing anything up")]
    Schedule(ScheduleCommand),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match &cli.command {
        None => RunCommand::default().run(&cli).await,
        Some(Commands::Run(cmd)) => cmd.run(&cli).await,
        Some(Commands::Validate(cmd)) => cmd.run(&cli).await,
        Some(Commands::Schedule(cmd)) => cmd.run(&cli).await,
    }
}

/// Installs the global subscriber. `--quiet` and `--verbose` override the
/// configured level; `RUST_LOG` overrides both.
pub(crate) fn init_tracing(level: &str, format: &str, verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tierdump={level},tierdump_core={level},tierdump_backends={level},tierdump_engine={level}")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        "console" => builder.with_target(false).try_init(),
        _ => builder.json().with_current_span(true).try_init(),
    };

    installed.map_err(|e| anyhow!("Setting default subscriber failed: {}", e))
}
