use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tierdump_backends::BackendRegistry;
use tierdump_engine::{BackupExecutor, PgDump, backup_all_databases};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Args, Default)]
pub struct RunCommand {
    #[arg(long, env = "TIERDUMP_PG_DUMP", help = "pg_dump binary to run")]
    pg_dump: Option<PathBuf>,
}

impl RunCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<ExitCode> {
        let config = super::load_config(cli)?;
        info!(config_file = %cli.config.display(), "Starting tierdump");

        if let Some(dir) = &config.backup_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;
        }

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, not starting any further databases");
                on_signal.cancel();
            }
        });

        let producer = match &self.pg_dump {
            Some(program) => PgDump::with_program(program),
            None => PgDump::new(),
        };
        let executor = Arc::new(
            BackupExecutor::new(Arc::new(config), BackendRegistry::with_defaults(), Arc::new(producer))
                .with_cancellation(cancel),
        );

        let report = backup_all_databases(executor, Utc::now()).await;

        info!(
            successful = report.successful(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Tierdump completed"
        );

        if let Some(e) = &report.error {
            error!(error = %e, "Backup execution failed");
        }
        if report.is_success() {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::FAILURE)
        }
    }
}
