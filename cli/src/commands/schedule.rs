use anyhow::Result;
use chrono::Utc;
use clap::Args;
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use tierdump_backends::BackendRegistry;
use tierdump_engine::{BackupExecutor, PgDump};
use tracing::warn;

#[derive(Args)]
pub struct ScheduleCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Only show this database")]
    database: Option<String>,
}

impl ScheduleCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<ExitCode> {
        let config = Arc::new(super::load_config(cli)?);
        let executor = BackupExecutor::new(
            config.clone(),
            BackendRegistry::with_defaults(),
            Arc::new(PgDump::new()),
        );
        let now = Utc::now();
        let format = self.format.as_deref().unwrap_or("table");

        let mut rows = Vec::new();
        let mut failed = false;
        for db in config.enabled_databases() {
            if self.database.as_ref().is_some_and(|name| *name != db.name) {
                continue;
            }
            match executor.schedule(db, now).await {
                Ok(schedule) => {
                    for (tier, next) in &schedule.next_due {
                        rows.push((db.name.clone(), *tier, schedule.is_due(*tier), *next));
                    }
                }
                Err(e) => {
                    warn!(database = %db.name, error = %e, "Failed to compute schedule");
                    failed = true;
                }
            }
        }

        match format {
            "json" => {
                let entries: Vec<_> = rows
                    .iter()
                    .map(|(database, tier, due, next)| {
                        json!({
                            "database": database,
                            "tier": tier,
                            "due": due,
                            "next_due": next.to_rfc3339(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
            _ => {
                if rows.is_empty() {
                    println!("No enabled databases");
                } else {
                    println!("{:<24} {:<10} {:<8} {}", "Database", "Tier", "Due", "Next due");
                    println!("{:-<70}", "");
                    for (database, tier, due, next) in &rows {
                        let due = if *due { "yes" } else { "no" };
                        println!(
                            "{:<24} {:<10} {:<8} {}",
                            database,
                            tier.as_str(),
                            due,
                            next.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                    }
                }
            }
        }

        Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
    }
}
