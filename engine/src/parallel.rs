//! Bounded parallel execution across databases.

use crate::executor::{BackupExecutor, DatabaseResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tierdump_core::{DatabaseConfig, Error};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Everything one run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Results in completion order, one per database that got a slot.
    pub results: Vec<DatabaseResult>,
    /// Databases that never started because the run was cancelled.
    pub cancelled: Vec<String>,
    /// First failure that stopped the run, if any.
    pub error: Option<Error>,
}

impl RunReport {
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.success && !r.skipped).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.skipped).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed() == 0 && self.cancelled.is_empty()
    }
}

enum TaskOutcome {
    Finished(DatabaseResult),
    NotStarted(String),
}

/// Backs up every enabled database, at most `max_concurrent_backups` at a
/// time.
///
/// The first database that fails cancels the group: databases still
/// waiting for a slot are not started, those already running finish.
pub async fn backup_all_databases(
    executor: Arc<BackupExecutor>,
    timestamp: DateTime<Utc>,
) -> RunReport {
    let config = executor.config();
    for db in config.databases.iter().filter(|db| !db.is_enabled()) {
        info!(database = %db.name, "Skipping disabled database");
    }
    let databases: Vec<DatabaseConfig> = config.enabled_databases().cloned().collect();

    let mut report = RunReport::default();
    if databases.is_empty() {
        warn!("No enabled databases to back up");
        return report;
    }

    let max_concurrent = config.max_concurrent_backups();
    info!(
        total_databases = databases.len(),
        max_concurrent,
        "Starting parallel backup execution"
    );

    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let group = executor.cancellation().child_token();
    let mut tasks = JoinSet::new();

    for db in databases {
        let semaphore = semaphore.clone();
        let group = group.clone();
        let executor = executor.clone();

        tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = group.cancelled() => return TaskOutcome::NotStarted(db.name),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return TaskOutcome::NotStarted(db.name),
                },
            };
            if group.is_cancelled() {
                return TaskOutcome::NotStarted(db.name);
            }

            let result = executor.backup_database(&db, timestamp).await;
            if !result.success {
                group.cancel();
            }
            TaskOutcome::Finished(result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(TaskOutcome::Finished(result)) => {
                if !result.success && report.error.is_none() {
                    let reason = result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string());
                    report.error = Some(Error::Backend(format!(
                        "backup failed for database {}: {}",
                        result.database, reason
                    )));
                }
                report.results.push(result);
            }
            Ok(TaskOutcome::NotStarted(database)) => {
                warn!(database = %database, "Backup not started, run was cancelled");
                report.cancelled.push(database);
            }
            Err(e) => {
                warn!(error = %e, "Database task did not complete");
                report
                    .error
                    .get_or_insert_with(|| Error::Backend(format!("database task failed: {}", e)));
            }
        }
    }

    if report.error.is_none() && !report.cancelled.is_empty() {
        report.error = Some(Error::Cancelled);
    }

    let total_duration: Duration = report.results.iter().map(|r| r.duration).sum();
    info!(
        successful = report.successful(),
        skipped = report.skipped(),
        failed = report.failed(),
        cancelled = report.cancelled.len(),
        total_duration_ms = total_duration.as_millis() as u64,
        "Parallel backup execution completed"
    );

    report
}
