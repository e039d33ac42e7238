//! One database run: dump every due tier, upload it everywhere, rotate.

use crate::dump::{DumpProducer, DumpRequest};
use crate::pgpass;
use crate::rotation;
use crate::scheduler::{self, TierSchedule};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierdump_backends::{
    Backend, BackendRegistry, MultiBackend, OperationResult, any_succeeded, close_all,
};
use tierdump_core::filename;
use tierdump_core::{Config, DatabaseConfig, Error, Result, Tier};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Outcome of one database run.
#[derive(Debug)]
pub struct DatabaseResult {
    pub database: String,
    pub success: bool,
    /// Nothing was due, so nothing was attempted.
    pub skipped: bool,
    pub tiers_completed: Vec<Tier>,
    pub tiers_failed: Vec<Tier>,
    pub backend_results: BTreeMap<Tier, Vec<OperationResult>>,
    pub error: Option<Error>,
    pub duration: Duration,
}

impl DatabaseResult {
    fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            success: false,
            skipped: false,
            tiers_completed: Vec::new(),
            tiers_failed: Vec::new(),
            backend_results: BTreeMap::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    fn skipped(database: &str, duration: Duration) -> Self {
        Self {
            success: true,
            skipped: true,
            duration,
            ..Self::new(database)
        }
    }

    fn failed(database: &str, error: Error, duration: Duration) -> Self {
        Self {
            error: Some(error),
            duration,
            ..Self::new(database)
        }
    }
}

/// A failed tier, with the upload results when it got that far.
type TierFailure = (Error, Option<Vec<OperationResult>>);

/// Credentials and backends shared by every tier of one run.
struct Session {
    pgpass: PathBuf,
    backends: Vec<Arc<dyn Backend>>,
}

pub struct BackupExecutor {
    config: Arc<Config>,
    registry: BackendRegistry,
    producer: Arc<dyn DumpProducer>,
    cancel: CancellationToken,
}

impl BackupExecutor {
    pub fn new(
        config: Arc<Config>,
        registry: BackendRegistry,
        producer: Arc<dyn DumpProducer>,
    ) -> Self {
        Self {
            config,
            registry,
            producer,
            cancel: CancellationToken::new(),
        }
    }

    /// Token handed to every backend built by this executor. Cancelling it
    /// interrupts retry waits and stops databases that have not started.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Builds the backends a database is written to. Disabled destinations
    /// are dropped; ending up with none is an error.
    pub async fn open_backends(&self, db: &DatabaseConfig) -> Result<Vec<Arc<dyn Backend>>> {
        let configs = self.config.destinations_for(db);
        if configs.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no storage destinations configured for database {}",
                db.name
            )));
        }

        let backends = self.registry.create_all(&configs, &self.cancel).await?;
        if backends.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no enabled storage destinations for database {}",
                db.name
            )));
        }

        info!(
            database = %db.name,
            count = backends.len(),
            "Initialized storage backends"
        );
        Ok(backends)
    }

    /// Which tiers of `db` are due at `now`, without backing anything up.
    pub async fn schedule(&self, db: &DatabaseConfig, now: DateTime<Utc>) -> Result<TierSchedule> {
        let backends = self.open_backends(db).await?;
        let tiers = db.retention_tiers(&self.config.global_defaults);
        let schedule = scheduler::check_schedule(&backends, &db.name, tiers, now).await;
        close_all(&backends).await;
        Ok(schedule)
    }

    /// Resolves and checks the pgpass file used by every dump of `db`.
    fn credentials(&self, db: &DatabaseConfig) -> Result<PathBuf> {
        let pgpass = pgpass::resolve_path(self.config.pgpass_file())?;
        pgpass::validate_permissions(&pgpass)?;
        debug!(database = %db.name, pgpass = %pgpass.display(), "Using pgpass file");

        let port = db.port(&self.config.global_defaults);
        match pgpass::has_entry(&pgpass, &db.host, port, &db.name, &db.user) {
            Ok(true) => {}
            Ok(false) => warn!(
                pgpass = %pgpass.display(),
                host = %db.host,
                port,
                user = %db.user,
                "No pgpass entry matches this database, pg_dump may prompt or fail"
            ),
            Err(e) => warn!(pgpass = %pgpass.display(), error = %e, "Could not read pgpass file"),
        }
        Ok(pgpass)
    }

    async fn open_session(&self, db: &DatabaseConfig) -> Result<Session> {
        let pgpass = self.credentials(db)?;
        let backends = self.open_backends(db).await?;
        Ok(Session { pgpass, backends })
    }

    /// Backs up whichever tiers of `db` are due at `timestamp`. A database
    /// with nothing due is skipped before its credentials are looked at.
    pub async fn backup_database(
        &self,
        db: &DatabaseConfig,
        timestamp: DateTime<Utc>,
    ) -> DatabaseResult {
        let span = info_span!("backup", database = %db.name);
        async {
            let start = Instant::now();

            let backends = match self.open_backends(db).await {
                Ok(backends) => backends,
                Err(e) => {
                    error!(error = %e, "Cannot start backup");
                    return DatabaseResult::failed(&db.name, e, start.elapsed());
                }
            };

            let tiers = db.retention_tiers(&self.config.global_defaults);
            let schedule = scheduler::check_schedule(&backends, &db.name, tiers, timestamp).await;

            let result = if schedule.nothing_due() {
                info!("Backup not due yet, skipping");
                DatabaseResult::skipped(&db.name, start.elapsed())
            } else {
                match self.credentials(db) {
                    Ok(pgpass) => {
                        let session = Session {
                            pgpass,
                            backends: backends.clone(),
                        };
                        self.run_tiers(db, timestamp, &schedule.due, &session, start).await
                    }
                    Err(e) => {
                        error!(error = %e, "Cannot start backup");
                        DatabaseResult::failed(&db.name, e, start.elapsed())
                    }
                }
            };

            close_all(&backends).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Backs up exactly `due` for `db`, skipping the schedule check.
    pub async fn backup_tiers(
        &self,
        db: &DatabaseConfig,
        timestamp: DateTime<Utc>,
        due: &[Tier],
    ) -> DatabaseResult {
        let span = info_span!("backup", database = %db.name);
        async {
            let start = Instant::now();
            if due.is_empty() {
                debug!("No tiers due, skipping backup");
                return DatabaseResult::skipped(&db.name, start.elapsed());
            }

            let session = match self.open_session(db).await {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "Cannot start backup");
                    return DatabaseResult::failed(&db.name, e, start.elapsed());
                }
            };

            let result = self.run_tiers(db, timestamp, due, &session, start).await;
            close_all(&session.backends).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_tiers(
        &self,
        db: &DatabaseConfig,
        timestamp: DateTime<Utc>,
        due: &[Tier],
        session: &Session,
        start: Instant,
    ) -> DatabaseResult {
        let mut result = DatabaseResult::new(&db.name);
        let port = db.port(&self.config.global_defaults);
        info!(due_tiers = ?due, host = %db.host, port, "Starting backup for due tiers");

        let temp_dir = self.config.temp_dir();
        if let Err(e) = tokio::fs::create_dir_all(&temp_dir).await {
            error!(temp_dir = %temp_dir.display(), error = %e, "Cannot create temp directory");
            result.error = Some(e.into());
            result.duration = start.elapsed();
            return result;
        }

        let uploader = MultiBackend::new(session.backends.clone());

        for &tier in due {
            let outcome = self
                .run_tier(db, tier, timestamp, &temp_dir, &session.pgpass, &uploader)
                .instrument(info_span!("tier", tier = %tier))
                .await;

            match outcome {
                Ok(uploads) => {
                    result.backend_results.insert(tier, uploads);
                    result.tiers_completed.push(tier);
                }
                Err((e, uploads)) => {
                    error!(tier = %tier, error = %e, "Tier backup failed");
                    if let Some(uploads) = uploads {
                        result.backend_results.insert(tier, uploads);
                    }
                    result.tiers_failed.push(tier);
                }
            }
        }

        result.duration = start.elapsed();
        if result.tiers_failed.is_empty() {
            result.success = true;
            info!(
                completed_tiers = ?result.tiers_completed,
                duration_ms = result.duration.as_millis() as u64,
                "All tier backups completed"
            );
        } else {
            result.error = Some(Error::Backend(format!(
                "{} of {} tier backups failed",
                result.tiers_failed.len(),
                due.len()
            )));
            error!(
                completed_tiers = ?result.tiers_completed,
                failed_tiers = ?result.tiers_failed,
                duration_ms = result.duration.as_millis() as u64,
                "Backup completed with failures"
            );
        }

        // Old backups are only pruned once something new exists.
        if result.tiers_completed.is_empty() {
            warn!("Skipping rotation, no tier backup succeeded");
        } else {
            self.rotate(db, &session.backends).await;
        }

        result
    }

    async fn run_tier(
        &self,
        db: &DatabaseConfig,
        tier: Tier,
        timestamp: DateTime<Utc>,
        temp_dir: &Path,
        pgpass: &Path,
        uploader: &MultiBackend,
    ) -> std::result::Result<Vec<OperationResult>, TierFailure> {
        let final_name = filename::encode(&db.name, Some(tier), timestamp).map_err(|e| (e, None))?;
        let temp_file = temp_dir.join(format!("{}.tmp", final_name));
        let log_file = temp_dir.join("logs").join(format!(
            "{}.log",
            final_name.trim_end_matches(".backup")
        ));

        info!(temp_file = %temp_file.display(), final_name = %final_name, "Creating tier backup");

        let request = DumpRequest {
            database: db.name.clone(),
            user: db.user.clone(),
            host: db.host.clone(),
            port: db.port(&self.config.global_defaults),
            output: temp_file.clone(),
            log_file: Some(log_file),
            pgpass_file: Some(pgpass.to_path_buf()),
        };

        if let Err(e) = self.producer.dump(&request).await {
            remove_temp(&temp_file).await;
            return Err((e, None));
        }

        let size = match tokio::fs::metadata(&temp_file).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err((
                    Error::Dump(format!("dump output {} missing: {}", temp_file.display(), e)),
                    None,
                ));
            }
        };
        if size == 0 {
            remove_temp(&temp_file).await;
            return Err((Error::Dump("dump output is empty".to_string()), None));
        }

        info!(size_bytes = size, "Dump created, uploading to destinations");
        let uploads = uploader.upload(&temp_file, &final_name).await;
        remove_temp(&temp_file).await;

        if any_succeeded(&uploads) {
            info!("Backup uploaded to at least one destination");
            Ok(uploads)
        } else {
            Err((
                Error::Backend("all backends failed to upload backup".to_string()),
                Some(uploads),
            ))
        }
    }

    async fn rotate(&self, db: &DatabaseConfig, backends: &[Arc<dyn Backend>]) {
        let tiers = db.retention_tiers(&self.config.global_defaults);
        if tiers.is_empty() {
            warn!("No retention tiers configured, skipping rotation");
            return;
        }

        info!(
            tier_count = tiers.len(),
            backend_count = backends.len(),
            "Applying retention policy per backend"
        );
        for backend in backends {
            let report = rotation::rotate_backend(backend.as_ref(), &db.name, tiers, Utc::now()).await;
            if !report.is_empty() {
                info!(
                    backend = %backend.name(),
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    "Rotation finished"
                );
            }
        }
    }
}

async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %path.display(), error = %e, "Failed to remove temp file");
        }
    }
}
