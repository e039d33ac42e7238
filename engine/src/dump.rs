//! Producing database dumps.

use async_trait::async_trait;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tierdump_core::{Error, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Everything a producer needs to dump one database to one file.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub database: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    pub output: PathBuf,
    /// Where the dump tool's own output goes.
    pub log_file: Option<PathBuf>,
    pub pgpass_file: Option<PathBuf>,
}

#[async_trait]
pub trait DumpProducer: Send + Sync {
    /// Writes a dump to `request.output`. Succeeds only if the tool
    /// reported success; the caller checks the file itself.
    async fn dump(&self, request: &DumpRequest) -> Result<()>;
}

/// Runs `pg_dump` in custom format.
#[derive(Debug, Clone)]
pub struct PgDump {
    program: PathBuf,
}

impl Default for PgDump {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pg_dump"),
        }
    }
}

impl PgDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(request: &DumpRequest) -> Vec<String> {
        vec![
            "-U".to_string(),
            request.user.clone(),
            "-h".to_string(),
            request.host.clone(),
            "-p".to_string(),
            request.port.to_string(),
            "-F".to_string(),
            "c".to_string(),
            "-b".to_string(),
            "-v".to_string(),
            "-f".to_string(),
            request.output.to_string_lossy().into_owned(),
            request.database.clone(),
        ]
    }
}

fn open_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[async_trait]
impl DumpProducer for PgDump {
    async fn dump(&self, request: &DumpRequest) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(Self::args(request))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(pgpass) = &request.pgpass_file {
            command.env("PGPASSFILE", pgpass);
        }

        if let Some(log_file) = &request.log_file {
            match open_log(log_file) {
                Ok((stdout, stderr)) => {
                    command.stdout(stdout).stderr(stderr);
                }
                Err(e) => {
                    warn!(
                        log_file = %log_file.display(),
                        error = %e,
                        "Failed to open dump log file, using process output"
                    );
                }
            }
        }

        debug!(
            database = %request.database,
            output = %request.output.display(),
            "Starting pg_dump"
        );

        let status = command.status().await.map_err(|e| {
            Error::Dump(format!("failed to start {}: {}", self.program.display(), e))
        })?;

        if !status.success() {
            let mut message = format!("pg_dump exited with {}", status);
            if let Some(log_file) = &request.log_file {
                message.push_str(&format!(", see {}", log_file.display()));
            }
            return Err(Error::Dump(message));
        }

        info!(database = %request.database, output = %request.output.display(), "pg_dump finished");
        Ok(())
    }
}
