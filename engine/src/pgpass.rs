//! PostgreSQL password file handling.
//!
//! The file is never read for passwords here; it is only located, checked
//! and handed to `pg_dump` through `PGPASSFILE`.

use std::fs;
use std::path::{Path, PathBuf};
use tierdump_core::{Error, Result};
use tracing::debug;

/// Location used by container images.
pub const CONTAINER_PGPASS: &str = "/config/.pgpass";

/// Finds the password file: the configured path, which must exist, else
/// [`CONTAINER_PGPASS`], else `~/.pgpass`.
pub fn resolve_path(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured.filter(|p| !p.as_os_str().is_empty()) {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::NotFound {
            path: format!("configured pgpass file {}", path.display()),
        });
    }

    let mut tried = vec![PathBuf::from(CONTAINER_PGPASS)];
    if let Some(dirs) = directories::BaseDirs::new() {
        tried.push(dirs.home_dir().join(".pgpass"));
    }

    for candidate in &tried {
        if candidate.exists() {
            debug!(path = %candidate.display(), "Found pgpass file");
            return Ok(candidate.clone());
        }
    }

    let tried: Vec<String> = tried.iter().map(|p| p.display().to_string()).collect();
    Err(Error::NotFound {
        path: format!("pgpass file (tried {})", tried.join(", ")),
    })
}

/// The file must be readable and writable by its owner only.
#[cfg(unix)]
pub fn validate_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(Error::PermissionDenied(format!(
            "{} has permissions {:o}, must be 600",
            path.display(),
            mode
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn validate_permissions(path: &Path) -> Result<()> {
    fs::metadata(path)?;
    Ok(())
}

fn field_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// True when some line `host:port:database:user:password` matches the
/// connection. `*` matches any value; comments, blank lines and lines
/// without exactly five fields are ignored.
pub fn has_entry(path: &Path, host: &str, port: u16, database: &str, user: &str) -> Result<bool> {
    let contents = fs::read_to_string(path)?;
    let port = port.to_string();

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .filter(|fields| fields.len() == 5)
        .any(|fields| {
            field_matches(fields[0], host)
                && field_matches(fields[1], &port)
                && field_matches(fields[2], database)
                && field_matches(fields[3], user)
        }))
}
