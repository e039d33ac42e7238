use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use tierdump_core::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendType {
    Local,
    S3,
    Backblaze,
    Ssh,
    Other(String),
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Local => f.write_str("local"),
            BackendType::S3 => f.write_str("s3"),
            BackendType::Backblaze => f.write_str("backblaze"),
            BackendType::Ssh => f.write_str("ssh"),
            BackendType::Other(kind) => f.write_str(kind),
        }
    }
}

/// A storage destination.
///
/// Paths are relative to the backend's root (directory, key prefix or
/// remote path). Implementations must never surface zero-byte entries from
/// `list`, and a failed `write` must not leave a non-empty object behind.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn backend_type(&self) -> BackendType;

    /// Copies a local file to `dest`.
    async fn write(&self, source: &Path, dest: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Entries matching `pattern`, newest first.
    async fn list(&self, pattern: &str) -> Result<Vec<FileEntry>>;

    /// Fails with `Error::NotFound` when the path does not exist.
    async fn stat(&self, path: &str) -> Result<FileEntry>;

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Newest first, ties broken by path so listings are stable.
pub(crate) fn sort_newest_first(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
}
