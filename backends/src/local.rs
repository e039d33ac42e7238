use crate::backend::{Backend, BackendType, FileEntry, sort_newest_first};
use crate::glob;
use crate::options::{self, LocalOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use tierdump_core::{BackendConfig, Error, Result};
use tokio::fs;
use tracing::debug;

pub struct LocalBackend {
    name: String,
    base_path: PathBuf,
}

impl LocalBackend {
    /// Opens a backend rooted at `base_path`, creating the directory.
    pub async fn new<P: AsRef<Path>>(name: impl Into<String>, base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            Error::Backend(format!(
                "failed to create directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(Self {
            name: name.into(),
            base_path,
        })
    }

    /// Uses the `path` option, falling back to `base_dir`.
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        let opts: LocalOptions = options::decode(config)?;
        let path = opts
            .path
            .filter(|p| !p.is_empty())
            .or_else(|| Some(config.base_dir.clone()).filter(|p| !p.is_empty()))
            .ok_or_else(|| Error::MissingOption {
                backend: config.name.clone(),
                option: "path".to_string(),
            })?;

        Self::new(config.name.clone(), path).await
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(Error::InvalidConfig(format!(
                "backend {}: path '{}' must be relative to the backend root",
                self.name, path
            )));
        }
        Ok(self.base_path.join(relative))
    }
}

fn map_io(path: &str, action: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::not_found(path),
        io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("failed to {} {}: {}", action, path, e))
        }
        _ => Error::Backend(format!("failed to {} {}: {}", action, path, e)),
    }
}

/// Copies into a temp file next to `dest` and renames it into place, so a
/// failed copy never leaves a partial destination.
fn copy_atomically(source: &Path, dest: &Path) -> io::Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut input = std::fs::File::open(source)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tierdump-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    async fn write(&self, source: &Path, dest: &str) -> Result<()> {
        let full_path = self.full_path(dest)?;
        let source_path = source.to_path_buf();

        tokio::task::spawn_blocking(move || copy_atomically(&source_path, &full_path))
            .await
            .map_err(|e| Error::Backend(format!("copy task failed: {}", e)))?
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    Error::Backend(format!("source {} not found", source.display()))
                }
                _ => map_io(dest, "write", e),
            })?;

        debug!(backend = %self.name, dest, "Wrote file");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::remove_file(&full_path)
            .await
            .map_err(|e| map_io(path, "delete", e))
    }

    async fn list(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        let mut results = Vec::new();

        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(map_io(&self.base_path.to_string_lossy(), "list", e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !glob::matches(&name, pattern) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Removed between read_dir and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(&name, "stat", e)),
            };
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }

            let modified: DateTime<Utc> = metadata.modified()?.into();
            results.push(FileEntry {
                path: name,
                size: metadata.len(),
                modified,
            });
        }

        sort_newest_first(&mut results);
        Ok(results)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(path, "stat", e))?;

        let modified: DateTime<Utc> = metadata.modified()?.into();

        Ok(FileEntry {
            path: path.to_string(),
            size: metadata.len(),
            modified,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, contents: &[u8], age: Duration) {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_write_stat_delete() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let source = staging.path().join("dump.tmp");
        std::fs::write(&source, b"payload").unwrap();

        let backend = LocalBackend::new("local", root.path().join("nested")).await.unwrap();
        backend.write(&source, "mydb--2024-12-17T03-00-00.backup").await.unwrap();

        let entry = backend.stat("mydb--2024-12-17T03-00-00.backup").await.unwrap();
        assert_eq!(entry.size, 7);
        assert!(backend.exists("mydb--2024-12-17T03-00-00.backup").await.unwrap());

        backend.delete("mydb--2024-12-17T03-00-00.backup").await.unwrap();
        assert!(!backend.exists("mydb--2024-12-17T03-00-00.backup").await.unwrap());
        assert!(backend.stat("mydb--2024-12-17T03-00-00.backup").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing() {
        let root = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", root.path()).await.unwrap();

        let result = backend
            .write(Path::new("/nonexistent/dump.tmp"), "mydb--2024-12-17T03-00-00.backup")
            .await;
        assert!(result.is_err());
        assert!(backend.list("*").await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let root = TempDir::new().unwrap();
        write_file(root.path(), "mydb--2024-12-15T03-00-00.backup", b"old", Duration::from_secs(7200));
        write_file(root.path(), "mydb--2024-12-17T03-00-00.backup", b"new", Duration::from_secs(60));
        write_file(root.path(), "mydb--2024-12-16T03-00-00.backup", b"mid", Duration::from_secs(3600));
        write_file(root.path(), "mydb--2024-12-18T03-00-00.backup", b"", Duration::from_secs(1));
        write_file(root.path(), "other--2024-12-17T03-00-00.backup", b"x", Duration::from_secs(1));
        std::fs::create_dir(root.path().join("mydb-dir.backup")).unwrap();

        let backend = LocalBackend::new("local", root.path()).await.unwrap();
        let listed: Vec<String> = backend
            .list("mydb*.backup")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();

        assert_eq!(
            listed,
            vec![
                "mydb--2024-12-17T03-00-00.backup",
                "mydb--2024-12-16T03-00-00.backup",
                "mydb--2024-12-15T03-00-00.backup",
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let root = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", root.path()).await.unwrap();
        assert!(backend.stat("../etc/passwd").await.is_err());
        assert!(backend.delete("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_from_config_falls_back_to_base_dir() {
        let root = TempDir::new().unwrap();
        let config = BackendConfig::new("local", "local").with_base_dir(root.path().to_string_lossy());
        let backend = LocalBackend::from_config(&config).await.unwrap();
        assert_eq!(backend.base_path(), root.path());

        let err = LocalBackend::from_config(&BackendConfig::new("bare", "local"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingOption { .. }));
    }
}
