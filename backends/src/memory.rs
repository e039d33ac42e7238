//! In-memory backend for tests.
//!
//! Records call counts and can be told to fail, panic or respond slowly, so
//! orchestration code can be exercised without real storage.

use crate::backend::{Backend, BackendType, FileEntry, sort_newest_first};
use crate::glob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tierdump_core::{Error, Result};

type ErrorFactory = Box<dyn Fn() -> Error + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct StoredFile {
    size: u64,
    modified: DateTime<Utc>,
}

pub struct MemoryBackend {
    name: String,
    latency: Duration,
    files: Mutex<BTreeMap<String, StoredFile>>,
    write_error: Mutex<Option<ErrorFactory>>,
    list_error: Mutex<Option<ErrorFactory>>,
    failing_deletes: Mutex<HashSet<String>>,
    panic_on_write: AtomicBool,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    lists: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            files: Mutex::new(BTreeMap::new()),
            write_error: Mutex::new(None),
            list_error: Mutex::new(None),
            failing_deletes: Mutex::new(HashSet::new()),
            panic_on_write: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Every call sleeps this long before doing anything.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seeds a stored file without counting a write.
    pub fn insert(&self, path: &str, size: u64, modified: DateTime<Utc>) {
        self.lock_files()
            .insert(path.to_string(), StoredFile { size, modified });
    }

    pub fn fail_writes_with(&self, error: impl Fn() -> Error + Send + Sync + 'static) {
        *lock(&self.write_error) = Some(Box::new(error));
    }

    pub fn fail_lists_with(&self, error: impl Fn() -> Error + Send + Sync + 'static) {
        *lock(&self.list_error) = Some(Box::new(error));
    }

    pub fn fail_delete_of(&self, path: &str) {
        lock(&self.failing_deletes).insert(path.to_string());
    }

    pub fn panic_on_write(&self) {
        self.panic_on_write.store(true, Ordering::SeqCst);
    }

    /// Stored paths in name order, including zero-byte ones.
    pub fn paths(&self) -> Vec<String> {
        self.lock_files().keys().cloned().collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock_files().contains_key(path)
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredFile>> {
        lock(&self.files)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

// A poisoned lock only means another test thread panicked; the data is
// still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Other("memory".to_string())
    }

    async fn write(&self, source: &Path, dest: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if self.panic_on_write.load(Ordering::SeqCst) {
            panic!("memory backend {} panicked on write", self.name);
        }
        if let Some(error) = lock(&self.write_error).as_ref() {
            return Err(error());
        }

        let size = tokio::fs::metadata(source).await?.len();
        self.insert(dest, size, Utc::now());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if lock(&self.failing_deletes).contains(path) {
            return Err(Error::Backend(format!("injected delete failure for {}", path)));
        }
        match self.lock_files().remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(path)),
        }
    }

    async fn list(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if let Some(error) = lock(&self.list_error).as_ref() {
            return Err(error());
        }

        let mut entries: Vec<FileEntry> = self
            .lock_files()
            .iter()
            .filter(|(path, file)| file.size > 0 && glob::matches(path, pattern))
            .map(|(path, file)| FileEntry {
                path: path.clone(),
                size: file.size,
                modified: file.modified,
            })
            .collect();
        sort_newest_first(&mut entries);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        self.delay().await;
        self.lock_files()
            .get(path)
            .map(|file| FileEntry {
                path: path.to_string(),
                size: file.size,
                modified: file.modified,
            })
            .ok_or_else(|| Error::not_found(path))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_list_hides_zero_byte_entries() {
        let backend = MemoryBackend::new("mem");
        let now = Utc::now();
        backend.insert("mydb--2024-12-17T03-00-00.backup", 10, now);
        backend.insert("mydb--2024-12-16T03-00-00.backup", 0, now - ChronoDuration::hours(1));
        backend.insert("mydb--2024-12-15T03-00-00.backup", 5, now - ChronoDuration::hours(2));

        let listed = backend.list("mydb*.backup").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, "mydb--2024-12-17T03-00-00.backup");
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_exists_maps_not_found() {
        let backend = MemoryBackend::new("mem");
        backend.insert("a.backup", 1, Utc::now());
        assert!(backend.exists("a.backup").await.unwrap());
        assert!(!backend.exists("b.backup").await.unwrap());
        assert!(backend.stat("b.backup").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new("mem");
        backend.fail_writes_with(|| Error::ConnectionFailed("down".to_string()));
        let err = backend
            .write(Path::new("/nonexistent"), "a.backup")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
        assert_eq!(backend.write_calls(), 1);
        assert!(backend.paths().is_empty());

        backend.insert("a.backup", 1, Utc::now());
        backend.fail_delete_of("a.backup");
        assert!(backend.delete("a.backup").await.is_err());
        assert!(backend.contains("a.backup"));
    }
}
