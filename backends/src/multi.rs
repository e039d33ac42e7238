use crate::backend::{Backend, BackendType};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierdump_core::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of one operation on one backend.
#[derive(Debug)]
pub struct OperationResult {
    pub backend_name: String,
    pub backend_type: BackendType,
    pub success: bool,
    pub error: Option<Error>,
    pub duration: Duration,
}

impl OperationResult {
    fn new(backend_name: String, backend_type: BackendType, outcome: Result<()>, duration: Duration) -> Self {
        let error = outcome.err();
        Self {
            backend_name,
            backend_type,
            success: error.is_none(),
            error,
            duration,
        }
    }
}

pub fn any_succeeded(results: &[OperationResult]) -> bool {
    results.iter().any(|r| r.success)
}

pub fn success_count(results: &[OperationResult]) -> usize {
    results.iter().filter(|r| r.success).count()
}

/// Fans one operation out to several backends at once.
///
/// Each backend runs in its own task and reports through a channel with
/// room for every result, so a slow or failing backend never holds up the
/// others. Results come back in backend order.
pub struct MultiBackend {
    backends: Vec<Arc<dyn Backend>>,
}

impl MultiBackend {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Copies `source` to `dest` on every backend.
    pub async fn upload(&self, source: &Path, dest: &str) -> Vec<OperationResult> {
        let source: PathBuf = source.to_path_buf();
        let dest = dest.to_string();
        self.fan_out("upload", move |backend| {
            let source = source.clone();
            let dest = dest.clone();
            async move { backend.write(&source, &dest).await }
        })
        .await
    }

    /// Deletes `path` on every backend.
    pub async fn delete(&self, path: &str) -> Vec<OperationResult> {
        let path = path.to_string();
        self.fan_out("delete", move |backend| {
            let path = path.clone();
            async move { backend.delete(&path).await }
        })
        .await
    }

    async fn fan_out<F, Fut>(&self, operation: &'static str, f: F) -> Vec<OperationResult>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let count = self.backends.len();
        if count == 0 {
            return Vec::new();
        }

        let (tx, mut rx) = mpsc::channel::<(usize, OperationResult)>(count);
        let mut tasks = JoinSet::new();

        for (index, backend) in self.backends.iter().enumerate() {
            let tx = tx.clone();
            let name = backend.name().to_string();
            let backend_type = backend.backend_type();
            let work = f(backend.clone());

            tasks.spawn(async move {
                let start = Instant::now();
                let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Backend(format!("{} on {} panicked", operation, name))),
                };
                let result = OperationResult::new(name, backend_type, outcome, start.elapsed());
                // Capacity covers every sender, so this never waits.
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(operation, error = %e, "Backend task did not complete");
            }
        }

        let mut slots: Vec<Option<OperationResult>> = (0..count).map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            slots[index] = Some(result);
        }

        let results: Vec<OperationResult> = slots
            .into_iter()
            .zip(&self.backends)
            .map(|(slot, backend)| {
                slot.unwrap_or_else(|| {
                    OperationResult::new(
                        backend.name().to_string(),
                        backend.backend_type(),
                        Err(Error::Backend(format!("{} task was aborted", operation))),
                        Duration::ZERO,
                    )
                })
            })
            .collect();

        for result in &results {
            match &result.error {
                None => debug!(
                    operation,
                    backend = %result.backend_name,
                    duration_ms = result.duration.as_millis() as u64,
                    "Backend operation succeeded"
                ),
                Some(e) => warn!(
                    operation,
                    backend = %result.backend_name,
                    duration_ms = result.duration.as_millis() as u64,
                    error = %e,
                    "Backend operation failed"
                ),
            }
        }
        info!(
            operation,
            succeeded = success_count(&results),
            total = count,
            "Multi-backend operation finished"
        );

        results
    }
}
