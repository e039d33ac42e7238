use crate::backend::Backend;
use crate::local::LocalBackend;
use crate::s3::S3Backend;
use crate::ssh::SshBackend;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tierdump_core::{BackendConfig, Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Builds a backend from its configuration. The token is handed to the
/// backend so retry waits can be interrupted.
pub type BackendConstructor = Arc<
    dyn Fn(BackendConfig, CancellationToken) -> BoxFuture<'static, Result<Arc<dyn Backend>>>
        + Send
        + Sync,
>;

/// Maps backend kind strings (`local`, `s3`, ...) to constructors.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in kind: `local`, `s3`, `backblaze`
    /// and `ssh`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("local", |config, _cancel| {
            async move {
                let backend = LocalBackend::from_config(&config).await?;
                Ok::<_, Error>(Arc::new(backend) as Arc<dyn Backend>)
            }
            .boxed()
        });
        registry.register("s3", |config, cancel| {
            async move {
                let backend = S3Backend::from_config(&config, cancel)?;
                Ok::<_, Error>(Arc::new(backend) as Arc<dyn Backend>)
            }
            .boxed()
        });
        registry.register("backblaze", |config, cancel| {
            async move {
                let backend = crate::backblaze::from_config(&config, cancel)?;
                Ok::<_, Error>(Arc::new(backend) as Arc<dyn Backend>)
            }
            .boxed()
        });
        registry.register("ssh", |config, cancel| {
            async move {
                let backend = SshBackend::connect(&config, cancel).await?;
                Ok::<_, Error>(Arc::new(backend) as Arc<dyn Backend>)
            }
            .boxed()
        });

        registry
    }

    /// Registers or replaces the constructor for `kind`.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(BackendConfig, CancellationToken) -> BoxFuture<'static, Result<Arc<dyn Backend>>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(kind.to_string(), Arc::new(constructor));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Builds one backend. Disabled configs and unknown kinds are rejected
    /// before any constructor runs.
    pub async fn create(
        &self,
        config: &BackendConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Backend>> {
        if !config.enabled {
            return Err(Error::BackendDisabled {
                name: config.name.clone(),
            });
        }

        let constructor = self
            .constructors
            .get(&config.kind)
            .ok_or_else(|| Error::UnknownBackendType {
                kind: config.kind.clone(),
            })?;

        let backend = constructor(config.clone(), cancel.clone()).await?;
        debug!(backend = %config.name, kind = %config.kind, "Created backend");
        Ok(backend)
    }

    /// Builds every enabled config. On the first failure the backends
    /// already built are closed and the error is returned.
    pub async fn create_all(
        &self,
        configs: &[BackendConfig],
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<dyn Backend>>> {
        let mut backends = Vec::with_capacity(configs.len());

        for config in configs {
            if !config.enabled {
                debug!(backend = %config.name, "Skipping disabled backend");
                continue;
            }

            match self.create(config, cancel).await {
                Ok(backend) => backends.push(backend),
                Err(e) => {
                    warn!(backend = %config.name, error = %e, "Failed to create backend");
                    close_all(&backends).await;
                    return Err(e);
                }
            }
        }

        Ok(backends)
    }
}

/// Closes every backend, logging failures instead of returning them.
pub async fn close_all(backends: &[Arc<dyn Backend>]) {
    for backend in backends {
        if let Err(e) = backend.close().await {
            warn!(backend = %backend.name(), error = %e, "Failed to close backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use std::sync::Mutex;

    fn registry_with_memory(created: Arc<Mutex<Vec<Arc<MemoryBackend>>>>) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register("memory", move |config, _cancel| {
            let created = created.clone();
            async move {
                if config.options.contains_key("fail") {
                    return Err(Error::InvalidConfig("boom".to_string()));
                }
                let backend = Arc::new(MemoryBackend::new(&config.name));
                created.lock().unwrap().push(backend.clone());
                Ok::<_, Error>(backend as Arc<dyn Backend>)
            }
            .boxed()
        });
        registry
    }

    #[tokio::test]
    async fn test_create_rejects_disabled_and_unknown() {
        let registry = registry_with_memory(Arc::default());
        let cancel = CancellationToken::new();

        let err = registry
            .create(&BackendConfig::new("a", "memory").disabled(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::BackendDisabled { .. }));

        let err = registry
            .create(&BackendConfig::new("b", "tape"), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownBackendType { ref kind } if kind == "tape"));

        let backend = registry
            .create(&BackendConfig::new("c", "memory"), &cancel)
            .await
            .unwrap();
        assert_eq!(backend.name(), "c");
    }

    #[tokio::test]
    async fn test_create_all_skips_disabled() {
        let registry = registry_with_memory(Arc::default());
        let configs = vec![
            BackendConfig::new("a", "memory"),
            BackendConfig::new("b", "memory").disabled(),
            BackendConfig::new("c", "memory"),
        ];
        let backends = registry
            .create_all(&configs, &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_create_all_closes_partial_batch() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_memory(created.clone());
        let configs = vec![
            BackendConfig::new("a", "memory"),
            BackendConfig::new("b", "memory"),
            BackendConfig::new("c", "memory").with_option("fail", true),
            BackendConfig::new("d", "memory"),
        ];

        let err = registry
            .create_all(&configs, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let created = created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|b| b.is_closed()));
    }

    #[test]
    fn test_with_defaults_kinds() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec!["backblaze", "local", "s3", "ssh"]);
    }

    #[tokio::test]
    async fn test_default_local_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = BackendRegistry::with_defaults();
        let config = BackendConfig::new("default_local", "local")
            .with_base_dir(dir.path().to_string_lossy());
        let backend = registry
            .create(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backend.backend_type(), crate::BackendType::Local);
        assert!(backend.list("*").await.unwrap().is_empty());
    }
}
