use crate::backend::{Backend, BackendType, FileEntry, sort_newest_first};
use crate::glob;
use crate::options::{self, S3Options};
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::{Builder as S3ConfigBuilder, Credentials},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
};
use chrono::{DateTime, Utc};
use std::path::Path;
use tierdump_core::{BackendConfig, Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection settings shared by every S3-compatible destination.
#[derive(Clone)]
pub struct S3Settings {
    pub name: String,
    pub backend_type: BackendType,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub force_path_style: bool,
}

pub struct S3Backend {
    name: String,
    backend_type: BackendType,
    client: Client,
    region: String,
    bucket: String,
    prefix: String,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl S3Backend {
    pub fn new(settings: S3Settings, cancel: CancellationToken) -> Self {
        let credentials = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "tierdump",
        );

        let mut builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .force_path_style(settings.force_path_style);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        debug!(
            backend = %settings.name,
            bucket = %settings.bucket,
            prefix = %settings.prefix,
            endpoint = settings.endpoint.as_deref().unwrap_or("aws"),
            "Configured S3 client"
        );

        Self {
            name: settings.name,
            backend_type: settings.backend_type,
            client: Client::from_conf(builder.build()),
            region: settings.region,
            bucket: settings.bucket,
            prefix: settings.prefix,
            retry: RetryConfig::default(),
            cancel,
        }
    }

    pub fn from_config(config: &BackendConfig, cancel: CancellationToken) -> Result<Self> {
        options::require(config, &S3Options::REQUIRED)?;
        let opts: S3Options = options::decode(config)?;

        let settings = S3Settings {
            name: config.name.clone(),
            backend_type: BackendType::S3,
            region: opts.region,
            bucket: opts.bucket,
            access_key_id: opts.access_key_id,
            secret_access_key: opts.secret_access_key,
            endpoint: opts
                .endpoint
                .filter(|e| !e.is_empty())
                .map(|e| endpoint_url(&e, opts.use_ssl)),
            prefix: options::join_prefix(opts.prefix.as_deref(), &config.base_dir),
            force_path_style: opts.force_path_style,
        };
        Ok(Self::new(settings, cancel))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn full_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .and_then(|k| k.strip_prefix('/'))
                .unwrap_or(key)
        }
    }
}

/// Adds a scheme to bare `host:port` endpoints.
pub(crate) fn endpoint_url(endpoint: &str, use_ssl: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if use_ssl {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

/// Maps an SDK failure onto the retry classes: transport problems are
/// retryable, credential problems are critical.
fn classify<E, R>(err: SdkError<E, R>, action: &str, path: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = format!("failed to {} {}: {}", action, path, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => return Error::Timeout(message),
        SdkError::DispatchFailure(_) => return Error::ConnectionFailed(message),
        _ => {}
    }

    match err.code() {
        Some("NoSuchKey" | "NotFound") => Error::not_found(path),
        Some(
            "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken"
            | "InvalidClientTokenId",
        ) => Error::AuthFailed(message),
        Some("AccessDenied") => Error::PermissionDenied(message),
        Some("NoSuchBucket") => Error::InvalidConfig(message),
        Some("SlowDown" | "RequestTimeout" | "ServiceUnavailable" | "InternalError") => {
            Error::ConnectionFailed(message)
        }
        _ => Error::Backend(message),
    }
}

fn to_chrono(t: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    t.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        self.backend_type.clone()
    }

    async fn write(&self, source: &Path, dest: &str) -> Result<()> {
        let key = self.full_key(dest);
        let operation = format!("{} upload {}", self.name, dest);

        retry_with_backoff(&self.retry, &self.cancel, &operation, || {
            let key = key.clone();
            async move {
                let body = ByteStream::from_path(source).await.map_err(|e| {
                    Error::Backend(format!("failed to open {}: {}", source.display(), e))
                })?;
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| classify(e, "upload", dest))?;
                Ok::<(), Error>(())
            }
        })
        .await?;

        debug!(backend = %self.name, bucket = %self.bucket, key = %key, "Uploaded object");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| classify(e, "delete", path))?;
        Ok(())
    }

    async fn list(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        let list_prefix = self.full_key(glob::literal_prefix(pattern));
        let mut results = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify(e, "list", pattern))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let size = object.size().unwrap_or(0);
                let path = self.relative_key(key);
                if size <= 0 || path.contains('/') || !glob::matches(path, pattern) {
                    continue;
                }

                results.push(FileEntry {
                    path: path.to_string(),
                    size: size as u64,
                    modified: to_chrono(object.last_modified()),
                });
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        sort_newest_first(&mut results);
        Ok(results)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Error::not_found(path)
                } else {
                    classify(e, "stat", path)
                }
            })?;

        Ok(FileEntry {
            path: path.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            modified: to_chrono(response.last_modified()),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
