//! Remote directory over SFTP.
//!
//! One SSH session carries one `sftp` subsystem channel; every operation is
//! an SFTP request on it, so SFTP-only and chrooted accounts work.

use crate::backend::{Backend, BackendType, FileEntry, sort_newest_first};
use crate::glob;
use crate::options::{self, SshOptions};
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client;
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tierdump_core::{BackendConfig, Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

struct ClientHandler {
    host: String,
    port: u16,
    known_hosts_check: bool,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if !self.known_hosts_check {
            return Ok(true);
        }
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => Ok(known),
            Err(e) => {
                warn!(host = %self.host, error = %e, "Server key rejected");
                Ok(false)
            }
        }
    }
}

pub struct SshBackend {
    name: String,
    host: String,
    root: String,
    session: Mutex<client::Handle<ClientHandler>>,
    sftp: SftpSession,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl SshBackend {
    /// Connects, authenticates and makes sure the remote directory exists.
    pub async fn connect(config: &BackendConfig, cancel: CancellationToken) -> Result<Self> {
        options::require(config, &SshOptions::REQUIRED)?;
        let opts: SshOptions = options::decode(config)?;

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            preferred: if opts.use_compression {
                russh::Preferred::COMPRESSED
            } else {
                russh::Preferred::DEFAULT
            },
            ..Default::default()
        });

        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((opts.host.as_str(), opts.port)),
        )
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {}:{}", opts.host, opts.port)))?
        .map_err(|e| {
            Error::ConnectionFailed(format!("{}:{}: {}", opts.host, opts.port, e))
        })?;

        let handler = ClientHandler {
            host: opts.host.clone(),
            port: opts.port,
            known_hosts_check: opts.known_hosts_check,
        };
        let mut session = client::connect_stream(ssh_config, stream, handler)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("SSH handshake with {}: {}", opts.host, e)))?;

        let authenticated = if let Some(key_path) = opts.key_path.as_deref().filter(|p| !p.is_empty()) {
            let key = load_private_key(Path::new(key_path), opts.key_passphrase.as_deref()).await?;
            session
                .authenticate_publickey(&opts.user, Arc::new(key))
                .await
                .map_err(|e| Error::AuthFailed(format!("{}@{}: {}", opts.user, opts.host, e)))?
        } else if let Some(password) = &opts.password {
            session
                .authenticate_password(&opts.user, password)
                .await
                .map_err(|e| Error::AuthFailed(format!("{}@{}: {}", opts.user, opts.host, e)))?
        } else {
            return Err(Error::MissingOption {
                backend: config.name.clone(),
                option: "password or key_path".to_string(),
            });
        };

        if !authenticated {
            return Err(Error::AuthFailed(format!(
                "authentication rejected for {}@{}",
                opts.user, opts.host
            )));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", opts.host, e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: sftp subsystem: {}", opts.host, e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: sftp handshake: {}", opts.host, e)))?;

        let backend = Self {
            name: config.name.clone(),
            host: opts.host,
            root: opts.remote_path.trim_end_matches('/').to_string(),
            session: Mutex::new(session),
            sftp,
            retry: RetryConfig::default(),
            cancel,
        };

        let root = backend.root.clone();
        backend.ensure_dir(&root).await?;

        debug!(backend = %backend.name, host = %backend.host, root = %backend.root, "Connected");
        Ok(backend)
    }

    fn remote_path(&self, path: &str) -> Result<String> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(Error::InvalidConfig(format!(
                "backend {}: path '{}' must be relative to the backend root",
                self.name, path
            )));
        }
        Ok(format!("{}/{}", self.root, path))
    }

    /// Creates `dir` and its missing parents.
    async fn ensure_dir(&self, dir: &str) -> Result<()> {
        for prefix in dir_prefixes(dir) {
            if self.sftp.metadata(prefix.clone()).await.is_ok() {
                continue;
            }
            // A parent outside a chroot may refuse creation; only the final
            // check decides.
            if let Err(e) = self.sftp.create_dir(prefix.clone()).await {
                debug!(backend = %self.name, dir = %prefix, error = %e, "create_dir failed");
            }
        }

        match self.sftp.metadata(dir.to_string()).await {
            Ok(attrs) if attrs.is_dir() => Ok(()),
            Ok(_) => Err(Error::Backend(format!("{} is not a directory", dir))),
            Err(e) => Err(map_sftp_error(e, "create directory", dir)),
        }
    }

    async fn send_file(&self, source: &Path, temp: &str) -> Result<()> {
        let mut local = tokio::fs::File::open(source).await.map_err(|e| {
            Error::Backend(format!("failed to open {}: {}", source.display(), e))
        })?;
        let mut remote = self
            .sftp
            .create(temp.to_string())
            .await
            .map_err(|e| map_sftp_error(e, "create", temp))?;

        tokio::io::copy(&mut local, &mut remote)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("failed to write {}: {}", temp, e)))?;
        remote
            .shutdown()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("failed to close {}: {}", temp, e)))
    }

    /// Renames `temp` over `target`. SFTP v3 servers refuse to rename onto
    /// an existing file, so a stale target is removed and the rename retried.
    async fn replace(&self, temp: &str, target: &str) -> Result<()> {
        match self.sftp.rename(temp.to_string(), target.to_string()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                if self.sftp.metadata(target.to_string()).await.is_err() {
                    return Err(map_sftp_error(first, "rename", temp));
                }
                self.sftp
                    .remove_file(target.to_string())
                    .await
                    .map_err(|e| map_sftp_error(e, "replace", target))?;
                self.sftp
                    .rename(temp.to_string(), target.to_string())
                    .await
                    .map_err(|e| map_sftp_error(e, "rename", temp))
            }
        }
    }

    async fn upload_once(&self, source: &Path, dest: &str) -> Result<()> {
        let target = self.remote_path(dest)?;
        let temp = format!("{}.tmp", target);

        if let Some(parent) = Path::new(&target).parent() {
            let parent = parent.to_string_lossy();
            if parent != self.root {
                self.ensure_dir(&parent).await?;
            }
        }

        let (temp, target) = (&temp, &target);
        staged_upload(
            self.send_file(source, temp),
            move || self.replace(temp, target),
            move || async move {
                if let Err(e) = self.sftp.remove_file(temp.clone()).await {
                    warn!(backend = %self.name, temp = %temp, error = %e, "Failed to remove partial upload");
                }
            },
        )
        .await
    }
}

async fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<russh_keys::key::KeyPair> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::InvalidConfig(format!("failed to read key file {}: {}", path.display(), e))
    })?;

    russh_keys::decode_secret_key(&content, passphrase)
        .map_err(|e| Error::AuthFailed(format!("failed to decode key {}: {}", path.display(), e)))
}

/// Sends to a temp name, then moves it into place. Whichever step fails,
/// `cleanup` runs before the error is returned.
async fn staged_upload<S, R, RF, C, CF>(send: S, replace: R, cleanup: C) -> Result<()>
where
    S: Future<Output = Result<()>>,
    R: FnOnce() -> RF,
    RF: Future<Output = Result<()>>,
    C: FnOnce() -> CF,
    CF: Future<Output = ()>,
{
    let result = match send.await {
        Ok(()) => replace().await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        cleanup().await;
    }
    result
}

/// Every ancestor of `dir` followed by `dir` itself, outermost first.
fn dir_prefixes(dir: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    if dir.starts_with('/') {
        current.push('/');
    }
    for component in dir.split('/').filter(|c| !c.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(component);
        prefixes.push(current.clone());
    }
    prefixes
}

fn map_status(code: StatusCode, message: &str, action: &str, path: &str) -> Error {
    let detail = format!("failed to {} {}: {}", action, path, message);
    match code {
        StatusCode::NoSuchFile => Error::not_found(path),
        StatusCode::PermissionDenied => Error::PermissionDenied(detail),
        StatusCode::NoConnection | StatusCode::ConnectionLost => Error::ConnectionFailed(detail),
        _ => Error::Backend(detail),
    }
}

fn map_sftp_error(err: SftpError, action: &str, path: &str) -> Error {
    match err {
        SftpError::Status(status) => {
            map_status(status.status_code, &status.error_message, action, path)
        }
        SftpError::Timeout => Error::Timeout(format!("{} {}", action, path)),
        other => Error::ConnectionFailed(format!("failed to {} {}: {}", action, path, other)),
    }
}

fn entry_from_attrs(path: &str, size: Option<u64>, mtime: Option<u32>) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        size: size.unwrap_or(0),
        modified: mtime
            .and_then(|t| DateTime::from_timestamp(i64::from(t), 0))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    }
}

#[async_trait]
impl Backend for SshBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Ssh
    }

    async fn write(&self, source: &Path, dest: &str) -> Result<()> {
        let operation = format!("{} upload {}", self.name, dest);
        retry_with_backoff(&self.retry, &self.cancel, &operation, || {
            self.upload_once(source, dest)
        })
        .await?;

        debug!(backend = %self.name, dest, "Uploaded file");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.remote_path(path)?;
        self.sftp
            .remove_file(target)
            .await
            .map_err(|e| map_sftp_error(e, "delete", path))
    }

    async fn list(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        let dir = match self.sftp.read_dir(self.root.clone()).await {
            Ok(dir) => dir,
            Err(e) => {
                let err = map_sftp_error(e, "list", &self.root);
                return if err.is_not_found() { Ok(Vec::new()) } else { Err(err) };
            }
        };

        let mut entries: Vec<FileEntry> = dir
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let attrs = entry.metadata();
                entry_from_attrs(&entry.file_name(), attrs.size, attrs.mtime)
            })
            .filter(|e| e.size > 0 && glob::matches(&e.path, pattern))
            .collect();

        sort_newest_first(&mut entries);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let target = self.remote_path(path)?;
        let attrs = self
            .sftp
            .metadata(target)
            .await
            .map_err(|e| map_sftp_error(e, "stat", path))?;
        Ok(entry_from_attrs(path, attrs.size, attrs.mtime))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.sftp.close().await {
            debug!(backend = %self.name, error = %e, "Failed to close sftp channel");
        }
        let session = self.session.lock().await;
        session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::Backend(format!("failed to disconnect from {}: {}", self.host, e)))
    }
}
