//! Typed views over the free-form `options` map of a destination.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tierdump_core::{BackendConfig, Error, Result};

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Clone, Deserialize)]
pub struct LocalOptions {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Clone, Deserialize)]
pub struct S3Options {
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    #[serde(default)]
    pub force_path_style: bool,
}

impl S3Options {
    pub const REQUIRED: [&'static str; 4] =
        ["region", "bucket", "access_key_id", "secret_access_key"];
}

#[derive(Clone, Deserialize)]
pub struct BackblazeOptions {
    pub account_id: String,
    pub application_key: String,
    pub bucket_name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl BackblazeOptions {
    pub const REQUIRED: [&'static str; 3] = ["account_id", "application_key", "bucket_name"];
}

#[derive(Clone, Deserialize)]
pub struct SshOptions {
    pub host: String,
    pub user: String,
    pub remote_path: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    #[serde(default = "default_true")]
    pub use_compression: bool,
    /// Verify the server key against `~/.ssh/known_hosts`.
    #[serde(default)]
    pub known_hosts_check: bool,
}

impl SshOptions {
    pub const REQUIRED: [&'static str; 3] = ["host", "user", "remote_path"];
}

/// Fails with `MissingOption` for the first required key that is absent,
/// null or an empty string.
pub fn require(config: &BackendConfig, keys: &[&str]) -> Result<()> {
    for key in keys {
        let present = match config.options.get(*key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(Error::MissingOption {
                backend: config.name.clone(),
                option: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Decodes the options map into `T`. Type mismatches surface as
/// `InvalidConfig` naming the destination.
pub fn decode<T: DeserializeOwned>(config: &BackendConfig) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(config.options.clone())).map_err(|e| {
        Error::InvalidConfig(format!("backend {}: invalid options: {}", config.name, e))
    })
}

/// Joins a configured prefix with `base_dir`, dropping empty parts and
/// stray slashes. The result is empty or ends without a slash.
pub fn join_prefix(prefix: Option<&str>, base_dir: &str) -> String {
    [prefix.unwrap_or_default(), base_dir]
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_reports_first_missing_key() {
        let config = BackendConfig::new("offsite", "s3")
            .with_option("region", "us-east-1")
            .with_option("bucket", "");
        let err = require(&config, &S3Options::REQUIRED).unwrap_err();
        match err {
            Error::MissingOption { backend, option } => {
                assert_eq!(backend, "offsite");
                assert_eq!(option, "bucket");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_applies_defaults() {
        let config = BackendConfig::new("nas", "ssh")
            .with_option("host", "nas.local")
            .with_option("user", "backup")
            .with_option("remote_path", "/srv");
        require(&config, &SshOptions::REQUIRED).unwrap();
        let opts: SshOptions = decode(&config).unwrap();
        assert_eq!(opts.port, 22);
        assert!(opts.use_compression);
        assert!(opts.password.is_none());
    }

    #[test]
    fn test_decode_type_mismatch_is_invalid_config() {
        let config = BackendConfig::new("nas", "ssh")
            .with_option("host", "nas.local")
            .with_option("user", "backup")
            .with_option("remote_path", "/srv")
            .with_option("port", json!("not-a-port"));
        let err = decode::<SshOptions>(&config).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_join_prefix() {
        assert_eq!(join_prefix(None, ""), "");
        assert_eq!(join_prefix(Some("backups/"), ""), "backups");
        assert_eq!(join_prefix(Some("/team"), "/pg/"), "team/pg");
        assert_eq!(join_prefix(None, "pg"), "pg");
    }
}
