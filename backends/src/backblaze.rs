//! Backblaze B2 through its S3-compatible API.
//!
//! B2 accepts the account (or application key) id as the access key and the
//! application key as the secret, so this is an [`S3Backend`] with a fixed
//! endpoint and its own backend type.

use crate::backend::BackendType;
use crate::options::{self, BackblazeOptions};
use crate::s3::{S3Backend, S3Settings, endpoint_url};
use tierdump_core::{BackendConfig, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Region used when neither `region` nor a B2 `endpoint` names one.
pub const DEFAULT_REGION: &str = "us-west-004";

pub fn b2_endpoint(region: &str) -> String {
    format!("https://s3.{}.backblazeb2.com", region)
}

/// Pulls `<region>` out of an `s3.<region>.backblazeb2.com` endpoint.
pub fn region_from_endpoint(endpoint: &str) -> Option<String> {
    let host = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest)
        .split(['/', ':'])
        .next()?;
    let region = host.strip_prefix("s3.")?.strip_suffix(".backblazeb2.com")?;
    (!region.is_empty() && !region.contains('.')).then(|| region.to_string())
}

pub fn from_config(config: &BackendConfig, cancel: CancellationToken) -> Result<S3Backend> {
    options::require(config, &BackblazeOptions::REQUIRED)?;
    let opts: BackblazeOptions = options::decode(config)?;

    let configured_endpoint = opts.endpoint.filter(|e| !e.is_empty());
    let region = match opts.region.filter(|r| !r.is_empty()) {
        Some(region) => region,
        None => match configured_endpoint.as_deref().and_then(region_from_endpoint) {
            Some(region) => region,
            None => {
                warn!(
                    backend = %config.name,
                    region = DEFAULT_REGION,
                    "No region or B2 endpoint configured, using default region"
                );
                DEFAULT_REGION.to_string()
            }
        },
    };

    let endpoint = match configured_endpoint {
        Some(endpoint) => endpoint_url(&endpoint, true),
        None => b2_endpoint(&region),
    };

    if let Some(bucket_id) = &opts.bucket_id {
        debug!(backend = %config.name, bucket_id = %bucket_id, "bucket_id is not needed by the S3 API");
    }

    let settings = S3Settings {
        name: config.name.clone(),
        backend_type: BackendType::Backblaze,
        region,
        bucket: opts.bucket_name,
        access_key_id: opts.account_id,
        secret_access_key: opts.application_key,
        endpoint: Some(endpoint),
        prefix: options::join_prefix(opts.prefix.as_deref(), &config.base_dir),
        force_path_style: true,
    };
    Ok(S3Backend::new(settings, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use tierdump_core::Error;

    fn config() -> BackendConfig {
        BackendConfig::new("b2", "backblaze")
            .with_option("account_id", "0012ab")
            .with_option("application_key", "K001")
            .with_option("bucket_name", "pg-backups")
            .with_option("region", "us-west-004")
    }

    #[tokio::test]
    async fn test_from_config() {
        let backend = from_config(&config(), CancellationToken::new()).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Backblaze);
        assert_eq!(backend.bucket(), "pg-backups");
        assert_eq!(backend.name(), "b2");
    }

    #[tokio::test]
    async fn test_region_is_optional() {
        let mut cfg = config();
        cfg.options.remove("region");
        let backend = from_config(&cfg, CancellationToken::new()).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Backblaze);
        assert_eq!(backend.region(), DEFAULT_REGION);

        let cfg = cfg.with_option("endpoint", "https://s3.eu-central-003.backblazeb2.com");
        let backend = from_config(&cfg, CancellationToken::new()).unwrap();
        assert_eq!(backend.region(), "eu-central-003");
    }

    #[tokio::test]
    async fn test_requires_bucket_name() {
        let mut cfg = config();
        cfg.options.remove("bucket_name");
        let err = from_config(&cfg, CancellationToken::new()).err().unwrap();
        assert!(matches!(err, Error::MissingOption { ref option, .. } if option == "bucket_name"));
    }

    #[test]
    fn test_region_from_endpoint() {
        assert_eq!(
            region_from_endpoint("https://s3.us-west-004.backblazeb2.com").as_deref(),
            Some("us-west-004")
        );
        assert_eq!(
            region_from_endpoint("s3.eu-central-003.backblazeb2.com:443/").as_deref(),
            Some("eu-central-003")
        );
        assert_eq!(region_from_endpoint("https://minio.internal:9000"), None);
    }

    #[test]
    fn test_b2_endpoint() {
        assert_eq!(b2_endpoint("us-west-004"), "https://s3.us-west-004.backblazeb2.com");
    }
}
