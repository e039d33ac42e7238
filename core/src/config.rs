use crate::tier::{RetentionTier, Tier};
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_MAX_CONCURRENT_BACKUPS: usize = 3;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_FORMAT: &str = "json";
pub const DEFAULT_LOCAL_BACKEND: &str = "default_local";

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["json", "console"];
const DATABASE_NAME_PATTERN: &str = "^[a-zA-Z0-9_-]+$";

fn default_true() -> bool {
    true
}

/// One storage destination as written in the configuration file.
///
/// `options` stays weakly typed here; each backend decodes the keys it
/// understands when it is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_dir: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            enabled: true,
            base_dir: String::new(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalDefaults {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub retention_tiers: Vec<RetentionTier>,
    #[serde(default)]
    pub pgpass_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub destinations: Vec<BackendConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub retention_tiers: Vec<RetentionTier>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Destination names this database is written to. Empty means every
    /// configured destination.
    #[serde(default)]
    pub storage_destinations: Vec<String>,
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user: user.into(),
            host: host.into(),
            port: None,
            retention_tiers: Vec::new(),
            enabled: None,
            storage_destinations: Vec::new(),
        }
    }

    pub fn port(&self, defaults: &GlobalDefaults) -> u16 {
        self.port.or(defaults.port).unwrap_or(DEFAULT_PORT)
    }

    /// Database tiers win over the global defaults as a whole list.
    pub fn retention_tiers<'a>(&'a self, defaults: &'a GlobalDefaults) -> &'a [RetentionTier] {
        if self.retention_tiers.is_empty() {
            &defaults.retention_tiers
        } else {
            &self.retention_tiers
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Legacy single local destination, used when `storage.destinations`
    /// is empty.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub global_defaults: GlobalDefaults,
    #[serde(default)]
    pub max_concurrent_backups: Option<usize>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

impl Config {
    /// Reads a configuration file. Files ending in `.toml` are parsed as
    /// TOML, everything else as JSON. The result is not validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            Self::from_toml(&contents)
        } else {
            Self::from_json(&contents)
        };
        let config =
            config.map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        debug!(
            path = %path.display(),
            databases = config.databases.len(),
            destinations = config.storage.destinations.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse JSON config: {}", e)))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse TOML config: {}", e)))
    }

    /// Checks everything deserialisation alone cannot. Returns the first
    /// problem found.
    pub fn validate(&self) -> Result<()> {
        let name_re = Regex::new(DATABASE_NAME_PATTERN)
            .map_err(|e| Error::Other(format!("invalid name pattern: {}", e)))?;

        if self.max_concurrent_backups == Some(0) {
            return Err(Error::InvalidConfig(
                "max_concurrent_backups must be at least 1".to_string(),
            ));
        }
        if let Some(level) = &self.log_level {
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "log_level must be one of {:?}, got '{}'",
                    LOG_LEVELS, level
                )));
            }
        }
        if let Some(format) = &self.log_format {
            if !LOG_FORMATS.contains(&format.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "log_format must be one of {:?}, got '{}'",
                    LOG_FORMATS, format
                )));
            }
        }
        if self.global_defaults.port == Some(0) {
            return Err(Error::InvalidConfig(
                "global_defaults.port must be between 1 and 65535".to_string(),
            ));
        }
        validate_tiers("global_defaults", &self.global_defaults.retention_tiers)?;

        let mut destination_names = HashSet::new();
        for dest in &self.storage.destinations {
            if dest.name.is_empty() {
                return Err(Error::InvalidConfig("destination name is empty".to_string()));
            }
            if dest.kind.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "destination '{}' has no type",
                    dest.name
                )));
            }
            if !destination_names.insert(dest.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate destination name '{}'",
                    dest.name
                )));
            }
        }

        if self.storage.destinations.is_empty() && self.backup_dir.is_none() {
            return Err(Error::InvalidConfig(
                "either backup_dir or storage.destinations must be set".to_string(),
            ));
        }

        let mut database_names = HashSet::new();
        for db in &self.databases {
            if !name_re.is_match(&db.name) || db.name.contains(crate::filename::SEPARATOR) {
                return Err(Error::InvalidConfig(format!(
                    "invalid database name '{}': must match {} and not contain '{}'",
                    db.name,
                    DATABASE_NAME_PATTERN,
                    crate::filename::SEPARATOR
                )));
            }
            if !database_names.insert(db.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate database '{}'",
                    db.name
                )));
            }
            if db.user.is_empty() || db.host.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "database '{}' requires user and host",
                    db.name
                )));
            }
            if db.port == Some(0) {
                return Err(Error::InvalidConfig(format!(
                    "database '{}': port must be between 1 and 65535",
                    db.name
                )));
            }
            validate_tiers(&db.name, &db.retention_tiers)?;

            for dest in &db.storage_destinations {
                if !destination_names.contains(dest.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "database '{}' references unknown destination '{}'",
                        db.name, dest
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn max_concurrent_backups(&self) -> usize {
        self.max_concurrent_backups
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_BACKUPS)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_format(&self) -> &str {
        self.log_format.as_deref().unwrap_or(DEFAULT_LOG_FORMAT)
    }

    pub fn pgpass_file(&self) -> Option<&Path> {
        self.global_defaults.pgpass_file.as_deref()
    }

    /// `storage.temp_dir`, else `<backup_dir>/.tmp`, else the system temp
    /// directory.
    pub fn temp_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.temp_dir {
            return dir.clone();
        }
        if let Some(dir) = &self.backup_dir {
            return dir.join(".tmp");
        }
        std::env::temp_dir().join("tierdump")
    }

    pub fn enabled_databases(&self) -> impl Iterator<Item = &DatabaseConfig> {
        self.databases.iter().filter(|db| db.is_enabled())
    }

    /// Destinations a database is written to. Falls back to a single local
    /// destination rooted at `backup_dir` when no destinations are
    /// configured.
    pub fn destinations_for(&self, db: &DatabaseConfig) -> Vec<BackendConfig> {
        if self.storage.destinations.is_empty() {
            return match &self.backup_dir {
                Some(dir) => vec![
                    BackendConfig::new(DEFAULT_LOCAL_BACKEND, "local")
                        .with_base_dir(dir.to_string_lossy()),
                ],
                None => Vec::new(),
            };
        }

        self.storage
            .destinations
            .iter()
            .filter(|d| {
                db.storage_destinations.is_empty() || db.storage_destinations.contains(&d.name)
            })
            .cloned()
            .collect()
    }
}

fn validate_tiers(owner: &str, tiers: &[RetentionTier]) -> Result<()> {
    let mut seen = HashSet::new();
    for rt in tiers {
        if rt.tier == Tier::Default {
            return Err(Error::InvalidConfig(format!(
                "{}: tier 'default' cannot be configured",
                owner
            )));
        }
        if !seen.insert(rt.tier) {
            return Err(Error::InvalidConfig(format!(
                "{}: tier '{}' listed more than once",
                owner, rt.tier
            )));
        }
    }
    Ok(())
}
