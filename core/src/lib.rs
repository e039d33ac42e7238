pub mod config;
pub mod error;
pub mod filename;
pub mod tier;

pub use config::{BackendConfig, Config, DatabaseConfig, GlobalDefaults, StorageConfig};
pub use error::{Error, ErrorClass, Result};
pub use filename::{BackupFilename, BackupFilenameComponents};
pub use tier::{RetentionTier, TIER_ORDER, Tier};
