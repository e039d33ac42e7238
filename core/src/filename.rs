//! Backup filename codec.
//!
//! Three on-disk shapes are understood:
//!
//! ```text
//! mydb--daily--2024-12-17T14-30-45.backup   tagged
//! mydb--2024-12-17T14-30-45.backup          untagged
//! my_db_2024-12-17_14-30-45.backup          legacy (read-only)
//! ```
//!
//! Only the first two are ever written. A filename that cannot be decoded
//! is an error; callers never see a placeholder timestamp.

use crate::{Error, Result, Tier};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;

pub const EXTENSION: &str = "backup";
pub const SEPARATOR: &str = "--";
const LEGACY_SEPARATOR: char = '_';
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// A decoded backup filename, by on-disk shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupFilename {
    Tagged {
        database: String,
        tier: Tier,
        timestamp: DateTime<Utc>,
    },
    Untagged {
        database: String,
        timestamp: DateTime<Utc>,
    },
    Legacy {
        database: String,
        timestamp: DateTime<Utc>,
    },
}

/// Flat view over a decoded filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFilenameComponents {
    pub database: String,
    pub tier: Option<Tier>,
    pub timestamp: DateTime<Utc>,
    pub has_tier: bool,
}

impl BackupFilename {
    /// Decodes a filename or path. Dispatches on the presence of `--`,
    /// falling back to the legacy underscore format.
    pub fn decode(filename: &str) -> Result<Self> {
        let base = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid(filename, "not a file name"))?;
        let stem = strip_extension(base);

        if stem.contains(SEPARATOR) {
            decode_current(filename, stem)
        } else {
            decode_legacy(filename, stem)
        }
    }

    /// Builds a current-format filename value.
    pub fn new(database: impl Into<String>, tier: Option<Tier>, timestamp: DateTime<Utc>) -> Self {
        let database = database.into();
        match tier {
            Some(tier) => BackupFilename::Tagged {
                database,
                tier,
                timestamp,
            },
            None => BackupFilename::Untagged {
                database,
                timestamp,
            },
        }
    }

    /// Encodes in the current format. A legacy value is re-encoded as
    /// untagged, never in the underscore layout.
    pub fn encode(&self) -> Result<String> {
        encode(self.database(), self.tier(), self.timestamp())
    }

    pub fn database(&self) -> &str {
        match self {
            BackupFilename::Tagged { database, .. }
            | BackupFilename::Untagged { database, .. }
            | BackupFilename::Legacy { database, .. } => database,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BackupFilename::Tagged { timestamp, .. }
            | BackupFilename::Untagged { timestamp, .. }
            | BackupFilename::Legacy { timestamp, .. } => *timestamp,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            BackupFilename::Tagged { tier, .. } => Some(*tier),
            _ => None,
        }
    }

    pub fn components(&self) -> BackupFilenameComponents {
        BackupFilenameComponents {
            database: self.database().to_string(),
            tier: self.tier(),
            timestamp: self.timestamp(),
            has_tier: self.tier().is_some(),
        }
    }
}

fn strip_extension(base: &str) -> &str {
    match base.rfind('.') {
        Some(idx) => &base[..idx],
        None => base,
    }
}

fn invalid(filename: &str, reason: impl Into<String>) -> Error {
    Error::InvalidFilename {
        filename: filename.to_string(),
        reason: reason.into(),
    }
}

fn parse_timestamp(filename: &str, raw: &str, format: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, format)
        .map(|naive| naive.and_utc())
        .map_err(|e| invalid(filename, format!("failed to parse timestamp '{}': {}", raw, e)))
}

fn decode_current(filename: &str, stem: &str) -> Result<BackupFilename> {
    let parts: Vec<&str> = stem.split(SEPARATOR).collect();
    if parts[0].is_empty() {
        return Err(invalid(filename, "missing database name"));
    }

    match parts.as_slice() {
        [database, tier, raw] => {
            let tier = tier
                .parse::<Tier>()
                .map_err(|reason| invalid(filename, reason))?;
            Ok(BackupFilename::Tagged {
                database: database.to_string(),
                tier,
                timestamp: parse_timestamp(filename, raw, TIMESTAMP_FORMAT)?,
            })
        }
        [database, raw] => Ok(BackupFilename::Untagged {
            database: database.to_string(),
            timestamp: parse_timestamp(filename, raw, TIMESTAMP_FORMAT)?,
        }),
        _ => Err(invalid(
            filename,
            format!(
                "expected 2 or 3 parts separated by '{}', got {}",
                SEPARATOR,
                parts.len()
            ),
        )),
    }
}

// The database name may itself contain underscores, so the date and time
// are always the last two segments.
fn decode_legacy(filename: &str, stem: &str) -> Result<BackupFilename> {
    let parts: Vec<&str> = stem.split(LEGACY_SEPARATOR).collect();
    if parts.len() < 3 {
        return Err(invalid(
            filename,
            format!(
                "expected at least 3 parts separated by '{}', got {}",
                LEGACY_SEPARATOR,
                parts.len()
            ),
        ));
    }

    let split = parts.len() - 2;
    let database = parts[..split].join("_");
    if database.is_empty() {
        return Err(invalid(filename, "missing database name"));
    }

    let raw = format!("{}_{}", parts[split], parts[split + 1]);
    Ok(BackupFilename::Legacy {
        database,
        timestamp: parse_timestamp(filename, &raw, LEGACY_TIMESTAMP_FORMAT)?,
    })
}

/// Decodes a filename into its flat components.
pub fn decode(filename: &str) -> Result<BackupFilenameComponents> {
    BackupFilename::decode(filename).map(|f| f.components())
}

/// Encodes a backup filename in the current format, tagged when `tier` is
/// set. Sub-second precision is dropped.
pub fn encode(database: &str, tier: Option<Tier>, timestamp: DateTime<Utc>) -> Result<String> {
    validate_database_name(database)?;
    let stamp = timestamp.format(TIMESTAMP_FORMAT);
    Ok(match tier {
        Some(tier) => format!("{database}{SEPARATOR}{tier}{SEPARATOR}{stamp}.{EXTENSION}"),
        None => format!("{database}{SEPARATOR}{stamp}.{EXTENSION}"),
    })
}

/// Rejects names that would not decode back to themselves.
pub fn validate_database_name(database: &str) -> Result<()> {
    if database.is_empty() {
        return Err(Error::InvalidConfig("database name is empty".to_string()));
    }
    if database.contains(SEPARATOR) {
        return Err(Error::InvalidConfig(format!(
            "database name '{}' must not contain '{}'",
            database, SEPARATOR
        )));
    }
    if database.contains(['/', '\\', '.']) {
        return Err(Error::InvalidConfig(format!(
            "database name '{}' must not contain path characters",
            database
        )));
    }
    Ok(())
}

pub fn extract_date(filename: &str) -> Result<DateTime<Utc>> {
    BackupFilename::decode(filename).map(|f| f.timestamp())
}

/// Pattern matching every backup of a database, in any format.
pub fn backup_pattern(database: &str) -> String {
    format!("{database}*.{EXTENSION}")
}

/// Pattern matching tagged backups of one tier.
pub fn tier_pattern(database: &str, tier: Tier) -> String {
    format!("{database}{SEPARATOR}{tier}{SEPARATOR}*.{EXTENSION}")
}

/// True when the filename decodes and names exactly this database, so that
/// `mydb` does not claim `mydb_test` backups.
pub fn belongs_to_database(filename: &str, database: &str) -> bool {
    BackupFilename::decode(filename)
        .map(|f| f.database() == database)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_extract_date_accepts_all_formats() {
        let cases = [
            ("mydb_2024-12-17_03-00-00.backup", at(2024, 12, 17, 3, 0, 0)),
            ("/backups/database_2024-01-01_00-00-00.backup", at(2024, 1, 1, 0, 0, 0)),
            ("my_prod_db_2024-12-17_14-30-45.backup", at(2024, 12, 17, 14, 30, 45)),
            ("mydb--2024-12-17T03-00-00.backup", at(2024, 12, 17, 3, 0, 0)),
            ("my_very_long_db_name--2024-12-17T14-30-45.backup", at(2024, 12, 17, 14, 30, 45)),
            ("/backups/prod_db--2024-01-01T00-00-00.backup", at(2024, 1, 1, 0, 0, 0)),
            ("my-prod-db--2024-12-17T14-30-45.backup", at(2024, 12, 17, 14, 30, 45)),
            ("mydb--hourly--2024-12-17T14-30-45.backup", at(2024, 12, 17, 14, 30, 45)),
            ("mydb_2024-12-17_03-00-00", at(2024, 12, 17, 3, 0, 0)),
        ];
        for (filename, want) in cases {
            assert_eq!(extract_date(filename).unwrap(), want, "{}", filename);
        }
    }

    #[test]
    fn test_extract_date_rejects_malformed() {
        for filename in [
            "database.backup",
            "mydb_invalid-date.backup",
            "mydb_2024-12.backup",
            "mydb--invalid-date.backup",
            "mydb--daily--2024-13-45T99-00-00.backup",
            "a--b--c--2024-12-17T03-00-00.backup",
            "--daily--2024-12-17T03-00-00.backup",
        ] {
            let err = extract_date(filename).unwrap_err();
            assert!(
                matches!(err, Error::InvalidFilename { .. }),
                "{} gave {:?}",
                filename,
                err
            );
        }
    }

    #[test]
    fn test_unknown_tier_tag_is_rejected() {
        let err = decode("mydb--fortnightly--2024-12-17T03-00-00.backup").unwrap_err();
        assert!(err.to_string().contains("fortnightly"));
    }

    #[test]
    fn test_legacy_name_with_underscores() {
        let parsed = BackupFilename::decode("my_prod_db_2024-12-17_14-30-45.backup").unwrap();
        assert_eq!(
            parsed,
            BackupFilename::Legacy {
                database: "my_prod_db".to_string(),
                timestamp: at(2024, 12, 17, 14, 30, 45),
            }
        );
        assert!(!parsed.components().has_tier);
    }

    #[test]
    fn test_tagged_round_trip() {
        let ts = at(2024, 12, 17, 14, 30, 45);
        for tier in crate::TIER_ORDER {
            for db in ["mydb", "my_prod_db", "my-prod-db"] {
                let name = encode(db, Some(tier), ts).unwrap();
                let parsed = decode(&name).unwrap();
                assert_eq!(
                    parsed,
                    BackupFilenameComponents {
                        database: db.to_string(),
                        tier: Some(tier),
                        timestamp: ts,
                        has_tier: true,
                    }
                );
            }
        }
    }

    #[test]
    fn test_untagged_round_trip() {
        let ts = at(2025, 2, 28, 23, 59, 59);
        let name = encode("my_prod_db", None, ts).unwrap();
        assert_eq!(name, "my_prod_db--2025-02-28T23-59-59.backup");
        let parsed = decode(&name).unwrap();
        assert_eq!(parsed.database, "my_prod_db");
        assert_eq!(parsed.tier, None);
        assert_eq!(parsed.timestamp, ts);
        assert!(!parsed.has_tier);
    }

    #[test]
    fn test_legacy_decode_matches_legacy_layout() {
        let ts = at(2023, 6, 1, 8, 5, 9);
        let name = format!("{}_{}.backup", "old_db", ts.format(LEGACY_TIMESTAMP_FORMAT));
        let parsed = decode(&name).unwrap();
        assert_eq!(parsed.database, "old_db");
        assert_eq!(parsed.timestamp, ts);
        assert_eq!(parsed.tier, None);
    }

    #[test]
    fn test_enum_encode_round_trip() {
        let ts = at(2024, 3, 9, 1, 2, 3);
        let tagged = BackupFilename::new("mydb", Some(Tier::Monthly), ts);
        assert_eq!(BackupFilename::decode(&tagged.encode().unwrap()).unwrap(), tagged);

        let legacy = BackupFilename::decode("old_db_2024-03-09_01-02-03.backup").unwrap();
        assert_eq!(legacy.encode().unwrap(), "old_db--2024-03-09T01-02-03.backup");
    }

    #[test]
    fn test_encode_formats() {
        let ts = at(2024, 12, 17, 14, 30, 45);
        assert_eq!(
            encode("mydb", Some(Tier::Daily), ts).unwrap(),
            "mydb--daily--2024-12-17T14-30-45.backup"
        );
        assert!(encode("", None, ts).is_err());
        assert!(encode("my--db", None, ts).is_err());
        assert!(encode("../etc", None, ts).is_err());
    }

    #[test]
    fn test_patterns() {
        assert_eq!(backup_pattern("mydb"), "mydb*.backup");
        assert_eq!(tier_pattern("mydb", Tier::Weekly), "mydb--weekly--*.backup");
    }

    #[test]
    fn test_belongs_to_database() {
        assert!(belongs_to_database("mydb--2025-12-17T03-00-00.backup", "mydb"));
        assert!(belongs_to_database("my_prod_db_2025-12-17_03-00-00.backup", "my_prod_db"));
        assert!(belongs_to_database("mydb--daily--2025-12-17T03-00-00.backup", "mydb"));
        assert!(!belongs_to_database("otherdb--2025-12-17T03-00-00.backup", "mydb"));
        assert!(!belongs_to_database("mydb_test--2025-12-17T03-00-00.backup", "mydb"));
        assert!(!belongs_to_database("mydb--garbage.backup", "mydb"));
    }
}
