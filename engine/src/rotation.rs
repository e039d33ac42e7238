//! Retention enforcement.
//!
//! Tagged backups are pruned per tier from their own listing. Untagged and
//! legacy backups carry no tier, so they are bucketed by age instead. A tier
//! that is not configured, or has a retention of 0, is never pruned.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tierdump_backends::Backend;
use tierdump_core::filename::{self, BackupFilename};
use tierdump_core::{Result, RetentionTier, TIER_ORDER, Tier};
use tracing::{debug, error, info, warn};

/// A decoded backup as the retention engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: String,
    pub timestamp: DateTime<Utc>,
    /// Tier tag from the filename, `None` for untagged and legacy files.
    pub creation_tier: Option<Tier>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

impl RotationReport {
    pub fn merge(&mut self, other: RotationReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.failed.is_empty()
    }
}

fn retention_for(tiers: &[RetentionTier], tier: Tier) -> Option<usize> {
    tiers.iter().find(|rt| rt.tier == tier).map(|rt| rt.retention)
}

/// Age-based selection. Buckets every backup by its age at `now`, keeps the
/// newest `retention` per configured bucket and returns the paths to
/// delete, oldest first within each bucket.
pub fn apply_retention(
    backups: &[BackupFile],
    tiers: &[RetentionTier],
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut buckets: BTreeMap<Tier, Vec<&BackupFile>> = BTreeMap::new();
    for backup in backups {
        buckets
            .entry(Tier::categorize(now - backup.timestamp))
            .or_default()
            .push(backup);
    }

    let mut to_delete = Vec::new();
    for tier in TIER_ORDER {
        let Some(bucket) = buckets.get_mut(&tier) else {
            continue;
        };

        let retention = match retention_for(tiers, tier) {
            Some(0) | None => {
                debug!(tier = %tier, count = bucket.len(), "No limit for tier, keeping all");
                continue;
            }
            Some(n) => n,
        };

        if bucket.len() <= retention {
            continue;
        }

        bucket.sort_by_key(|b| b.timestamp);
        let excess = bucket.len() - retention;
        for backup in &bucket[..excess] {
            debug!(tier = %tier, file = %backup.path, "Marking backup for deletion");
            to_delete.push(backup.path.clone());
        }
    }

    to_delete
}

async fn delete_all(
    backend: &dyn Backend,
    paths: impl IntoIterator<Item = String>,
    tier: Tier,
    report: &mut RotationReport,
) {
    for path in paths {
        match backend.delete(&path).await {
            Ok(()) => {
                info!(backend = %backend.name(), tier = %tier, file = %path, "Deleted old backup");
                report.deleted.push(path);
            }
            Err(e) => {
                error!(
                    backend = %backend.name(),
                    tier = %tier,
                    file = %path,
                    error = %e,
                    "Failed to delete old backup"
                );
                report.failed.push(path);
            }
        }
    }
}

/// Tag-based rotation on one backend.
///
/// A listing failure for one tier does not stop the others; the first one
/// is returned once every tier has been processed. Deletion failures are
/// only recorded in the report.
pub async fn apply_retention_with_backend(
    backend: &dyn Backend,
    database: &str,
    tiers: &[RetentionTier],
) -> Result<RotationReport> {
    let mut report = RotationReport::default();
    let mut first_error = None;

    for rt in tiers {
        if rt.is_unlimited() {
            debug!(backend = %backend.name(), tier = %rt.tier, "Unlimited retention, skipping");
            continue;
        }

        let pattern = filename::tier_pattern(database, rt.tier);
        let files = match backend.list(&pattern).await {
            Ok(files) => files,
            Err(e) => {
                warn!(
                    backend = %backend.name(),
                    tier = %rt.tier,
                    error = %e,
                    "Failed to list backups for tier"
                );
                first_error.get_or_insert(e);
                continue;
            }
        };

        // Listings are newest first; anything that does not decode as this
        // tier is left alone.
        let files: Vec<String> = files
            .into_iter()
            .map(|f| f.path)
            .filter(|path| match BackupFilename::decode(path) {
                Ok(name) => name.database() == database && name.tier() == Some(rt.tier),
                Err(e) => {
                    warn!(file = %path, error = %e, "Ignoring unparseable backup name");
                    false
                }
            })
            .collect();

        if files.len() <= rt.retention {
            debug!(
                backend = %backend.name(),
                tier = %rt.tier,
                found = files.len(),
                retention = rt.retention,
                "Retention not exceeded"
            );
            continue;
        }

        info!(
            backend = %backend.name(),
            tier = %rt.tier,
            total = files.len(),
            retention = rt.retention,
            to_delete = files.len() - rt.retention,
            "Applying retention policy"
        );
        delete_all(backend, files.into_iter().skip(rt.retention), rt.tier, &mut report).await;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

/// Age-based rotation of the untagged and legacy backups of `database` on
/// one backend.
pub async fn rotate_untagged(
    backend: &dyn Backend,
    database: &str,
    tiers: &[RetentionTier],
    now: DateTime<Utc>,
) -> Result<RotationReport> {
    let mut report = RotationReport::default();
    let entries = backend.list(&filename::backup_pattern(database)).await?;

    let backups: Vec<BackupFile> = entries
        .into_iter()
        .filter_map(|entry| match BackupFilename::decode(&entry.path) {
            Ok(name) if name.database() == database && name.tier().is_none() => Some(BackupFile {
                timestamp: name.timestamp(),
                creation_tier: None,
                path: entry.path,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!(file = %entry.path, error = %e, "Skipping file with invalid name");
                None
            }
        })
        .collect();

    if backups.is_empty() {
        return Ok(report);
    }

    let to_delete = apply_retention(&backups, tiers, now);
    for path in to_delete {
        let age_tier = backups
            .iter()
            .find(|b| b.path == path)
            .map(|b| Tier::categorize(now - b.timestamp))
            .unwrap_or(Tier::Default);
        delete_all(backend, [path], age_tier, &mut report).await;
    }

    Ok(report)
}

/// Full rotation of one backend: tagged tiers first, then untagged files.
/// Errors are logged, never returned.
pub async fn rotate_backend(
    backend: &dyn Backend,
    database: &str,
    tiers: &[RetentionTier],
    now: DateTime<Utc>,
) -> RotationReport {
    let mut report = RotationReport::default();

    match apply_retention_with_backend(backend, database, tiers).await {
        Ok(tagged) => report.merge(tagged),
        Err(e) => error!(backend = %backend.name(), error = %e, "Tagged rotation failed"),
    }
    match rotate_untagged(backend, database, tiers, now).await {
        Ok(untagged) => report.merge(untagged),
        Err(e) => error!(backend = %backend.name(), error = %e, "Untagged rotation failed"),
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tierdump_backends::MemoryBackend;
    use tierdump_core::Error;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap()
    }

    fn seed_tagged(backend: &MemoryBackend, tier: Tier, count: i64, step: Duration) -> Vec<String> {
        (0..count)
            .map(|i| {
                let ts = now() - step * (i as i32);
                let name = filename::encode("mydb", Some(tier), ts).unwrap();
                backend.insert(&name, 100, ts);
                name
            })
            .collect()
    }

    #[tokio::test]
    async fn test_deletes_exactly_the_oldest_excess() {
        let backend = MemoryBackend::new("mem");
        let names = seed_tagged(&backend, Tier::Daily, 10, Duration::days(1));

        let report = apply_retention_with_backend(
            &backend,
            "mydb",
            &[RetentionTier::new(Tier::Daily, 7)],
        )
        .await
        .unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        let mut expected = names[7..].to_vec();
        expected.sort();
        assert_eq!(deleted, expected);
        assert!(report.failed.is_empty());
        assert_eq!(backend.paths().len(), 7);
    }

    #[tokio::test]
    async fn test_within_retention_is_noop() {
        let backend = MemoryBackend::new("mem");
        seed_tagged(&backend, Tier::Weekly, 3, Duration::days(7));

        let report = apply_retention_with_backend(
            &backend,
            "mydb",
            &[RetentionTier::new(Tier::Weekly, 4)],
        )
        .await
        .unwrap();

        assert!(report.is_empty());
        assert_eq!(backend.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_and_unconfigured_tiers_are_kept() {
        let backend = MemoryBackend::new("mem");
        seed_tagged(&backend, Tier::Hourly, 5, Duration::hours(1));
        seed_tagged(&backend, Tier::Yearly, 5, Duration::days(365));

        let report = apply_retention_with_backend(
            &backend,
            "mydb",
            &[RetentionTier::new(Tier::Yearly, 0)],
        )
        .await
        .unwrap();

        assert!(report.is_empty());
        assert_eq!(backend.paths().len(), 10);
    }

    #[tokio::test]
    async fn test_delete_failures_are_recorded_not_fatal() {
        let backend = MemoryBackend::new("mem");
        let names = seed_tagged(&backend, Tier::Daily, 4, Duration::days(1));
        backend.fail_delete_of(&names[2]);

        let report = apply_retention_with_backend(
            &backend,
            "mydb",
            &[RetentionTier::new(Tier::Daily, 1)],
        )
        .await
        .unwrap();

        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.failed, vec![names[2].clone()]);
    }

    #[tokio::test]
    async fn test_list_failure_continues_other_tiers() {
        let backend = MemoryBackend::new("mem");
        backend.fail_lists_with(|| Error::ConnectionFailed("down".to_string()));

        let err = apply_retention_with_backend(
            &backend,
            "mydb",
            &[
                RetentionTier::new(Tier::Hourly, 1),
                RetentionTier::new(Tier::Daily, 1),
            ],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ConnectionFailed(_)));
        assert_eq!(backend.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_other_databases_are_untouched() {
        let backend = MemoryBackend::new("mem");
        seed_tagged(&backend, Tier::Daily, 3, Duration::days(1));
        let ts = now() - Duration::days(5);
        backend.insert(&filename::encode("mydb_test", Some(Tier::Daily), ts).unwrap(), 1, ts);
        backend.insert(&filename::encode("mydb_test", None, ts).unwrap(), 1, ts);

        let report = rotate_backend(
            &backend,
            "mydb",
            &[RetentionTier::new(Tier::Daily, 1)],
            now(),
        )
        .await;

        assert_eq!(report.deleted.len(), 2);
        assert!(report.deleted.iter().all(|p| p.starts_with("mydb--daily--")));
        assert_eq!(backend.paths().len(), 3);
    }

    #[test]
    fn test_apply_retention_buckets_by_age() {
        let file = |hours: i64| BackupFile {
            path: format!("mydb--{}.backup", hours),
            timestamp: now() - Duration::hours(hours),
            creation_tier: None,
        };
        // Three hourly-aged, two daily-aged, one yearly-aged.
        let backups = vec![file(1), file(2), file(3), file(30), file(50), file(24 * 400)];

        let to_delete = apply_retention(
            &backups,
            &[
                RetentionTier::new(Tier::Hourly, 2),
                RetentionTier::new(Tier::Daily, 1),
            ],
            now(),
        );

        assert_eq!(to_delete, vec!["mydb--3.backup", "mydb--50.backup"]);
    }

    #[tokio::test]
    async fn test_rotate_untagged_only_touches_untagged() {
        let backend = MemoryBackend::new("mem");
        for hours in [1, 2, 3] {
            let ts = now() - Duration::hours(hours);
            backend.insert(&filename::encode("mydb", None, ts).unwrap(), 10, ts);
        }
        let legacy_ts = now() - Duration::hours(4);
        backend.insert("mydb_2025-01-10_08-00-00.backup", 10, legacy_ts);
        seed_tagged(&backend, Tier::Hourly, 3, Duration::hours(1));

        let report = rotate_untagged(
            &backend,
            "mydb",
            &[RetentionTier::new(Tier::Hourly, 2)],
            now(),
        )
        .await
        .unwrap();

        let mut deleted = report.deleted;
        deleted.sort();
        assert_eq!(
            deleted,
            vec![
                "mydb--2025-01-10T09-00-00.backup".to_string(),
                "mydb_2025-01-10_08-00-00.backup".to_string(),
            ]
        );
        assert_eq!(backend.paths().len(), 5);
    }
}
