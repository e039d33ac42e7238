//! Decides which tiers are due for a database.

use crate::rotation::BackupFile;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tierdump_backends::Backend;
use tierdump_core::filename::{self, BackupFilename};
use tierdump_core::{Result, RetentionTier, Tier};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierSchedule {
    /// Tiers to back up now, in configuration order.
    pub due: Vec<Tier>,
    /// When each configured tier next becomes due. Due tiers map to `now`.
    pub next_due: BTreeMap<Tier, DateTime<Utc>>,
}

impl TierSchedule {
    pub fn is_due(&self, tier: Tier) -> bool {
        self.due.contains(&tier)
    }

    pub fn nothing_due(&self) -> bool {
        self.due.is_empty()
    }

    fn all_due(tiers: &[RetentionTier], now: DateTime<Utc>) -> Self {
        if tiers.is_empty() {
            return Self::default_only(now);
        }
        Self {
            due: tiers.iter().map(|rt| rt.tier).collect(),
            next_due: tiers.iter().map(|rt| (rt.tier, now)).collect(),
        }
    }

    fn default_only(now: DateTime<Utc>) -> Self {
        Self {
            due: vec![Tier::Default],
            next_due: BTreeMap::from([(Tier::Default, now)]),
        }
    }
}

/// Tier a backup counts towards: its tag, or the tier its age falls in.
fn effective_tier(backup: &BackupFile, now: DateTime<Utc>) -> Tier {
    backup
        .creation_tier
        .unwrap_or_else(|| Tier::categorize(now - backup.timestamp))
}

/// Pure scheduling decision over a set of known backups.
///
/// A tier is due when it has no backup yet or its newest one is at least
/// one interval old. With no tiers configured only [`Tier::Default`] is
/// due, unconditionally.
pub fn compute_schedule(
    tiers: &[RetentionTier],
    backups: &[BackupFile],
    now: DateTime<Utc>,
) -> TierSchedule {
    if tiers.is_empty() {
        return TierSchedule::default_only(now);
    }

    let mut newest: BTreeMap<Tier, DateTime<Utc>> = BTreeMap::new();
    for backup in backups {
        let tier = effective_tier(backup, now);
        let slot = newest.entry(tier).or_insert(backup.timestamp);
        if backup.timestamp > *slot {
            *slot = backup.timestamp;
        }
    }

    let mut schedule = TierSchedule::default();
    for rt in tiers {
        let Some(interval) = rt.tier.interval() else {
            schedule.due.push(rt.tier);
            schedule.next_due.insert(rt.tier, now);
            continue;
        };

        match newest.get(&rt.tier) {
            Some(&last) if now - last < interval => {
                debug!(tier = %rt.tier, last = %last, "Tier not due yet");
                schedule.next_due.insert(rt.tier, last + interval);
            }
            Some(&last) => {
                debug!(tier = %rt.tier, last = %last, "Tier due");
                schedule.due.push(rt.tier);
                schedule.next_due.insert(rt.tier, now);
            }
            None => {
                debug!(tier = %rt.tier, "No existing backup for tier");
                schedule.due.push(rt.tier);
                schedule.next_due.insert(rt.tier, now);
            }
        }
    }

    schedule
}

async fn collect_backups(
    backends: &[Arc<dyn Backend>],
    database: &str,
) -> Result<Vec<BackupFile>> {
    let pattern = filename::backup_pattern(database);
    let mut backups = Vec::new();

    for backend in backends {
        for entry in backend.list(&pattern).await? {
            match BackupFilename::decode(&entry.path) {
                Ok(name) if name.database() == database => backups.push(BackupFile {
                    timestamp: name.timestamp(),
                    creation_tier: name.tier(),
                    path: entry.path,
                }),
                Ok(_) => {}
                Err(e) => {
                    debug!(backend = %backend.name(), file = %entry.path, error = %e, "Skipping file with invalid name");
                }
            }
        }
    }

    Ok(backups)
}

/// Inspects every backend and computes the schedule from the union of
/// their backups. If any listing fails, every configured tier is due.
pub async fn check_schedule(
    backends: &[Arc<dyn Backend>],
    database: &str,
    tiers: &[RetentionTier],
    now: DateTime<Utc>,
) -> TierSchedule {
    if tiers.is_empty() {
        return TierSchedule::default_only(now);
    }

    match collect_backups(backends, database).await {
        Ok(backups) => compute_schedule(tiers, &backups, now),
        Err(e) => {
            warn!(
                database,
                error = %e,
                "Failed to inspect existing backups, treating all tiers as due"
            );
            TierSchedule::all_due(tiers, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tierdump_backends::MemoryBackend;
    use tierdump_core::Error;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn tagged(tier: Tier, age: Duration) -> BackupFile {
        let timestamp = now() - age;
        BackupFile {
            path: filename::encode("mydb", Some(tier), timestamp).unwrap(),
            timestamp,
            creation_tier: Some(tier),
        }
    }

    #[test]
    fn test_no_backups_everything_due() {
        let tiers = vec![
            RetentionTier::new(Tier::Hourly, 24),
            RetentionTier::new(Tier::Daily, 7),
        ];
        let schedule = compute_schedule(&tiers, &[], now());
        assert_eq!(schedule.due, vec![Tier::Hourly, Tier::Daily]);
        assert_eq!(schedule.next_due[&Tier::Daily], now());
    }

    #[test]
    fn test_interval_boundaries() {
        let tiers = vec![
            RetentionTier::new(Tier::Hourly, 24),
            RetentionTier::new(Tier::Daily, 7),
        ];
        let backups = vec![
            tagged(Tier::Hourly, Duration::hours(1)),
            tagged(Tier::Daily, Duration::hours(23)),
        ];
        let schedule = compute_schedule(&tiers, &backups, now());
        assert_eq!(schedule.due, vec![Tier::Hourly]);
        assert_eq!(schedule.next_due[&Tier::Daily], now() + Duration::hours(1));
    }

    #[test]
    fn test_yearly_not_due_with_recent_yearly_and_old_history() {
        let tiers = vec![
            RetentionTier::new(Tier::Daily, 7),
            RetentionTier::new(Tier::Yearly, 5),
        ];
        let backups = vec![
            tagged(Tier::Daily, Duration::days(400)),
            tagged(Tier::Yearly, Duration::days(10)),
            tagged(Tier::Daily, Duration::hours(2)),
        ];
        let schedule = compute_schedule(&tiers, &backups, now());
        assert!(!schedule.is_due(Tier::Yearly));
        assert!(!schedule.is_due(Tier::Daily));
        assert!(schedule.nothing_due());
    }

    #[test]
    fn test_untagged_counts_by_age() {
        let timestamp = now() - Duration::hours(3);
        let backups = vec![BackupFile {
            path: filename::encode("mydb", None, timestamp).unwrap(),
            timestamp,
            creation_tier: None,
        }];
        let tiers = vec![
            RetentionTier::new(Tier::Hourly, 24),
            RetentionTier::new(Tier::Daily, 7),
        ];
        let schedule = compute_schedule(&tiers, &backups, now());
        assert_eq!(schedule.due, vec![Tier::Hourly, Tier::Daily]);

        let backups = vec![BackupFile {
            timestamp: now() - Duration::minutes(30),
            ..backups[0].clone()
        }];
        let schedule = compute_schedule(&tiers, &backups, now());
        assert_eq!(schedule.due, vec![Tier::Daily]);
    }

    #[test]
    fn test_no_tiers_means_default() {
        let schedule = compute_schedule(&[], &[tagged(Tier::Daily, Duration::hours(1))], now());
        assert_eq!(schedule.due, vec![Tier::Default]);
    }

    #[tokio::test]
    async fn test_check_schedule_unions_backends() {
        let a = Arc::new(MemoryBackend::new("a"));
        let b = Arc::new(MemoryBackend::new("b"));
        let daily = tagged(Tier::Daily, Duration::hours(5));
        b.insert(&daily.path, 10, daily.timestamp);
        a.insert("notes.txt", 10, now());

        let tiers = vec![
            RetentionTier::new(Tier::Hourly, 24),
            RetentionTier::new(Tier::Daily, 7),
        ];
        let backends = vec![a.clone() as Arc<dyn Backend>, b.clone() as Arc<dyn Backend>];
        let schedule = check_schedule(&backends, "mydb", &tiers, now()).await;
        assert_eq!(schedule.due, vec![Tier::Hourly]);
    }

    #[tokio::test]
    async fn test_check_schedule_fails_open() {
        let a = Arc::new(MemoryBackend::new("a"));
        let b = Arc::new(MemoryBackend::new("b"));
        let daily = tagged(Tier::Daily, Duration::hours(5));
        a.insert(&daily.path, 10, daily.timestamp);
        b.fail_lists_with(|| Error::ConnectionFailed("unreachable".to_string()));

        let tiers = vec![
            RetentionTier::new(Tier::Hourly, 24),
            RetentionTier::new(Tier::Daily, 7),
        ];
        let backends = vec![a.clone() as Arc<dyn Backend>, b.clone() as Arc<dyn Backend>];
        let schedule = check_schedule(&backends, "mydb", &tiers, now()).await;
        assert_eq!(schedule.due, vec![Tier::Hourly, Tier::Daily]);
    }

    #[tokio::test]
    async fn test_check_schedule_without_tiers_skips_listing() {
        let a = Arc::new(MemoryBackend::new("a"));
        let backends = vec![a.clone() as Arc<dyn Backend>];
        let schedule = check_schedule(&backends, "mydb", &[], now()).await;
        assert_eq!(schedule.due, vec![Tier::Default]);
        assert_eq!(a.list_calls(), 0);
    }
}
