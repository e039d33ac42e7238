use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A retention bucket.
///
/// `Default` is not configurable: it names the single unconditional tier a
/// database gets when no retention tiers are configured for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    Default,
}

/// Configurable tiers, shortest interval first.
pub const TIER_ORDER: [Tier; 6] = [
    Tier::Hourly,
    Tier::Daily,
    Tier::Weekly,
    Tier::Monthly,
    Tier::Quarterly,
    Tier::Yearly,
];

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hourly => "hourly",
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Quarterly => "quarterly",
            Tier::Yearly => "yearly",
            Tier::Default => "default",
        }
    }

    /// Minimum time between two backups of this tier. `None` for the
    /// default tier, which is always due.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Tier::Hourly => Some(Duration::hours(1)),
            Tier::Daily => Some(Duration::hours(24)),
            Tier::Weekly => Some(Duration::days(7)),
            Tier::Monthly => Some(Duration::days(30)),
            Tier::Quarterly => Some(Duration::days(90)),
            Tier::Yearly => Some(Duration::days(365)),
            Tier::Default => None,
        }
    }

    /// Age-based classification used for files that carry no tier tag.
    pub fn categorize(age: Duration) -> Tier {
        if age <= Duration::hours(24) {
            Tier::Hourly
        } else if age <= Duration::days(7) {
            Tier::Daily
        } else if age <= Duration::days(30) {
            Tier::Weekly
        } else if age <= Duration::days(90) {
            Tier::Monthly
        } else if age <= Duration::days(365) {
            Tier::Quarterly
        } else {
            Tier::Yearly
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Tier::Hourly),
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            "quarterly" => Ok(Tier::Quarterly),
            "yearly" => Ok(Tier::Yearly),
            "default" => Ok(Tier::Default),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Keep-count for one tier. A retention of 0 keeps everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionTier {
    pub tier: Tier,
    pub retention: usize,
}

impl RetentionTier {
    pub fn new(tier: Tier, retention: usize) -> Self {
        Self { tier, retention }
    }

    pub fn is_unlimited(&self) -> bool {
        self.retention == 0
    }
}
