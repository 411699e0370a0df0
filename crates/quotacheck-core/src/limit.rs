//! Tracked limits and their usage state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current usage of a limit.
///
/// `Unknown` means collection never succeeded (or last failed). It is
/// deliberately distinct from `Count(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageState {
    /// Usage has not been determined
    #[default]
    Unknown,

    /// Number of resources counted by the last successful pass
    Count(u64),
}

impl UsageState {
    /// The count, if known.
    pub fn count(&self) -> Option<u64> {
        match self {
            UsageState::Count(n) => Some(*n),
            UsageState::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, UsageState::Unknown)
    }
}

impl fmt::Display for UsageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageState::Count(n) => write!(f, "{}", n),
            UsageState::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// Warning and critical thresholds, as percentages of the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Usage at or above this percentage is a warning
    pub warning: u8,

    /// Usage at or above this percentage is critical
    pub critical: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 75,
            critical: 90,
        }
    }
}

impl Thresholds {
    pub fn new(warning: u8, critical: u8) -> Self {
        Self { warning, critical }
    }
}

/// Result of comparing usage against a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThresholdStatus {
    Ok,
    /// Usage or quota could not be determined
    Unknown,
    Warning,
    Critical,
}

impl fmt::Display for ThresholdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdStatus::Ok => write!(f, "OK"),
            ThresholdStatus::Unknown => write!(f, "UNKNOWN"),
            ThresholdStatus::Warning => write!(f, "WARNING"),
            ThresholdStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A named resource quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Unique name (e.g., "VPCs")
    pub name: String,

    /// Service the resource belongs to (e.g., "ec2")
    pub service: String,

    /// Provider-side quota, if known
    #[serde(default)]
    pub quota: Option<u64>,

    /// Current usage
    #[serde(default)]
    pub usage: UsageState,
}

impl Limit {
    /// Create a limit with unknown usage and no quota.
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            quota: None,
            usage: UsageState::Unknown,
        }
    }

    /// Set the provider-side quota.
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Current usage rendered for display (`"1"`, `"<unknown>"`).
    pub fn current_usage_str(&self) -> String {
        self.usage.to_string()
    }

    /// Compare usage against the quota.
    ///
    /// A zero quota with zero usage is `Ok`; any usage against a zero quota
    /// is `Critical`.
    pub fn check_thresholds(&self, thresholds: &Thresholds) -> ThresholdStatus {
        let (Some(usage), Some(quota)) = (self.usage.count(), self.quota) else {
            return ThresholdStatus::Unknown;
        };

        let scaled = u128::from(usage) * 100;
        let quota = u128::from(quota);

        if scaled >= quota * u128::from(thresholds.critical) && usage > 0 {
            ThresholdStatus::Critical
        } else if scaled >= quota * u128::from(thresholds.warning) && usage > 0 {
            ThresholdStatus::Warning
        } else {
            ThresholdStatus::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_usage_display() {
        assert_eq!(UsageState::Count(1).to_string(), "1");
        assert_eq!(UsageState::Count(0).to_string(), "0");
        assert_eq!(UsageState::Unknown.to_string(), "<unknown>");
    }

    #[test]
    fn test_new_limit_is_unknown() {
        let limit = Limit::new("VPCs", "ec2");
        assert!(limit.usage.is_unknown());
        assert_eq!(limit.current_usage_str(), "<unknown>");
    }

    #[test]
    fn test_threshold_levels() {
        let thresholds = Thresholds::default();
        let mut limit = Limit::new("VPCs", "ec2").with_quota(100);

        limit.usage = UsageState::Count(74);
        assert_eq!(limit.check_thresholds(&thresholds), ThresholdStatus::Ok);

        limit.usage = UsageState::Count(75);
        assert_eq!(limit.check_thresholds(&thresholds), ThresholdStatus::Warning);

        limit.usage = UsageState::Count(90);
        assert_eq!(limit.check_thresholds(&thresholds), ThresholdStatus::Critical);
    }

    #[test]
    fn test_threshold_unknown_without_quota_or_usage() {
        let thresholds = Thresholds::default();

        let no_quota = Limit {
            usage: UsageState::Count(3),
            ..Limit::new("VPCs", "ec2")
        };
        assert_eq!(no_quota.check_thresholds(&thresholds), ThresholdStatus::Unknown);

        let no_usage = Limit::new("VPCs", "ec2").with_quota(5);
        assert_eq!(no_usage.check_thresholds(&thresholds), ThresholdStatus::Unknown);
    }

    #[test]
    fn test_zero_quota() {
        let thresholds = Thresholds::default();
        let mut limit = Limit::new("Dedicated Hosts", "ec2").with_quota(0);

        limit.usage = UsageState::Count(0);
        assert_eq!(limit.check_thresholds(&thresholds), ThresholdStatus::Ok);

        limit.usage = UsageState::Count(1);
        assert_eq!(limit.check_thresholds(&thresholds), ThresholdStatus::Critical);
    }

    proptest! {
        #[test]
        fn prop_status_is_monotonic_in_usage(quota in 1u64..10_000, a in 0u64..20_000, b in 0u64..20_000) {
            let thresholds = Thresholds::default();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };

            let mut limit = Limit::new("x", "ec2").with_quota(quota);
            limit.usage = UsageState::Count(low);
            let low_status = limit.check_thresholds(&thresholds);
            limit.usage = UsageState::Count(high);
            let high_status = limit.check_thresholds(&thresholds);

            prop_assert!(low_status <= high_status);
        }
    }
}
