use akidb_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tiering policy configuration
///
/// Controls when collections are promoted/demoted between tiers based on access patterns.
///
/// # Example
///
/// ```
/// use akidb_storage::tiering_manager::TieringPolicyConfig;
///
/// let policy = TieringPolicyConfig::default();
/// assert_eq!(policy.demotion_idle_threshold_secs, 6 * 3600);
/// assert_eq!(policy.promotion_access_threshold, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringPolicyConfig {
    /// Seconds without access before demoting hot → warm (default: 6h)
    pub demotion_idle_threshold_secs: u64,

    /// Seconds without access before demoting warm → cold (default: 7d)
    pub cold_demotion_idle_threshold_secs: u64,

    /// Accesses within the window that promote a collection one tier up
    /// (default: 10)
    pub promotion_access_threshold: u32,

    /// Access window for promotion counting (default: 1h)
    pub promotion_window_secs: u64,

    /// Background worker interval in seconds (default: 300 = 5 minutes)
    pub worker_interval_secs: u64,

    /// Candidates processed per direction per cycle (default: 10)
    pub lru_batch_size: usize,

    /// Cap on Hot collections; least recently used ones are demoted past it
    /// (default: unlimited)
    pub max_hot_collections: Option<usize>,
}

impl Default for TieringPolicyConfig {
    fn default() -> Self {
        Self {
            demotion_idle_threshold_secs: 6 * 3600,
            cold_demotion_idle_threshold_secs: 7 * 24 * 3600,
            promotion_access_threshold: 10,
            promotion_window_secs: 3600,
            worker_interval_secs: 300, // 5 minutes
            lru_batch_size: 10,
            max_hot_collections: None,
        }
    }
}

impl TieringPolicyConfig {
    /// Validate policy configuration
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if any value is below its minimum
    /// or the cold idle threshold is shorter than the warm one
    pub fn validate(&self) -> CoreResult<()> {
        if self.worker_interval_secs == 0 {
            return Err(CoreError::ValidationError(
                "tiering.worker_interval_secs must be >= 1".into(),
            ));
        }
        if self.lru_batch_size == 0 {
            return Err(CoreError::ValidationError(
                "tiering.lru_batch_size must be >= 1".into(),
            ));
        }
        if self.promotion_access_threshold == 0 {
            return Err(CoreError::ValidationError(
                "tiering.promotion_access_threshold must be >= 1".into(),
            ));
        }
        if self.promotion_window_secs == 0 {
            return Err(CoreError::ValidationError(
                "tiering.promotion_window_secs must be >= 1".into(),
            ));
        }
        if self.cold_demotion_idle_threshold_secs < self.demotion_idle_threshold_secs {
            return Err(CoreError::ValidationError(format!(
                "tiering.cold_demotion_idle_threshold_secs ({}) must be >= demotion_idle_threshold_secs ({})",
                self.cold_demotion_idle_threshold_secs, self.demotion_idle_threshold_secs
            )));
        }
        if self.max_hot_collections == Some(0) {
            return Err(CoreError::ValidationError(
                "tiering.max_hot_collections must be >= 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Get worker interval as Duration
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_secs)
    }

    pub fn demotion_idle_threshold(&self) -> chrono::Duration {
        seconds(self.demotion_idle_threshold_secs)
    }

    pub fn cold_demotion_idle_threshold(&self) -> chrono::Duration {
        seconds(self.cold_demotion_idle_threshold_secs)
    }

    pub fn promotion_window(&self) -> chrono::Duration {
        seconds(self.promotion_window_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = TieringPolicyConfig::default();
        assert_eq!(policy.demotion_idle_threshold_secs, 21_600);
        assert_eq!(policy.cold_demotion_idle_threshold_secs, 604_800);
        assert_eq!(policy.promotion_access_threshold, 10);
        assert_eq!(policy.promotion_window_secs, 3600);
        assert_eq!(policy.worker_interval_secs, 300);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_invalid_threshold() {
        let mut policy = TieringPolicyConfig::default();
        policy.promotion_access_threshold = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_invalid_batch_size() {
        let mut policy = TieringPolicyConfig::default();
        policy.lru_batch_size = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_invalid_worker_interval() {
        let mut policy = TieringPolicyConfig::default();
        policy.worker_interval_secs = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_cold_threshold_below_warm_threshold() {
        let policy = TieringPolicyConfig {
            demotion_idle_threshold_secs: 100,
            cold_demotion_idle_threshold_secs: 10,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let policy = TieringPolicyConfig::default();
        assert_eq!(policy.worker_interval(), Duration::from_secs(300));
        assert_eq!(policy.promotion_window(), chrono::Duration::hours(1));
        assert_eq!(policy.demotion_idle_threshold(), chrono::Duration::hours(6));
    }
}
