//! SchedulerConfig - 実行時設定
//!
//! すべてのフィールドにデフォルトがあるので、設定ファイルは必要なキーだけ書けばよい。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SchedulerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often `ReaperLoop` runs the expiry sweep.
    pub expiry_interval_secs: u64,

    /// How often `GcLoop` reaps terminated tasks.
    pub gc_interval_secs: u64,

    /// Terminated tasks older than this are hard deleted.
    pub retention_days: u32,

    /// Default `limit` for dequeue from the CLI.
    pub dequeue_limit: usize,

    pub database_path: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_interval_secs: 1,
            gc_interval_secs: 3600,
            retention_days: 10,
            dequeue_limit: 10,
            database_path: PathBuf::from("shuttle.db"),
        }
    }
}

impl SchedulerConfig {
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    /// Reject values that would make a loop spin or reap everything.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.expiry_interval_secs == 0 {
            return Err(SchedulerError::Config(
                "expiry_interval_secs must be greater than 0".into(),
            ));
        }
        if self.gc_interval_secs == 0 {
            return Err(SchedulerError::Config(
                "gc_interval_secs must be greater than 0".into(),
            ));
        }
        if self.retention_days == 0 {
            return Err(SchedulerError::Config(
                "retention_days must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.expiry_interval(), Duration::from_secs(1));
        assert_eq!(config.retention_days, 10);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: SchedulerConfig =
            serde_json::from_value(serde_json::json!({"retention_days": 3})).unwrap();
        assert_eq!(config.retention_days, 3);
        assert_eq!(config.gc_interval_secs, 3600);
        assert_eq!(config.database_path, PathBuf::from("shuttle.db"));
    }

    #[rstest]
    #[case::expiry(SchedulerConfig { expiry_interval_secs: 0, ..Default::default() })]
    #[case::gc(SchedulerConfig { gc_interval_secs: 0, ..Default::default() })]
    #[case::retention(SchedulerConfig { retention_days: 0, ..Default::default() })]
    fn zero_values_are_rejected(#[case] config: SchedulerConfig) {
        assert!(matches!(config.validate(), Err(SchedulerError::Config(_))));
    }
}
