use crate::error::{RetentionError, RetentionResult};
use crate::policy::MAX_RETENTION_DAYS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts before an entry is marked failed (default: 3)
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Data items processed concurrently per policy run (default: 50)
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Seconds between scheduled ticks (default: 3600 = hourly)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Queue depth per event kind (default: 256)
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Policies kept in the read-through cache (default: 128)
    #[serde(default = "default_policy_cache_capacity")]
    pub policy_cache_capacity: usize,

    /// Failed/processed ratio above which a threshold warning is emitted
    #[serde(default = "default_failure_warning_ratio")]
    pub failure_warning_ratio: f64,

    /// Hours past due before a pending entry counts as overdue in reports
    #[serde(default = "default_overdue_grace_hours")]
    pub overdue_grace_hours: i64,

    /// Days execution results are kept for reporting (default: 365)
    #[serde(default = "default_execution_history_days")]
    pub execution_history_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            batch_concurrency: default_batch_concurrency(),
            tick_interval_secs: default_tick_interval(),
            event_channel_capacity: default_event_channel_capacity(),
            policy_cache_capacity: default_policy_cache_capacity(),
            failure_warning_ratio: default_failure_warning_ratio(),
            overdue_grace_hours: default_overdue_grace_hours(),
            execution_history_days: default_execution_history_days(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional file, then `RETENTION__*` environment variables
    pub fn load(path: Option<&Path>) -> RetentionResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RETENTION")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RetentionResult<()> {
        if self.max_retry_attempts == 0 {
            return Err(RetentionError::Configuration(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.batch_concurrency == 0 {
            return Err(RetentionError::Configuration(
                "batch_concurrency must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(RetentionError::Configuration(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_warning_ratio) {
            return Err(RetentionError::Configuration(format!(
                "failure_warning_ratio must be within [0, 1], got {}",
                self.failure_warning_ratio
            )));
        }
        if !(0..=i64::from(MAX_RETENTION_DAYS) * 24).contains(&self.overdue_grace_hours) {
            return Err(RetentionError::Configuration(format!(
                "overdue_grace_hours must be within [0, {}], got {}",
                i64::from(MAX_RETENTION_DAYS) * 24,
                self.overdue_grace_hours
            )));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.execution_history_days) {
            return Err(RetentionError::Configuration(format!(
                "execution_history_days must be within [1, {}], got {}",
                MAX_RETENTION_DAYS, self.execution_history_days
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_batch_concurrency() -> usize {
    50
}

fn default_tick_interval() -> u64 {
    3600
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_policy_cache_capacity() -> usize {
    128
}

fn default_failure_warning_ratio() -> f64 {
    0.25
}

fn default_overdue_grace_hours() -> i64 {
    24
}

fn default_execution_history_days() -> u32 {
    365
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.tick_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_load_from_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "batch_concurrency: 8\nfailure_warning_ratio: 0.5").unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.batch_concurrency, 8);
        assert_eq!(config.failure_warning_ratio, 0.5);
        assert_eq!(config.max_retry_attempts, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig {
            max_retry_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            failure_warning_ratio: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            overdue_grace_hours: i64::MAX,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            execution_history_days: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
