//! Engine configuration
//!
//! Defaults are usable as-is. Hosts can override them from JSON or from
//! `ENTITLEMENT_*` environment variables (a `.env` file is honoured).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::billing::PlanLimitsTable;
use crate::error::{EngineError, Result};

/// Directory name used under the platform config dir
const APP_DIR_NAME: &str = "entitlement-engine";

/// Tunables for the entitlement engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// A cached snapshot younger than this is returned without a remote call
    pub freshness_window_secs: u64,
    /// Bound applied to each individual remote fetch
    pub remote_timeout_secs: u64,
    /// Prefer the receipt service over the document store when both answer
    pub receipt_authoritative: bool,
    /// Hard timeout of a supervised operation
    pub operation_timeout_secs: u64,
    /// Elapsed seconds at which progress copy escalates
    pub progress_thresholds_secs: Vec<u64>,
    /// Tolerance over a hard limit when a buffered check is requested
    pub usage_buffer_percent: u32,
    /// Percentage at which a resource is reported as near its limit
    pub usage_warning_percent: u8,
    /// Extra access window granted to GRACE_PERIOD records
    pub grace_period_days: i64,
    /// Broadcast channel capacity
    pub event_capacity: usize,
    /// Number of recent events retained for diagnostics
    pub event_history: usize,
    pub plan_limits: PlanLimitsTable,
    /// Location of the local SQLite store
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 5 * 60,
            remote_timeout_secs: 10,
            receipt_authoritative: true,
            operation_timeout_secs: 5,
            progress_thresholds_secs: vec![2, 3],
            usage_buffer_percent: 10,
            usage_warning_percent: 80,
            grace_period_days: 3,
            event_capacity: 64,
            event_history: 32,
            plan_limits: PlanLimitsTable::default(),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `ENTITLEMENT_*` environment variables
    pub fn from_env() -> Result<Self> {
        // Missing .env is normal outside development
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Some(v) = env_u64("ENTITLEMENT_FRESHNESS_SECS")? {
            config.freshness_window_secs = v;
        }
        if let Some(v) = env_u64("ENTITLEMENT_REMOTE_TIMEOUT_SECS")? {
            config.remote_timeout_secs = v;
        }
        if let Some(v) = env_u64("ENTITLEMENT_OPERATION_TIMEOUT_SECS")? {
            config.operation_timeout_secs = v;
        }
        if let Some(v) = env_u64("ENTITLEMENT_USAGE_BUFFER_PERCENT")? {
            config.usage_buffer_percent = u32::try_from(v)
                .map_err(|_| EngineError::Config(format!("buffer percent out of range: {}", v)))?;
        }
        if let Some(v) = env_u64("ENTITLEMENT_GRACE_PERIOD_DAYS")? {
            config.grace_period_days = i64::try_from(v)
                .map_err(|_| EngineError::Config(format!("grace period out of range: {}", v)))?;
        }
        if let Ok(dir) = std::env::var("ENTITLEMENT_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(EngineError::Config(
                "eventCapacity must be greater than zero".to_string(),
            ));
        }
        if self.usage_warning_percent > 100 {
            return Err(EngineError::Config(format!(
                "usageWarningPercent must be <= 100, got {}",
                self.usage_warning_percent
            )));
        }
        if self.grace_period_days < 0 {
            return Err(EngineError::Config(
                "gracePeriodDays must not be negative".to_string(),
            ));
        }
        if try_window_secs(self.freshness_window_secs).is_none() {
            return Err(EngineError::Config(format!(
                "freshnessWindowSecs out of range: {}",
                self.freshness_window_secs
            )));
        }
        if chrono::Duration::try_days(self.grace_period_days).is_none() {
            return Err(EngineError::Config(format!(
                "gracePeriodDays out of range: {}",
                self.grace_period_days
            )));
        }
        Ok(())
    }

    /// Saturates for values `validate` would reject
    pub fn freshness_window(&self) -> chrono::Duration {
        try_window_secs(self.freshness_window_secs).unwrap_or(chrono::Duration::MAX)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Saturates for values `validate` would reject; negative counts as zero
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.grace_period_days.max(0)).unwrap_or(chrono::Duration::MAX)
    }

    /// Resolve the SQLite database path (~/.config/entitlement-engine/engine.db)
    pub fn database_path(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .ok_or_else(|| {
                    EngineError::Config("Could not determine config directory".to_string())
                })?,
        };
        Ok(dir.join("engine.db"))
    }
}

fn try_window_secs(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("{} is not a number: {}", key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.freshness_window(), chrono::Duration::minutes(5));
        assert_eq!(config.usage_buffer_percent, 10);
        assert_eq!(config.progress_thresholds_secs, vec![2, 3]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"freshnessWindowSecs": 30, "usageBufferPercent": 5}"#)
                .unwrap();
        assert_eq!(config.freshness_window_secs, 30);
        assert_eq!(config.usage_buffer_percent, 5);
        assert_eq!(config.remote_timeout_secs, 10);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"eventCapacity": 0}"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"freshnessWindowSecs": 9300000000000000}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"freshnessWindowSecs": 18446744073709551615}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"gracePeriodDays": 9223372036854775807}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"gracePeriodDays": -1}"#).is_err());
    }

    #[test]
    fn test_unvalidated_durations_saturate() {
        let config = EngineConfig {
            freshness_window_secs: u64::MAX,
            grace_period_days: i64::MAX,
            ..Default::default()
        };
        assert_eq!(config.freshness_window(), chrono::Duration::MAX);
        assert_eq!(config.grace_period(), chrono::Duration::MAX);

        let negative = EngineConfig {
            grace_period_days: -5,
            ..Default::default()
        };
        assert_eq!(negative.grace_period(), chrono::Duration::zero());
    }

    #[test]
    fn test_explicit_data_dir() {
        let config = EngineConfig {
            data_dir: Some(PathBuf::from("/tmp/engine")),
            ..Default::default()
        };
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/tmp/engine/engine.db")
        );
    }
}
