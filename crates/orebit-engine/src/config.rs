//! Engine configuration types

use crate::retry::RetryConfig;
use orebit_core::{EconomyError, Result};
use orebit_economics::community::{default_metrics, validate_metrics};
use orebit_economics::competition::validate_competitions;
use orebit_economics::{
    AlgorithmTable, CompetitionDefinition, EventConfig, MetricDefinition, ProgressionConfig,
    RateConfig, RuleSet,
};
use orebit_storage::CACHE_FORMAT_VERSION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rate bounds and accrual windows
    #[serde(default)]
    pub rates: RateConfig,

    /// Level table and feature efficiency
    #[serde(default)]
    pub progression: ProgressionConfig,

    /// Algorithm multipliers, prices and level gates
    #[serde(default)]
    pub algorithms: AlgorithmTable,

    /// Explicit and recurring event windows
    #[serde(default)]
    pub events: EventConfig,

    /// Achievements and milestones
    #[serde(default)]
    pub rules: RuleSet,

    /// Aggregate metrics referenced by community milestones
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricDefinition>,

    #[serde(default)]
    pub competitions: Vec<CompetitionDefinition>,

    /// Ledger, cache and retry settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Tick periods
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rates: RateConfig::default(),
            progression: ProgressionConfig::default(),
            algorithms: AlgorithmTable::default(),
            events: EventConfig::default(),
            rules: RuleSet::default(),
            metrics: default_metrics(),
            competitions: Vec::new(),
            sync: SyncConfig::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| EconomyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EconomyError::Serialization(e.to_string()))
    }

    /// Reject inconsistent tables before anything runs
    pub fn validate(&self) -> Result<()> {
        self.rates.validate()?;
        self.progression.validate()?;
        self.algorithms.validate()?;
        self.events.validate()?;
        self.rules.validate()?;
        validate_metrics(&self.metrics)?;
        validate_competitions(&self.competitions)?;
        self.sync.validate()?;
        self.schedule.validate()?;

        for rule in self.rules.community() {
            if let Some((metric, _)) = rule.metric_target() {
                if !self.metrics.iter().any(|m| m.id == metric) {
                    return Err(EconomyError::Config(format!(
                        "community milestone {} references unknown metric {metric}",
                        rule.id
                    )));
                }
            }
        }
        for def in self.algorithms.definitions() {
            if def.required_level > self.progression.levels.len() as u32 {
                return Err(EconomyError::Config(format!(
                    "algorithm {} requires level {} beyond the level table",
                    def.algorithm, def.required_level
                )));
            }
        }
        Ok(())
    }
}

/// Ledger, cache and retry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    /// Local cache record version; bump to invalidate every cache
    #[serde(default = "default_cache_version")]
    pub cache_version: u32,

    /// Pending ledger entries younger than this are left to their writer
    #[serde(default = "default_pending_retry_secs")]
    pub pending_retry_secs: u64,

    /// Commit attempts before a pending entry is marked failed
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,

    /// Concurrent ledger applications during community fan-out
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
}

fn default_cache_version() -> u32 {
    CACHE_FORMAT_VERSION
}

fn default_pending_retry_secs() -> u64 {
    60
}

fn default_max_commit_attempts() -> u32 {
    8
}

fn default_fanout_concurrency() -> usize {
    16
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            cache_version: default_cache_version(),
            pending_retry_secs: default_pending_retry_secs(),
            max_commit_attempts: default_max_commit_attempts(),
            fanout_concurrency: default_fanout_concurrency(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.max_commit_attempts == 0 {
            return Err(EconomyError::Config("sync.max_commit_attempts must be >= 1".into()));
        }
        if self.fanout_concurrency == 0 {
            return Err(EconomyError::Config("sync.fanout_concurrency must be >= 1".into()));
        }
        Ok(())
    }

    pub fn pending_retry_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_retry_secs as i64)
    }
}

/// Tick periods
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Accrual tick (ms); windows are credited when complete, the tick only polls
    #[serde(default = "default_accrual_tick_ms")]
    pub accrual_tick_ms: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_aggregate_interval_secs")]
    pub aggregate_interval_secs: u64,
}

fn default_accrual_tick_ms() -> u64 {
    1_000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_aggregate_interval_secs() -> u64 {
    300
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            accrual_tick_ms: default_accrual_tick_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            aggregate_interval_secs: default_aggregate_interval_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.accrual_tick_ms == 0
            || self.reconcile_interval_secs == 0
            || self.aggregate_interval_secs == 0
        {
            return Err(EconomyError::Config("schedule periods must be > 0".into()));
        }
        Ok(())
    }

    pub fn accrual_tick(&self) -> Duration {
        Duration::from_millis(self.accrual_tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_secs(self.aggregate_interval_secs)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level / filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Color output
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: true,
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.rates.max_rate_per_day, 7.5);
        assert_eq!(config.progression.levels.len(), 10);
        assert!(config.rules.get("first_mine").is_some());
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [rates]
            max_rate_per_day = 9.0

            [sync.retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.rates.max_rate_per_day, 9.0);
        assert_eq!(config.rates.min_rate_per_day, 3.0);
        assert_eq!(config.sync.retry.max_attempts, 2);
    }

    #[test]
    fn test_inverted_rate_band_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [rates]
            min_rate_per_day = 8.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EconomyError::Config(_)));
    }

    #[test]
    fn test_overlapping_sale_windows_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [[events.windows]]
            id = "spring-sale"
            kind = "sale"
            multiplier = 0.8
            start_time = "2026-04-01T00:00:00Z"
            duration_hours = 48

            [[events.windows]]
            id = "flash-sale"
            kind = "sale"
            multiplier = 0.5
            start_time = "2026-04-02T00:00:00Z"
            duration_hours = 6
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            metrics = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("active_miners"));
    }

    #[test]
    fn test_defaults_survive_toml_round_trip() {
        let text = EngineConfig::default().to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.rules, RuleSet::default());
        assert_eq!(parsed.algorithms, AlgorithmTable::default());
    }
}
