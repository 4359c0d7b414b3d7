//! # Community Metrics
//!
//! Aggregate counters shared by every user. A metric's stored value only
//! ever grows: each poll keeps `max(stored, polled)`, so a stale replica
//! reporting a lower count cannot un-complete a milestone.

use chrono::{DateTime, Utc};
use orebit_core::{EconomyError, Result, UserId};
use serde::{Deserialize, Serialize};

/// Aggregate query the remote store evaluates over all users
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregateQuery {
    /// Users with an applied ledger entry in the last `within_hours`
    ActiveUsers { within_hours: u32 },

    /// Sum of `mined_windows` over all users
    TotalMinedWindows,

    /// Sum of lifetime XP over all users
    TotalXp,

    /// Users whose derived level is at least `level`
    UsersAtLevel { level: u32 },
}

/// Named aggregate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    pub query: AggregateQuery,
}

/// Who receives a community reward
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    #[serde(default = "default_min_level")]
    pub min_level: u32,

    /// Only users active in this many hours before completion
    #[serde(default)]
    pub active_within_hours: Option<u32>,
}

fn default_min_level() -> u32 {
    1
}

impl Default for Eligibility {
    fn default() -> Self {
        Self {
            min_level: default_min_level(),
            active_within_hours: None,
        }
    }
}

pub fn default_metrics() -> Vec<MetricDefinition> {
    vec![
        MetricDefinition {
            id: "active_miners".to_string(),
            query: AggregateQuery::ActiveUsers { within_hours: 24 },
        },
        MetricDefinition {
            id: "total_mined_windows".to_string(),
            query: AggregateQuery::TotalMinedWindows,
        },
    ]
}

pub fn validate_metrics(metrics: &[MetricDefinition]) -> Result<()> {
    for (i, metric) in metrics.iter().enumerate() {
        if metric.id.is_empty() {
            return Err(EconomyError::Config("metric id must not be empty".into()));
        }
        if metrics[..i].iter().any(|m| m.id == metric.id) {
            return Err(EconomyError::Config(format!("metric {} defined twice", metric.id)));
        }
    }
    Ok(())
}

/// Persisted progress of one community milestone
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityMetric {
    /// Milestone (rule) id
    pub id: String,
    pub current_value: u64,
    pub target: u64,
    pub completed: bool,
    pub distributed: bool,

    /// Recipients captured when the target was first crossed
    #[serde(default)]
    pub eligible_snapshot: Vec<UserId>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommunityMetric {
    pub fn new(id: impl Into<String>, target: u64) -> Self {
        Self {
            id: id.into(),
            current_value: 0,
            target,
            completed: false,
            distributed: false,
            eligible_snapshot: Vec::new(),
            completed_at: None,
        }
    }

    /// Fold in a freshly polled value.
    ///
    /// Returns `true` exactly once: on the poll that first crosses the target.
    pub fn observe(&mut self, polled: u64, now: DateTime<Utc>) -> bool {
        self.current_value = self.current_value.max(polled);
        if !self.completed && self.current_value >= self.target {
            self.completed = true;
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    /// Completed but not yet fully distributed
    pub fn needs_distribution(&self) -> bool {
        self.completed && !self.distributed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_completes_on_first_crossing_only() {
        let mut metric = CommunityMetric::new("community_1000_active", 1000);

        assert!(!metric.observe(999, now()));
        assert!(!metric.completed);

        assert!(metric.observe(1001, now()));
        assert!(metric.completed);
        assert_eq!(metric.completed_at, Some(now()));

        assert!(!metric.observe(1500, now()));
        assert!(metric.needs_distribution());
    }

    #[test]
    fn test_value_is_monotonic() {
        let mut metric = CommunityMetric::new("m", 10);
        metric.observe(8, now());
        metric.observe(3, now());
        assert_eq!(metric.current_value, 8);
    }

    #[test]
    fn test_duplicate_metric_rejected() {
        let mut metrics = default_metrics();
        metrics.push(metrics[0].clone());
        assert!(validate_metrics(&metrics).is_err());
    }

    #[test]
    fn test_query_toml_shape() {
        let metric: MetricDefinition = toml::from_str(
            r#"
            id = "lvl5"
            query = { type = "users_at_level", level = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(metric.query, AggregateQuery::UsersAtLevel { level: 5 });
    }
}
