//! Community Aggregator
//!
//! Polls aggregate metrics for every community milestone, completes a
//! milestone the first time its metric crosses the target and distributes
//! the reward to the users eligible at that instant.
//!
//! Distribution is a fan-out of ordinary ledger applications keyed by
//! `(user, community_milestone, rule id)`, so an interrupted run is finished
//! by simply running again. `distributed` is recorded once no snapshot
//! member is left pending; failed entries are terminal and only reported.

use crate::ledger::RewardLedger;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use orebit_core::{EconomyError, LedgerDelta, Result, SourceKind, UserId};
use orebit_economics::{
    AggregateQuery, CommunityMetric, Eligibility, MetricDefinition, ProgressionCalculator,
    RuleDefinition, RuleSet,
};
use orebit_storage::{EligibilityFilter, MetricQuery, RemoteStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Distribution counts for one milestone
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub applied: usize,
    pub pending: usize,
    pub failed: usize,
}

impl FanoutReport {
    /// Nothing left to retry; failed entries never become applied
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

/// Result of one [`CommunityAggregator::run`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateReport {
    /// Milestones polled
    pub evaluated: usize,

    /// Milestones completed by this run
    pub completed: Vec<String>,

    /// Milestones fully distributed by this run
    pub distributed: Vec<String>,

    /// Milestones whose fan-out has to be resumed
    pub partial: Vec<EconomyError>,

    /// Failed ledger entries per milestone fanned out by this run
    pub failed: Vec<(String, usize)>,
}

/// Community milestone tracker
pub struct CommunityAggregator {
    store: Arc<dyn RemoteStore>,
    ledger: RewardLedger,
    retry: RetryPolicy,
    progression: Arc<ProgressionCalculator>,
    rules: RuleSet,
    metrics: Vec<MetricDefinition>,
    fanout_concurrency: usize,
}

impl CommunityAggregator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        ledger: RewardLedger,
        retry: RetryPolicy,
        progression: Arc<ProgressionCalculator>,
        rules: RuleSet,
        metrics: Vec<MetricDefinition>,
        fanout_concurrency: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            retry,
            progression,
            rules,
            metrics,
            fanout_concurrency: fanout_concurrency.max(1),
        }
    }

    /// Translate a configured aggregate into a store query at `now`
    pub fn metric_query(&self, query: &AggregateQuery, now: DateTime<Utc>) -> MetricQuery {
        match query {
            AggregateQuery::ActiveUsers { within_hours } => {
                MetricQuery::ActiveSince(now - Duration::hours(*within_hours as i64))
            }
            AggregateQuery::TotalMinedWindows => MetricQuery::TotalMinedWindows,
            AggregateQuery::TotalXp => MetricQuery::TotalXp,
            AggregateQuery::UsersAtLevel { level } => MetricQuery::UsersWithXpAtLeast(
                self.progression.threshold(*level).unwrap_or(u64::MAX),
            ),
        }
    }

    /// Translate an eligibility rule into a store filter at `now`
    pub fn eligibility_filter(
        &self,
        eligibility: Option<&Eligibility>,
        now: DateTime<Utc>,
    ) -> EligibilityFilter {
        let Some(eligibility) = eligibility else {
            return EligibilityFilter::default();
        };
        EligibilityFilter {
            min_total_xp: self
                .progression
                .threshold(eligibility.min_level)
                .unwrap_or(u64::MAX),
            active_since: eligibility
                .active_within_hours
                .map(|h| now - Duration::hours(h as i64)),
        }
    }

    /// Stored progress of one milestone
    pub async fn metric(&self, id: &str) -> Result<Option<CommunityMetric>> {
        self.retry
            .run("load_community_metric", || self.store.load_community_metric(id))
            .await
    }

    /// Poll every community milestone once and resume any pending fan-out.
    ///
    /// A milestone that cannot be polled is skipped with a warning; the
    /// others still run.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<AggregateReport> {
        let mut report = AggregateReport::default();

        for rule in self.rules.community() {
            report.evaluated += 1;
            match self.run_milestone(rule, now, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. }) => {
                    warn!(milestone = %rule.id, error = %e, "Milestone poll delayed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn run_milestone(
        &self,
        rule: &RuleDefinition,
        now: DateTime<Utc>,
        report: &mut AggregateReport,
    ) -> Result<()> {
        let Some((metric_id, target)) = rule.metric_target() else {
            return Ok(());
        };
        let definition = self
            .metrics
            .iter()
            .find(|m| m.id == metric_id)
            .ok_or_else(|| EconomyError::Config(format!("unknown metric {metric_id}")))?;

        let mut metric = self
            .metric(&rule.id)
            .await?
            .unwrap_or_else(|| CommunityMetric::new(rule.id.clone(), target));
        metric.target = target;

        if !metric.completed {
            let query = self.metric_query(&definition.query, now);
            let value = self
                .retry
                .run("query_aggregate_metric", || self.store.query_aggregate_metric(&query))
                .await?;

            if metric.observe(value, now) {
                let filter = self.eligibility_filter(rule.eligibility.as_ref(), now);
                metric.eligible_snapshot = self
                    .retry
                    .run("list_eligible_users", || self.store.list_eligible_users(&filter))
                    .await?;
                info!(
                    milestone = %rule.id,
                    value,
                    target,
                    eligible = metric.eligible_snapshot.len(),
                    "Community milestone completed"
                );
                report.completed.push(rule.id.clone());
            } else {
                debug!(milestone = %rule.id, value, target, "Community milestone progress");
            }

            let saved = self
                .retry
                .run("save_community_metric", || self.store.save_community_metric(&metric))
                .await?;
            metric = saved;
        }

        if !metric.needs_distribution() {
            return Ok(());
        }

        let fanout = self.fan_out(rule, &metric.eligible_snapshot).await?;
        if fanout.failed > 0 {
            warn!(milestone = %rule.id, failed = fanout.failed, "Community rewards failed");
            report.failed.push((rule.id.clone(), fanout.failed));
        }
        if fanout.is_complete() {
            metric.distributed = true;
            self.retry
                .run("save_community_metric", || self.store.save_community_metric(&metric))
                .await?;
            info!(
                milestone = %rule.id,
                applied = fanout.applied,
                failed = fanout.failed,
                "Community milestone distributed"
            );
            report.distributed.push(rule.id.clone());
        } else {
            let e = EconomyError::PartialFanout {
                milestone: rule.id.clone(),
                pending: fanout.pending,
                failed: fanout.failed,
            };
            warn!(milestone = %rule.id, error = %e, "Fan-out incomplete; will resume");
            report.partial.push(e);
        }
        Ok(())
    }

    /// Apply the milestone reward to every snapshot member, bounded in flight
    async fn fan_out(&self, rule: &RuleDefinition, users: &[UserId]) -> Result<FanoutReport> {
        // community rewards ignore double-xp windows: every member gets the same delta
        let delta: LedgerDelta = rule.reward.to_delta(1.0)?;
        let source_id = rule.id.as_str();

        let results: Vec<(UserId, Result<bool>)> = stream::iter(users.iter().cloned())
            .map(|user| {
                let delta = delta.clone();
                async move {
                    let result = self
                        .ledger
                        .apply(&user, SourceKind::CommunityMilestone, source_id, delta)
                        .await
                        .map(|entry| entry.is_applied());
                    (user, result)
                }
            })
            .buffer_unordered(self.fanout_concurrency)
            .collect()
            .await;

        let mut report = FanoutReport::default();
        for (user, result) in results {
            match result {
                Ok(true) => report.applied += 1,
                Ok(false) => report.failed += 1,
                Err(e) if e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. }) => {
                    report.pending += 1
                }
                Err(e) => {
                    warn!(milestone = %rule.id, user = %user, error = %e, "Community reward failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
