//! Competition service
//!
//! Records scores while a window is open and pays prize tiers once it has
//! ended. The first finalize freezes the standings in the store; every
//! later finalize pays from that snapshot. Prizes are ledger entries keyed
//! by the window id, so finalizing twice pays nothing the second time.

use crate::ledger::RewardLedger;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use orebit_core::{EconomyError, Result, SourceKind, UserId};
use orebit_economics::{rank_entries, CompetitionDefinition, CompetitionEntry};
use orebit_storage::RemoteStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of [`CompetitionService::finalize`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinalizeReport {
    pub window_id: String,

    /// Final standings, rank 1 first
    pub standings: Vec<CompetitionEntry>,

    /// Prize entries applied (by this call or an earlier one)
    pub awarded: usize,

    /// Prizes still pending; finalize again to finish
    pub pending: usize,
    pub failed: usize,
}

pub struct CompetitionService {
    store: Arc<dyn RemoteStore>,
    ledger: RewardLedger,
    retry: RetryPolicy,
    competitions: Vec<CompetitionDefinition>,
}

impl CompetitionService {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        ledger: RewardLedger,
        retry: RetryPolicy,
        competitions: Vec<CompetitionDefinition>,
    ) -> Self {
        Self {
            store,
            ledger,
            retry,
            competitions,
        }
    }

    pub fn definitions(&self) -> &[CompetitionDefinition] {
        &self.competitions
    }

    pub fn get(&self, window_id: &str) -> Result<&CompetitionDefinition> {
        self.competitions
            .iter()
            .find(|c| c.id == window_id)
            .ok_or_else(|| EconomyError::Config(format!("unknown competition {window_id}")))
    }

    /// Windows accepting scores at `now`
    pub fn open_at(&self, now: DateTime<Utc>) -> Vec<&CompetitionDefinition> {
        self.competitions.iter().filter(|c| c.is_open(now)).collect()
    }

    /// Windows that have ended at `now`
    pub fn ended_at(&self, now: DateTime<Utc>) -> Vec<&CompetitionDefinition> {
        self.competitions.iter().filter(|c| c.has_ended(now)).collect()
    }

    /// Record `score` for `user`; the best score per user is kept
    pub async fn record_score(
        &self,
        window_id: &str,
        user: &UserId,
        score: u64,
        now: DateTime<Utc>,
    ) -> Result<CompetitionEntry> {
        let competition = self.get(window_id)?;
        if !competition.is_open(now) {
            return Err(EconomyError::CompetitionClosed(window_id.to_string()));
        }

        // prizes are committed against the user record
        self.retry
            .run("ensure_user", || self.store.ensure_user(user, now))
            .await?;

        let entry = CompetitionEntry::new(window_id, user.clone(), score);
        let stored = self
            .retry
            .run("upsert_competition_score", || {
                self.store.upsert_competition_score(&entry)
            })
            .await?;
        debug!(competition = window_id, user = %user, score = stored.score, "Score recorded");
        Ok(stored)
    }

    /// Current leaderboard, rank 1 first
    pub async fn standings(&self, window_id: &str) -> Result<Vec<CompetitionEntry>> {
        self.get(window_id)?;
        let entries = self
            .retry
            .run("competition_entries", || self.store.competition_entries(window_id))
            .await?;
        Ok(rank_entries(entries))
    }

    /// Pay every prize tier of an ended window
    pub async fn finalize(&self, window_id: &str, now: DateTime<Utc>) -> Result<FinalizeReport> {
        let competition = self.get(window_id)?;
        if !competition.has_ended(now) {
            return Err(EconomyError::CompetitionStillOpen(window_id.to_string()));
        }

        let live = self.standings(window_id).await?;
        let standings = self
            .retry
            .run("freeze_competition_standings", || {
                self.store
                    .freeze_competition_standings(window_id, live.clone())
            })
            .await?;
        let mut report = FinalizeReport {
            window_id: window_id.to_string(),
            ..Default::default()
        };

        for entry in &standings {
            let Some(reward) = competition.prize_for(entry.rank) else {
                continue;
            };
            let delta = reward.to_delta(1.0)?;
            match self
                .ledger
                .apply(&entry.user_id, SourceKind::CompetitionPrize, window_id, delta)
                .await
            {
                Ok(stored) if stored.is_applied() => report.awarded += 1,
                Ok(_) => report.failed += 1,
                Err(e) if e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. }) => {
                    report.pending += 1
                }
                Err(e) => {
                    warn!(competition = window_id, user = %entry.user_id, error = %e, "Prize failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            competition = window_id,
            entrants = standings.len(),
            awarded = report.awarded,
            pending = report.pending,
            "Competition finalized"
        );
        report.standings = standings;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use chrono::{Duration, TimeZone};
    use orebit_core::{Clock, ManualClock, ONE_COIN};
    use orebit_economics::{PrizeTier, Reward};
    use orebit_storage::MemoryRemoteStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 0, 0, 0).unwrap()
    }

    fn weekly() -> CompetitionDefinition {
        CompetitionDefinition {
            id: "week-32".into(),
            start_time: start(),
            duration_hours: 168,
            prizes: vec![
                PrizeTier {
                    from_rank: 1,
                    to_rank: 1,
                    reward: Reward::coins(100.0),
                },
                PrizeTier {
                    from_rank: 2,
                    to_rank: 3,
                    reward: Reward::xp(200),
                },
            ],
        }
    }

    fn setup() -> (Arc<MemoryRemoteStore>, Arc<ManualClock>, CompetitionService) {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let retry = RetryPolicy::new(RetryConfig::default());
        let ledger = RewardLedger::new(
            store.clone(),
            retry.clone(),
            clock.clone(),
            Duration::seconds(60),
            5,
        );
        let service = CompetitionService::new(store.clone(), ledger, retry, vec![weekly()]);
        (store, clock, service)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scores_rejected_outside_window() {
        let (_store, clock, service) = setup();
        let alice = UserId::from("alice");

        let before = start() - Duration::hours(1);
        let err = service.record_score("week-32", &alice, 10, before).await.unwrap_err();
        assert!(matches!(err, EconomyError::CompetitionClosed(_)));

        let after = clock.advance(Duration::hours(168));
        let err = service.record_score("week-32", &alice, 10, after).await.unwrap_err();
        assert!(matches!(err, EconomyError::CompetitionClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_before_end_rejected() {
        let (_store, clock, service) = setup();
        let err = service.finalize("week-32", clock.now()).await.unwrap_err();
        assert!(matches!(err, EconomyError::CompetitionStillOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_pays_tiers_once() {
        let (store, clock, service) = setup();
        let now = clock.now();
        for (name, score) in [("alice", 50), ("bob", 80), ("carol", 80), ("dave", 10)] {
            service
                .record_score("week-32", &UserId::from(name), score, now)
                .await
                .unwrap();
        }

        let end = clock.advance(Duration::hours(168));
        let report = service.finalize("week-32", end).await.unwrap();
        assert_eq!(report.awarded, 3);
        let order: Vec<&str> = report.standings.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(order, vec!["bob", "carol", "alice", "dave"]);

        let bob = store.get_user_state(&UserId::from("bob")).await.unwrap();
        assert_eq!(bob.balance, 100 * ONE_COIN);
        let dave = store.get_user_state(&UserId::from("dave")).await.unwrap();
        assert_eq!(dave.total_xp, 0);

        let len = store.ledger_len();
        let again = service.finalize("week-32", end).await.unwrap();
        assert_eq!(again.awarded, 3);
        assert_eq!(store.ledger_len(), len);
        assert_eq!(
            store.get_user_state(&UserId::from("bob")).await.unwrap().balance,
            100 * ONE_COIN
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_score_does_not_change_prizes() {
        let (store, clock, service) = setup();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        service
            .record_score("week-32", &alice, 50, clock.now())
            .await
            .unwrap();

        let end = clock.advance(Duration::hours(168));
        service.finalize("week-32", end).await.unwrap();

        // a lagging client still believes the window is open
        let err = service
            .record_score("week-32", &bob, 80, end - Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::CompetitionClosed(_)));

        let again = service.finalize("week-32", end).await.unwrap();
        assert_eq!(again.standings.len(), 1);
        assert_eq!(again.standings[0].user_id, alice);
        assert_eq!(store.get_user_state(&alice).await.unwrap().balance, 100 * ONE_COIN);
        assert_eq!(store.get_user_state(&bob).await.unwrap().balance, 0);
        assert!(store.ledger_for(&bob).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_competition_awards_nothing() {
        let (store, clock, service) = setup();
        let end = clock.advance(Duration::hours(200));
        let report = service.finalize("week-32", end).await.unwrap();
        assert!(report.standings.is_empty());
        assert_eq!(report.awarded, 0);
        assert_eq!(store.ledger_len(), 0);
    }
}
