//! Remote store interface
//!
//! The remote store is the single source of truth for balances, XP, unlocks
//! and the reward ledger. It must enforce uniqueness of ledger keys and apply
//! each entry's delta together with its `pending -> applied` transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orebit_core::{
    Algorithm, FeatureId, LedgerEntry, LedgerKey, Result, UserId, UserProgressionState,
};
use orebit_economics::{CommunityMetric, CompetitionEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outcome of an insert-if-absent
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOutcome {
    /// New pending entry written
    Inserted(LedgerEntry),

    /// Key already taken; the stored entry is returned unchanged
    Existing(LedgerEntry),
}

impl InsertOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::Inserted(e) | Self::Existing(e) => e,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Self::Inserted(e) | Self::Existing(e) => e,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Authoritative per-user fields as stored remotely
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUserRecord {
    pub user_id: UserId,
    pub total_xp: u64,
    pub balance: u64,
    pub unlocked_features: BTreeSet<FeatureId>,
    pub owned_algorithms: BTreeSet<Algorithm>,
    pub selected_algorithm: Algorithm,
    pub mined_windows: u64,
    pub created_at: DateTime<Utc>,

    /// Time of the last applied ledger entry
    pub last_active_at: Option<DateTime<Utc>>,
}

impl RemoteUserRecord {
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        let fresh = UserProgressionState::new(user_id.clone());
        Self {
            user_id,
            total_xp: 0,
            balance: 0,
            unlocked_features: fresh.unlocked_features,
            owned_algorithms: fresh.owned_algorithms,
            selected_algorithm: fresh.selected_algorithm,
            mined_windows: 0,
            created_at: now,
            last_active_at: None,
        }
    }

    /// State with authoritative fields filled in; derived fields still need
    /// to be recomputed by the progression calculator.
    pub fn to_state(&self, synced_at: DateTime<Utc>) -> UserProgressionState {
        let mut state = UserProgressionState::new(self.user_id.clone());
        state.total_xp = self.total_xp;
        state.balance = self.balance;
        state.unlocked_features = self.unlocked_features.clone();
        state.owned_algorithms = self.owned_algorithms.clone();
        state.selected_algorithm = self.selected_algorithm;
        state.mined_windows = self.mined_windows;
        state.last_synced_at = Some(synced_at);
        state
    }
}

/// Aggregate query in store terms
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricQuery {
    /// Users with `last_active_at >= since`
    ActiveSince(DateTime<Utc>),
    TotalMinedWindows,
    TotalXp,

    /// Users with `total_xp >= min_total_xp`
    UsersWithXpAtLeast(u64),
}

/// Recipient filter in store terms
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EligibilityFilter {
    pub min_total_xp: u64,
    pub active_since: Option<DateTime<Utc>>,
}

/// Authoritative backend.
///
/// Implementations must be safe to call concurrently from many sessions;
/// every mutating method is atomic with respect to the others.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Authoritative fields, `UserNotFound` for unknown users
    async fn get_user_state(&self, user: &UserId) -> Result<RemoteUserRecord>;

    /// Create the record on first contact; existing records are untouched
    async fn ensure_user(&self, user: &UserId, now: DateTime<Utc>) -> Result<RemoteUserRecord>;

    /// Atomic additive change; rejects results below zero.
    ///
    /// Out-of-band adjustment for operators and backfills. Engine paths never
    /// call it: every earned or spent coin goes through
    /// [`commit_ledger_entry`](Self::commit_ledger_entry), which applies the
    /// delta and marks the entry applied in one step, so a direct increment
    /// leaves no ledger entry behind.
    async fn increment_balance(&self, user: &UserId, amount: i64) -> Result<u64>;

    async fn set_selected_algorithm(&self, user: &UserId, algorithm: Algorithm) -> Result<()>;

    async fn insert_ledger_entry_if_absent(&self, entry: LedgerEntry) -> Result<InsertOutcome>;

    async fn get_ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>>;

    /// Apply the entry's delta and mark it applied in one step.
    ///
    /// Entries that are already applied or failed are returned unchanged.
    async fn commit_ledger_entry(&self, key: &LedgerKey, now: DateTime<Utc>) -> Result<LedgerEntry>;

    /// Mark a pending entry failed; terminal entries are returned unchanged
    async fn fail_ledger_entry(
        &self,
        key: &LedgerKey,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry>;

    /// Pending entries, for one user or all users
    async fn pending_ledger_entries(&self, user: Option<&UserId>) -> Result<Vec<LedgerEntry>>;

    async fn applied_keys(&self, user: &UserId) -> Result<BTreeSet<LedgerKey>>;

    async fn query_aggregate_metric(&self, query: &MetricQuery) -> Result<u64>;

    /// Eligible users in ascending id order
    async fn list_eligible_users(&self, filter: &EligibilityFilter) -> Result<Vec<UserId>>;

    async fn load_community_metric(&self, id: &str) -> Result<Option<CommunityMetric>>;

    /// Persist a metric; `current_value` and `completed` never move backwards
    async fn save_community_metric(&self, metric: &CommunityMetric) -> Result<CommunityMetric>;

    /// Keep the better of the stored and submitted score.
    ///
    /// Rejected with `CompetitionClosed` once the window's standings are frozen.
    async fn upsert_competition_score(&self, entry: &CompetitionEntry) -> Result<CompetitionEntry>;

    async fn competition_entries(&self, window_id: &str) -> Result<Vec<CompetitionEntry>>;

    /// Freeze the final standings of a window and close it to new scores.
    ///
    /// The first call wins; later calls return the standings stored by it.
    async fn freeze_competition_standings(
        &self,
        window_id: &str,
        standings: Vec<CompetitionEntry>,
    ) -> Result<Vec<CompetitionEntry>>;
}
