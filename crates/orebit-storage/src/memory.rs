//! In-memory remote store
//!
//! Reference [`RemoteStore`] used by tests, the CLI simulator and local
//! development. All state sits behind one lock so that every method is
//! atomic. Faults can be injected per operation to exercise retry, resume
//! and reconciliation paths.

use crate::remote::{EligibilityFilter, InsertOutcome, MetricQuery, RemoteStore, RemoteUserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orebit_core::{
    Algorithm, EconomyError, LedgerEntry, LedgerKey, LedgerStatus, Result, SourceKind, UserId,
};
use orebit_economics::{CommunityMetric, CompetitionEntry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Store operation, used to target injected faults
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetUser,
    EnsureUser,
    IncrementBalance,
    SelectAlgorithm,
    InsertLedger,
    GetLedger,
    CommitLedger,
    FailLedger,
    PendingLedger,
    AppliedKeys,
    QueryMetric,
    ListEligible,
    LoadMetric,
    SaveMetric,
    UpsertScore,
    CompetitionEntries,
    FreezeStandings,
}

impl StoreOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetUser => "get_user_state",
            Self::EnsureUser => "ensure_user",
            Self::IncrementBalance => "increment_balance",
            Self::SelectAlgorithm => "set_selected_algorithm",
            Self::InsertLedger => "insert_ledger_entry_if_absent",
            Self::GetLedger => "get_ledger_entry",
            Self::CommitLedger => "commit_ledger_entry",
            Self::FailLedger => "fail_ledger_entry",
            Self::PendingLedger => "pending_ledger_entries",
            Self::AppliedKeys => "applied_keys",
            Self::QueryMetric => "query_aggregate_metric",
            Self::ListEligible => "list_eligible_users",
            Self::LoadMetric => "load_community_metric",
            Self::SaveMetric => "save_community_metric",
            Self::UpsertScore => "upsert_competition_score",
            Self::CompetitionEntries => "competition_entries",
            Self::FreezeStandings => "freeze_competition_standings",
        }
    }
}

/// Injected failure for the next `times` calls of one operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail before the call reaches the store
    Unreachable { times: u32 },

    /// Perform the operation, then lose the response
    LoseResponse { times: u32 },
}

#[derive(Default)]
struct Inner {
    users: BTreeMap<UserId, RemoteUserRecord>,
    ledger: BTreeMap<LedgerKey, LedgerEntry>,
    metrics: HashMap<String, CommunityMetric>,
    competitions: HashMap<String, BTreeMap<UserId, CompetitionEntry>>,
    frozen: HashMap<String, Vec<CompetitionEntry>>,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    latency: Option<Duration>,
    planned: HashMap<StoreOp, Fault>,
    calls: HashMap<StoreOp, u64>,
}

/// Thread-safe in-memory [`RemoteStore`]
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
    faults: Mutex<Faults>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a transient error while offline
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Delay every call, e.g. to trigger client timeouts
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    pub fn inject(&self, op: StoreOp, fault: Fault) {
        self.faults.lock().planned.insert(op, fault);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.offline = false;
        faults.latency = None;
        faults.planned.clear();
    }

    /// Calls that reached the store or were failed by injection
    pub fn calls(&self, op: StoreOp) -> u64 {
        self.faults.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// All ledger entries for one user, in key order
    pub fn ledger_for(&self, user: &UserId) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .ledger
            .values()
            .filter(|e| &e.key.user_id == user)
            .cloned()
            .collect()
    }

    pub fn ledger_len(&self) -> usize {
        self.inner.lock().ledger.len()
    }

    /// Seed a user record directly, bypassing the ledger
    pub fn seed_user(&self, record: RemoteUserRecord) {
        self.inner.lock().users.insert(record.user_id.clone(), record);
    }

    /// Directly mark a user active, as any other client would
    pub fn touch_user(&self, user: &UserId, at: DateTime<Utc>) {
        if let Some(record) = self.inner.lock().users.get_mut(user) {
            record.last_active_at = Some(at);
        }
    }

    async fn gate(&self, op: StoreOp) -> Result<bool> {
        let latency = {
            let mut faults = self.faults.lock();
            *faults.calls.entry(op).or_default() += 1;
            faults.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        if faults.offline {
            return Err(EconomyError::transient(op.name(), "store offline"));
        }

        let mut lose_response = false;
        let mut unreachable = false;
        let mut clear = false;
        if let Some(fault) = faults.planned.get_mut(&op) {
            let (times, lose) = match fault {
                Fault::Unreachable { times } => (times, false),
                Fault::LoseResponse { times } => (times, true),
            };
            if *times > 0 {
                *times -= 1;
                if lose {
                    lose_response = true;
                } else {
                    unreachable = true;
                }
            }
            clear = *times == 0;
        }
        if clear {
            faults.planned.remove(&op);
        }
        if unreachable {
            return Err(EconomyError::transient(op.name(), "injected fault"));
        }
        Ok(lose_response)
    }

    fn lost(op: StoreOp) -> EconomyError {
        EconomyError::transient(op.name(), "response lost")
    }
}

fn apply_entry(
    record: &mut RemoteUserRecord,
    entry: &LedgerEntry,
) -> Result<()> {
    let delta = &entry.delta;

    if delta.balance < 0 {
        let required = delta.balance.unsigned_abs();
        if record.balance < required {
            return Err(EconomyError::InsufficientBalance {
                user: record.user_id.clone(),
                required,
                available: record.balance,
            });
        }
    }
    if entry.key.source_kind == SourceKind::Purchase {
        if let Some(owned) = delta
            .grant_algorithms
            .iter()
            .find(|a| record.owned_algorithms.contains(a))
        {
            return Err(EconomyError::AlgorithmAlreadyOwned {
                user: record.user_id.clone(),
                algorithm: *owned,
            });
        }
    }

    record.total_xp = record.total_xp.saturating_add(delta.xp);
    record.balance = if delta.balance >= 0 {
        record.balance.saturating_add(delta.balance as u64)
    } else {
        record.balance - delta.balance.unsigned_abs()
    };
    record
        .unlocked_features
        .extend(delta.unlock_features.iter().cloned());
    record
        .owned_algorithms
        .extend(delta.grant_algorithms.iter().copied());
    record.mined_windows = record.mined_windows.saturating_add(delta.mined_windows);
    Ok(())
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get_user_state(&self, user: &UserId) -> Result<RemoteUserRecord> {
        let lose = self.gate(StoreOp::GetUser).await?;
        let record = self
            .inner
            .lock()
            .users
            .get(user)
            .cloned()
            .ok_or_else(|| EconomyError::UserNotFound(user.clone()))?;
        if lose {
            return Err(Self::lost(StoreOp::GetUser));
        }
        Ok(record)
    }

    async fn ensure_user(&self, user: &UserId, now: DateTime<Utc>) -> Result<RemoteUserRecord> {
        let lose = self.gate(StoreOp::EnsureUser).await?;
        let record = self
            .inner
            .lock()
            .users
            .entry(user.clone())
            .or_insert_with(|| RemoteUserRecord::new(user.clone(), now))
            .clone();
        if lose {
            return Err(Self::lost(StoreOp::EnsureUser));
        }
        Ok(record)
    }

    async fn increment_balance(&self, user: &UserId, amount: i64) -> Result<u64> {
        let lose = self.gate(StoreOp::IncrementBalance).await?;
        let balance = {
            let mut inner = self.inner.lock();
            let record = inner
                .users
                .get_mut(user)
                .ok_or_else(|| EconomyError::UserNotFound(user.clone()))?;
            if amount < 0 && record.balance < amount.unsigned_abs() {
                return Err(EconomyError::InsufficientBalance {
                    user: user.clone(),
                    required: amount.unsigned_abs(),
                    available: record.balance,
                });
            }
            record.balance = if amount >= 0 {
                record.balance.saturating_add(amount as u64)
            } else {
                record.balance - amount.unsigned_abs()
            };
            record.balance
        };
        if lose {
            return Err(Self::lost(StoreOp::IncrementBalance));
        }
        Ok(balance)
    }

    async fn set_selected_algorithm(&self, user: &UserId, algorithm: Algorithm) -> Result<()> {
        let lose = self.gate(StoreOp::SelectAlgorithm).await?;
        {
            let mut inner = self.inner.lock();
            let record = inner
                .users
                .get_mut(user)
                .ok_or_else(|| EconomyError::UserNotFound(user.clone()))?;
            if !record.owned_algorithms.contains(&algorithm) {
                return Err(EconomyError::AlgorithmNotOwned {
                    user: user.clone(),
                    algorithm,
                });
            }
            record.selected_algorithm = algorithm;
        }
        if lose {
            return Err(Self::lost(StoreOp::SelectAlgorithm));
        }
        Ok(())
    }

    async fn insert_ledger_entry_if_absent(&self, entry: LedgerEntry) -> Result<InsertOutcome> {
        let lose = self.gate(StoreOp::InsertLedger).await?;
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.ledger.get(&entry.key) {
                Some(existing) => InsertOutcome::Existing(existing.clone()),
                None => {
                    debug!(key = %entry.key, "Ledger entry inserted");
                    inner.ledger.insert(entry.key.clone(), entry.clone());
                    InsertOutcome::Inserted(entry)
                }
            }
        };
        if lose {
            return Err(Self::lost(StoreOp::InsertLedger));
        }
        Ok(outcome)
    }

    async fn get_ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        let lose = self.gate(StoreOp::GetLedger).await?;
        let entry = self.inner.lock().ledger.get(key).cloned();
        if lose {
            return Err(Self::lost(StoreOp::GetLedger));
        }
        Ok(entry)
    }

    async fn commit_ledger_entry(&self, key: &LedgerKey, now: DateTime<Utc>) -> Result<LedgerEntry> {
        let lose = self.gate(StoreOp::CommitLedger).await?;
        let committed = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let entry = inner
                .ledger
                .get_mut(key)
                .ok_or_else(|| EconomyError::LedgerEntryNotFound(key.clone()))?;
            if entry.status != LedgerStatus::Pending {
                return Ok(entry.clone());
            }
            entry.attempts += 1;

            let record = inner
                .users
                .get_mut(&key.user_id)
                .ok_or_else(|| EconomyError::UserNotFound(key.user_id.clone()))?;

            // Validate and apply against a copy so a rejected commit leaves no trace
            let mut next = record.clone();
            apply_entry(&mut next, entry)?;
            next.last_active_at = Some(now);
            *record = next;

            entry.status = LedgerStatus::Applied;
            entry.applied_at = Some(now);
            entry.clone()
        };
        debug!(key = %key, "Ledger entry committed");
        if lose {
            return Err(Self::lost(StoreOp::CommitLedger));
        }
        Ok(committed)
    }

    async fn fail_ledger_entry(
        &self,
        key: &LedgerKey,
        reason: &str,
        _now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let lose = self.gate(StoreOp::FailLedger).await?;
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner
                .ledger
                .get_mut(key)
                .ok_or_else(|| EconomyError::LedgerEntryNotFound(key.clone()))?;
            if entry.status == LedgerStatus::Pending {
                warn!(key = %key, reason, "Ledger entry marked failed");
                entry.status = LedgerStatus::Failed;
                entry.failure = Some(reason.to_string());
            }
            entry.clone()
        };
        if lose {
            return Err(Self::lost(StoreOp::FailLedger));
        }
        Ok(entry)
    }

    async fn pending_ledger_entries(&self, user: Option<&UserId>) -> Result<Vec<LedgerEntry>> {
        let lose = self.gate(StoreOp::PendingLedger).await?;
        let pending = self
            .inner
            .lock()
            .ledger
            .values()
            .filter(|e| e.is_pending())
            .filter(|e| user.map(|u| &e.key.user_id == u).unwrap_or(true))
            .cloned()
            .collect();
        if lose {
            return Err(Self::lost(StoreOp::PendingLedger));
        }
        Ok(pending)
    }

    async fn applied_keys(&self, user: &UserId) -> Result<BTreeSet<LedgerKey>> {
        let lose = self.gate(StoreOp::AppliedKeys).await?;
        let keys = self
            .inner
            .lock()
            .ledger
            .values()
            .filter(|e| &e.key.user_id == user && e.is_applied())
            .map(|e| e.key.clone())
            .collect();
        if lose {
            return Err(Self::lost(StoreOp::AppliedKeys));
        }
        Ok(keys)
    }

    async fn query_aggregate_metric(&self, query: &MetricQuery) -> Result<u64> {
        let lose = self.gate(StoreOp::QueryMetric).await?;
        let value = {
            let inner = self.inner.lock();
            let users = inner.users.values();
            match query {
                MetricQuery::ActiveSince(since) => users
                    .filter(|u| u.last_active_at.map(|t| t >= *since).unwrap_or(false))
                    .count() as u64,
                MetricQuery::TotalMinedWindows => users.map(|u| u.mined_windows).sum(),
                MetricQuery::TotalXp => users.map(|u| u.total_xp).sum(),
                MetricQuery::UsersWithXpAtLeast(min) => {
                    users.filter(|u| u.total_xp >= *min).count() as u64
                }
            }
        };
        if lose {
            return Err(Self::lost(StoreOp::QueryMetric));
        }
        Ok(value)
    }

    async fn list_eligible_users(&self, filter: &EligibilityFilter) -> Result<Vec<UserId>> {
        let lose = self.gate(StoreOp::ListEligible).await?;
        let users = self
            .inner
            .lock()
            .users
            .values()
            .filter(|u| u.total_xp >= filter.min_total_xp)
            .filter(|u| match filter.active_since {
                Some(since) => u.last_active_at.map(|t| t >= since).unwrap_or(false),
                None => true,
            })
            .map(|u| u.user_id.clone())
            .collect();
        if lose {
            return Err(Self::lost(StoreOp::ListEligible));
        }
        Ok(users)
    }

    async fn load_community_metric(&self, id: &str) -> Result<Option<CommunityMetric>> {
        let lose = self.gate(StoreOp::LoadMetric).await?;
        let metric = self.inner.lock().metrics.get(id).cloned();
        if lose {
            return Err(Self::lost(StoreOp::LoadMetric));
        }
        Ok(metric)
    }

    async fn save_community_metric(&self, metric: &CommunityMetric) -> Result<CommunityMetric> {
        let lose = self.gate(StoreOp::SaveMetric).await?;
        let saved = {
            let mut inner = self.inner.lock();
            let stored = inner
                .metrics
                .entry(metric.id.clone())
                .or_insert_with(|| metric.clone());

            stored.current_value = stored.current_value.max(metric.current_value);
            stored.target = metric.target;
            if !stored.completed && metric.completed {
                stored.completed = true;
                stored.completed_at = metric.completed_at;
            }
            if stored.eligible_snapshot.is_empty() {
                stored.eligible_snapshot = metric.eligible_snapshot.clone();
            }
            stored.distributed |= metric.distributed;
            stored.clone()
        };
        if lose {
            return Err(Self::lost(StoreOp::SaveMetric));
        }
        Ok(saved)
    }

    async fn upsert_competition_score(&self, entry: &CompetitionEntry) -> Result<CompetitionEntry> {
        let lose = self.gate(StoreOp::UpsertScore).await?;
        let stored = {
            let mut inner = self.inner.lock();
            if inner.frozen.contains_key(&entry.window_id) {
                return Err(EconomyError::CompetitionClosed(entry.window_id.clone()));
            }
            let board = inner.competitions.entry(entry.window_id.clone()).or_default();
            let stored = board
                .entry(entry.user_id.clone())
                .or_insert_with(|| entry.clone());
            stored.score = stored.score.max(entry.score);
            stored.clone()
        };
        if lose {
            return Err(Self::lost(StoreOp::UpsertScore));
        }
        Ok(stored)
    }

    async fn competition_entries(&self, window_id: &str) -> Result<Vec<CompetitionEntry>> {
        let lose = self.gate(StoreOp::CompetitionEntries).await?;
        let entries = self
            .inner
            .lock()
            .competitions
            .get(window_id)
            .map(|board| board.values().cloned().collect())
            .unwrap_or_default();
        if lose {
            return Err(Self::lost(StoreOp::CompetitionEntries));
        }
        Ok(entries)
    }

    async fn freeze_competition_standings(
        &self,
        window_id: &str,
        standings: Vec<CompetitionEntry>,
    ) -> Result<Vec<CompetitionEntry>> {
        let lose = self.gate(StoreOp::FreezeStandings).await?;
        let frozen = self
            .inner
            .lock()
            .frozen
            .entry(window_id.to_string())
            .or_insert(standings)
            .clone();
        if lose {
            return Err(Self::lost(StoreOp::FreezeStandings));
        }
        Ok(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use orebit_core::{LedgerDelta, ONE_COIN};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
    }

    fn pending(user: &str, kind: SourceKind, id: &str, delta: LedgerDelta) -> LedgerEntry {
        LedgerEntry::pending(LedgerKey::new(UserId::from(user), kind, id), delta, now())
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_key() {
        let store = MemoryRemoteStore::new();
        let entry = pending("alice", SourceKind::Achievement, "first_mine", LedgerDelta::xp(100));

        let first = store.insert_ledger_entry_if_absent(entry.clone()).await.unwrap();
        let mut other = entry.clone();
        other.delta = LedgerDelta::xp(999);
        let second = store.insert_ledger_entry_if_absent(other).await.unwrap();

        assert!(first.was_inserted());
        assert!(!second.was_inserted());
        assert_eq!(second.entry().delta.xp, 100);
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_commit_applies_once() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        store.ensure_user(&alice, now()).await.unwrap();
        let entry = pending("alice", SourceKind::Achievement, "first_mine", LedgerDelta::xp(100));
        store.insert_ledger_entry_if_absent(entry.clone()).await.unwrap();

        store.commit_ledger_entry(&entry.key, now()).await.unwrap();
        let again = store.commit_ledger_entry(&entry.key, now()).await.unwrap();

        assert!(again.is_applied());
        assert_eq!(again.attempts, 1);
        assert_eq!(store.get_user_state(&alice).await.unwrap().total_xp, 100);
    }

    #[tokio::test]
    async fn test_purchase_rejected_without_funds() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        store.ensure_user(&alice, now()).await.unwrap();
        let entry = pending(
            "alice",
            SourceKind::Purchase,
            "scrypt:intent",
            LedgerDelta::balance(-50 * ONE_COIN as i64).with_algorithm(Algorithm::Scrypt),
        );
        store.insert_ledger_entry_if_absent(entry.clone()).await.unwrap();

        let err = store.commit_ledger_entry(&entry.key, now()).await.unwrap_err();
        assert!(matches!(err, EconomyError::InsufficientBalance { .. }));

        let record = store.get_user_state(&alice).await.unwrap();
        assert!(!record.owned_algorithms.contains(&Algorithm::Scrypt));
        assert!(store.get_ledger_entry(&entry.key).await.unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_direct_increment_bypasses_ledger() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        store.ensure_user(&alice, now()).await.unwrap();

        assert_eq!(store.increment_balance(&alice, 30).await.unwrap(), 30);
        let err = store.increment_balance(&alice, -31).await.unwrap_err();
        assert!(matches!(err, EconomyError::InsufficientBalance { .. }));
        assert_eq!(store.increment_balance(&alice, -30).await.unwrap(), 0);

        assert_eq!(store.ledger_len(), 0);
        assert!(store.applied_keys(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_response_still_applies() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        store.ensure_user(&alice, now()).await.unwrap();
        let entry = pending("alice", SourceKind::Accrual, "42", LedgerDelta::balance(10));
        store.insert_ledger_entry_if_absent(entry.clone()).await.unwrap();

        store.inject(StoreOp::CommitLedger, Fault::LoseResponse { times: 1 });
        let err = store.commit_ledger_entry(&entry.key, now()).await.unwrap_err();
        assert!(err.is_transient());

        let retried = store.commit_ledger_entry(&entry.key, now()).await.unwrap();
        assert!(retried.is_applied());
        assert_eq!(store.get_user_state(&alice).await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_unreachable_fault_clears_after_count() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        store.inject(StoreOp::EnsureUser, Fault::Unreachable { times: 2 });

        assert!(store.ensure_user(&alice, now()).await.is_err());
        assert!(store.ensure_user(&alice, now()).await.is_err());
        assert!(store.ensure_user(&alice, now()).await.is_ok());
        assert_eq!(store.calls(StoreOp::EnsureUser), 3);
    }

    #[tokio::test]
    async fn test_metric_never_regresses() {
        let store = MemoryRemoteStore::new();
        let mut metric = CommunityMetric::new("m", 10);
        metric.observe(12, now());
        store.save_community_metric(&metric).await.unwrap();

        let stale = CommunityMetric::new("m", 10);
        let saved = store.save_community_metric(&stale).await.unwrap();
        assert_eq!(saved.current_value, 12);
        assert!(saved.completed);
    }

    #[tokio::test]
    async fn test_competition_keeps_best_score() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        store
            .upsert_competition_score(&CompetitionEntry::new("w1", alice.clone(), 40))
            .await
            .unwrap();
        let stored = store
            .upsert_competition_score(&CompetitionEntry::new("w1", alice, 15))
            .await
            .unwrap();
        assert_eq!(stored.score, 40);
        assert_eq!(store.competition_entries("w1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_frozen_standings_close_the_board() {
        let store = MemoryRemoteStore::new();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let first = vec![CompetitionEntry::new("w1", alice.clone(), 50)];
        store.freeze_competition_standings("w1", first.clone()).await.unwrap();

        let err = store
            .upsert_competition_score(&CompetitionEntry::new("w1", bob.clone(), 80))
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::CompetitionClosed(_)));

        let later = vec![CompetitionEntry::new("w1", bob, 80)];
        let kept = store.freeze_competition_standings("w1", later).await.unwrap();
        assert_eq!(kept, first);
    }
}
