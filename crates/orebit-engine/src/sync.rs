//! Synchronization Manager
//!
//! Reconciles a client's local view with the remote store.
//!
//! - **Pull**: authoritative fields come from the store; level, efficiency and
//!   hash rate are re-derived, never read back from the cache.
//! - **Push**: queued reward triggers go through the ledger under their
//!   original key, so re-sending after a crash or from a second tab is safe.
//! - **Divergence**: an unreadable cache is discarded and rebuilt from the
//!   store.

use crate::ledger::{RewardLedger, SweepReport};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orebit_core::{Clock, EconomyError, Result, UserId, UserProgressionState};
use orebit_economics::{ProgressionCalculator, RateCalculator};
use orebit_storage::{CachedState, LocalCache, PendingTrigger, RemoteStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of one [`SyncManager::reconcile`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    /// Triggers that reached a terminal ledger state
    pub pushed: usize,

    /// Triggers dropped because the ledger rejected them
    pub rejected: usize,

    /// Triggers still waiting in the local queue
    pub queued: usize,
    pub swept: SweepReport,

    /// Retry budget exhausted somewhere; the UI shows "sync delayed"
    pub sync_delayed: bool,

    /// Fresh authoritative state, when the pull succeeded
    pub state: Option<UserProgressionState>,
}

/// Outcome of pushing the local queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub pushed: usize,
    pub rejected: usize,
    pub queued: usize,
    pub delayed: bool,
}

/// Local/remote reconciliation for every user of one client
pub struct SyncManager {
    store: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    ledger: RewardLedger,
    retry: RetryPolicy,
    progression: Arc<ProgressionCalculator>,
    rates: Arc<RateCalculator>,
    clock: Arc<dyn Clock>,

    /// Serializes queue read-modify-write per user
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        ledger: RewardLedger,
        retry: RetryPolicy,
        progression: Arc<ProgressionCalculator>,
        rates: Arc<RateCalculator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            ledger,
            retry,
            progression,
            rates,
            clock,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Recompute derived fields from authoritative ones
    pub fn derive(&self, state: &UserProgressionState) -> UserProgressionState {
        let mut next = self.progression.rederive(state);
        next.hash_rate = self.rates.hash_rate(&next);
        next
    }

    /// Cached record, or `None` when absent or unusable.
    ///
    /// Unusable records are discarded so the next write starts clean.
    fn read_cache(&self, user: &UserId) -> Option<CachedState> {
        match self.cache.load(user) {
            Ok(cached) => cached,
            Err(e @ EconomyError::CacheCorruption(_)) => {
                warn!(user = %user, error = %e, "Discarding local cache");
                if let Err(e) = self.cache.discard(user) {
                    warn!(user = %user, error = %e, "Failed to discard local cache");
                }
                None
            }
            Err(e) => {
                warn!(user = %user, error = %e, "Local cache unreadable");
                None
            }
        }
    }

    fn write_cache(&self, user: &UserId, cached: &CachedState) {
        if let Err(e) = self.cache.store(user, cached) {
            warn!(user = %user, error = %e, "Failed to write local cache");
        }
    }

    /// State for display: the cached snapshot if usable, otherwise a pull
    pub async fn load(&self, user: &UserId) -> Result<UserProgressionState> {
        match self.read_cache(user) {
            Some(cached) => Ok(self.derive(&cached.snapshot)),
            None => self.rehydrate(user).await,
        }
    }

    /// Fetch authoritative fields and refresh the cached snapshot
    pub async fn pull(&self, user: &UserId) -> Result<UserProgressionState> {
        let now = self.clock.now();
        let record = self
            .retry
            .run("ensure_user", || self.store.ensure_user(user, now))
            .await?;
        let state = self.derive(&record.to_state(now));

        let lock = self.lock_for(user);
        let _guard = lock.lock().await;
        let mut cached = self
            .read_cache(user)
            .unwrap_or_else(|| CachedState::new(state.clone(), now));
        cached.snapshot = state.clone();
        cached.saved_at = now;
        self.write_cache(user, &cached);

        debug!(user = %user, level = state.level, balance = state.balance, "Pulled state");
        Ok(state)
    }

    /// Drop the local cache and rebuild it from the store
    pub async fn rehydrate(&self, user: &UserId) -> Result<UserProgressionState> {
        info!(user = %user, "Rehydrating from remote store");
        {
            let lock = self.lock_for(user);
            let _guard = lock.lock().await;
            self.cache.discard(user)?;
        }
        self.pull(user).await
    }

    /// Queue a reward trigger locally (write-through); duplicates are ignored
    pub async fn enqueue(&self, user: &UserId, trigger: PendingTrigger) -> Result<()> {
        if &trigger.key.user_id != user {
            return Err(EconomyError::InvalidDelta(format!(
                "trigger {} queued for {user}",
                trigger.key
            )));
        }
        trigger.delta.validate(trigger.key.source_kind)?;

        let lock = self.lock_for(user);
        let _guard = lock.lock().await;
        let mut cached = self.read_cache(user).unwrap_or_else(|| {
            CachedState::new(UserProgressionState::new(user.clone()), self.clock.now())
        });
        if !cached.pending.iter().any(|t| t.key == trigger.key) {
            cached.pending.push(trigger);
        }
        self.cache.store(user, &cached)
    }

    /// Triggers waiting locally
    pub async fn queued(&self, user: &UserId) -> Vec<PendingTrigger> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;
        self.read_cache(user).map(|c| c.pending).unwrap_or_default()
    }

    /// Push queued triggers through the ledger, oldest first.
    ///
    /// Stops at the first delayed trigger so ordering is preserved.
    pub async fn push(&self, user: &UserId) -> Result<PushOutcome> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let Some(mut cached) = self.read_cache(user) else {
            return Ok(PushOutcome::default());
        };

        let mut outcome = PushOutcome::default();
        while let Some(trigger) = cached.pending.first().cloned() {
            let result = self
                .ledger
                .apply(
                    user,
                    trigger.key.source_kind,
                    trigger.key.source_id.clone(),
                    trigger.delta.clone(),
                )
                .await;

            match result {
                Ok(_) => outcome.pushed += 1,
                Err(e) if is_delay(&e) => {
                    outcome.delayed = true;
                    break;
                }
                Err(e) => {
                    warn!(key = %trigger.key, error = %e, "Dropping rejected trigger");
                    outcome.rejected += 1;
                }
            }
            cached.pending.remove(0);
            self.write_cache(user, &cached);
        }

        outcome.queued = cached.pending.len();
        Ok(outcome)
    }

    /// Push, sweep this user's pending ledger entries, then pull
    pub async fn reconcile(&self, user: &UserId, now: DateTime<Utc>) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let push = self.push(user).await?;
        report.pushed = push.pushed;
        report.rejected = push.rejected;
        report.queued = push.queued;
        report.sync_delayed = push.delayed;

        match self.ledger.sweep(Some(user), now).await {
            Ok(swept) => report.swept = swept,
            Err(e) if is_delay(&e) => report.sync_delayed = true,
            Err(e) => return Err(e),
        }

        match self.pull(user).await {
            Ok(state) => report.state = Some(state),
            Err(e) if is_delay(&e) => report.sync_delayed = true,
            Err(e) => return Err(e),
        }

        if report.sync_delayed {
            warn!(user = %user, queued = report.queued, "Sync delayed");
        } else {
            debug!(user = %user, pushed = report.pushed, "Reconciled");
        }
        Ok(report)
    }
}

fn is_delay(e: &EconomyError) -> bool {
    e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use chrono::{Duration, TimeZone};
    use orebit_core::{FixedJitter, LedgerDelta, LedgerKey, ManualClock, SourceKind, ONE_COIN};
    use orebit_economics::{AlgorithmTable, ProgressionConfig, RateConfig};
    use orebit_storage::{MemoryCache, MemoryRemoteStore, RemoteUserRecord};

    struct Fixture {
        store: Arc<MemoryRemoteStore>,
        cache: Arc<MemoryCache>,
        clock: Arc<ManualClock>,
        sync: SyncManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
        ));
        let retry = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 10,
            attempt_timeout_ms: 1_000,
        });
        let progression = Arc::new(ProgressionCalculator::new(ProgressionConfig::default()).unwrap());
        let rates = Arc::new(
            RateCalculator::new(
                RateConfig::default(),
                progression.clone(),
                AlgorithmTable::default(),
                Arc::new(FixedJitter(1.0)),
            )
            .unwrap(),
        );
        let ledger = RewardLedger::new(
            store.clone(),
            retry.clone(),
            clock.clone(),
            Duration::seconds(60),
            5,
        );
        let sync = SyncManager::new(
            store.clone(),
            cache.clone(),
            ledger,
            retry,
            progression,
            rates,
            clock.clone(),
        );
        Fixture {
            store,
            cache,
            clock,
            sync,
        }
    }

    fn accrual(user: &UserId, window: u64, now: DateTime<Utc>) -> PendingTrigger {
        PendingTrigger {
            key: LedgerKey::new(user.clone(), SourceKind::Accrual, window.to_string()),
            delta: LedgerDelta {
                balance: ONE_COIN as i64,
                xp: 5,
                mined_windows: 1,
                ..Default::default()
            },
            queued_at: now,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_cache_rehydrates_from_store() {
        let f = fixture();
        let alice = UserId::from("alice");
        let mut record = RemoteUserRecord::new(alice.clone(), f.clock.now());
        record.total_xp = 300;
        record.balance = 7 * ONE_COIN;
        f.store.seed_user(record);

        f.cache.put_raw(&alice, b"{ not json".to_vec());
        let state = f.sync.load(&alice).await.unwrap();

        assert_eq!(state.total_xp, 300);
        assert_eq!(state.level, 3);
        assert_eq!(state.balance, 7 * ONE_COIN);
        assert!(f.cache.load(&alice).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_fields_never_trusted_from_cache() {
        let f = fixture();
        let alice = UserId::from("alice");
        let mut snapshot = UserProgressionState::new(alice.clone());
        snapshot.total_xp = 120;
        snapshot.level = 9;
        snapshot.efficiency = 1.5;
        f.cache
            .store(&alice, &CachedState::new(snapshot, f.clock.now()))
            .unwrap();

        let state = f.sync.load(&alice).await.unwrap();
        assert_eq!(state.level, 2);
        assert_eq!(state.efficiency, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_ignores_duplicate_keys() {
        let f = fixture();
        let alice = UserId::from("alice");
        let now = f.clock.now();

        f.sync.enqueue(&alice, accrual(&alice, 7, now)).await.unwrap();
        f.sync.enqueue(&alice, accrual(&alice, 7, now)).await.unwrap();
        f.sync.enqueue(&alice, accrual(&alice, 8, now)).await.unwrap();

        assert_eq!(f.sync.queued(&alice).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_rejects_foreign_trigger() {
        let f = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let err = f
            .sync
            .enqueue(&alice, accrual(&bob, 1, f.clock.now()))
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::InvalidDelta(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_offline_keeps_queue() {
        let f = fixture();
        let alice = UserId::from("alice");
        let now = f.clock.now();
        f.sync.enqueue(&alice, accrual(&alice, 1, now)).await.unwrap();
        f.sync.enqueue(&alice, accrual(&alice, 2, now)).await.unwrap();

        f.store.set_offline(true);
        let outcome = f.sync.push(&alice).await.unwrap();
        assert!(outcome.delayed);
        assert_eq!(outcome.queued, 2);

        f.store.set_offline(false);
        f.store.ensure_user(&alice, now).await.unwrap();
        let later = f.clock.advance(Duration::minutes(2));
        let report = f.sync.reconcile(&alice, later).await.unwrap();

        assert_eq!(report.pushed, 2);
        assert_eq!(report.queued, 0);
        assert!(!report.sync_delayed);
        let state = report.state.unwrap();
        assert_eq!(state.balance, 2 * ONE_COIN);
        assert_eq!(state.mined_windows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_preserves_queue() {
        let f = fixture();
        let alice = UserId::from("alice");
        f.sync
            .enqueue(&alice, accrual(&alice, 4, f.clock.now()))
            .await
            .unwrap();

        f.sync.pull(&alice).await.unwrap();
        assert_eq!(f.sync.queued(&alice).await.len(), 1);
    }
}
