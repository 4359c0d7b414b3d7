//! Per-user session
//!
//! The client-facing surface of the engine: accrual, rule evaluation,
//! purchases and reconciliation for one user, plus level-up and reward
//! notifications. Several sessions for the same user (browser tabs, devices)
//! may run at once; the ledger keys keep every credit single.

use crate::engine::EconomyEngine;
use crate::sync::{PushOutcome, SyncReport};
use chrono::{DateTime, Utc};
use orebit_core::{
    Algorithm, EconomyError, FeatureId, LedgerDelta, LedgerEntry, LedgerKey, Result, RuleId,
    SourceKind, UserId, UserProgressionState,
};
use orebit_economics::{CompetitionEntry, Progress, RateBreakdown};
use orebit_storage::PendingTrigger;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Emitted when a refreshed state has a higher level than the previous one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelUp {
    pub user: UserId,
    pub from: u32,
    pub to: u32,

    /// Features that were not unlocked before
    pub unlocked: BTreeSet<FeatureId>,
}

type LevelUpCallback = Arc<dyn Fn(&LevelUp) + Send + Sync>;
type RewardCallback = Arc<dyn Fn(&LedgerEntry) + Send + Sync>;

/// Result of one [`Session::accrue`]
#[derive(Clone, Debug, PartialEq)]
pub struct AccrualReport {
    /// Windows queued for credit by this call
    pub windows: Vec<u64>,

    /// Micro-units queued by this call
    pub credited: u64,
    pub push: PushOutcome,

    /// Rules applied after the accrual
    pub rules_applied: Vec<RuleId>,
    pub sync_delayed: bool,
}

/// One user's view of the economy
pub struct Session {
    engine: Arc<EconomyEngine>,
    user: UserId,
    state: RwLock<UserProgressionState>,

    /// Highest window already queued or credited
    last_credited: Mutex<Option<u64>>,
    sync_delayed: AtomicBool,

    /// Authoritative state changed since rules were last evaluated
    rules_dirty: AtomicBool,
    level_up: RwLock<Vec<LevelUpCallback>>,
    rewards: RwLock<Vec<RewardCallback>>,
}

fn is_delay(e: &EconomyError) -> bool {
    e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. })
}

impl Session {
    /// Load state (cache first) and find where accrual left off.
    ///
    /// An unreachable store does not prevent mining: the session starts from
    /// whatever is cached and reports `sync_delayed`.
    pub async fn open(engine: Arc<EconomyEngine>, user: UserId) -> Result<Self> {
        let sync = engine.sync();
        let mut delayed = false;

        let state = match sync.load(&user).await {
            Ok(state) => state,
            Err(e) if is_delay(&e) => {
                warn!(user = %user, error = %e, "Starting offline");
                delayed = true;
                sync.derive(&UserProgressionState::new(user.clone()))
            }
            Err(e) => return Err(e),
        };

        let mut last: Option<u64> = sync
            .queued(&user)
            .await
            .iter()
            .filter_map(|t| accrual_window(&t.key))
            .max();
        match engine.ledger().applied_keys(&user).await {
            Ok(keys) => {
                let applied = keys.iter().filter_map(accrual_window).max();
                last = last.max(applied);
            }
            Err(e) if is_delay(&e) => delayed = true,
            Err(e) => return Err(e),
        }
        // no history: start with the window in progress
        let now = engine.now();
        let last = last.unwrap_or_else(|| engine.rates().window_index(now).saturating_sub(1));

        info!(user = %user, level = state.level, last_window = last, "Session opened");
        Ok(Self {
            engine,
            user,
            state: RwLock::new(state),
            last_credited: Mutex::new(Some(last)),
            sync_delayed: AtomicBool::new(delayed),
            rules_dirty: AtomicBool::new(true),
            level_up: RwLock::new(Vec::new()),
            rewards: RwLock::new(Vec::new()),
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Last known state, derived fields included
    pub fn state(&self) -> UserProgressionState {
        self.state.read().clone()
    }

    pub fn progress(&self) -> Progress {
        self.engine.progression().progress(&self.state.read())
    }

    pub fn current_rate(&self, now: DateTime<Utc>) -> f64 {
        self.rate_breakdown(now).rate
    }

    pub fn rate_breakdown(&self, now: DateTime<Utc>) -> RateBreakdown {
        let events = self.engine.active_events(now);
        self.engine
            .rates()
            .breakdown(&self.state.read(), &events, now)
    }

    /// Whether the last remote interaction ran out of retries
    pub fn is_sync_delayed(&self) -> bool {
        self.sync_delayed.load(Ordering::Relaxed)
    }

    pub fn on_level_up(&self, callback: impl Fn(&LevelUp) + Send + Sync + 'static) {
        self.level_up.write().push(Arc::new(callback));
    }

    /// Called for every rule reward this session sees applied
    pub fn on_reward_applied(&self, callback: impl Fn(&LedgerEntry) + Send + Sync + 'static) {
        self.rewards.write().push(Arc::new(callback));
    }

    fn set_state(&self, next: UserProgressionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next.clone());
        if next.authoritative() != previous.authoritative() {
            self.rules_dirty.store(true, Ordering::Relaxed);
        }
        if next.level <= previous.level {
            return;
        }

        let event = LevelUp {
            user: self.user.clone(),
            from: previous.level,
            to: next.level,
            unlocked: next
                .unlocked_features
                .difference(&previous.unlocked_features)
                .cloned()
                .collect(),
        };
        info!(user = %self.user, from = event.from, to = event.to, "Level up");
        // callbacks may register further callbacks
        let callbacks = self.level_up.read().clone();
        for callback in callbacks {
            callback(&event);
        }
    }

    fn notify_reward(&self, entry: &LedgerEntry) {
        let callbacks = self.rewards.read().clone();
        for callback in callbacks {
            callback(entry);
        }
    }

    /// Pull authoritative state; on a delay the previous state is kept
    pub async fn refresh(&self) -> Result<UserProgressionState> {
        match self.engine.sync().pull(&self.user).await {
            Ok(state) => {
                self.sync_delayed.store(false, Ordering::Relaxed);
                self.set_state(state.clone());
                Ok(state)
            }
            Err(e) if is_delay(&e) => {
                self.sync_delayed.store(true, Ordering::Relaxed);
                Ok(self.state())
            }
            Err(e) => Err(e),
        }
    }

    /// Credit every completed window since the last credited one.
    ///
    /// Catch-up after a long absence is capped at `max_offline_windows`.
    /// Each window is keyed by its index, so a second tab crediting the same
    /// window is a no-op.
    pub async fn accrue(&self, now: DateTime<Utc>) -> Result<AccrualReport> {
        let rates = self.engine.rates();
        let current = rates.window_index(now);
        let cap = rates.config().max_offline_windows;

        let windows: Vec<u64> = {
            let last = self.last_credited.lock();
            let next = last.map(|w| w + 1).unwrap_or(current);
            let from = next.max(current.saturating_sub(cap));
            (from..current).collect()
        };
        if windows.len() as u64 == cap && cap > 0 {
            debug!(user = %self.user, cap, "Offline catch-up capped");
        }

        let state = self.state();
        let mut credited = 0u64;
        for &window in &windows {
            let start = rates.window_start(window);
            let events = self.engine.active_events(start);
            let amount = rates.accrual_for_window(&state, &events, window)?;
            let xp = (rates.config().xp_per_window as f64 * self.engine.xp_multiplier(start))
                .round() as u64;
            let balance = i64::try_from(amount)
                .map_err(|_| EconomyError::InvalidDelta(format!("accrual {amount} overflows")))?;

            let delta = LedgerDelta {
                xp,
                balance,
                mined_windows: 1,
                ..Default::default()
            };
            let trigger = PendingTrigger {
                key: LedgerKey::new(self.user.clone(), SourceKind::Accrual, window.to_string()),
                delta,
                queued_at: now,
            };
            self.engine.sync().enqueue(&self.user, trigger).await?;
            credited = credited.saturating_add(amount);

            // only windows that made it into the queue count as credited
            let mut last = self.last_credited.lock();
            *last = (*last).max(Some(window));
        }

        let push = self.engine.sync().push(&self.user).await?;
        let mut sync_delayed = push.delayed;
        let mut rules_applied = Vec::new();

        if !push.delayed {
            if push.pushed > 0 {
                self.refresh().await?;
            }
            if self.rules_dirty.swap(false, Ordering::Relaxed) {
                rules_applied = self.evaluate_rules(now).await?;
            }
            sync_delayed = self.is_sync_delayed();
        } else {
            self.sync_delayed.store(true, Ordering::Relaxed);
        }

        debug!(
            user = %self.user,
            windows = windows.len(),
            credited,
            queued = push.queued,
            "Accrual tick"
        );
        Ok(AccrualReport {
            windows,
            credited,
            push,
            rules_applied,
            sync_delayed,
        })
    }

    /// Apply every per-user rule newly satisfied by the current state.
    ///
    /// XP rewards are scaled by an active double-XP window.
    pub async fn evaluate_rules(&self, now: DateTime<Utc>) -> Result<Vec<RuleId>> {
        let applied_keys = match self.engine.ledger().applied_keys(&self.user).await {
            Ok(keys) => keys,
            Err(e) if is_delay(&e) => {
                self.sync_delayed.store(true, Ordering::Relaxed);
                self.rules_dirty.store(true, Ordering::Relaxed);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let rules = self.engine.rules();
        let multiplier = self.engine.xp_multiplier(now);
        let satisfied = self.engine.evaluator().evaluate_scaled(
            &self.state(),
            rules,
            &applied_keys,
            multiplier,
        );

        let mut applied = Vec::new();
        for id in satisfied {
            let Some(rule) = rules.get(&id) else {
                continue;
            };
            let delta = rule.reward.to_delta(multiplier)?;
            match self
                .engine
                .ledger()
                .apply(&self.user, rule.kind.source_kind(), id.clone(), delta)
                .await
            {
                Ok(entry) if entry.is_applied() => {
                    self.notify_reward(&entry);
                    applied.push(id);
                }
                Ok(entry) => {
                    warn!(key = %entry.key, "Rule reward previously failed");
                }
                Err(e) if is_delay(&e) => {
                    // the sweep finishes it; later rules may depend on this one
                    self.sync_delayed.store(true, Ordering::Relaxed);
                    self.rules_dirty.store(true, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    warn!(user = %self.user, rule = %id, error = %e, "Rule reward rejected");
                }
            }
        }

        if !applied.is_empty() {
            self.refresh().await?;
        }
        Ok(applied)
    }

    /// Push, sweep and pull
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        let report = self.engine.sync().reconcile(&self.user, now).await?;
        if let Some(state) = &report.state {
            self.set_state(state.clone());
        }
        self.sync_delayed.store(report.sync_delayed, Ordering::Relaxed);
        Ok(report)
    }

    /// Buy `algorithm` at the current (possibly discounted) price
    pub async fn purchase_algorithm(
        &self,
        algorithm: Algorithm,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let state = self.refresh().await?;
        let events = self.engine.active_events(now);
        let quote = self
            .engine
            .rates()
            .algorithms()
            .quote(&state, algorithm, &events, now)?;

        if state.balance < quote.price {
            return Err(EconomyError::InsufficientBalance {
                user: self.user.clone(),
                required: quote.price,
                available: state.balance,
            });
        }
        let price = i64::try_from(quote.price)
            .map_err(|_| EconomyError::InvalidDelta(format!("price {} overflows", quote.price)))?;

        let delta = LedgerDelta::balance(-price).with_algorithm(algorithm);
        let source_id = format!("{}:{}", algorithm, Uuid::new_v4());
        let entry = self
            .engine
            .ledger()
            .apply(&self.user, SourceKind::Purchase, source_id, delta)
            .await?;

        info!(
            user = %self.user,
            algorithm = %algorithm,
            price = quote.price,
            sale = quote.sale_multiplier,
            "Algorithm purchased"
        );
        self.refresh().await?;
        Ok(entry)
    }

    /// Switch the mining algorithm; only owned algorithms can be selected
    pub async fn select_algorithm(&self, algorithm: Algorithm) -> Result<UserProgressionState> {
        if !self.state.read().owned_algorithms.contains(&algorithm) {
            return Err(EconomyError::AlgorithmNotOwned {
                user: self.user.clone(),
                algorithm,
            });
        }
        let store = self.engine.store();
        self.engine
            .retry()
            .run("set_selected_algorithm", || {
                store.set_selected_algorithm(&self.user, algorithm)
            })
            .await?;
        self.refresh().await
    }

    pub async fn record_score(
        &self,
        window_id: &str,
        score: u64,
        now: DateTime<Utc>,
    ) -> Result<CompetitionEntry> {
        self.engine
            .competitions()
            .record_score(window_id, &self.user, score, now)
            .await
    }
}

fn accrual_window(key: &LedgerKey) -> Option<u64> {
    if key.source_kind != SourceKind::Accrual {
        return None;
    }
    key.source_id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use chrono::{Duration, TimeZone};
    use orebit_core::{Clock, FixedJitter, ManualClock, ONE_COIN};
    use orebit_economics::EventConfig;
    use orebit_storage::{
        LocalCache, MemoryCache, MemoryRemoteStore, RemoteStore, RemoteUserRecord, StoreOp,
    };
    use std::sync::atomic::AtomicU32;

    /// Memory cache whose writes can be made to fail
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        fail_writes: AtomicBool,
    }

    impl LocalCache for FlakyCache {
        fn version(&self) -> u32 {
            self.inner.version()
        }

        fn read_raw(&self, user: &UserId) -> Result<Option<Vec<u8>>> {
            self.inner.read_raw(user)
        }

        fn write_raw(&self, user: &UserId, bytes: Vec<u8>) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(EconomyError::Io("disk full".into()));
            }
            self.inner.write_raw(user, bytes)
        }

        fn discard(&self, user: &UserId) -> Result<()> {
            self.inner.discard(user)
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
    }

    fn quiet_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.events = EventConfig {
            windows: Vec::new(),
            recurring: Vec::new(),
        };
        config
    }

    fn engine(store: Arc<MemoryRemoteStore>, clock: Arc<ManualClock>) -> Arc<EconomyEngine> {
        EconomyEngine::builder(quiet_config())
            .store(store)
            .clock(clock)
            .jitter(Arc::new(FixedJitter(1.0)))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_window_earns_first_mine() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let alice = UserId::from("alice");
        let session = engine.session(alice.clone()).await.unwrap();

        let rewards = Arc::new(AtomicU32::new(0));
        let seen = rewards.clone();
        session.on_reward_applied(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // nothing completes inside the opening window
        let report = session.accrue(clock.now()).await.unwrap();
        assert!(report.windows.is_empty());

        let now = clock.advance(Duration::hours(1));
        let report = session.accrue(now).await.unwrap();
        assert_eq!(report.windows.len(), 1);
        assert_eq!(report.rules_applied, vec!["first_mine".to_string()]);
        assert_eq!(rewards.load(Ordering::SeqCst), 1);

        let state = session.state();
        assert_eq!(state.mined_windows, 1);
        // 5 xp per window + 100 for first_mine
        assert_eq!(state.total_xp, 105);
        assert_eq!(state.balance, report.credited);
        assert!(store.get_user_state(&alice).await.unwrap().balance > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tick_skips_rule_evaluation() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let session = engine.session(UserId::from("alice")).await.unwrap();

        let now = clock.advance(Duration::hours(1));
        session.accrue(now).await.unwrap();
        session.accrue(now).await.unwrap();

        let calls = store.calls(StoreOp::AppliedKeys);
        let report = session.accrue(now).await.unwrap();
        assert!(report.windows.is_empty());
        assert_eq!(store.calls(StoreOp::AppliedKeys), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cache_write_keeps_windows_uncredited() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(FlakyCache::default());
        let engine = EconomyEngine::builder(quiet_config())
            .store(store.clone())
            .cache(cache.clone())
            .clock(clock.clone())
            .jitter(Arc::new(FixedJitter(1.0)))
            .build()
            .unwrap();
        let session = engine.session(UserId::from("alice")).await.unwrap();

        let now = clock.advance(Duration::hours(2));
        cache.fail_writes.store(true, Ordering::SeqCst);
        assert!(session.accrue(now).await.is_err());

        cache.fail_writes.store(false, Ordering::SeqCst);
        let report = session.accrue(now).await.unwrap();
        assert_eq!(report.windows.len(), 2);
        assert_eq!(session.state().mined_windows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_register_callbacks() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store, clock.clone());
        let session = engine.session(UserId::from("alice")).await.unwrap();

        let registered = Arc::new(AtomicU32::new(0));
        let seen = registered.clone();
        let inner = session.clone();
        session.on_reward_applied(move |_| {
            inner.on_level_up(|_| {});
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let now = clock.advance(Duration::hours(1));
        let report = session.accrue(now).await.unwrap();
        assert!(!report.rules_applied.is_empty());
        assert_eq!(registered.load(Ordering::SeqCst), report.rules_applied.len() as u32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_catch_up_is_capped() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let session = engine.session(UserId::from("alice")).await.unwrap();

        let now = clock.advance(Duration::days(3));
        let report = session.accrue(now).await.unwrap();
        assert_eq!(report.windows.len(), 24);

        let again = session.accrue(now).await.unwrap();
        assert!(again.windows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_up_callback_fires() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let alice = UserId::from("alice");
        let mut record = RemoteUserRecord::new(alice.clone(), start());
        record.total_xp = 95;
        store.seed_user(record);

        let engine = engine(store.clone(), clock.clone());
        let session = engine.session(alice).await.unwrap();
        assert_eq!(session.state().level, 1);

        let levels = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = levels.clone();
        session.on_level_up(move |event| seen.lock().push((event.from, event.to)));

        let now = clock.advance(Duration::hours(1));
        session.accrue(now).await.unwrap();

        let levels = levels.lock();
        assert!(!levels.is_empty());
        assert_eq!(levels[0].0, 1);
        assert!(levels.last().unwrap().1 >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purchase_requires_funds_and_level() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let alice = UserId::from("alice");

        let mut record = RemoteUserRecord::new(alice.clone(), start());
        record.balance = 60 * ONE_COIN;
        store.seed_user(record.clone());
        let engine = engine(store.clone(), clock.clone());
        let session = engine.session(alice.clone()).await.unwrap();

        // scrypt needs level 3
        let err = session
            .purchase_algorithm(Algorithm::Scrypt, clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::AlgorithmLocked { .. }));

        record.total_xp = engine.progression().threshold(3).unwrap();
        store.seed_user(record);
        let entry = session
            .purchase_algorithm(Algorithm::Scrypt, clock.now())
            .await
            .unwrap();
        assert!(entry.is_applied());
        assert!(entry.key.source_id.starts_with("scrypt:"));

        let state = session.state();
        assert_eq!(state.balance, 10 * ONE_COIN);
        assert!(state.owned_algorithms.contains(&Algorithm::Scrypt));

        let err = session
            .purchase_algorithm(Algorithm::Scrypt, clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::AlgorithmAlreadyOwned { .. }));

        let state = session.select_algorithm(Algorithm::Scrypt).await.unwrap();
        assert_eq!(state.selected_algorithm, Algorithm::Scrypt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_unowned_algorithm_rejected() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store, clock);
        let session = engine.session(UserId::from("alice")).await.unwrap();

        let err = session.select_algorithm(Algorithm::KawPow).await.unwrap_err();
        assert!(matches!(err, EconomyError::AlgorithmNotOwned { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_accrual_queues_then_reconciles() {
        let store = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let alice = UserId::from("alice");
        let session = engine.session(alice.clone()).await.unwrap();

        store.set_offline(true);
        let now = clock.advance(Duration::hours(3));
        let report = session.accrue(now).await.unwrap();
        assert!(report.sync_delayed);
        assert_eq!(report.push.queued, 3);
        assert!(session.is_sync_delayed());

        store.set_offline(false);
        let later = clock.advance(Duration::minutes(5));
        let sync = session.reconcile(later).await.unwrap();
        assert!(!sync.sync_delayed);
        assert_eq!(sync.pushed, 3);
        assert_eq!(session.state().mined_windows, 3);
        assert!(engine.sync().queued(&alice).await.is_empty());
    }
}
