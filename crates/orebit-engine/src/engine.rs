//! Economy engine
//!
//! Owns the calculators, the ledger and the synchronization manager for one
//! client process and hands out per-user [`Session`]s.

use crate::aggregator::{AggregateReport, CommunityAggregator};
use crate::competition::{CompetitionService, FinalizeReport};
use crate::config::EngineConfig;
use crate::ledger::{RewardLedger, SweepReport};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::sync::SyncManager;
use chrono::{DateTime, Utc};
use orebit_core::{Clock, EconomyError, JitterSource, Result, SeededJitter, SystemClock, UserId};
use orebit_economics::constants::JITTER_SALT;
use orebit_economics::events::multiplier_for;
use orebit_economics::{
    EventCalendar, EventKind, EventWindow, ProgressionCalculator, RateCalculator, RuleEvaluator,
    RuleSet,
};
use orebit_storage::{LocalCache, MemoryCache, RemoteStore};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one aggregation tick
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregationRun {
    pub community: AggregateReport,
    pub competitions: Vec<FinalizeReport>,
}

/// Builder for [`EconomyEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn RemoteStore>>,
    cache: Option<Arc<dyn LocalCache>>,
    clock: Option<Arc<dyn Clock>>,
    jitter: Option<Arc<dyn JitterSource>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            cache: None,
            clock: None,
            jitter: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to an in-memory cache
    pub fn cache(mut self, cache: Arc<dyn LocalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to seeded jitter with the configured amplitude
    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn build(self) -> Result<Arc<EconomyEngine>> {
        let config = self.config;
        config.validate()?;

        let store = self
            .store
            .ok_or_else(|| EconomyError::Config("remote store not configured".into()))?;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::with_version(config.sync.cache_version)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let jitter = self.jitter.unwrap_or_else(|| {
            Arc::new(SeededJitter::new(config.rates.jitter_amplitude, JITTER_SALT))
        });

        let progression = Arc::new(ProgressionCalculator::new(config.progression.clone())?);
        let rates = Arc::new(RateCalculator::new(
            config.rates.clone(),
            progression.clone(),
            config.algorithms.clone(),
            jitter,
        )?);
        let calendar = EventCalendar::new(config.events.clone())?;
        let evaluator = RuleEvaluator::new(progression.clone());

        let retry = RetryPolicy::new(config.sync.retry.clone());
        let ledger = RewardLedger::new(
            store.clone(),
            retry.clone(),
            clock.clone(),
            config.sync.pending_retry_after(),
            config.sync.max_commit_attempts,
        );
        let sync = SyncManager::new(
            store.clone(),
            cache,
            ledger.clone(),
            retry.clone(),
            progression.clone(),
            rates.clone(),
            clock.clone(),
        );
        let aggregator = CommunityAggregator::new(
            store.clone(),
            ledger.clone(),
            retry.clone(),
            progression.clone(),
            config.rules.clone(),
            config.metrics.clone(),
            config.sync.fanout_concurrency,
        );
        let competitions = CompetitionService::new(
            store.clone(),
            ledger.clone(),
            retry.clone(),
            config.competitions.clone(),
        );

        info!(
            rules = config.rules.rules().len(),
            levels = progression.max_level(),
            competitions = config.competitions.len(),
            "Economy engine ready"
        );

        Ok(Arc::new(EconomyEngine {
            config,
            store,
            clock,
            retry,
            progression,
            rates,
            calendar,
            evaluator,
            ledger,
            sync,
            aggregator,
            competitions,
            finalized: Mutex::new(BTreeSet::new()),
        }))
    }
}

/// Shared engine context for one client
pub struct EconomyEngine {
    config: EngineConfig,
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    progression: Arc<ProgressionCalculator>,
    rates: Arc<RateCalculator>,
    calendar: EventCalendar,
    evaluator: RuleEvaluator,
    ledger: RewardLedger,
    sync: SyncManager,
    aggregator: CommunityAggregator,
    competitions: CompetitionService,

    /// Competitions whose prizes are all applied
    finalized: Mutex<BTreeSet<String>>,
}

impl EconomyEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn progression(&self) -> &ProgressionCalculator {
        &self.progression
    }

    pub fn rates(&self) -> &RateCalculator {
        &self.rates
    }

    pub fn rules(&self) -> &RuleSet {
        &self.config.rules
    }

    pub fn evaluator(&self) -> &RuleEvaluator {
        &self.evaluator
    }

    pub fn ledger(&self) -> &RewardLedger {
        &self.ledger
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn aggregator(&self) -> &CommunityAggregator {
        &self.aggregator
    }

    pub fn competitions(&self) -> &CompetitionService {
        &self.competitions
    }

    /// Event windows active at `now`
    pub fn active_events(&self, now: DateTime<Utc>) -> Vec<EventWindow> {
        self.calendar.active_at(now)
    }

    /// Double-XP multiplier at `now` (1.0 outside any window)
    pub fn xp_multiplier(&self, now: DateTime<Utc>) -> f64 {
        multiplier_for(&self.active_events(now), EventKind::DoubleXp, now)
    }

    /// Open a session for `user`, loading cached or remote state
    pub async fn session(self: &Arc<Self>, user: UserId) -> Result<Arc<Session>> {
        Session::open(self.clone(), user).await.map(Arc::new)
    }

    /// Retry stale pending ledger entries of every user
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.ledger.sweep(None, now).await
    }

    /// Poll community milestones and finalize ended competitions.
    ///
    /// A competition is finalized again on later runs until every prize is
    /// applied.
    pub async fn run_aggregation(&self, now: DateTime<Utc>) -> Result<AggregationRun> {
        let community = self.aggregator.run(now).await?;

        let due: Vec<String> = {
            let finalized = self.finalized.lock();
            self.competitions
                .ended_at(now)
                .into_iter()
                .filter(|c| !finalized.contains(&c.id))
                .map(|c| c.id.clone())
                .collect()
        };

        let mut competitions = Vec::new();
        for id in due {
            match self.competitions.finalize(&id, now).await {
                Ok(report) => {
                    if report.pending == 0 {
                        self.finalized.lock().insert(id);
                    }
                    competitions.push(report);
                }
                Err(e) if e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. }) => {
                    warn!(competition = %id, error = %e, "Finalization delayed");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(AggregationRun {
            community,
            competitions,
        })
    }
}
