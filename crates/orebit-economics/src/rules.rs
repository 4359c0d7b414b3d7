//! # Rule Evaluation
//!
//! Achievements and milestones are data: a predicate over user stats (or an
//! aggregate metric) plus a reward. The evaluator is re-entrant; it keeps no
//! counters of its own and reads "already granted" from the ledger's
//! applied-keys index.
//!
//! | Kind | Scope | Evaluated by |
//! |------|-------|--------------|
//! | achievement | per-user | [`RuleEvaluator`] |
//! | personal-milestone | per-user | [`RuleEvaluator`] |
//! | community-milestone | global | community aggregator |

use crate::community::Eligibility;
use crate::progression::ProgressionCalculator;
use orebit_core::{
    coins_to_micros, Algorithm, EconomyError, FeatureId, LedgerDelta, LedgerKey, Result, RuleId,
    SourceKind, UserId, UserProgressionState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Rule category; determines the ledger source kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Achievement,
    PersonalMilestone,
    CommunityMilestone,
}

impl RuleKind {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::Achievement => SourceKind::Achievement,
            Self::PersonalMilestone => SourceKind::PersonalMilestone,
            Self::CommunityMilestone => SourceKind::CommunityMilestone,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleScope {
    #[default]
    PerUser,
    Global,
}

/// Condition over [`UserStats`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    TotalXpAtLeast { xp: u64 },
    LevelAtLeast { level: u32 },
    BalanceAtLeast { coins: f64 },
    MinedWindowsAtLeast { windows: u64 },
    OwnsAlgorithm { algorithm: Algorithm },
    AlgorithmsOwnedAtLeast { count: usize },
    FeatureUnlocked { feature: FeatureId },
    RuleApplied { rule: RuleId },
    MetricAtLeast { metric: String, value: u64 },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
}

impl Predicate {
    pub fn is_satisfied(&self, stats: &UserStats) -> bool {
        match self {
            Self::TotalXpAtLeast { xp } => stats.total_xp >= *xp,
            Self::LevelAtLeast { level } => stats.level >= *level,
            Self::BalanceAtLeast { coins } => match coins_to_micros(*coins) {
                Ok(required) => stats.balance >= required,
                Err(_) => false,
            },
            Self::MinedWindowsAtLeast { windows } => stats.mined_windows >= *windows,
            Self::OwnsAlgorithm { algorithm } => stats.owned_algorithms.contains(algorithm),
            Self::AlgorithmsOwnedAtLeast { count } => stats.owned_algorithms.len() >= *count,
            Self::FeatureUnlocked { feature } => stats.unlocked_features.contains(feature),
            Self::RuleApplied { rule } => stats.applied_rules.contains(rule),
            Self::MetricAtLeast { metric, value } => stats
                .metrics
                .get(metric)
                .map(|v| v >= value)
                .unwrap_or(false),
            Self::All { of } => of.iter().all(|p| p.is_satisfied(stats)),
            Self::Any { of } => of.iter().any(|p| p.is_satisfied(stats)),
        }
    }

    fn references_metric(&self) -> bool {
        match self {
            Self::MetricAtLeast { .. } => true,
            Self::All { of } | Self::Any { of } => of.iter().any(Predicate::references_metric),
            _ => false,
        }
    }

    fn referenced_rules<'a>(&'a self, out: &mut Vec<&'a RuleId>) {
        match self {
            Self::RuleApplied { rule } => out.push(rule),
            Self::All { of } | Self::Any { of } => {
                for p in of {
                    p.referenced_rules(out);
                }
            }
            _ => {}
        }
    }
}

/// What a rule grants
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    #[serde(default)]
    pub xp: u64,

    #[serde(default)]
    pub coins: f64,

    #[serde(default)]
    pub unlocks: Vec<FeatureId>,

    #[serde(default)]
    pub algorithms: Vec<Algorithm>,
}

impl Reward {
    pub fn xp(xp: u64) -> Self {
        Self {
            xp,
            ..Default::default()
        }
    }

    pub fn coins(coins: f64) -> Self {
        Self {
            coins,
            ..Default::default()
        }
    }

    /// Ledger delta with XP scaled by an active double-XP multiplier
    pub fn to_delta(&self, xp_multiplier: f64) -> Result<LedgerDelta> {
        if !xp_multiplier.is_finite() || xp_multiplier <= 0.0 {
            return Err(EconomyError::InvalidDelta(format!(
                "xp multiplier {xp_multiplier}"
            )));
        }
        let balance = i64::try_from(coins_to_micros(self.coins)?)
            .map_err(|_| EconomyError::InvalidDelta(format!("reward {} overflows", self.coins)))?;

        Ok(LedgerDelta {
            xp: (self.xp as f64 * xp_multiplier).round() as u64,
            balance,
            unlock_features: self.unlocks.iter().cloned().collect(),
            grant_algorithms: self.algorithms.iter().copied().collect(),
            mined_windows: 0,
        })
    }
}

/// One achievement or milestone
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: RuleId,
    pub kind: RuleKind,

    #[serde(default)]
    pub scope: RuleScope,
    pub predicate: Predicate,
    pub reward: Reward,

    /// Recipient filter for global rules
    #[serde(default)]
    pub eligibility: Option<Eligibility>,
}

impl RuleDefinition {
    pub fn ledger_key(&self, user: &UserId) -> LedgerKey {
        LedgerKey::new(user.clone(), self.kind.source_kind(), self.id.clone())
    }

    pub fn is_per_user(&self) -> bool {
        self.scope == RuleScope::PerUser
    }

    /// `(metric, target)` of a community milestone
    pub fn metric_target(&self) -> Option<(&str, u64)> {
        match &self.predicate {
            Predicate::MetricAtLeast { metric, value } => Some((metric.as_str(), *value)),
            _ => None,
        }
    }
}

/// Validated rule list, sorted by id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RuleDefinition>", into = "Vec<RuleDefinition>")]
pub struct RuleSet(Vec<RuleDefinition>);

impl TryFrom<Vec<RuleDefinition>> for RuleSet {
    type Error = EconomyError;

    fn try_from(rules: Vec<RuleDefinition>) -> Result<Self> {
        Self::new(rules)
    }
}

impl From<RuleSet> for Vec<RuleDefinition> {
    fn from(set: RuleSet) -> Self {
        set.0
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        let mut rules = vec![
            RuleDefinition {
                id: "first_mine".into(),
                kind: RuleKind::Achievement,
                scope: RuleScope::PerUser,
                predicate: Predicate::MinedWindowsAtLeast { windows: 1 },
                reward: Reward::xp(100),
                eligibility: None,
            },
            RuleDefinition {
                id: "level_5".into(),
                kind: RuleKind::PersonalMilestone,
                scope: RuleScope::PerUser,
                predicate: Predicate::LevelAtLeast { level: 5 },
                reward: Reward::coins(25.0),
                eligibility: None,
            },
            RuleDefinition {
                id: "collector".into(),
                kind: RuleKind::Achievement,
                scope: RuleScope::PerUser,
                predicate: Predicate::AlgorithmsOwnedAtLeast { count: 3 },
                reward: Reward {
                    xp: 300,
                    coins: 50.0,
                    ..Default::default()
                },
                eligibility: None,
            },
            RuleDefinition {
                id: "marathon".into(),
                kind: RuleKind::Achievement,
                scope: RuleScope::PerUser,
                predicate: Predicate::MinedWindowsAtLeast { windows: 168 },
                reward: Reward::xp(500),
                eligibility: None,
            },
            RuleDefinition {
                id: "veteran".into(),
                kind: RuleKind::PersonalMilestone,
                scope: RuleScope::PerUser,
                predicate: Predicate::All {
                    of: vec![
                        Predicate::LevelAtLeast { level: 8 },
                        Predicate::RuleApplied {
                            rule: "marathon".into(),
                        },
                    ],
                },
                reward: Reward {
                    xp: 1_000,
                    unlocks: vec!["veteran_badge".into()],
                    ..Default::default()
                },
                eligibility: None,
            },
            RuleDefinition {
                id: "community_1000_active".into(),
                kind: RuleKind::CommunityMilestone,
                scope: RuleScope::Global,
                predicate: Predicate::MetricAtLeast {
                    metric: "active_miners".into(),
                    value: 1_000,
                },
                reward: Reward {
                    xp: 250,
                    coins: 10.0,
                    ..Default::default()
                },
                eligibility: Some(Eligibility {
                    min_level: 1,
                    active_within_hours: Some(7 * 24),
                }),
            },
        ];
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Self(rules)
    }
}

impl RuleSet {
    /// Build a rule set; rules are kept in ascending id order
    pub fn new(mut rules: Vec<RuleDefinition>) -> Result<Self> {
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        let set = Self(rules);
        set.validate()?;
        Ok(set)
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.0
    }

    pub fn get(&self, id: &str) -> Option<&RuleDefinition> {
        self.0.iter().find(|r| r.id == id)
    }

    pub fn per_user(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.0.iter().filter(|r| r.is_per_user())
    }

    pub fn community(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.0.iter().filter(|r| r.kind == RuleKind::CommunityMilestone)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.0.iter().enumerate() {
            if rule.id.is_empty() {
                return Err(EconomyError::Config("rule id must not be empty".into()));
            }
            if self.0[..i].iter().any(|r| r.id == rule.id) {
                return Err(EconomyError::Config(format!("rule {} defined twice", rule.id)));
            }

            let community = rule.kind == RuleKind::CommunityMilestone;
            if community != (rule.scope == RuleScope::Global) {
                return Err(EconomyError::Config(format!(
                    "rule {}: community milestones are global and only they are",
                    rule.id
                )));
            }
            if community && rule.metric_target().is_none() {
                return Err(EconomyError::Config(format!(
                    "community milestone {} needs a metric_at_least predicate",
                    rule.id
                )));
            }
            if !community && rule.predicate.references_metric() {
                return Err(EconomyError::Config(format!(
                    "per-user rule {} cannot reference an aggregate metric",
                    rule.id
                )));
            }

            let mut refs = Vec::new();
            rule.predicate.referenced_rules(&mut refs);
            if let Some(missing) = refs.into_iter().find(|r| self.get(r).is_none()) {
                return Err(EconomyError::Config(format!(
                    "rule {} depends on unknown rule {missing}",
                    rule.id
                )));
            }

            rule.reward.to_delta(1.0)?.validate(rule.kind.source_kind()).map_err(|e| {
                EconomyError::Config(format!("rule {} reward: {e}", rule.id))
            })?;
        }
        Ok(())
    }
}

/// Stats visible to predicates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserStats {
    pub total_xp: u64,
    pub level: u32,
    pub balance: u64,
    pub mined_windows: u64,
    pub owned_algorithms: BTreeSet<Algorithm>,
    pub unlocked_features: BTreeSet<FeatureId>,
    pub applied_rules: BTreeSet<RuleId>,
    pub metrics: BTreeMap<String, u64>,
}

/// Predicate evaluation over a user's state and applied-keys index
#[derive(Clone, Debug)]
pub struct RuleEvaluator {
    progression: Arc<ProgressionCalculator>,
}

impl RuleEvaluator {
    pub fn new(progression: Arc<ProgressionCalculator>) -> Self {
        Self { progression }
    }

    pub fn stats(
        &self,
        state: &UserProgressionState,
        rules: &RuleSet,
        applied_keys: &BTreeSet<LedgerKey>,
    ) -> UserStats {
        let applied_rules = rules
            .rules()
            .iter()
            .filter(|r| applied_keys.contains(&r.ledger_key(&state.user_id)))
            .map(|r| r.id.clone())
            .collect();

        UserStats {
            total_xp: state.total_xp,
            level: self.progression.level_for(state.total_xp),
            balance: state.balance,
            mined_windows: state.mined_windows,
            owned_algorithms: state.owned_algorithms.clone(),
            unlocked_features: state.unlocked_features.clone(),
            applied_rules,
            metrics: BTreeMap::new(),
        }
    }

    /// Per-user rules newly satisfied by `state`, in the order they resolve.
    ///
    /// Each satisfied reward is folded into a working copy of the stats before
    /// the next rule is checked, and passes repeat until nothing new resolves,
    /// so chains such as `marathon -> veteran` complete in one call.
    pub fn evaluate(
        &self,
        state: &UserProgressionState,
        rules: &RuleSet,
        applied_keys: &BTreeSet<LedgerKey>,
    ) -> Vec<RuleId> {
        self.evaluate_scaled(state, rules, applied_keys, 1.0)
    }

    /// [`evaluate`](Self::evaluate) with reward XP folded at `xp_multiplier`,
    /// the same scaling the ledger applies during a double-XP window
    pub fn evaluate_scaled(
        &self,
        state: &UserProgressionState,
        rules: &RuleSet,
        applied_keys: &BTreeSet<LedgerKey>,
        xp_multiplier: f64,
    ) -> Vec<RuleId> {
        let mut stats = self.stats(state, rules, applied_keys);
        let mut satisfied = Vec::new();

        loop {
            let mut progressed = false;
            for rule in rules.per_user() {
                if stats.applied_rules.contains(&rule.id) {
                    continue;
                }
                if rule.predicate.is_satisfied(&stats) {
                    debug!(user = %state.user_id, rule = %rule.id, "Rule satisfied");
                    self.fold(&mut stats, rule, xp_multiplier);
                    satisfied.push(rule.id.clone());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        satisfied
    }

    fn fold(&self, stats: &mut UserStats, rule: &RuleDefinition, xp_multiplier: f64) {
        let reward = &rule.reward;
        let xp = reward
            .to_delta(xp_multiplier)
            .map(|delta| delta.xp)
            .unwrap_or(reward.xp);
        stats.total_xp = stats.total_xp.saturating_add(xp);
        stats.level = self.progression.level_for(stats.total_xp);
        if let Ok(micros) = coins_to_micros(reward.coins) {
            stats.balance = stats.balance.saturating_add(micros);
        }
        stats.unlocked_features.extend(reward.unlocks.iter().cloned());
        stats
            .unlocked_features
            .extend(self.progression.unlocks_through(stats.level));
        stats.owned_algorithms.extend(reward.algorithms.iter().copied());
        stats.applied_rules.insert(rule.id.clone());
    }
}
