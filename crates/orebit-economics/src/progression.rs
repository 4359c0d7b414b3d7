//! # Progression
//!
//! Level is a pure step function of lifetime XP.
//!
//! | Level | Total XP | Rate multiplier | Unlocks |
//! |-------|----------|-----------------|---------|
//! | 1 | 0 | 1.00x | basic_mining |
//! | 2 | 100 | 1.03x | daily_bonus |
//! | 3 | 250 | 1.06x | marketplace |
//! | 4 | 500 | 1.10x | auto_claim |
//! | 5 | 1,000 | 1.14x | competitions |
//! | 6 | 2,000 | 1.18x | clan_access |
//! | 7 | 3,500 | 1.22x | overclock |
//! | 8 | 5,500 | 1.25x | turbo_cooling |
//! | 9 | 8,000 | 1.28x | - |
//! | 10 | 12,000 | 1.30x | legendary_rig |
//!
//! Unlocks granted by level are derived, not stored: re-deriving from the
//! same `total_xp` always yields the same set.

use orebit_core::{EconomyError, FeatureId, Result, SourceKind, UserProgressionState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One row of the level table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelDefinition {
    pub level: u32,

    /// Minimum lifetime XP for this level
    pub threshold: u64,

    /// Mining rate multiplier at this level
    pub multiplier: f64,

    /// Features reachable from this level on
    #[serde(default)]
    pub unlocks: Vec<FeatureId>,
}

/// Level table and feature effects
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressionConfig {
    #[serde(default = "default_levels")]
    pub levels: Vec<LevelDefinition>,

    /// Efficiency bonus contributed by each unlocked feature
    #[serde(default = "default_feature_efficiency")]
    pub feature_efficiency: BTreeMap<FeatureId, f64>,

    /// Upper bound for the efficiency factor
    #[serde(default = "default_max_efficiency")]
    pub max_efficiency: f64,
}

fn level(level: u32, threshold: u64, multiplier: f64, unlocks: &[&str]) -> LevelDefinition {
    LevelDefinition {
        level,
        threshold,
        multiplier,
        unlocks: unlocks.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_levels() -> Vec<LevelDefinition> {
    vec![
        level(1, 0, 1.00, &["basic_mining"]),
        level(2, 100, 1.03, &["daily_bonus"]),
        level(3, 250, 1.06, &["marketplace"]),
        level(4, 500, 1.10, &["auto_claim"]),
        level(5, 1_000, 1.14, &["competitions"]),
        level(6, 2_000, 1.18, &["clan_access"]),
        level(7, 3_500, 1.22, &["overclock"]),
        level(8, 5_500, 1.25, &["turbo_cooling"]),
        level(9, 8_000, 1.28, &[]),
        level(10, 12_000, 1.30, &["legendary_rig"]),
    ]
}

fn default_feature_efficiency() -> BTreeMap<FeatureId, f64> {
    let mut bonuses = BTreeMap::new();
    bonuses.insert("auto_claim".to_string(), 0.05);
    bonuses.insert("overclock".to_string(), 0.10);
    bonuses.insert("turbo_cooling".to_string(), 0.10);
    bonuses
}

fn default_max_efficiency() -> f64 {
    1.5
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            feature_efficiency: default_feature_efficiency(),
            max_efficiency: default_max_efficiency(),
        }
    }
}

impl ProgressionConfig {
    /// Levels must be 1..=N, thresholds strictly increasing from 0
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(EconomyError::Config("level table is empty".into()));
        }
        if self.levels[0].threshold != 0 {
            return Err(EconomyError::Config("level 1 threshold must be 0".into()));
        }
        for (i, def) in self.levels.iter().enumerate() {
            if def.level as usize != i + 1 {
                return Err(EconomyError::Config(format!(
                    "level table out of order at row {}: found level {}",
                    i + 1,
                    def.level
                )));
            }
            if !def.multiplier.is_finite() || def.multiplier <= 0.0 {
                return Err(EconomyError::Config(format!(
                    "level {} multiplier must be positive",
                    def.level
                )));
            }
        }
        for pair in self.levels.windows(2) {
            if pair[1].threshold <= pair[0].threshold {
                return Err(EconomyError::Config(format!(
                    "threshold for level {} must exceed level {}",
                    pair[1].level, pair[0].level
                )));
            }
        }
        if !self.max_efficiency.is_finite() || self.max_efficiency < 1.0 {
            return Err(EconomyError::Config("max_efficiency must be >= 1.0".into()));
        }
        if self.feature_efficiency.values().any(|b| !b.is_finite() || *b < 0.0) {
            return Err(EconomyError::Config("feature efficiency bonuses must be >= 0".into()));
        }
        Ok(())
    }
}

/// Result of [`ProgressionCalculator::add_xp`]
#[derive(Clone, Debug, PartialEq)]
pub struct XpOutcome {
    pub state: UserProgressionState,
    pub leveled_up: bool,

    /// Features that were not in the unlock set before this addition
    pub unlocked: BTreeSet<FeatureId>,
}

/// Progress towards the next level, for the UI
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub level: u32,
    pub total_xp: u64,
    pub xp_into_level: u64,

    /// XP still needed; `None` at max level
    pub xp_to_next: Option<u64>,

    /// 0.0 - 1.0 through the current level
    pub fraction: f64,
}

/// Level/unlock calculator over a validated [`ProgressionConfig`]
#[derive(Clone, Debug)]
pub struct ProgressionCalculator {
    config: ProgressionConfig,
}

impl ProgressionCalculator {
    pub fn new(config: ProgressionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProgressionConfig {
        &self.config
    }

    pub fn max_level(&self) -> u32 {
        self.config.levels.len() as u32
    }

    /// Highest level whose threshold is <= `total_xp`
    pub fn level_for(&self, total_xp: u64) -> u32 {
        self.config
            .levels
            .partition_point(|def| def.threshold <= total_xp)
            .max(1) as u32
    }

    pub fn threshold(&self, level: u32) -> Option<u64> {
        self.definition(level).map(|def| def.threshold)
    }

    pub fn level_multiplier(&self, level: u32) -> f64 {
        self.definition(level)
            .or_else(|| self.config.levels.last())
            .map(|def| def.multiplier)
            .unwrap_or(1.0)
    }

    /// Every feature reachable at or below `level`
    pub fn unlocks_through(&self, level: u32) -> BTreeSet<FeatureId> {
        self.config
            .levels
            .iter()
            .take_while(|def| def.level <= level)
            .flat_map(|def| def.unlocks.iter().cloned())
            .collect()
    }

    /// `1 + sum(feature bonuses)`, capped
    pub fn efficiency(&self, features: &BTreeSet<FeatureId>) -> f64 {
        let bonus: f64 = features
            .iter()
            .filter_map(|f| self.config.feature_efficiency.get(f))
            .sum();
        (1.0 + bonus).min(self.config.max_efficiency)
    }

    /// Add XP from `source`.
    ///
    /// A negative amount is a caller bug and is rejected before anything
    /// reaches the ledger.
    pub fn add_xp(
        &self,
        state: &UserProgressionState,
        amount: i64,
        source: SourceKind,
    ) -> Result<XpOutcome> {
        if amount < 0 {
            return Err(EconomyError::InvalidDelta(format!(
                "negative xp {amount} from {source}"
            )));
        }

        let mut next = state.clone();
        next.total_xp = state.total_xp.saturating_add(amount as u64);
        let next = self.rederive(&next);

        let unlocked: BTreeSet<FeatureId> = next
            .unlocked_features
            .difference(&state.unlocked_features)
            .cloned()
            .collect();

        Ok(XpOutcome {
            leveled_up: next.level > state.level,
            unlocked,
            state: next,
        })
    }

    /// Recompute the derived fields from the authoritative ones
    pub fn rederive(&self, state: &UserProgressionState) -> UserProgressionState {
        let mut next = state.clone();
        next.level = self.level_for(state.total_xp);
        next.xp = state.total_xp - self.threshold(next.level).unwrap_or(0);
        next.unlocked_features
            .extend(self.unlocks_through(next.level));
        next.efficiency = self.efficiency(&next.unlocked_features);
        next
    }

    pub fn progress(&self, state: &UserProgressionState) -> Progress {
        let level = self.level_for(state.total_xp);
        let floor = self.threshold(level).unwrap_or(0);
        let into = state.total_xp - floor;

        match self.threshold(level + 1) {
            Some(next) => {
                let span = next - floor;
                Progress {
                    level,
                    total_xp: state.total_xp,
                    xp_into_level: into,
                    xp_to_next: Some(next - state.total_xp),
                    fraction: into as f64 / span as f64,
                }
            }
            None => Progress {
                level,
                total_xp: state.total_xp,
                xp_into_level: into,
                xp_to_next: None,
                fraction: 1.0,
            },
        }
    }

    fn definition(&self, level: u32) -> Option<&LevelDefinition> {
        if level == 0 {
            return None;
        }
        self.config.levels.get(level as usize - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orebit_core::UserId;

    fn calculator() -> ProgressionCalculator {
        ProgressionCalculator::new(ProgressionConfig::default()).unwrap()
    }

    #[test]
    fn test_level_for_thresholds() {
        let calc = calculator();

        assert_eq!(calc.level_for(0), 1);
        assert_eq!(calc.level_for(99), 1);
        assert_eq!(calc.level_for(100), 2);
        assert_eq!(calc.level_for(11_999), 9);
        assert_eq!(calc.level_for(12_000), 10);
        assert_eq!(calc.level_for(u64::MAX), 10);
    }

    #[test]
    fn test_add_xp_levels_up_and_unlocks() {
        let calc = calculator();
        let state = calc.rederive(&UserProgressionState::new(UserId::from("alice")));

        let outcome = calc.add_xp(&state, 260, SourceKind::Achievement).unwrap();

        assert!(outcome.leveled_up);
        assert_eq!(outcome.state.level, 3);
        assert_eq!(outcome.state.xp, 10);
        assert!(outcome.unlocked.contains("daily_bonus"));
        assert!(outcome.unlocked.contains("marketplace"));
        assert!(!outcome.unlocked.contains("basic_mining"));
    }

    #[test]
    fn test_add_xp_rejects_negative() {
        let calc = calculator();
        let state = UserProgressionState::new(UserId::from("bob"));

        let err = calc.add_xp(&state, -1, SourceKind::Accrual).unwrap_err();
        assert!(matches!(err, EconomyError::InvalidDelta(_)));
    }

    #[test]
    fn test_rederive_is_idempotent() {
        let calc = calculator();
        let mut state = UserProgressionState::new(UserId::from("carol"));
        state.total_xp = 3_600;

        let once = calc.rederive(&state);
        let twice = calc.rederive(&once);

        assert_eq!(once, twice);
        assert_eq!(once.level, 7);
        assert!((once.efficiency - 1.15).abs() < 1e-9);
    }

    #[test]
    fn test_progress_at_max_level() {
        let calc = calculator();
        let mut state = UserProgressionState::new(UserId::from("dave"));
        state.total_xp = 50_000;

        let progress = calc.progress(&state);
        assert_eq!(progress.level, 10);
        assert_eq!(progress.xp_to_next, None);
        assert_eq!(progress.fraction, 1.0);
    }

    #[test]
    fn test_validate_rejects_non_monotonic() {
        let mut config = ProgressionConfig::default();
        config.levels[3].threshold = 200;
        assert!(config.validate().is_err());

        let mut config = ProgressionConfig::default();
        config.levels[0].threshold = 5;
        assert!(config.validate().is_err());
    }
}
