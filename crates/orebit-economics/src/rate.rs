//! # Mining Rate
//!
//! ```text
//! rate = clamp(base × level × algorithm × efficiency × Π(events) × jitter, min, max)
//! ```
//!
//! `min`/`max` are hard bounds: no stacking of level, algorithm and event
//! multipliers can leave `[min_rate, max_rate]`. Jitter is drawn once per
//! accrual window from a seed of `(user, window)`, so every session of the
//! same user computes the same rate for the same window.

use crate::events::{rate_multiplier, EventWindow};
use crate::marketplace::AlgorithmTable;
use crate::progression::ProgressionCalculator;
use chrono::{DateTime, TimeZone, Utc};
use orebit_core::{
    coins_to_micros, EconomyError, JitterSource, Result, UserProgressionState, SECONDS_PER_DAY,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Rate bounds and accrual parameters (coins per day)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_base_rate")]
    pub base_rate_per_day: f64,

    #[serde(default = "default_min_rate")]
    pub min_rate_per_day: f64,

    #[serde(default = "default_max_rate")]
    pub max_rate_per_day: f64,

    /// Jitter amplitude, e.g. 0.05 for ±5%
    #[serde(default = "default_jitter")]
    pub jitter_amplitude: f64,

    /// Length of one accrual (and jitter) window
    #[serde(default = "default_accrual_window")]
    pub accrual_window_secs: u64,

    /// Offline catch-up cap, in windows
    #[serde(default = "default_max_offline_windows")]
    pub max_offline_windows: u64,

    /// XP granted per credited window
    #[serde(default = "default_xp_per_window")]
    pub xp_per_window: u64,

    /// Display hash rate at 1.0x (H/s)
    #[serde(default = "default_base_hash_rate")]
    pub base_hash_rate: f64,
}

fn default_base_rate() -> f64 {
    4.0
}

fn default_min_rate() -> f64 {
    3.0
}

fn default_max_rate() -> f64 {
    7.5
}

fn default_jitter() -> f64 {
    0.05
}

fn default_accrual_window() -> u64 {
    3600
}

fn default_max_offline_windows() -> u64 {
    24
}

fn default_xp_per_window() -> u64 {
    5
}

fn default_base_hash_rate() -> f64 {
    120.0
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            base_rate_per_day: default_base_rate(),
            min_rate_per_day: default_min_rate(),
            max_rate_per_day: default_max_rate(),
            jitter_amplitude: default_jitter(),
            accrual_window_secs: default_accrual_window(),
            max_offline_windows: default_max_offline_windows(),
            xp_per_window: default_xp_per_window(),
            base_hash_rate: default_base_hash_rate(),
        }
    }
}

impl RateConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(EconomyError::Config(format!("{name} must be positive")))
            }
        };
        positive("base_rate_per_day", self.base_rate_per_day)?;
        positive("min_rate_per_day", self.min_rate_per_day)?;
        positive("max_rate_per_day", self.max_rate_per_day)?;
        positive("base_hash_rate", self.base_hash_rate)?;

        if self.min_rate_per_day > self.max_rate_per_day {
            return Err(EconomyError::Config(format!(
                "min_rate_per_day {} exceeds max_rate_per_day {}",
                self.min_rate_per_day, self.max_rate_per_day
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_amplitude) {
            return Err(EconomyError::Config("jitter_amplitude must be in [0, 1)".into()));
        }
        if self.accrual_window_secs == 0 {
            return Err(EconomyError::Config("accrual_window_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// Every factor of one rate evaluation, for display and diagnostics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateBreakdown {
    pub base: f64,
    pub level_multiplier: f64,
    pub algorithm_multiplier: f64,
    pub efficiency: f64,
    pub event_multiplier: f64,
    pub jitter: f64,

    /// Product before clamping
    pub raw: f64,

    /// Final rate in coins/day
    pub rate: f64,
    pub clamped: bool,
    pub window: u64,
}

/// Rate calculator. Pure apart from the injected jitter source.
#[derive(Clone)]
pub struct RateCalculator {
    config: RateConfig,
    progression: Arc<ProgressionCalculator>,
    algorithms: AlgorithmTable,
    jitter: Arc<dyn JitterSource>,
}

impl RateCalculator {
    pub fn new(
        config: RateConfig,
        progression: Arc<ProgressionCalculator>,
        algorithms: AlgorithmTable,
        jitter: Arc<dyn JitterSource>,
    ) -> Result<Self> {
        config.validate()?;
        algorithms.validate()?;
        Ok(Self {
            config,
            progression,
            algorithms,
            jitter,
        })
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    pub fn algorithms(&self) -> &AlgorithmTable {
        &self.algorithms
    }

    /// Accrual window containing `at`
    pub fn window_index(&self, at: DateTime<Utc>) -> u64 {
        at.timestamp()
            .max(0)
            .div_euclid(self.config.accrual_window_secs as i64) as u64
    }

    pub fn window_start(&self, window: u64) -> DateTime<Utc> {
        let secs = (window * self.config.accrual_window_secs) as i64;
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    pub fn window_end(&self, window: u64) -> DateTime<Utc> {
        self.window_start(window + 1)
    }

    /// Bounded mining rate (coins/day) at `now`
    pub fn compute_rate(
        &self,
        state: &UserProgressionState,
        active_events: &[EventWindow],
        now: DateTime<Utc>,
    ) -> f64 {
        self.breakdown(state, active_events, now).rate
    }

    pub fn breakdown(
        &self,
        state: &UserProgressionState,
        active_events: &[EventWindow],
        now: DateTime<Utc>,
    ) -> RateBreakdown {
        let window = self.window_index(now);
        let level = self.progression.level_for(state.total_xp);
        let level_multiplier = self.progression.level_multiplier(level);
        let algorithm_multiplier = self.algorithms.multiplier(state.selected_algorithm);
        let efficiency = self.progression.efficiency(&state.unlocked_features);
        let event_multiplier = rate_multiplier(active_events, now);
        let jitter = self.jitter.factor(&state.user_id, window);

        let raw = self.config.base_rate_per_day
            * level_multiplier
            * algorithm_multiplier
            * efficiency
            * event_multiplier
            * jitter;

        let rate = self.clamp(raw);

        RateBreakdown {
            base: self.config.base_rate_per_day,
            level_multiplier,
            algorithm_multiplier,
            efficiency,
            event_multiplier,
            jitter,
            raw,
            rate,
            clamped: rate != raw,
            window,
        }
    }

    /// Micro-units credited for one full accrual window.
    ///
    /// The rate is evaluated at the window start so that late or repeated
    /// crediting of the same window produces the same amount.
    pub fn accrual_for_window(
        &self,
        state: &UserProgressionState,
        events: &[EventWindow],
        window: u64,
    ) -> Result<u64> {
        let rate = self.compute_rate(state, events, self.window_start(window));
        let fraction_of_day = self.config.accrual_window_secs as f64 / SECONDS_PER_DAY as f64;
        coins_to_micros(rate * fraction_of_day)
    }

    /// Display hash rate (H/s); no economic effect
    pub fn hash_rate(&self, state: &UserProgressionState) -> f64 {
        let level = self.progression.level_for(state.total_xp);
        self.config.base_hash_rate
            * self.progression.level_multiplier(level)
            * self.algorithms.multiplier(state.selected_algorithm)
            * self.progression.efficiency(&state.unlocked_features)
    }

    fn clamp(&self, raw: f64) -> f64 {
        if raw.is_nan() {
            return self.config.min_rate_per_day;
        }
        raw.clamp(self.config.min_rate_per_day, self.config.max_rate_per_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::progression::ProgressionConfig;
    use orebit_core::{Algorithm, FixedJitter, SeededJitter, UserId, ONE_COIN};

    fn calculator(jitter: Arc<dyn JitterSource>) -> RateCalculator {
        let progression = Arc::new(ProgressionCalculator::new(ProgressionConfig::default()).unwrap());
        RateCalculator::new(RateConfig::default(), progression, AlgorithmTable::default(), jitter)
            .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 10, 30, 0).unwrap()
    }

    fn boost(multiplier: f64) -> EventWindow {
        EventWindow {
            id: "boost".into(),
            kind: EventKind::MiningBoost,
            multiplier,
            start_time: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
            duration_hours: 24,
        }
    }

    #[test]
    fn test_base_rate_at_level_one() {
        let calc = calculator(Arc::new(FixedJitter(1.0)));
        let state = UserProgressionState::new(UserId::from("alice"));

        assert_eq!(calc.compute_rate(&state, &[], now()), 4.0);
    }

    #[test]
    fn test_stacked_multipliers_clamp_to_max() {
        // level 1.3x, algorithm 1.3x, event 3x against a 3..7.5/day band
        let calc = calculator(Arc::new(FixedJitter(1.0)));
        let mut state = UserProgressionState::new(UserId::from("alice"));
        state.total_xp = 12_000;
        state.selected_algorithm = Algorithm::KawPow;
        state.owned_algorithms.insert(Algorithm::KawPow);

        let breakdown = calc.breakdown(&state, &[boost(3.0)], now());

        assert_eq!(breakdown.level_multiplier, 1.3);
        assert_eq!(breakdown.algorithm_multiplier, 1.3);
        assert_eq!(breakdown.event_multiplier, 3.0);
        assert!(breakdown.clamped);
        assert_eq!(breakdown.rate, 7.5);
    }

    #[test]
    fn test_low_jitter_clamps_to_min() {
        let calc = calculator(Arc::new(FixedJitter(0.5)));
        let state = UserProgressionState::new(UserId::from("bob"));

        assert_eq!(calc.compute_rate(&state, &[], now()), 3.0);
    }

    #[test]
    fn test_jitter_constant_within_window() {
        let calc = calculator(Arc::new(SeededJitter::new(0.05, b"rate")));
        let state = UserProgressionState::new(UserId::from("carol"));
        let start = calc.window_start(calc.window_index(now()));

        let a = calc.compute_rate(&state, &[], start);
        let b = calc.compute_rate(&state, &[], start + chrono::Duration::minutes(59));
        assert_eq!(a, b);
    }

    #[test]
    fn test_accrual_for_window() {
        let calc = calculator(Arc::new(FixedJitter(1.0)));
        let state = UserProgressionState::new(UserId::from("dave"));
        let window = calc.window_index(now());

        // 4 coins/day over one hour
        let amount = calc.accrual_for_window(&state, &[], window).unwrap();
        assert_eq!(amount, 4 * ONE_COIN / 24);
    }

    #[test]
    fn test_nan_jitter_never_escapes_bounds() {
        let calc = calculator(Arc::new(FixedJitter(f64::NAN)));
        let state = UserProgressionState::new(UserId::from("erin"));

        let rate = calc.compute_rate(&state, &[], now());
        assert!((3.0..=7.5).contains(&rate));
    }

    #[test]
    fn test_config_rejects_inverted_bounds() {
        let config = RateConfig {
            min_rate_per_day: 8.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
