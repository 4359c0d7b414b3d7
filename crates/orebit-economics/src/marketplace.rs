//! # Algorithm Marketplace
//!
//! Algorithms carry a rate multiplier, a price and a level gate.
//!
//! | Algorithm | Multiplier | Price | Required level |
//! |-----------|------------|-------|----------------|
//! | sha256 | 1.00x | free (starter) | 1 |
//! | scrypt | 1.10x | 50 | 3 |
//! | ethash | 1.20x | 150 | 5 |
//! | random_x | 1.25x | 400 | 7 |
//! | kaw_pow | 1.30x | 1,000 | 9 |

use crate::events::{multiplier_for, EventKind, EventWindow};
use chrono::{DateTime, Utc};
use orebit_core::{coins_to_micros, Algorithm, EconomyError, Result, UserProgressionState};
use serde::{Deserialize, Serialize};

/// Static properties of one algorithm
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmDefinition {
    pub algorithm: Algorithm,
    pub multiplier: f64,

    /// List price in coins
    pub price: f64,
    pub required_level: u32,
}

/// Price offered to one user at one instant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchaseQuote {
    pub algorithm: Algorithm,

    /// Final price in micro-units
    pub price: u64,

    /// Sale multiplier applied to the list price (1.0 = no sale)
    pub sale_multiplier: f64,
}

/// Algorithm table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlgorithmTable(Vec<AlgorithmDefinition>);

impl Default for AlgorithmTable {
    fn default() -> Self {
        let def = |algorithm, multiplier, price, required_level| AlgorithmDefinition {
            algorithm,
            multiplier,
            price,
            required_level,
        };
        Self(vec![
            def(Algorithm::Sha256, 1.00, 0.0, 1),
            def(Algorithm::Scrypt, 1.10, 50.0, 3),
            def(Algorithm::Ethash, 1.20, 150.0, 5),
            def(Algorithm::RandomX, 1.25, 400.0, 7),
            def(Algorithm::KawPow, 1.30, 1_000.0, 9),
        ])
    }
}

impl AlgorithmTable {
    pub fn new(definitions: Vec<AlgorithmDefinition>) -> Self {
        Self(definitions)
    }

    pub fn definitions(&self) -> &[AlgorithmDefinition] {
        &self.0
    }

    pub fn get(&self, algorithm: Algorithm) -> Option<&AlgorithmDefinition> {
        self.0.iter().find(|d| d.algorithm == algorithm)
    }

    /// Unknown algorithms mine at the neutral 1.0x
    pub fn multiplier(&self, algorithm: Algorithm) -> f64 {
        self.get(algorithm).map(|d| d.multiplier).unwrap_or(1.0)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, def) in self.0.iter().enumerate() {
            if !def.multiplier.is_finite() || def.multiplier <= 0.0 {
                return Err(EconomyError::Config(format!(
                    "algorithm {} multiplier must be positive",
                    def.algorithm
                )));
            }
            if !def.price.is_finite() || def.price < 0.0 {
                return Err(EconomyError::Config(format!(
                    "algorithm {} price must be >= 0",
                    def.algorithm
                )));
            }
            if def.required_level == 0 {
                return Err(EconomyError::Config(format!(
                    "algorithm {} required_level must be >= 1",
                    def.algorithm
                )));
            }
            if self.0[..i].iter().any(|d| d.algorithm == def.algorithm) {
                return Err(EconomyError::Config(format!(
                    "algorithm {} listed twice",
                    def.algorithm
                )));
            }
        }
        if self.get(Algorithm::default()).is_none() {
            return Err(EconomyError::Config(format!(
                "starter algorithm {} missing from table",
                Algorithm::default()
            )));
        }
        Ok(())
    }

    /// Quote a purchase for `state`, applying any active sale
    pub fn quote(
        &self,
        state: &UserProgressionState,
        algorithm: Algorithm,
        events: &[EventWindow],
        now: DateTime<Utc>,
    ) -> Result<PurchaseQuote> {
        let def = self
            .get(algorithm)
            .ok_or_else(|| EconomyError::Config(format!("algorithm {algorithm} is not for sale")))?;

        if state.owned_algorithms.contains(&algorithm) {
            return Err(EconomyError::AlgorithmAlreadyOwned {
                user: state.user_id.clone(),
                algorithm,
            });
        }
        if state.level < def.required_level {
            return Err(EconomyError::AlgorithmLocked {
                algorithm,
                required: def.required_level,
            });
        }

        let sale_multiplier = multiplier_for(events, EventKind::Sale, now).min(1.0);
        let list_price = coins_to_micros(def.price)?;
        let price = (list_price as f64 * sale_multiplier).round() as u64;

        Ok(PurchaseQuote {
            algorithm,
            price,
            sale_multiplier,
        })
    }
}
