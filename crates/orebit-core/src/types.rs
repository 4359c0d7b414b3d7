//! Core type definitions for Orebit
//!
//! Identifiers, the per-user progression aggregate and the ledger records
//! that every other crate passes around.

use crate::error::{EconomyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One coin in micro-units. Balances are integral so that increments are exact.
pub const ONE_COIN: u64 = 1_000_000;

/// Seconds in a day, used to scale per-day rates
pub const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Feature identifier (e.g. "auto_claim", "marketplace")
pub type FeatureId = String;

/// Rule identifier, ordered lexicographically for tie-breaking
pub type RuleId = String;

/// Convert a coin amount into micro-units (floor).
///
/// NaN, infinite and negative inputs are rejected so that a broken rate can
/// never reach the ledger.
pub fn coins_to_micros(coins: f64) -> Result<u64> {
    if !coins.is_finite() {
        return Err(EconomyError::InvalidDelta(format!("non-finite amount {coins}")));
    }
    if coins < 0.0 {
        return Err(EconomyError::InvalidDelta(format!("negative amount {coins}")));
    }
    let micros = (coins * ONE_COIN as f64).floor();
    if micros > u64::MAX as f64 {
        return Err(EconomyError::InvalidDelta(format!("amount {coins} overflows")));
    }
    Ok(micros as u64)
}

/// Convert micro-units back to coins for display
pub fn micros_to_coins(micros: u64) -> f64 {
    micros as f64 / ONE_COIN as f64
}

/// UserId - opaque account identifier issued by the remote store
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable bytes used to seed per-user randomness
    pub fn seed_bytes(&self) -> [u8; 32] {
        *blake3::hash(self.0.as_bytes()).as_bytes()
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Mining algorithm a user can own and select
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Sha256,
    Scrypt,
    Ethash,
    RandomX,
    KawPow,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::Sha256,
        Algorithm::Scrypt,
        Algorithm::Ethash,
        Algorithm::RandomX,
        Algorithm::KawPow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Scrypt => "scrypt",
            Self::Ethash => "ethash",
            Self::RandomX => "random_x",
            Self::KawPow => "kaw_pow",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| EconomyError::Config(format!("unknown algorithm: {s}")))
    }
}

/// What produced a ledger entry; part of the idempotency key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Balance credited for one completed accrual window
    Accrual,
    Achievement,
    PersonalMilestone,
    CommunityMilestone,
    CompetitionPrize,
    /// Marketplace purchase (the only kind allowed to debit)
    Purchase,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accrual => "accrual",
            Self::Achievement => "achievement",
            Self::PersonalMilestone => "personal-milestone",
            Self::CommunityMilestone => "community-milestone",
            Self::CompetitionPrize => "competition-prize",
            Self::Purchase => "purchase",
        }
    }

    /// Whether a negative balance delta is legal for this source
    pub fn allows_debit(&self) -> bool {
        matches!(self, Self::Purchase)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key: at most one applied ledger entry may exist per key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub user_id: UserId,
    pub source_kind: SourceKind,
    pub source_id: String,
}

impl LedgerKey {
    pub fn new(user_id: UserId, source_kind: SourceKind, source_id: impl Into<String>) -> Self {
        Self {
            user_id,
            source_kind,
            source_id: source_id.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.source_kind, self.source_id)
    }
}

/// Economic effect of one ledger entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDelta {
    /// XP to add
    #[serde(default)]
    pub xp: u64,

    /// Balance change in micro-units (negative only for purchases)
    #[serde(default)]
    pub balance: i64,

    /// Features to union into the unlock set
    #[serde(default)]
    pub unlock_features: BTreeSet<FeatureId>,

    /// Algorithms to grant
    #[serde(default)]
    pub grant_algorithms: BTreeSet<Algorithm>,

    /// Accrual windows credited by this entry
    #[serde(default)]
    pub mined_windows: u64,
}

impl LedgerDelta {
    pub fn xp(amount: u64) -> Self {
        Self {
            xp: amount,
            ..Default::default()
        }
    }

    pub fn balance(amount: i64) -> Self {
        Self {
            balance: amount,
            ..Default::default()
        }
    }

    pub fn with_xp(mut self, amount: u64) -> Self {
        self.xp = amount;
        self
    }

    pub fn with_unlock(mut self, feature: impl Into<FeatureId>) -> Self {
        self.unlock_features.insert(feature.into());
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.grant_algorithms.insert(algorithm);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.xp == 0
            && self.balance == 0
            && self.unlock_features.is_empty()
            && self.grant_algorithms.is_empty()
            && self.mined_windows == 0
    }

    /// Reject deltas that must never leave the client
    pub fn validate(&self, kind: SourceKind) -> Result<()> {
        if self.balance < 0 && !kind.allows_debit() {
            return Err(EconomyError::InvalidDelta(format!(
                "negative balance delta {} for {kind}",
                self.balance
            )));
        }
        if self.is_empty() {
            return Err(EconomyError::InvalidDelta(format!("empty delta for {kind}")));
        }
        Ok(())
    }
}

/// Ledger entry lifecycle: pending -> applied | failed, immutable afterwards
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Applied,
    Failed,
}

/// One reward application attempt and its outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: LedgerKey,
    pub delta: LedgerDelta,
    pub status: LedgerStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,

    /// Commit attempts made so far
    #[serde(default)]
    pub attempts: u32,

    /// Reason recorded when the entry was marked failed
    #[serde(default)]
    pub failure: Option<String>,
}

impl LedgerEntry {
    pub fn pending(key: LedgerKey, delta: LedgerDelta, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            delta,
            status: LedgerStatus::Pending,
            created_at,
            applied_at: None,
            attempts: 0,
            failure: None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status == LedgerStatus::Applied
    }

    pub fn is_pending(&self) -> bool {
        self.status == LedgerStatus::Pending
    }
}

/// Per-user progression aggregate.
///
/// `level`, `xp`, `efficiency` and `hash_rate` are derived from the
/// authoritative fields and recomputed after every pull.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProgressionState {
    pub user_id: UserId,
    pub level: u32,

    /// XP earned inside the current level
    pub xp: u64,

    /// Lifetime XP, never decreases
    pub total_xp: u64,
    pub unlocked_features: BTreeSet<FeatureId>,
    pub selected_algorithm: Algorithm,
    pub owned_algorithms: BTreeSet<Algorithm>,

    /// Balance in micro-units
    pub balance: u64,
    pub efficiency: f64,
    pub hash_rate: f64,

    /// Accrual windows credited so far
    #[serde(default)]
    pub mined_windows: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl UserProgressionState {
    /// Fresh state at first contact: level 1 with the starter algorithm
    pub fn new(user_id: UserId) -> Self {
        let mut owned = BTreeSet::new();
        owned.insert(Algorithm::default());
        Self {
            user_id,
            level: 1,
            xp: 0,
            total_xp: 0,
            unlocked_features: BTreeSet::new(),
            selected_algorithm: Algorithm::default(),
            owned_algorithms: owned,
            balance: 0,
            efficiency: 1.0,
            hash_rate: 0.0,
            mined_windows: 0,
            last_synced_at: None,
        }
    }

    /// Authoritative fields only, used to compare states modulo derived values
    pub fn authoritative(&self) -> AuthoritativeFields {
        AuthoritativeFields {
            user_id: self.user_id.clone(),
            total_xp: self.total_xp,
            balance: self.balance,
            unlocked_features: self.unlocked_features.clone(),
            owned_algorithms: self.owned_algorithms.clone(),
            selected_algorithm: self.selected_algorithm,
            mined_windows: self.mined_windows,
        }
    }
}

/// The subset of [`UserProgressionState`] owned by the remote store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeFields {
    pub user_id: UserId,
    pub total_xp: u64,
    pub balance: u64,
    pub unlocked_features: BTreeSet<FeatureId>,
    pub owned_algorithms: BTreeSet<Algorithm>,
    pub selected_algorithm: Algorithm,
    pub mined_windows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn micros_survive_display_round_trip(micros in 0u64..1_000_000_000_000_000) {
            let back = coins_to_micros(micros_to_coins(micros)).unwrap();
            prop_assert!(back <= micros);
            prop_assert!(micros - back <= 1);
        }

        #[test]
        fn coins_to_micros_never_rounds_up(coins in 0.0f64..1_000_000_000.0) {
            let micros = coins_to_micros(coins).unwrap();
            let exact = coins * ONE_COIN as f64;
            prop_assert!(micros as f64 <= exact);
            prop_assert!(exact - (micros as f64) < 1.0 + exact * f64::EPSILON);
        }
    }

    #[test]
    fn test_coins_to_micros() {
        assert_eq!(coins_to_micros(1.5).unwrap(), 1_500_000);
        assert_eq!(coins_to_micros(0.0).unwrap(), 0);
        assert!(coins_to_micros(f64::NAN).is_err());
        assert!(coins_to_micros(-1.0).is_err());
        assert!(coins_to_micros(f64::INFINITY).is_err());
    }

    #[test]
    fn test_ledger_key_display() {
        let key = LedgerKey::new(UserId::from("alice"), SourceKind::Achievement, "first_mine");
        assert_eq!(key.to_string(), "alice/achievement/first_mine");
    }

    #[test]
    fn test_delta_validation() {
        assert!(LedgerDelta::xp(100).validate(SourceKind::Achievement).is_ok());
        assert!(LedgerDelta::balance(-5).validate(SourceKind::Achievement).is_err());
        assert!(LedgerDelta::balance(-5).validate(SourceKind::Purchase).is_ok());
        assert!(LedgerDelta::default().validate(SourceKind::Accrual).is_err());
    }

    #[test]
    fn test_algorithm_parse() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert!("bogus".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_source_kind_serde() {
        let json = serde_json::to_string(&SourceKind::CommunityMilestone).unwrap();
        assert_eq!(json, "\"community-milestone\"");
    }

    #[test]
    fn test_new_state_owns_starter_algorithm() {
        let state = UserProgressionState::new(UserId::from("bob"));
        assert_eq!(state.level, 1);
        assert!(state.owned_algorithms.contains(&state.selected_algorithm));
    }
}
