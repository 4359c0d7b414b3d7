//! # Orebit Economics - Progression, Rates & Reward Rules
//!
//! Pure calculators for the Orebit mining economy. Nothing in this crate
//! touches the network or the clock; callers pass `now` and apply results
//! through the reward ledger.
//!
//! ## Key Features
//!
//! - **Level table**: step function of lifetime XP with derived unlocks
//! - **Bounded mining rate**: multiplier stack clamped to a fixed band
//! - **Event windows**: explicit and weekly recurring boosts, XP and sales
//! - **Data-driven rules**: achievements and milestones as predicates
//! - **Competitions**: time-boxed leaderboards with prize tiers
//!
//! ## Rate Band
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  base 4.0/day × level × algorithm × efficiency × events × j │
//! │                                                              │
//! │  3.0/day ◄──────────── clamp ────────────► 7.5/day          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod community;
pub mod competition;
pub mod events;
pub mod marketplace;
pub mod progression;
pub mod rate;
pub mod rules;

// Re-exports
pub use community::{AggregateQuery, CommunityMetric, Eligibility, MetricDefinition};
pub use competition::{rank_entries, CompetitionDefinition, CompetitionEntry, PrizeTier};
pub use events::{EventCalendar, EventConfig, EventKind, EventWindow, RecurringEvent};
pub use marketplace::{AlgorithmDefinition, AlgorithmTable, PurchaseQuote};
pub use progression::{LevelDefinition, Progress, ProgressionCalculator, ProgressionConfig, XpOutcome};
pub use rate::{RateBreakdown, RateCalculator, RateConfig};
pub use rules::{
    Predicate, Reward, RuleDefinition, RuleEvaluator, RuleKind, RuleScope, RuleSet, UserStats,
};

/// Economy constants
pub mod constants {
    /// Currency symbol
    pub const SYMBOL: &str = "ORE";

    /// Currency display name
    pub const NAME: &str = "Orebit Coin";

    /// Decimal places of the micro-unit representation
    pub const DECIMALS: u8 = 6;

    /// Salt mixed into every jitter seed
    pub const JITTER_SALT: &[u8] = b"orebit-jitter-v1";
}
