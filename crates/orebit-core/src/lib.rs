//! # Orebit Core
//!
//! Shared building blocks for the Orebit mining economy:
//! - `UserProgressionState` - per-user level, XP, balance and unlocks
//! - `LedgerKey` / `LedgerEntry` - the idempotency key and its record
//! - `EconomyError` - error taxonomy shared by every crate
//! - `Clock` / `JitterSource` - the only non-deterministic inputs
//!
//! ```text
//!   accrual tick ──► rate ──► rule evaluator ──► reward ledger ──► remote store
//!                                                     ▲                 │
//!   local cache ◄────────── synchronization ──────────┴─────────────────┘
//! ```

pub mod clock;
pub mod error;
pub mod types;

pub use clock::*;
pub use error::*;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, JitterSource, ManualClock, SystemClock};
    pub use crate::error::{EconomyError, Result};
    pub use crate::types::*;
}
