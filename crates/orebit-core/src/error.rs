//! Error types for Orebit economy operations

use crate::types::{Algorithm, LedgerKey, UserId};
use thiserror::Error;

/// Result type alias for Orebit operations
pub type Result<T> = std::result::Result<T, EconomyError>;

/// Errors that can occur while accruing, rewarding or synchronizing.
///
/// A key collision in the ledger is not represented here: it resolves to the
/// existing entry and is reported as a normal outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EconomyError {
    // === Transport ===
    /// Remote store unreachable or returned a retryable failure
    #[error("Transient network error during {op}: {reason}")]
    TransientNetwork { op: String, reason: String },

    /// Remote call exceeded its per-attempt timeout
    #[error("Remote call {op} timed out after {millis}ms")]
    Timeout { op: String, millis: u64 },

    /// Retry budget exhausted; the UI shows "sync delayed"
    #[error("Sync delayed: {op} failed after {attempts} attempts")]
    SyncDelayed { op: String, attempts: u32 },

    // === Ledger ===
    /// Negative, NaN or empty delta; rejected locally and never sent
    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    /// Ledger entry missing where one was expected
    #[error("Ledger entry not found: {0}")]
    LedgerEntryNotFound(LedgerKey),

    /// Commit would drive the balance below zero
    #[error("Insufficient balance for {user}: need {required}, have {available}")]
    InsufficientBalance {
        user: UserId,
        required: u64,
        available: u64,
    },

    // === Progression / marketplace ===
    /// User has never been seen by the remote store
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Algorithm {algorithm} already owned by {user}")]
    AlgorithmAlreadyOwned { user: UserId, algorithm: Algorithm },

    #[error("Algorithm {algorithm} requires level {required}")]
    AlgorithmLocked { algorithm: Algorithm, required: u32 },

    #[error("Algorithm {algorithm} is not owned by {user}")]
    AlgorithmNotOwned { user: UserId, algorithm: Algorithm },

    #[error("Competition {0} is not accepting scores")]
    CompetitionClosed(String),

    #[error("Competition {0} has not ended yet")]
    CompetitionStillOpen(String),

    // === Synchronization ===
    /// Local cache unreadable or inconsistent; discard and rehydrate
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    /// Community distribution interrupted; resumable by re-running
    #[error("Partial fan-out for {milestone}: {pending} pending, {failed} failed")]
    PartialFanout {
        milestone: String,
        pending: usize,
        failed: usize,
    },

    // === General ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EconomyError {
    /// Stable numeric code for logs and operator tooling
    pub fn code(&self) -> u32 {
        match self {
            Self::TransientNetwork { .. } => 1001,
            Self::Timeout { .. } => 1002,
            Self::SyncDelayed { .. } => 1003,
            Self::InvalidDelta(_) => 2001,
            Self::LedgerEntryNotFound(_) => 2002,
            Self::InsufficientBalance { .. } => 2003,
            Self::UserNotFound(_) => 3001,
            Self::AlgorithmAlreadyOwned { .. } => 3002,
            Self::AlgorithmLocked { .. } => 3003,
            Self::AlgorithmNotOwned { .. } => 3004,
            Self::CompetitionClosed(_) | Self::CompetitionStillOpen(_) => 3005,
            Self::CacheCorruption(_) => 4001,
            Self::PartialFanout { .. } => 4002,
            _ => 9999,
        }
    }

    /// Retryable with backoff, without any state change
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. } | Self::Timeout { .. })
    }

    /// Shorthand used by store implementations
    pub fn transient(op: &str, reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for EconomyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(EconomyError::transient("pull", "reset").code(), 1001);
        assert_eq!(EconomyError::InvalidDelta("nan".into()).code(), 2001);
        assert_eq!(EconomyError::CacheCorruption("bad".into()).code(), 4001);
    }

    #[test]
    fn test_transient_errors() {
        assert!(EconomyError::transient("insert", "503").is_transient());
        assert!(EconomyError::Timeout {
            op: "commit".into(),
            millis: 500
        }
        .is_transient());
        assert!(!EconomyError::InvalidDelta("x".into()).is_transient());
        assert!(!EconomyError::SyncDelayed {
            op: "pull".into(),
            attempts: 5
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = EconomyError::PartialFanout {
            milestone: "users_1000".into(),
            pending: 2,
            failed: 1,
        };
        assert!(err.to_string().contains("users_1000"));
    }
}
