//! # Orebit Storage
//!
//! Storage seams for the Orebit economy.
//!
//! ## Storage Layout
//!
//! - `remote` - authoritative store interface (users, ledger, metrics, competitions)
//! - `memory` - in-memory remote store with fault injection
//! - `cache` - disposable local snapshot + pending trigger queue

pub mod cache;
pub mod memory;
pub mod remote;

// Re-export for convenience
pub use cache::{
    CacheRecord, CachedState, FileCache, LocalCache, MemoryCache, PendingTrigger,
    CACHE_FORMAT_VERSION,
};
pub use memory::{Fault, MemoryRemoteStore, StoreOp};
pub use remote::{EligibilityFilter, InsertOutcome, MetricQuery, RemoteStore, RemoteUserRecord};
