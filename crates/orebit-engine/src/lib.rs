//! # Orebit Engine
//!
//! Runtime for the Orebit economy: the reward ledger, local/remote
//! synchronization, community aggregation, competitions and the tick
//! scheduler that drives them.

pub mod aggregator;
pub mod competition;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod sync;

pub use aggregator::{AggregateReport, CommunityAggregator, FanoutReport};
pub use competition::{CompetitionService, FinalizeReport};
pub use config::{EngineConfig, LoggingConfig, ScheduleConfig, SyncConfig};
pub use engine::{AggregationRun, EconomyEngine, EngineBuilder};
pub use ledger::{RewardLedger, SweepReport};
pub use retry::{RetryConfig, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerEvent, SchedulerStats, Tick};
pub use session::{AccrualReport, LevelUp, Session};
pub use sync::{PushOutcome, SyncManager, SyncReport};
