//! PulseStore Core: metrics & relation consistency engine
//!
//! Keeps high-write-rate counters and many-to-many relations fast to read
//! and write in a fast key-value store while a slower durable store stays
//! the system of record.
//!
//! # Architecture
//!
//! - **Counters**: writes are atomic pending-delta increments in the fast
//!   store; reads return `max(0, baseline + pending)`
//! - **Relations**: forward and inverse set indexes dual-written with the
//!   durable edge table, rolled back on partial failure
//! - **Reconciliation**: a periodic flush folds pending deltas into the
//!   durable baselines, subtracting exactly what it applied
//! - **Trending**: a bounded ranked structure rebuilt on a timer, with a
//!   durable fallback when cold
//!
//! Store adapters are traits; this crate ships in-memory implementations.
//! Production adapters live in `pulsestore-backends`.

pub mod config;
pub mod counter;
pub mod credential;
pub mod engine;
pub mod error;
pub mod journal;
pub mod keys;
pub mod leaderboard;
pub mod memory;
pub mod reconcile;
pub mod relation;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sweep;
pub mod types;

// Re-export key types for convenience
pub use config::{HeatWeights, PulseConfig, RetryPolicy};
pub use counter::CounterEngine;
pub use credential::CredentialMirror;
pub use engine::{CounterFacade, PulseEngine, RelationFacade, TrendingFacade};
pub use error::{ConfigError, JournalError, PulseError, PulseResult, StoreError, StoreKind, StoreResult};
pub use journal::{RepairJournal, RepairRecord};
pub use leaderboard::{LeaderboardMaintainer, RefreshReport, TrendingEntry};
pub use memory::{Faults, MemoryDurableStore, MemoryFastStore};
pub use reconcile::{FlushReport, Reconciler};
pub use relation::RelationMirror;
pub use scheduler::{spawn_periodic, JobHandle, JobSpec, JobStats, RefreshSignal};
pub use store::{DurableStore, FastStore, KeyScan, ScanPage};
pub use sweep::{RelationSweep, SweepReport};
pub use types::{
    CounterKind, CounterSnapshot, CredentialRecord, RelationEdge, RelationKind, RelationOutcome, Side, SubjectId,
    UserId,
};
