//! Floe core: the durable work-queue engine behind the tape sync pipeline.
//!
//! This crate handles:
//! - The filesystem work-unit store (atomic enqueue/move/update via rename)
//! - Per-stage exclusion locks with stale-holder reclamation
//! - Quarantine isolation with failure diagnostics
//! - Configuration loading with env interpolation
//! - The stage polling harness, metrics events, and tracing/signal setup
//!
//! External-service code (tape retrieval, bulk transfer) lives in the
//! `floe` crate; nothing here shells out.

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod polling;
pub mod quarantine;
pub mod signal;
pub mod store;
pub mod tracing;
pub mod types;

// Re-export commonly used items
pub use config::Config;
pub use error::{ConfigError, LockError, MetricsError, QuarantineError, StoreError};
pub use lock::{Acquire, LockGuard, LockRecord, StageLock};
pub use polling::{IterationResult, StageProcessor, run_stage_loop};
pub use quarantine::{FailureRecord, QuarantineManager};
pub use signal::shutdown_signal;
pub use store::{Queue, UnitRef, WorkStore};
pub use types::{Stage, SyncFile, SyncJob, SyncRequest, TransferState};
