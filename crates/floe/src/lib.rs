//! Floe: stage workers for the tape-to-tape archival sync pipeline.
//!
//! This crate handles:
//! - The five stage workers (syncer, retriever, globus-xfer, reaper,
//!   finisher) and their shared drain harness
//! - Thin wrappers over the external `hsi` and `globus` CLIs, behind
//!   traits so tests can substitute mocks
//! - Transfer-buffer bookkeeping
//! - The `floe` binary: config loading, metrics, signal handling
//!
//! The durable queue engine itself lives in `floe-core`.

mod app;
pub mod error;
pub mod globus;
pub mod hsi;
pub mod stages;
pub mod staging;

pub use app::{CliArgs, StageCommand, run};
pub use error::{AppError, GlobusError, HsiError, StageError, StagingError};

// Re-export from floe-core
pub use floe_core::{Config, Queue, Stage, SyncJob, SyncRequest, TransferState, WorkStore};
