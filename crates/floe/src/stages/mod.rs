//! The five stage workers and their shared drain harness.
//!
//! Workers communicate only through the durable queue tree; each is
//! idempotent per invocation and safe to re-run after a crash at any
//! point, because every state transition is a single atomic rename.

mod finisher;
mod globus_xfer;
mod reaper;
mod retriever;
mod runner;
mod syncer;

pub use finisher::Finisher;
pub use globus_xfer::GlobusXfer;
pub use reaper::Reaper;
pub use retriever::Retriever;
pub use runner::{DrainPlan, Outcome, StageRunner, StageWorker};
pub use syncer::Syncer;
