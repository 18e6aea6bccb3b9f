//! Buffer reclamation: delete staged files for transferred jobs.
//!
//! Deletes exactly the file set recorded on the job — never a directory
//! wildcard — so concurrently staged data for other jobs is untouchable.
//! A fully-reclaimed buffer advances (the crash-and-rerun case); anything
//! partial quarantines rather than leaving silent half-reclaimed state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::StageError;
use crate::stages::runner::{Loaded, Outcome, StageWorker, load_unit};
use crate::staging::{self, Reclaim};
use floe_core::emit;
use floe_core::metrics::events::BufferReclaimed;
use floe_core::store::{Queue, UnitRef, WorkStore};
use floe_core::types::{Stage, SyncJob};

pub struct Reaper {
    store: Arc<WorkStore>,
    transfer_dir: PathBuf,
}

impl Reaper {
    pub fn new(store: Arc<WorkStore>, transfer_dir: PathBuf) -> Self {
        Self {
            store,
            transfer_dir,
        }
    }
}

#[async_trait]
impl StageWorker for Reaper {
    fn stage(&self) -> Stage {
        Stage::Reaper
    }

    fn input_queue(&self) -> Queue {
        Queue::Reaper
    }

    async fn process_unit(&mut self, unit: &UnitRef) -> Result<Outcome, StageError> {
        let job: SyncJob = match load_unit(&self.store, unit).await? {
            Loaded::Unit(job) => job,
            Loaded::Corrupt(reason) => return Ok(Outcome::quarantine("decode sync job", reason)),
            Loaded::Vanished => return Ok(Outcome::Defer),
        };

        info!(
            job = %job.work_id,
            tape = %job.tape,
            files = job.files.len(),
            bytes = job.size,
            "Reclaiming transfer buffer"
        );

        match staging::reclaim_job_files(&self.transfer_dir, &job).await {
            Ok(Reclaim::Complete { bytes }) => {
                emit!(BufferReclaimed { bytes });
                Ok(Outcome::Advance(Queue::Finished))
            }
            Ok(Reclaim::AlreadyGone) => {
                info!(job = %job.work_id, "Buffer already reclaimed by a prior run");
                Ok(Outcome::Advance(Queue::Finished))
            }
            Ok(Reclaim::Partial { missing, removed }) => {
                let listed: Vec<String> = missing
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                Ok(Outcome::quarantine(
                    "reclaim transfer buffer",
                    format!(
                        "partial reclaim: {removed} files deleted, {} already missing ({}), or foreign data left in the job directory",
                        missing.len(),
                        listed.join(", ")
                    ),
                ))
            }
            Err(e) => Ok(Outcome::quarantine(
                "reclaim transfer buffer",
                e.to_string(),
            )),
        }
    }
}
