//! Tape retrieval: stage queued jobs into the transfer buffer.
//!
//! Each job's files are copied out of the archive in tape order into
//! `{transfer_dir}/{work_id}/`. A job is either entirely staged or not
//! staged at all: after a partial run the already-landed files are
//! removed before the job quarantines, so the buffer never holds an
//! unflagged fragment of a job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::StageError;
use crate::hsi::{Retrieval, StageRequest, TapeArchive};
use crate::stages::runner::{Loaded, Outcome, StageWorker, load_unit, timeout_strike};
use crate::staging;
use floe_core::emit;
use floe_core::metrics::events::FilesStaged;
use floe_core::store::{Queue, UnitRef, WorkStore};
use floe_core::types::{Stage, SyncJob};

pub struct Retriever {
    store: Arc<WorkStore>,
    archive: Arc<dyn TapeArchive>,
    transfer_dir: std::path::PathBuf,
    /// Transfer-buffer quota in bytes.
    quota_bytes: u64,
    max_timeout_strikes: u32,
}

impl Retriever {
    pub fn new(
        store: Arc<WorkStore>,
        archive: Arc<dyn TapeArchive>,
        transfer_dir: std::path::PathBuf,
        quota_bytes: u64,
        max_timeout_strikes: u32,
    ) -> Self {
        Self {
            store,
            archive,
            transfer_dir,
            quota_bytes,
            max_timeout_strikes,
        }
    }

    /// Remove whatever a failed staging run left behind, so the buffer is
    /// all-or-none for this job when operators inspect it.
    async fn clear_partial_staging(&self, job: &SyncJob) {
        if let Err(e) = staging::reclaim_job_files(&self.transfer_dir, job).await {
            warn!(job = %job.work_id, error = %e, "Failed to clear partial staging");
        }
    }
}

#[async_trait]
impl StageWorker for Retriever {
    fn stage(&self) -> Stage {
        Stage::Retriever
    }

    fn input_queue(&self) -> Queue {
        Queue::Hpss
    }

    async fn process_unit(&mut self, unit: &UnitRef) -> Result<Outcome, StageError> {
        let mut job: SyncJob = match load_unit(&self.store, unit).await? {
            Loaded::Unit(job) => job,
            Loaded::Corrupt(reason) => return Ok(Outcome::quarantine("decode sync job", reason)),
            Loaded::Vanished => return Ok(Outcome::Defer),
        };

        // Respect the buffer quota; later jobs wait for the next cycle.
        let used = staging::directory_size(&self.transfer_dir);
        if used + job.size > self.quota_bytes {
            info!(
                job = %job.work_id,
                used_bytes = used,
                job_bytes = job.size,
                quota_bytes = self.quota_bytes,
                "Transfer buffer is full; halting retrieval until next cycle"
            );
            return Ok(Outcome::Halt);
        }

        let dir = staging::job_dir(&self.transfer_dir, job.work_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            // Buffer storage trouble is usually transient; retry next cycle.
            warn!(job = %job.work_id, error = %e, "Failed to create buffer directory");
            return Ok(Outcome::Defer);
        }

        let requests: Vec<StageRequest> = job
            .files
            .iter()
            .map(|file| StageRequest {
                hpss_path: file.hpss_path.clone(),
                destination: dir.join(&file.file_name),
            })
            .collect();

        info!(
            job = %job.work_id,
            tape = %job.tape,
            files = requests.len(),
            bytes = job.size,
            "Retrieving files from tape"
        );

        match self.archive.retrieve(&requests).await {
            Ok(Retrieval::Complete) => {
                if job.timeout_strikes > 0 {
                    job.timeout_strikes = 0;
                    if let Err(e) = self.store.update(unit, &job).await {
                        warn!(job = %job.work_id, error = %e, "Failed to reset timeout strikes");
                    }
                }
                emit!(FilesStaged {
                    count: job.files.len(),
                    bytes: job.size,
                });
                info!(job = %job.work_id, "All files staged");
                Ok(Outcome::Advance(Queue::Globus))
            }
            Ok(Retrieval::Partial { missing }) => {
                self.clear_partial_staging(&job).await;
                let listed: Vec<String> = missing
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                Ok(Outcome::quarantine(
                    "stage files from tape",
                    format!(
                        "{} of {} files missing after staging: {}",
                        missing.len(),
                        job.files.len(),
                        listed.join(", ")
                    ),
                ))
            }
            Err(e) if e.is_timeout() => {
                self.clear_partial_staging(&job).await;
                timeout_strike(
                    &self.store,
                    unit,
                    &mut job,
                    self.max_timeout_strikes,
                    "stage files from tape",
                    e.to_string(),
                )
                .await
            }
            Err(e) => {
                self.clear_partial_staging(&job).await;
                Ok(Outcome::quarantine("stage files from tape", e.to_string()))
            }
        }
    }
}
