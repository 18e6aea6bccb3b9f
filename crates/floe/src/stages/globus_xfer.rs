//! Transfer management: submit and poll bulk transfers for staged jobs.
//!
//! A pure state-advance worker: each cycle moves a job at most one step
//! through `Unsubmitted → Submitted → Completed | Failed` and never waits
//! for the transfer itself — an in-progress task just leaves the job in
//! place to be re-polled next cycle. The persisted task id is the guard
//! against double submission.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::error::{StageError, StoreSnafu};
use crate::globus::{TransferItem, TransferService, TransferStatus};
use crate::stages::runner::{Loaded, Outcome, StageWorker, load_unit, timeout_strike};
use crate::staging;
use floe_core::emit;
use floe_core::metrics::events::{TransferOutcome, TransferResolved, TransferSubmitted};
use floe_core::store::{Queue, UnitRef, WorkStore};
use floe_core::types::{Stage, SyncJob, TransferState};

pub struct GlobusXfer {
    store: Arc<WorkStore>,
    transfer: Arc<dyn TransferService>,
    transfer_dir: PathBuf,
    /// Archive namespace root; source paths must live under it.
    hpss_base_path: String,
    /// Destination root the archive-relative paths are grafted onto.
    dest_base_path: String,
    max_timeout_strikes: u32,
}

impl GlobusXfer {
    pub fn new(
        store: Arc<WorkStore>,
        transfer: Arc<dyn TransferService>,
        transfer_dir: PathBuf,
        hpss_base_path: String,
        dest_base_path: String,
        max_timeout_strikes: u32,
    ) -> Self {
        Self {
            store,
            transfer,
            transfer_dir,
            hpss_base_path,
            dest_base_path,
            max_timeout_strikes,
        }
    }

    async fn submit(&self, unit: &UnitRef, mut job: SyncJob) -> Result<Outcome, StageError> {
        let items = match transfer_items(
            &job,
            &self.transfer_dir,
            &self.hpss_base_path,
            &self.dest_base_path,
        ) {
            Ok(items) => items,
            Err(reason) => return Ok(Outcome::quarantine("build transfer manifest", reason)),
        };

        let label = format!("floe {}", job.work_id);
        match self.transfer.submit(&label, &items).await {
            Ok(task_id) => {
                // Persist the guard immediately; without it a restart
                // would submit this job a second time.
                job.transfer = TransferState::Submitted { task_id };
                job.timeout_strikes = 0;
                self.store.update(unit, &job).await.context(StoreSnafu)?;

                info!(job = %job.work_id, task = %task_id, "Transfer submitted");
                emit!(TransferSubmitted {
                    files: items.len(),
                    bytes: job.size,
                });
                Ok(Outcome::Defer)
            }
            Err(e) if e.is_transient() => {
                timeout_strike(
                    &self.store,
                    unit,
                    &mut job,
                    self.max_timeout_strikes,
                    "submit transfer",
                    e.to_string(),
                )
                .await
            }
            Err(e) => Ok(Outcome::quarantine("submit transfer", e.to_string())),
        }
    }

    async fn poll(
        &self,
        unit: &UnitRef,
        mut job: SyncJob,
        task_id: uuid::Uuid,
    ) -> Result<Outcome, StageError> {
        match self.transfer.poll(task_id).await {
            Ok(TransferStatus::InProgress) => {
                // The pipeline's suspension point: no state change, the
                // next cycle re-polls.
                debug!(job = %job.work_id, task = %task_id, "Transfer still in progress");
                Ok(Outcome::Defer)
            }
            Ok(TransferStatus::Succeeded) => {
                job.transfer = TransferState::Completed { task_id };
                job.timeout_strikes = 0;
                self.store.update(unit, &job).await.context(StoreSnafu)?;

                info!(job = %job.work_id, task = %task_id, "Transfer succeeded");
                emit!(TransferResolved {
                    outcome: TransferOutcome::Succeeded,
                });
                Ok(Outcome::Advance(Queue::Reaper))
            }
            Ok(TransferStatus::Failed { reason }) => {
                job.transfer = TransferState::Failed {
                    task_id,
                    reason: reason.clone(),
                };
                self.store.update(unit, &job).await.context(StoreSnafu)?;

                emit!(TransferResolved {
                    outcome: TransferOutcome::Failed,
                });
                Ok(Outcome::quarantine("bulk transfer", reason))
            }
            Err(e) if e.is_transient() => {
                timeout_strike(
                    &self.store,
                    unit,
                    &mut job,
                    self.max_timeout_strikes,
                    "poll transfer",
                    e.to_string(),
                )
                .await
            }
            Err(e) => Ok(Outcome::quarantine("poll transfer", e.to_string())),
        }
    }
}

#[async_trait]
impl StageWorker for GlobusXfer {
    fn stage(&self) -> Stage {
        Stage::GlobusXfer
    }

    fn input_queue(&self) -> Queue {
        Queue::Globus
    }

    async fn process_unit(&mut self, unit: &UnitRef) -> Result<Outcome, StageError> {
        let job: SyncJob = match load_unit(&self.store, unit).await? {
            Loaded::Unit(job) => job,
            Loaded::Corrupt(reason) => return Ok(Outcome::quarantine("decode sync job", reason)),
            Loaded::Vanished => return Ok(Outcome::Defer),
        };

        match job.transfer.clone() {
            TransferState::Unsubmitted => self.submit(unit, job).await,
            TransferState::Submitted { task_id } => self.poll(unit, job, task_id).await,
            // Terminal state was recorded but the crash hit before the
            // queue move; finish the move now.
            TransferState::Completed { .. } => Ok(Outcome::Advance(Queue::Reaper)),
            TransferState::Failed { reason, .. } => {
                Ok(Outcome::quarantine("bulk transfer", reason))
            }
        }
    }
}

/// Map each staged file to its destination path: the archive-relative
/// part of the HPSS path grafted onto the destination base.
fn transfer_items(
    job: &SyncJob,
    transfer_dir: &Path,
    hpss_base_path: &str,
    dest_base_path: &str,
) -> Result<Vec<TransferItem>, String> {
    let dir = staging::job_dir(transfer_dir, job.work_id);
    let base = hpss_base_path.trim_end_matches('/');

    job.files
        .iter()
        .map(|file| {
            let relative = file
                .hpss_path
                .strip_prefix(base)
                .filter(|rest| rest.starts_with('/'))
                .map(|rest| rest.trim_start_matches('/'))
                .filter(|rest| !rest.is_empty())
                .ok_or_else(|| {
                    format!(
                        "archive path {} is outside the archive base {base}",
                        file.hpss_path
                    )
                })?;
            Ok(TransferItem {
                source: dir.join(&file.file_name),
                destination: Path::new(dest_base_path).join(relative),
            })
        })
        .collect()
}
