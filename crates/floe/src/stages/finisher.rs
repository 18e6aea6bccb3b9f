//! Request close-out: finish requests whose jobs have all completed.
//!
//! A read-only scan over the live job queues and the quarantine areas.
//! Active jobs leave the request tracked; quarantined jobs leave it
//! tracked indefinitely, because only an operator can resolve them.
//! Only requests move here — never jobs.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StageError, StoreSnafu};
use crate::stages::runner::{Loaded, Outcome, StageWorker, load_unit};
use floe_core::emit;
use floe_core::error::StoreError;
use floe_core::metrics::events::RequestFinished;
use floe_core::store::{Queue, UnitRef, WorkStore};
use floe_core::types::{Stage, SyncJob, SyncRequest};

/// What a scan found for one request.
enum JobsFound {
    None,
    Active,
    Quarantined,
}

pub struct Finisher {
    store: Arc<WorkStore>,
}

impl Finisher {
    pub fn new(store: Arc<WorkStore>) -> Self {
        Self { store }
    }

    /// Scan a queue for jobs referencing `request_id`.
    async fn scan_queue(&self, queue: Queue, request_id: Uuid) -> Result<bool, StageError> {
        for job_ref in self.store.list_ready(queue).await.context(StoreSnafu)? {
            match self.store.read::<SyncJob>(&job_ref).await {
                Ok(job) if job.request_id == request_id => return Ok(true),
                Ok(_) => {}
                Err(StoreError::NotFound { .. }) => {
                    // Moved between listing and reading; it may have gone
                    // anywhere, so count it as active and re-check next
                    // cycle rather than finish a request too early.
                    return Ok(true);
                }
                Err(StoreError::Decode { .. }) => match queue {
                    // A corrupt unit in a live queue will be quarantined
                    // by its own stage; treat it as active until then.
                    Queue::Hpss | Queue::Globus | Queue::Reaper => return Ok(true),
                    // A corrupt quarantined unit cannot be attributed to
                    // any request; skip it rather than pin every request
                    // forever.
                    _ => {
                        warn!(unit = %job_ref.id, queue = %queue, "Skipping unreadable quarantined unit");
                    }
                },
                Err(e) => return Err(e).context(StoreSnafu),
            }
        }
        Ok(false)
    }

    async fn find_jobs(&self, request_id: Uuid) -> Result<JobsFound, StageError> {
        for queue in Queue::ACTIVE_JOBS {
            if self.scan_queue(queue, request_id).await? {
                return Ok(JobsFound::Active);
            }
        }

        // Jobs only ever quarantine from the three job-driven stages.
        for stage in [Stage::Retriever, Stage::GlobusXfer, Stage::Reaper] {
            if self
                .scan_queue(Queue::Quarantine(stage), request_id)
                .await?
            {
                return Ok(JobsFound::Quarantined);
            }
        }

        Ok(JobsFound::None)
    }
}

#[async_trait]
impl StageWorker for Finisher {
    fn stage(&self) -> Stage {
        Stage::Finisher
    }

    fn input_queue(&self) -> Queue {
        Queue::Requests
    }

    async fn process_unit(&mut self, unit: &UnitRef) -> Result<Outcome, StageError> {
        let request: SyncRequest = match load_unit(&self.store, unit).await? {
            Loaded::Unit(request) => request,
            Loaded::Corrupt(reason) => {
                return Ok(Outcome::quarantine("decode sync request", reason));
            }
            Loaded::Vanished => return Ok(Outcome::Defer),
        };

        match self.find_jobs(request.request_id).await? {
            JobsFound::Active => {
                debug!(request = %request.request_id, "Jobs still in flight");
                Ok(Outcome::Defer)
            }
            JobsFound::Quarantined => {
                // Deliberately left pending until an operator resolves the
                // quarantined jobs; the request itself is healthy.
                info!(
                    request = %request.request_id,
                    "Quarantined jobs pin this request; leaving it tracked"
                );
                Ok(Outcome::Defer)
            }
            JobsFound::None => {
                info!(request = %request.request_id, "All jobs complete; finishing request");
                emit!(RequestFinished);
                Ok(Outcome::Advance(Queue::Finished))
            }
        }
    }
}
