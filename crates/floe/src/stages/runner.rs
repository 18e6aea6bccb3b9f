//! Shared drain discipline for stage workers.
//!
//! Every stage follows the same cycle: take the stage lock, snapshot the
//! input queue, process units one at a time, and atomically route each to
//! its successor queue or quarantine. A failure on one unit never aborts
//! its siblings; only systemic faults (store or lock unreachable) abort
//! the invocation, leaving every unit untouched for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{LockSnafu, QuarantineSnafu, StageError, StoreSnafu};
use floe_core::emit;
use floe_core::error::StoreError;
use floe_core::lock::{Acquire, LockGuard, StageLock};
use floe_core::metrics::events::{LockContended, UnitAdvanced, UnitDeferred, UnitsDiscovered};
use floe_core::polling::{IterationResult, StageProcessor};
use floe_core::quarantine::QuarantineManager;
use floe_core::store::{Queue, UnitRef, WorkStore};
use floe_core::types::{Stage, SyncJob};

/// Per-unit outcome of a stage worker.
#[derive(Debug)]
pub enum Outcome {
    /// Atomically move the unit to `queue`.
    Advance(Queue),
    /// Leave the unit in place for the next cycle.
    Defer,
    /// Isolate the unit with diagnostics.
    Quarantine { operation: String, reason: String },
    /// Stop draining for this cycle, leaving this and later units queued.
    Halt,
}

impl Outcome {
    /// Shorthand for quarantine outcomes.
    pub fn quarantine(operation: &str, reason: impl Into<String>) -> Self {
        Outcome::Quarantine {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// One stage's unit-processing logic.
///
/// Implementations fold per-unit failures into the returned [`Outcome`];
/// a returned error is systemic and aborts the whole invocation.
#[async_trait]
pub trait StageWorker: Send {
    fn stage(&self) -> Stage;
    fn input_queue(&self) -> Queue;
    async fn process_unit(&mut self, unit: &UnitRef) -> Result<Outcome, StageError>;
}

/// State prepared for one drain iteration: the held lock and the queue
/// snapshot taken under it.
pub struct DrainPlan {
    lock: LockGuard,
    units: Vec<UnitRef>,
}

/// Drives a [`StageWorker`] through the lock/snapshot/drain cycle.
pub struct StageRunner<W> {
    worker: W,
    store: Arc<WorkStore>,
    locks: StageLock,
    quarantine: QuarantineManager,
    holder: String,
    stale_after: Duration,
}

impl<W: StageWorker> StageRunner<W> {
    pub fn new(worker: W, store: Arc<WorkStore>, stale_after: Duration) -> Self {
        let locks = StageLock::new(store.semaphore_dir());
        let quarantine = QuarantineManager::new(store.clone());
        let holder = std::env::var("USER").unwrap_or_else(|_| "floe".to_string());
        Self {
            worker,
            store,
            locks,
            quarantine,
            holder,
            stale_after,
        }
    }
}

#[async_trait]
impl<W: StageWorker> StageProcessor for StageRunner<W> {
    type State = DrainPlan;
    type Error = StageError;

    fn stage(&self) -> Stage {
        self.worker.stage()
    }

    async fn prepare(&mut self) -> Result<Option<DrainPlan>, StageError> {
        let stage = self.worker.stage();

        let lock = match self
            .locks
            .try_acquire(stage, &self.holder, self.stale_after)
            .await
            .context(LockSnafu)?
        {
            Acquire::Held(lock) => lock,
            Acquire::Busy { holder } => {
                // Not an error: another instance is already draining.
                info!(
                    stage = %stage,
                    holder = %holder.holder,
                    pid = holder.pid,
                    "Stage lock busy; skipping this cycle"
                );
                emit!(LockContended {
                    stage: stage.as_str(),
                });
                return Ok(None);
            }
        };

        let units = self
            .store
            .list_ready(self.worker.input_queue())
            .await
            .context(StoreSnafu)?;
        if units.is_empty() {
            lock.release().await.context(LockSnafu)?;
            return Ok(None);
        }

        emit!(UnitsDiscovered {
            stage: stage.as_str(),
            count: units.len(),
        });
        Ok(Some(DrainPlan { lock, units }))
    }

    async fn process(&mut self, plan: DrainPlan) -> Result<IterationResult, StageError> {
        let stage = self.worker.stage();
        let total = plan.units.len();

        for (index, unit) in plan.units.iter().enumerate() {
            info!(stage = %stage, unit = %unit.id, "Processing unit {}/{total}", index + 1);

            match self.worker.process_unit(unit).await? {
                Outcome::Advance(queue) => match self.store.transfer(unit, queue).await {
                    Ok(_) => {
                        emit!(UnitAdvanced {
                            stage: stage.as_str(),
                        });
                    }
                    Err(e) if e.is_not_found() => {
                        // Should not happen inside our exclusive window;
                        // skip defensively rather than abort the drain.
                        warn!(stage = %stage, unit = %unit.id, "Unit vanished mid-drain; skipping");
                    }
                    Err(e) => return Err(e).context(StoreSnafu),
                },
                Outcome::Defer => {
                    debug!(stage = %stage, unit = %unit.id, "Unit deferred to next cycle");
                    emit!(UnitDeferred {
                        stage: stage.as_str(),
                    });
                }
                Outcome::Quarantine { operation, reason } => {
                    self.quarantine
                        .quarantine(stage, unit, &operation, &reason)
                        .await
                        .context(QuarantineSnafu)?;
                }
                Outcome::Halt => {
                    info!(stage = %stage, remaining = total - index, "Halting drain for this cycle");
                    break;
                }
            }
        }

        plan.lock.release().await.context(LockSnafu)?;
        Ok(IterationResult::ProcessedItems)
    }
}

/// Result of loading a unit's payload inside a drain.
pub(crate) enum Loaded<T> {
    Unit(T),
    /// Payload does not decode; the unit belongs in quarantine.
    Corrupt(String),
    /// The unit is gone; nothing to do for it.
    Vanished,
}

/// Load a unit, folding per-unit read failures into [`Loaded`] and
/// letting systemic IO errors abort the invocation.
pub(crate) async fn load_unit<T: DeserializeOwned>(
    store: &WorkStore,
    unit: &UnitRef,
) -> Result<Loaded<T>, StageError> {
    match store.read(unit).await {
        Ok(payload) => Ok(Loaded::Unit(payload)),
        Err(e @ StoreError::Decode { .. }) => Ok(Loaded::Corrupt(e.to_string())),
        Err(StoreError::NotFound { .. }) => {
            warn!(unit = %unit.id, "Unit vanished before it could be read");
            Ok(Loaded::Vanished)
        }
        Err(e) => Err(e).context(StoreSnafu),
    }
}

/// Record a consecutive-timeout strike on a job.
///
/// The updated strike count is persisted in place; once it reaches
/// `max_strikes` the job quarantines, otherwise it stays queued so a
/// briefly slow external service does not condemn it.
pub(crate) async fn timeout_strike(
    store: &WorkStore,
    unit: &UnitRef,
    job: &mut SyncJob,
    max_strikes: u32,
    operation: &str,
    error_text: String,
) -> Result<Outcome, StageError> {
    job.timeout_strikes += 1;
    store.update(unit, job).await.context(StoreSnafu)?;

    if job.timeout_strikes >= max_strikes {
        Ok(Outcome::quarantine(
            operation,
            format!(
                "{error_text} ({} consecutive timeouts)",
                job.timeout_strikes
            ),
        ))
    } else {
        warn!(
            unit = %unit.id,
            strikes = job.timeout_strikes,
            max_strikes,
            "External operation timed out; will retry next cycle"
        );
        Ok(Outcome::Defer)
    }
}
