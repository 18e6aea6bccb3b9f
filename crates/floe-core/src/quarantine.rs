//! Failure isolation for work units a stage could not advance.
//!
//! A per-unit failure must not block the rest of the queue: the unit is
//! moved into the stage's quarantine area with a diagnostics sidecar
//! (`{uuid}.failure.json`) recording what was being attempted and why it
//! failed. Quarantined units are never retried automatically — operators
//! inspect them out-of-band and either re-inject or discard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{info, warn};
use uuid::Uuid;

use crate::emit;
use crate::error::{
    IsolateSnafu, QuarantineError, RecordFailureSnafu, ReleaseUnitSnafu, StoreError,
};
use crate::metrics::events::UnitQuarantined;
use crate::store::{Queue, UnitRef, WorkStore};
use crate::types::Stage;

/// Diagnostics recorded alongside a quarantined unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The quarantined unit's id.
    pub unit: Uuid,
    /// Stage that failed to advance the unit.
    pub stage: Stage,
    /// Operation that was being attempted.
    pub operation: String,
    /// Human-readable cause.
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

/// Moves failed units into quarantine and supports operator remediation.
#[derive(Debug, Clone)]
pub struct QuarantineManager {
    store: Arc<WorkStore>,
}

impl QuarantineManager {
    pub fn new(store: Arc<WorkStore>) -> Self {
        Self { store }
    }

    /// Isolate `unit` in `stage`'s quarantine area with diagnostics.
    ///
    /// The sidecar is written before the move; a crash in between leaves
    /// an orphan sidecar in quarantine and the unit still live, which the
    /// next invocation resolves by quarantining again (the sidecar is
    /// simply rewritten).
    pub async fn quarantine(
        &self,
        stage: Stage,
        unit: &UnitRef,
        operation: &str,
        reason: &str,
    ) -> Result<UnitRef, QuarantineError> {
        let record = FailureRecord {
            unit: unit.id,
            stage,
            operation: operation.to_string(),
            reason: reason.to_string(),
            quarantined_at: Utc::now(),
        };

        let sidecar = self.sidecar_path(stage, unit.id);
        self.store
            .write_atomic(&sidecar, &record)
            .await
            .context(RecordFailureSnafu { unit: unit.id })?;

        let moved = self
            .store
            .transfer(unit, Queue::Quarantine(stage))
            .await
            .context(IsolateSnafu {
                unit: unit.id,
                stage,
            })?;

        warn!(
            stage = %stage,
            unit = %unit.id,
            operation = operation,
            reason = reason,
            "Work unit quarantined"
        );
        emit!(UnitQuarantined {
            stage: stage.as_str(),
        });

        Ok(moved)
    }

    /// Units currently held in `stage`'s quarantine area.
    pub async fn list(&self, stage: Stage) -> Result<Vec<UnitRef>, StoreError> {
        self.store.list_ready(Queue::Quarantine(stage)).await
    }

    /// Read the diagnostics sidecar for a quarantined unit, if present.
    pub async fn failure_record(
        &self,
        stage: Stage,
        unit: Uuid,
    ) -> Result<Option<FailureRecord>, StoreError> {
        let sidecar = self.sidecar_path(stage, unit);
        match tokio::fs::read(&sidecar).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(unit = %unit, error = %e, "Malformed failure sidecar");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(crate::error::IoSnafu { path: sidecar }),
        }
    }

    /// Re-inject a quarantined unit into a live queue after operator
    /// remediation, dropping its diagnostics sidecar.
    pub async fn release(
        &self,
        stage: Stage,
        unit: &UnitRef,
        back_to: Queue,
    ) -> Result<UnitRef, QuarantineError> {
        let moved = self
            .store
            .transfer(unit, back_to)
            .await
            .context(ReleaseUnitSnafu {
                unit: unit.id,
                stage,
            })?;

        let sidecar = self.sidecar_path(stage, unit.id);
        if let Err(e) = tokio::fs::remove_file(&sidecar).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(unit = %unit.id, error = %e, "Failed to remove failure sidecar");
        }

        info!(stage = %stage, unit = %unit.id, back_to = %back_to, "Released unit from quarantine");
        Ok(moved)
    }

    fn sidecar_path(&self, stage: Stage, unit: Uuid) -> std::path::PathBuf {
        self.store
            .queue_dir(Queue::Quarantine(stage))
            .join(format!("{unit}.failure.json"))
    }
}
