//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline
//! and implements [`InternalEvent`], which records the corresponding
//! Prometheus metric. Stage-scoped events carry a `stage` label so the
//! five workers are observable independently.

use std::time::Duration;

use metrics::{counter, histogram};
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Units found in a stage's input queue at the start of a drain.
pub struct UnitsDiscovered {
    pub stage: &'static str,
    pub count: usize,
}

impl InternalEvent for UnitsDiscovered {
    fn emit(self) {
        trace!(stage = self.stage, count = self.count, "Units discovered");
        counter!("floe_units_discovered_total", "stage" => self.stage).increment(self.count as u64);
    }
}

/// A unit was atomically advanced to its successor queue.
pub struct UnitAdvanced {
    pub stage: &'static str,
}

impl InternalEvent for UnitAdvanced {
    fn emit(self) {
        trace!(stage = self.stage, "Unit advanced");
        counter!("floe_units_advanced_total", "stage" => self.stage).increment(1);
    }
}

/// A unit was left in place for the next cycle.
pub struct UnitDeferred {
    pub stage: &'static str,
}

impl InternalEvent for UnitDeferred {
    fn emit(self) {
        trace!(stage = self.stage, "Unit deferred");
        counter!("floe_units_deferred_total", "stage" => self.stage).increment(1);
    }
}

/// A unit was isolated in quarantine.
pub struct UnitQuarantined {
    pub stage: &'static str,
}

impl InternalEvent for UnitQuarantined {
    fn emit(self) {
        trace!(stage = self.stage, "Unit quarantined");
        counter!("floe_units_quarantined_total", "stage" => self.stage).increment(1);
    }
}

/// A worker found its stage lock held by another live worker.
pub struct LockContended {
    pub stage: &'static str,
}

impl InternalEvent for LockContended {
    fn emit(self) {
        trace!(stage = self.stage, "Stage lock contended");
        counter!("floe_lock_contended_total", "stage" => self.stage).increment(1);
    }
}

/// Files staged from tape into the transfer buffer.
pub struct FilesStaged {
    pub count: usize,
    pub bytes: u64,
}

impl InternalEvent for FilesStaged {
    fn emit(self) {
        trace!(count = self.count, bytes = self.bytes, "Files staged");
        counter!("floe_files_staged_total").increment(self.count as u64);
        counter!("floe_bytes_staged_total").increment(self.bytes);
    }
}

/// A bulk transfer was accepted by the transfer service.
pub struct TransferSubmitted {
    pub files: usize,
    pub bytes: u64,
}

impl InternalEvent for TransferSubmitted {
    fn emit(self) {
        trace!(files = self.files, bytes = self.bytes, "Transfer submitted");
        counter!("floe_transfers_submitted_total").increment(1);
        counter!("floe_transfer_bytes_submitted_total").increment(self.bytes);
    }
}

/// Terminal outcome of a polled transfer.
#[derive(Debug, Clone, Copy)]
pub enum TransferOutcome {
    Succeeded,
    Failed,
}

impl TransferOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferOutcome::Succeeded => "succeeded",
            TransferOutcome::Failed => "failed",
        }
    }
}

/// A polled transfer reached a terminal state.
pub struct TransferResolved {
    pub outcome: TransferOutcome,
}

impl InternalEvent for TransferResolved {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Transfer resolved");
        counter!("floe_transfers_resolved_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// Transfer-buffer bytes reclaimed by the reaper.
pub struct BufferReclaimed {
    pub bytes: u64,
}

impl InternalEvent for BufferReclaimed {
    fn emit(self) {
        trace!(bytes = self.bytes, "Buffer reclaimed");
        counter!("floe_buffer_bytes_reclaimed_total").increment(self.bytes);
    }
}

/// A request had no remaining jobs and was closed out.
pub struct RequestFinished;

impl InternalEvent for RequestFinished {
    fn emit(self) {
        trace!("Request finished");
        counter!("floe_requests_finished_total").increment(1);
    }
}

/// Result classification for a completed drain iteration.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
}

impl IterationResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
        }
    }
}

/// A drain iteration completed.
pub struct IterationCompleted {
    pub stage: &'static str,
    pub result: IterationResultType,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(stage = self.stage, result = self.result.as_str(), "Iteration completed");
        counter!(
            "floe_iterations_total",
            "stage" => self.stage,
            "result" => self.result.as_str(),
        )
        .increment(1);
    }
}

/// Wall-clock duration of a drain iteration.
pub struct IterationDuration {
    pub stage: &'static str,
    pub duration: Duration,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        histogram!("floe_iteration_duration_seconds", "stage" => self.stage)
            .record(self.duration.as_secs_f64());
    }
}
