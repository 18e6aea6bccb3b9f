//! Shared data model for the floe pipeline.
//!
//! A [`SyncRequest`] is user intent ("synchronize dataset D"); the syncer
//! expands it into one or more tape-grouped [`SyncJob`]s which flow through
//! retrieval, transfer, and buffer reclamation independently. A unit's
//! current pipeline position is not stored in these records — it is the
//! queue directory that currently holds the unit's file.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five processing roles of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Syncer,
    Retriever,
    GlobusXfer,
    Reaper,
    Finisher,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Syncer,
        Stage::Retriever,
        Stage::GlobusXfer,
        Stage::Reaper,
        Stage::Finisher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Syncer => "syncer",
            Stage::Retriever => "retriever",
            Stage::GlobusXfer => "globus_xfer",
            Stage::Reaper => "reaper",
            Stage::Finisher => "finisher",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to synchronize a dataset from the source archive to the
/// destination site.
///
/// Immutable once created; only its queue membership changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub request_id: Uuid,
    /// When the request was submitted.
    pub date_created: DateTime<Utc>,
    /// Dataset root in the source archive namespace.
    pub source: String,
    /// Destination root at the remote site.
    pub dest: String,
    /// Glob over the archive namespace selecting the dataset's files.
    pub pattern: String,
}

/// One file within a sync job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFile {
    /// File name without any path information.
    pub file_name: String,
    /// Absolute path of the file in the source archive.
    pub hpss_path: String,
    /// Recorded size of the file in the archive.
    pub size: u64,
    /// Tape mark the file starts at.
    pub tape_num: u64,
    /// Bytes past the mark where the file starts.
    pub tape_offset: u64,
}

/// Persisted transfer state machine for a job.
///
/// The submitted task id is the resubmission guard: a job carrying one is
/// never submitted again. Terminal states are written into the record just
/// before the job's terminal queue move, so finished and quarantined
/// records are self-describing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value")]
pub enum TransferState {
    /// No transfer has been submitted for this job yet.
    #[default]
    Unsubmitted,
    /// A transfer was accepted by the service and is being polled.
    Submitted { task_id: Uuid },
    /// The transfer reached terminal success.
    Completed { task_id: Uuid },
    /// The transfer reached terminal failure.
    Failed { task_id: Uuid, reason: String },
}

impl TransferState {
    /// The service-side task handle, if one has been recorded.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            TransferState::Unsubmitted => None,
            TransferState::Submitted { task_id }
            | TransferState::Completed { task_id }
            | TransferState::Failed { task_id, .. } => Some(*task_id),
        }
    }
}

/// A tape-grouped set of files to synchronize, created by the syncer from
/// one [`SyncRequest`].
///
/// `files` is kept in tape-access order (tape mark, then offset) so that
/// retrieval seeks forward through the tape instead of thrashing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub work_id: Uuid,
    /// When this work unit was created.
    pub date_created: DateTime<Utc>,
    /// Tape label this group of files resides on.
    pub tape: String,
    /// Total size of the group in bytes.
    pub size: u64,
    /// The request that generated this work.
    pub request_id: Uuid,
    /// Files to synchronize, in tape-access order.
    pub files: Vec<SyncFile>,
    /// Transfer state machine, persisted across invocations.
    #[serde(default)]
    pub transfer: TransferState,
    /// Consecutive external-operation timeouts observed for this job.
    /// Reset on any successful external call.
    #[serde(default)]
    pub timeout_strikes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> SyncJob {
        SyncJob {
            work_id: Uuid::new_v4(),
            date_created: Utc::now(),
            tape: "AG084600".to_string(),
            size: 42,
            request_id: Uuid::new_v4(),
            files: vec![SyncFile {
                file_name: "a.zip".to_string(),
                hpss_path: "/archive/data/a.zip".to_string(),
                size: 42,
                tape_num: 840,
                tape_offset: 0,
            }],
            transfer: TransferState::Unsubmitted,
            timeout_strikes: 0,
        }
    }

    #[test]
    fn transfer_state_roundtrip() {
        let task_id = Uuid::new_v4();
        let mut job = sample_job();
        job.transfer = TransferState::Submitted { task_id };

        let json = serde_json::to_string(&job).unwrap();
        let back: SyncJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transfer, TransferState::Submitted { task_id });
        assert_eq!(back.transfer.task_id(), Some(task_id));
    }

    #[test]
    fn transfer_state_defaults_to_unsubmitted() {
        // Records written before the transfer field existed must still load.
        let json = r#"{
            "work_id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "date_created": "2026-01-28T00:00:00Z",
            "tape": "AU031800",
            "size": 0,
            "request_id": "67e55044-10b1-426f-9247-bb680e5fe0c9",
            "files": []
        }"#;
        let job: SyncJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.transfer, TransferState::Unsubmitted);
        assert_eq!(job.timeout_strikes, 0);
    }

    #[test]
    fn stage_labels_are_stable() {
        // Queue directory names are derived from these labels; they are
        // on-disk format, not display strings.
        let labels: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            labels,
            vec!["syncer", "retriever", "globus_xfer", "reaper", "finisher"]
        );
    }
}
