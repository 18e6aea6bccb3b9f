//! Globus CLI transfer submission and polling.
//!
//! One job becomes one Globus task: every staged file is listed in a
//! batch manifest fed to `globus transfer --batch -` on stdin, and the
//! returned task id is persisted on the job as its resubmission guard.
//! Polling uses `globus task show`; the worker never waits for a transfer
//! to finish.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{
    GlobusDecodeSnafu, GlobusError, GlobusOutputSnafu, GlobusRejectedSnafu, GlobusSpawnSnafu,
    GlobusTaskMismatchSnafu, GlobusTimeoutSnafu,
};
use floe_core::config::GlobusConfig;

/// One source file and its destination path within a job's transfer.
#[derive(Debug, Clone)]
pub struct TransferItem {
    /// Path in the transfer buffer, relative to the source endpoint.
    pub source: std::path::PathBuf,
    /// Path at the destination site, relative to the dest endpoint.
    pub destination: std::path::PathBuf,
}

/// Status of a submitted transfer, as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// The task is running or suspended; check again next cycle.
    InProgress,
    /// Terminal success.
    Succeeded,
    /// Terminal failure; requires operator intervention.
    Failed { reason: String },
}

/// Interface to the bulk-transfer service.
#[async_trait]
pub trait TransferService: Send + Sync {
    /// Submit one transfer task covering `items`; returns the task id.
    async fn submit(&self, label: &str, items: &[TransferItem]) -> Result<Uuid, GlobusError>;

    /// Poll a previously submitted task.
    async fn poll(&self, task_id: Uuid) -> Result<TransferStatus, GlobusError>;
}

/// Task metadata returned by `globus task show`.
///
/// `status` is one word: ACTIVE (in progress), INACTIVE (suspended,
/// usually credential expiry), SUCCEEDED, or FAILED.
#[derive(Debug, Deserialize)]
struct GlobusTask {
    task_id: Uuid,
    status: String,
    #[serde(default)]
    nice_status_details: Option<String>,
}

/// Ack returned by `globus transfer`.
#[derive(Debug, Deserialize)]
struct SubmitAck {
    code: String,
    message: String,
    task_id: Uuid,
}

/// `globus` CLI implementation of [`TransferService`].
pub struct GlobusCli {
    source_endpoint: String,
    dest_endpoint: String,
    sync_level: String,
    verify_checksum: bool,
    timeout: Duration,
}

impl GlobusCli {
    pub fn new(config: &GlobusConfig, timeout: Duration) -> Self {
        Self {
            source_endpoint: config.source_endpoint.clone(),
            dest_endpoint: config.dest_endpoint.clone(),
            sync_level: config.sync_level.clone(),
            verify_checksum: config.verify_checksum,
            timeout,
        }
    }

    async fn wait_with_timeout(
        &self,
        child: tokio::process::Child,
    ) -> Result<std::process::Output, GlobusError> {
        tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                GlobusTimeoutSnafu {
                    timeout: self.timeout,
                }
                .build()
            })?
            .context(GlobusSpawnSnafu)
    }
}

#[async_trait]
impl TransferService for GlobusCli {
    async fn submit(&self, label: &str, items: &[TransferItem]) -> Result<Uuid, GlobusError> {
        // Batch manifest: one quoted "source dest" pair per line.
        let manifest: String = items
            .iter()
            .map(|item| {
                format!(
                    "\"{}\" \"{}\"\n",
                    item.source.display(),
                    item.destination.display()
                )
            })
            .collect();

        info!(
            label = label,
            files = items.len(),
            "Submitting globus transfer"
        );

        let mut command = Command::new("globus");
        command
            .arg("transfer")
            .arg("--batch")
            .arg("-")
            .arg("--sync-level")
            .arg(&self.sync_level)
            .arg("--preserve-mtime")
            .arg("--label")
            .arg(label)
            .arg("--format")
            .arg("json")
            .arg(&self.source_endpoint)
            .arg(&self.dest_endpoint)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.verify_checksum {
            command.arg("--verify-checksum");
        }

        let mut child = command.spawn().context(GlobusSpawnSnafu)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(manifest.as_bytes())
                .await
                .context(GlobusSpawnSnafu)?;
            // Dropping stdin closes the pipe so the CLI sees EOF.
        }

        let output = self.wait_with_timeout(child).await?;
        let stdout = String::from_utf8(output.stdout).context(GlobusOutputSnafu)?;
        debug!("{stdout}");

        let ack: SubmitAck = serde_json::from_str(&stdout).context(GlobusDecodeSnafu)?;
        ensure!(
            ack.code == "Accepted",
            GlobusRejectedSnafu {
                code: ack.code,
                message: ack.message,
            }
        );

        Ok(ack.task_id)
    }

    async fn poll(&self, task_id: Uuid) -> Result<TransferStatus, GlobusError> {
        debug!(task = %task_id, "Polling globus task");
        let mut command = Command::new("globus");
        command
            .arg("task")
            .arg("show")
            .arg("--format")
            .arg("json")
            .arg(task_id.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().context(GlobusSpawnSnafu)?;
        let output = self.wait_with_timeout(child).await?;
        let stdout = String::from_utf8(output.stdout).context(GlobusOutputSnafu)?;
        debug!("{stdout}");

        let task: GlobusTask = serde_json::from_str(&stdout).context(GlobusDecodeSnafu)?;
        ensure!(
            task.task_id == task_id,
            GlobusTaskMismatchSnafu {
                asked: task_id,
                answered: task.task_id,
            }
        );

        Ok(map_task_status(&task))
    }
}

fn map_task_status(task: &GlobusTask) -> TransferStatus {
    match task.status.as_str() {
        "ACTIVE" | "INACTIVE" => TransferStatus::InProgress,
        "SUCCEEDED" => TransferStatus::Succeeded,
        status => TransferStatus::Failed {
            reason: task
                .nice_status_details
                .clone()
                .unwrap_or_else(|| status.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: &str, details: Option<&str>) -> GlobusTask {
        GlobusTask {
            task_id: Uuid::new_v4(),
            status: status.to_string(),
            nice_status_details: details.map(ToString::to_string),
        }
    }

    #[test]
    fn active_and_inactive_are_in_progress() {
        assert_eq!(map_task_status(&task("ACTIVE", None)), TransferStatus::InProgress);
        assert_eq!(
            map_task_status(&task("INACTIVE", None)),
            TransferStatus::InProgress
        );
    }

    #[test]
    fn failed_carries_service_details() {
        let status = map_task_status(&task("FAILED", Some("Endpoint disk full")));
        assert_eq!(
            status,
            TransferStatus::Failed {
                reason: "Endpoint disk full".to_string()
            }
        );
    }

    #[test]
    fn unknown_status_is_a_failure() {
        let status = map_task_status(&task("EXPIRED", None));
        assert!(matches!(status, TransferStatus::Failed { reason } if reason == "EXPIRED"));
    }

    #[test]
    fn task_show_json_decodes() {
        let json = r#"{
            "DATA_TYPE": "task",
            "task_id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "status": "SUCCEEDED",
            "type": "TRANSFER"
        }"#;
        let task: GlobusTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.status, "SUCCEEDED");
        assert_eq!(map_task_status(&task), TransferStatus::Succeeded);
    }

    #[test]
    fn submit_ack_json_decodes() {
        let json = r#"{
            "DATA_TYPE": "transfer_result",
            "code": "Accepted",
            "message": "The transfer has been accepted and a task has been created",
            "request_id": "AbCdEf123",
            "resource": "/transfer",
            "submission_id": "67e55044-10b1-426f-9247-bb680e5fe0c1",
            "task_id": "67e55044-10b1-426f-9247-bb680e5fe0c2"
        }"#;
        let ack: SubmitAck = serde_json::from_str(json).unwrap();
        assert_eq!(ack.code, "Accepted");
    }
}
