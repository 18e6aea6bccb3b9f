//! Batched `hsi` invocations against the HPSS tape archive.
//!
//! The archive is driven through batch files: commands are written to a
//! scratch file under `semaphore/` and fed to `hsi -P in <file>`, one
//! process per operation, so a thousand-file job costs one tape session
//! instead of a thousand. Stages depend on the [`TapeArchive`] trait, not
//! on this wrapper, so tests can substitute an in-memory archive.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use snafu::prelude::*;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HsiBatchFileSnafu, HsiError, HsiMetadataSnafu, HsiOutputSnafu, HsiSpawnSnafu};

/// Expected field count in an `ls -NP` metadata record.
const HSI_METADATA_FIELDS: usize = 13;

/// File metadata reported by HPSS, including tape residency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpssFile {
    /// Absolute path of the file in HPSS.
    pub hpss_path: String,
    pub size: u64,
    /// Tape label; `"0"` when the archive did not report one.
    pub tape: String,
    /// Tape mark the file starts at.
    pub tape_num: u64,
    /// Bytes past the mark where the file starts.
    pub tape_offset: u64,
}

/// One file to copy out of the archive.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub hpss_path: String,
    pub destination: PathBuf,
}

/// Result of a staging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieval {
    /// Every requested file landed at its destination.
    Complete,
    /// Some destinations are missing after the run.
    Partial { missing: Vec<PathBuf> },
}

/// Interface to the source tape archive.
#[async_trait]
pub trait TapeArchive: Send + Sync {
    /// Recursively list every path under `base_path`.
    async fn list_files(&self, base_path: &str) -> Result<Vec<String>, HsiError>;

    /// Query tape-residency metadata for the given paths, in one batch.
    async fn tape_metadata(&self, paths: &[String]) -> Result<Vec<HpssFile>, HsiError>;

    /// Copy files out of the archive to their destinations, in the given
    /// order (tape order), and verify each one landed.
    async fn retrieve(&self, files: &[StageRequest]) -> Result<Retrieval, HsiError>;
}

/// `hsi` CLI implementation of [`TapeArchive`].
pub struct HsiClient {
    /// Scratch directory for batch files (the workspace `semaphore/` dir).
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl HsiClient {
    pub fn new(scratch_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            timeout,
        }
    }

    async fn run(&self, mut command: Command) -> Result<std::process::Output, HsiError> {
        command.kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                crate::error::HsiTimeoutSnafu {
                    timeout: self.timeout,
                }
                .build()
            })?
            .context(HsiSpawnSnafu)?;
        Ok(output)
    }

    /// Write `lines` to a scratch batch file, run `hsi -P in <file>`, and
    /// clean the batch file up afterwards.
    async fn run_batch(&self, lines: &[String]) -> Result<std::process::Output, HsiError> {
        let batch_path = self.scratch_dir.join(Uuid::new_v4().to_string());
        let script = format!("{}\n", lines.join("\n"));
        tokio::fs::write(&batch_path, script)
            .await
            .context(HsiBatchFileSnafu {
                path: batch_path.clone(),
            })?;
        debug!(batch = %batch_path.display(), commands = lines.len(), "Running hsi batch");

        let mut command = Command::new("hsi");
        command.arg("-P").arg("in").arg(&batch_path);
        let result = self.run(command).await;

        if let Err(e) = tokio::fs::remove_file(&batch_path).await {
            warn!(batch = %batch_path.display(), error = %e, "Failed to remove hsi batch file");
        }

        result
    }
}

#[async_trait]
impl TapeArchive for HsiClient {
    async fn list_files(&self, base_path: &str) -> Result<Vec<String>, HsiError> {
        info!(base_path = base_path, "Listing archive namespace");
        let mut command = Command::new("hsi");
        command.arg("-q").arg("ls").arg("-1").arg("-R").arg(base_path);
        let output = self.run(command).await?;

        // hsi prints listings on stderr, not stdout.
        let stderr = String::from_utf8(output.stderr).context(HsiOutputSnafu)?;
        Ok(stderr.lines().map(ToString::to_string).collect())
    }

    async fn tape_metadata(&self, paths: &[String]) -> Result<Vec<HpssFile>, HsiError> {
        info!(files = paths.len(), "Querying tape metadata");
        let lines: Vec<String> = paths.iter().map(|path| format!("ls -NP {path}")).collect();
        let output = self.run_batch(&lines).await?;

        // Metadata responses come back on stdout.
        let stdout = String::from_utf8(output.stdout).context(HsiOutputSnafu)?;
        parse_tape_metadata(&stdout)
    }

    async fn retrieve(&self, files: &[StageRequest]) -> Result<Retrieval, HsiError> {
        info!(files = files.len(), "Staging files out of the archive");
        let lines: Vec<String> = files
            .iter()
            .map(|file| {
                format!(
                    "get -C -P {} : {}",
                    file.destination.display(),
                    file.hpss_path
                )
            })
            .collect();
        let output = self.run_batch(&lines).await?;

        if let Ok(stdout) = String::from_utf8(output.stdout) {
            debug!("{stdout}");
        }

        // hsi exit codes are unreliable for batch runs; trust the
        // filesystem instead and verify every destination landed.
        let mut missing = Vec::new();
        for file in files {
            if tokio::fs::metadata(&file.destination).await.is_err() {
                missing.push(file.destination.clone());
            }
        }

        if missing.is_empty() {
            Ok(Retrieval::Complete)
        } else {
            Ok(Retrieval::Partial { missing })
        }
    }
}

/// Parse `ls -NP` output into [`HpssFile`] records.
///
/// Response lines are tab-separated with 13 fields; the echoed command
/// lines (anything not starting with `FILE`) are skipped. Layout:
///
/// ```text
/// 0  FILE
/// 1  /path/in/archive/file.zip
/// 2  size
/// 3  size-on-media
/// 4  position (tape_num+tape_offset)
/// 5  tape label(s)
/// 6..12  segment/date bookkeeping
/// ```
pub fn parse_tape_metadata(output: &str) -> Result<Vec<HpssFile>, HsiError> {
    let mut files = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.first() != Some(&"FILE") {
            continue;
        }
        ensure!(fields.len() == HSI_METADATA_FIELDS, HsiMetadataSnafu { line });

        // A tape label shorter than 3 chars means "not on tape".
        let tape = if fields[5].len() < 3 { "0" } else { fields[5] };

        let (tape_num, tape_offset) = match fields[4].split_once('+') {
            Some((num, offset)) => {
                let num = num.parse().ok().context(HsiMetadataSnafu { line })?;
                let offset = offset.parse().ok().context(HsiMetadataSnafu { line })?;
                (num, offset)
            }
            None => (0, 0),
        };

        files.push(HpssFile {
            hpss_path: fields[1].to_string(),
            size: fields[2].parse().ok().context(HsiMetadataSnafu { line })?,
            tape: tape.to_string(),
            tape_num,
            tape_offset,
        });
    }

    Ok(files)
}
