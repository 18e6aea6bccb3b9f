//! Shared transfer-buffer helpers.
//!
//! The buffer holds one directory per job, named by the job's id, so
//! concurrent jobs never interfere. Reclamation deletes exactly the file
//! set recorded on the job — never a wildcard — so data staged by another
//! job can never be collateral damage.

use std::path::{Path, PathBuf};

use snafu::prelude::*;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{StagingError, StagingIoSnafu};
use floe_core::types::SyncJob;

/// Buffer directory for a job.
pub fn job_dir(transfer_dir: &Path, work_id: Uuid) -> PathBuf {
    transfer_dir.join(work_id.to_string())
}

/// Total bytes currently staged under `root`.
///
/// Unreadable entries are skipped rather than failing the accounting.
pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Outcome of reclaiming a job's staged files.
#[derive(Debug, PartialEq, Eq)]
pub enum Reclaim {
    /// Every recorded file was deleted and the job directory removed.
    Complete { bytes: u64 },
    /// Nothing was left to delete; a previous run already reclaimed it.
    AlreadyGone,
    /// Some files were missing while others were present, or the job
    /// directory held unexpected extra data. Needs operator attention.
    Partial {
        missing: Vec<PathBuf>,
        removed: usize,
    },
}

/// Delete exactly the files recorded on `job` from the transfer buffer,
/// then the job's directory.
pub async fn reclaim_job_files(transfer_dir: &Path, job: &SyncJob) -> Result<Reclaim, StagingError> {
    let dir = job_dir(transfer_dir, job.work_id);

    match tokio::fs::metadata(&dir).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Reclaim::AlreadyGone);
        }
        Err(e) => return Err(e).context(StagingIoSnafu { path: dir }),
    }

    let mut missing = Vec::new();
    let mut removed = 0usize;
    let mut bytes = 0u64;

    for file in &job.files {
        let path = dir.join(&file.file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                bytes += file.size;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => missing.push(path),
            Err(e) => return Err(e).context(StagingIoSnafu { path }),
        }
    }

    if missing.is_empty() {
        // Only our files were recorded; the directory must now be empty.
        // Anything left behind is foreign data and surfaces as Partial.
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => Ok(Reclaim::Complete { bytes }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Reclaim::Complete { bytes }),
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(Reclaim::Partial {
                missing: Vec::new(),
                removed,
            }),
            Err(e) => Err(e).context(StagingIoSnafu { path: dir }),
        }
    } else if removed == 0 {
        // All files already gone: a crashed prior run got everything but
        // (possibly) the directory itself.
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => Ok(Reclaim::AlreadyGone),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Reclaim::AlreadyGone),
            Err(_) => Ok(Reclaim::Partial {
                missing,
                removed,
            }),
        }
    } else {
        Ok(Reclaim::Partial { missing, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use floe_core::types::{SyncFile, TransferState};
    use tempfile::TempDir;

    fn job_with_files(names: &[&str]) -> SyncJob {
        SyncJob {
            work_id: Uuid::new_v4(),
            date_created: Utc::now(),
            tape: "AG084600".to_string(),
            size: names.len() as u64 * 4,
            request_id: Uuid::new_v4(),
            files: names
                .iter()
                .map(|name| SyncFile {
                    file_name: name.to_string(),
                    hpss_path: format!("/archive/{name}"),
                    size: 4,
                    tape_num: 0,
                    tape_offset: 0,
                })
                .collect(),
            transfer: TransferState::Unsubmitted,
            timeout_strikes: 0,
        }
    }

    fn stage(dir: &Path, names: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        for name in names {
            std::fs::write(dir.join(name), b"data").unwrap();
        }
    }

    #[tokio::test]
    async fn reclaims_exact_file_set_and_directory() {
        let temp = TempDir::new().unwrap();
        let job = job_with_files(&["a.zip", "b.zip"]);
        let dir = job_dir(temp.path(), job.work_id);
        stage(&dir, &["a.zip", "b.zip"]);

        let result = reclaim_job_files(temp.path(), &job).await.unwrap();
        assert_eq!(result, Reclaim::Complete { bytes: 8 });
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_already_gone() {
        let temp = TempDir::new().unwrap();
        let job = job_with_files(&["a.zip"]);

        let result = reclaim_job_files(temp.path(), &job).await.unwrap();
        assert_eq!(result, Reclaim::AlreadyGone);
    }

    #[tokio::test]
    async fn partially_missing_files_are_reported() {
        let temp = TempDir::new().unwrap();
        let job = job_with_files(&["a.zip", "b.zip"]);
        let dir = job_dir(temp.path(), job.work_id);
        stage(&dir, &["a.zip"]);

        match reclaim_job_files(temp.path(), &job).await.unwrap() {
            Reclaim::Partial { missing, removed } => {
                assert_eq!(removed, 1);
                assert_eq!(missing.len(), 1);
                assert!(missing[0].ends_with("b.zip"));
            }
            other => panic!("expected partial reclaim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_data_in_job_dir_is_partial() {
        let temp = TempDir::new().unwrap();
        let job = job_with_files(&["a.zip"]);
        let dir = job_dir(temp.path(), job.work_id);
        stage(&dir, &["a.zip", "not-ours.dat"]);

        match reclaim_job_files(temp.path(), &job).await.unwrap() {
            Reclaim::Partial { removed, .. } => assert_eq!(removed, 1),
            other => panic!("expected partial reclaim, got {other:?}"),
        }
        assert!(dir.join("not-ours.dat").exists());
    }

    #[test]
    fn directory_size_sums_files() {
        let temp = TempDir::new().unwrap();
        stage(&temp.path().join("j1"), &["a", "b"]);
        stage(&temp.path().join("j2"), &["c"]);
        assert_eq!(directory_size(temp.path()), 12);
    }
}
