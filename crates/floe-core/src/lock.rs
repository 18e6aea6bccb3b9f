//! Per-stage exclusion locks.
//!
//! One lock record per stage lives under `semaphore/`. The record is
//! created with `create_new`, so file existence doubles as acquisition:
//! there is at most one holder per stage at any instant. The record body
//! carries liveness metadata (holder identity, pid, hostname, acquisition
//! time) so a record left behind by a dead process is distinguishable from
//! a live one and can be reclaimed after a configurable age.
//!
//! Failing to acquire is not an error: the worker logs that another
//! instance is running and exits without doing any work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{LockCreateSnafu, LockError, LockReadSnafu, LockReclaimSnafu, LockReleaseSnafu};
use crate::types::Stage;

/// Liveness metadata stored inside a lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub stage: Stage,
    /// Human-readable holder identity (operator or service account).
    pub holder: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(stage: Stage, holder: &str) -> Self {
        Self {
            stage,
            holder: holder.to_string(),
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the record is old enough to be presumed abandoned.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::MAX);
        Utc::now().signed_duration_since(self.acquired_at) > max_age
    }
}

/// Result of a lock attempt.
#[derive(Debug)]
pub enum Acquire {
    /// The lock is held; drop or release the guard to free it.
    Held(LockGuard),
    /// Another live worker holds the stage lock.
    Busy { holder: LockRecord },
}

/// Held stage lock; removes its record on release.
///
/// `release()` reports removal errors; `Drop` is the best-effort backstop
/// for abnormal exit paths, with staleness detection covering hard crashes.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    stage: Stage,
    armed: bool,
}

impl LockGuard {
    /// Release the lock, propagating any failure to remove the record.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(stage = %self.stage, "Released stage lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(LockReleaseSnafu {
                path: self.path.clone(),
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(stage = %self.stage, error = %e, "Failed to release stage lock on drop");
        }
    }
}

/// Factory for per-stage locks rooted at the semaphore directory.
#[derive(Debug, Clone)]
pub struct StageLock {
    dir: PathBuf,
}

impl StageLock {
    pub fn new(semaphore_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: semaphore_dir.into(),
        }
    }

    fn lock_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("{stage}.lock"))
    }

    /// Try to acquire the lock for `stage`.
    ///
    /// A record older than `stale_after` is presumed abandoned (holder
    /// crashed without running its `Drop`) and reclaimed with a warning.
    /// An unreadable record is treated the same way: its liveness cannot
    /// be trusted.
    pub async fn try_acquire(
        &self,
        stage: Stage,
        holder: &str,
        stale_after: Duration,
    ) -> Result<Acquire, LockError> {
        let path = self.lock_path(stage);

        match self.create(&path, stage, holder).await? {
            Some(guard) => return Ok(Acquire::Held(guard)),
            None => {}
        }

        match self.read_record(&path).await? {
            Some(record) if !record.is_stale(stale_after) => {
                return Ok(Acquire::Busy { holder: record });
            }
            Some(record) => {
                warn!(
                    stage = %stage,
                    holder = %record.holder,
                    pid = record.pid,
                    acquired_at = %record.acquired_at,
                    "Reclaiming stale stage lock"
                );
            }
            None => {
                warn!(stage = %stage, "Reclaiming unreadable stage lock record");
            }
        }

        // Remove-and-retry: if two workers race the reclamation, both
        // removals succeed but only one create_new can win.
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(LockReclaimSnafu { path }),
        }

        match self.create(&path, stage, holder).await? {
            Some(guard) => Ok(Acquire::Held(guard)),
            None => match self.read_record(&path).await? {
                Some(record) => Ok(Acquire::Busy { holder: record }),
                // The racing winner's record is not readable yet; report
                // busy with a placeholder rather than fighting over it.
                None => Ok(Acquire::Busy {
                    holder: LockRecord::new(stage, "unknown"),
                }),
            },
        }
    }

    /// Attempt the atomic create; `None` means the record already exists.
    async fn create(
        &self,
        path: &Path,
        stage: Stage,
        holder: &str,
    ) -> Result<Option<LockGuard>, LockError> {
        let record = LockRecord::new(stage, holder);
        let json = serde_json::to_vec_pretty(&record)
            .expect("lock record should always serialize");

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(e).context(LockCreateSnafu {
                    path: path.to_path_buf(),
                });
            }
        };

        let written = async {
            file.write_all(&json).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            // Do not leave an empty record deadlocking the stage until
            // staleness kicks in.
            let _ = tokio::fs::remove_file(path).await;
            return Err(e).context(LockCreateSnafu {
                path: path.to_path_buf(),
            });
        }

        debug!(stage = %stage, holder = %holder, "Acquired stage lock");
        Ok(Some(LockGuard {
            path: path.to_path_buf(),
            stage,
            armed: true,
        }))
    }

    /// Read a lock record; `None` when missing or unreadable.
    async fn read_record(&self, path: &Path) -> Result<Option<LockRecord>, LockError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(LockReadSnafu {
                    path: path.to_path_buf(),
                });
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed lock record");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn acquire_then_busy_then_release() {
        let temp = TempDir::new().unwrap();
        let locks = StageLock::new(temp.path());

        let guard = match locks
            .try_acquire(Stage::Syncer, "alice", DAY)
            .await
            .unwrap()
        {
            Acquire::Held(guard) => guard,
            Acquire::Busy { .. } => panic!("first acquire must succeed"),
        };

        // Second acquire observes Busy with the first holder's identity.
        match locks.try_acquire(Stage::Syncer, "bob", DAY).await.unwrap() {
            Acquire::Busy { holder } => assert_eq!(holder.holder, "alice"),
            Acquire::Held(_) => panic!("second acquire must be busy"),
        }

        guard.release().await.unwrap();

        // Released lock can be re-acquired.
        match locks.try_acquire(Stage::Syncer, "bob", DAY).await.unwrap() {
            Acquire::Held(_) => {}
            Acquire::Busy { .. } => panic!("lock should be free after release"),
        }
    }

    #[tokio::test]
    async fn locks_are_per_stage() {
        let temp = TempDir::new().unwrap();
        let locks = StageLock::new(temp.path());

        let _syncer = locks.try_acquire(Stage::Syncer, "a", DAY).await.unwrap();
        match locks.try_acquire(Stage::Reaper, "b", DAY).await.unwrap() {
            Acquire::Held(_) => {}
            Acquire::Busy { .. } => panic!("different stages must not contend"),
        }
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let locks = StageLock::new(temp.path());

        // Write an old record directly, as a crashed holder would leave it.
        let record = LockRecord {
            stage: Stage::Retriever,
            holder: "dead".to_string(),
            pid: 1,
            hostname: String::new(),
            acquired_at: Utc::now() - chrono::Duration::hours(48),
        };
        std::fs::write(
            temp.path().join("retriever.lock"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        match locks
            .try_acquire(Stage::Retriever, "live", DAY)
            .await
            .unwrap()
        {
            Acquire::Held(_) => {}
            Acquire::Busy { .. } => panic!("stale lock must be reclaimed"),
        }
    }

    #[tokio::test]
    async fn drop_releases_as_backstop() {
        let temp = TempDir::new().unwrap();
        let locks = StageLock::new(temp.path());

        {
            let _guard = locks.try_acquire(Stage::Finisher, "a", DAY).await.unwrap();
        }
        assert!(!temp.path().join("finisher.lock").exists());
    }
}
