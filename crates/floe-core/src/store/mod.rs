//! Filesystem-backed work-unit store.
//!
//! A work unit is one JSON file named `{uuid}.json`; the queue directory
//! that currently contains the file *is* the unit's pipeline state. All
//! transitions happen via `rename(2)`, which is atomic within a volume:
//! an observer sees the unit in exactly one queue at every instant, even
//! if the calling process dies immediately before or after the rename.
//!
//! # Atomic Writes
//!
//! New and rewritten units use the write-then-rename pattern:
//! 1. Write payload to `{uuid}.json.tmp`
//! 2. Rename to `{uuid}.json`
//!
//! Listings only consider `*.json` names whose stem parses as a UUID, so a
//! half-written `.tmp` file is never visible as a unit.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DecodeSnafu, EncodeSnafu, IoSnafu, NotFoundSnafu, StoreError};
use crate::types::Stage;

/// File extension for persisted work units.
const UNIT_EXT: &str = "json";

/// Directory holding exclusion-lock records.
const SEMAPHORE_DIR: &str = "semaphore";

/// Directory reserved for worker log output.
const LOG_DIR: &str = "log";

/// A named holding area for work units awaiting a specific stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Request intake.
    Inbox,
    /// Requests being tracked to completion.
    Requests,
    /// Jobs awaiting tape retrieval.
    Hpss,
    /// Jobs awaiting or undergoing bulk transfer.
    Globus,
    /// Jobs awaiting transfer-buffer reclamation.
    Reaper,
    /// Terminal requests and terminal jobs.
    Finished,
    /// Units a stage failed to advance, pending operator remediation.
    Quarantine(Stage),
}

impl Queue {
    /// The three queues that hold live (non-terminal) jobs.
    pub const ACTIVE_JOBS: [Queue; 3] = [Queue::Hpss, Queue::Globus, Queue::Reaper];

    /// Directory name relative to the workspace root.
    pub fn dir_name(&self) -> String {
        match self {
            Queue::Inbox => "inbox".to_string(),
            Queue::Requests => "request_queue".to_string(),
            Queue::Hpss => "hpss_queue".to_string(),
            Queue::Globus => "globus_queue".to_string(),
            Queue::Reaper => "reaper_queue".to_string(),
            Queue::Finished => "finished".to_string(),
            Queue::Quarantine(stage) => format!("quarantine/{stage}"),
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Handle to a work unit resident in a specific queue.
///
/// A `UnitRef` is a snapshot: the unit may have been moved by the time it
/// is dereferenced, in which case operations report [`StoreError::NotFound`].
#[derive(Debug, Clone)]
pub struct UnitRef {
    pub id: Uuid,
    pub queue: Queue,
    path: PathBuf,
}

impl UnitRef {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.id)
    }
}

/// Durable work-unit store rooted at a workspace directory.
#[derive(Debug, Clone)]
pub struct WorkStore {
    root: PathBuf,
}

impl WorkStore {
    /// Open a store, ensuring the full queue layout exists under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };

        let mut dirs: Vec<PathBuf> = vec![
            store.root.join(SEMAPHORE_DIR),
            store.root.join(LOG_DIR),
        ];
        dirs.extend(
            [
                Queue::Inbox,
                Queue::Requests,
                Queue::Hpss,
                Queue::Globus,
                Queue::Reaper,
                Queue::Finished,
            ]
            .iter()
            .map(|q| store.queue_dir(*q)),
        );
        dirs.extend(Stage::ALL.iter().map(|s| store.queue_dir(Queue::Quarantine(*s))));

        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .context(IoSnafu { path: dir.clone() })?;
        }

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding exclusion-lock records.
    pub fn semaphore_dir(&self) -> PathBuf {
        self.root.join(SEMAPHORE_DIR)
    }

    /// Absolute directory of a queue.
    pub fn queue_dir(&self, queue: Queue) -> PathBuf {
        self.root.join(queue.dir_name())
    }

    fn unit_path(&self, queue: Queue, id: Uuid) -> PathBuf {
        self.queue_dir(queue).join(format!("{id}.{UNIT_EXT}"))
    }

    /// Create a new durably-persisted unit in `queue`.
    pub async fn enqueue<T: Serialize>(
        &self,
        queue: Queue,
        id: Uuid,
        unit: &T,
    ) -> Result<UnitRef, StoreError> {
        let path = self.unit_path(queue, id);
        self.write_atomic(&path, unit).await?;
        debug!(unit = %id, queue = %queue, "Enqueued work unit");
        Ok(UnitRef { id, queue, path })
    }

    /// Check whether a unit with this id is present in `queue`.
    pub async fn exists(&self, queue: Queue, id: Uuid) -> Result<bool, StoreError> {
        let path = self.unit_path(queue, id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(IoSnafu { path }),
        }
    }

    /// Snapshot the units currently present in `queue`, name-sorted.
    ///
    /// Units enqueued by other processes after the call are not guaranteed
    /// visible. Non-unit names (tmp files, failure sidecars) are skipped.
    pub async fn list_ready(&self, queue: Queue) -> Result<Vec<UnitRef>, StoreError> {
        let dir = self.queue_dir(queue);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(IoSnafu { path: dir.clone() })?;

        let mut units = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { path: dir.clone() })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            units.push(UnitRef { id, queue, path });
        }

        units.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(units)
    }

    /// Read a unit's payload.
    pub async fn read<T: DeserializeOwned>(&self, unit: &UnitRef) -> Result<T, StoreError> {
        let bytes = match tokio::fs::read(unit.path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return NotFoundSnafu {
                    path: unit.path().to_path_buf(),
                }
                .fail();
            }
            Err(e) => {
                return Err(e).context(IoSnafu {
                    path: unit.path().to_path_buf(),
                });
            }
        };
        serde_json::from_slice(&bytes).context(DecodeSnafu {
            path: unit.path().to_path_buf(),
        })
    }

    /// Atomically rewrite a unit's payload in place.
    pub async fn update<T: Serialize>(&self, unit: &UnitRef, payload: &T) -> Result<(), StoreError> {
        self.write_atomic(unit.path(), payload).await
    }

    /// Atomically relocate a unit to another queue.
    ///
    /// After this call the unit is visible in exactly one of the two
    /// queues, regardless of where the calling process dies.
    pub async fn transfer(&self, unit: &UnitRef, to: Queue) -> Result<UnitRef, StoreError> {
        let dest = self.unit_path(to, unit.id);
        match tokio::fs::rename(unit.path(), &dest).await {
            Ok(()) => {
                debug!(unit = %unit.id, from = %unit.queue, to = %to, "Moved work unit");
                Ok(UnitRef {
                    id: unit.id,
                    queue: to,
                    path: dest,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NotFoundSnafu {
                path: unit.path().to_path_buf(),
            }
            .fail(),
            Err(e) => Err(e).context(IoSnafu {
                path: unit.path().to_path_buf(),
            }),
        }
    }

    /// Remove a unit permanently.
    pub async fn delete(&self, unit: &UnitRef) -> Result<(), StoreError> {
        match tokio::fs::remove_file(unit.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NotFoundSnafu {
                path: unit.path().to_path_buf(),
            }
            .fail(),
            Err(e) => Err(e).context(IoSnafu {
                path: unit.path().to_path_buf(),
            }),
        }
    }

    /// Write `payload` to `path` via tmp file + rename so a crash never
    /// exposes a partially-written unit.
    pub(crate) async fn write_atomic<T: Serialize>(
        &self,
        path: &Path,
        payload: &T,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(payload).context(EncodeSnafu {
            path: path.to_path_buf(),
        })?;

        let tmp = path.with_extension(format!("{UNIT_EXT}.tmp"));
        tokio::fs::write(&tmp, &json)
            .await
            .context(IoSnafu { path: tmp.clone() })?;
        tokio::fs::rename(&tmp, path)
            .await
            .context(IoSnafu {
                path: path.to_path_buf(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        value: u64,
    }

    async fn open_store(temp: &TempDir) -> WorkStore {
        WorkStore::open(temp.path()).await.unwrap()
    }

    fn payload() -> Payload {
        Payload {
            name: "unit".to_string(),
            value: 7,
        }
    }

    #[tokio::test]
    async fn open_creates_full_layout() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        for dir in [
            "inbox",
            "request_queue",
            "hpss_queue",
            "globus_queue",
            "reaper_queue",
            "finished",
            "quarantine/syncer",
            "quarantine/retriever",
            "quarantine/globus_xfer",
            "quarantine/reaper",
            "quarantine/finisher",
            "semaphore",
            "log",
        ] {
            assert!(store.root().join(dir).is_dir(), "missing {dir}");
        }
    }

    #[tokio::test]
    async fn enqueue_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let id = Uuid::new_v4();
        let unit = store.enqueue(Queue::Inbox, id, &payload()).await.unwrap();
        assert!(store.exists(Queue::Inbox, id).await.unwrap());

        let back: Payload = store.read(&unit).await.unwrap();
        assert_eq!(back, payload());
    }

    #[tokio::test]
    async fn transfer_moves_unit_to_exactly_one_queue() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let id = Uuid::new_v4();
        let unit = store.enqueue(Queue::Hpss, id, &payload()).await.unwrap();
        let moved = store.transfer(&unit, Queue::Globus).await.unwrap();

        assert!(!store.exists(Queue::Hpss, id).await.unwrap());
        assert!(store.exists(Queue::Globus, id).await.unwrap());
        assert_eq!(moved.queue, Queue::Globus);

        // Payload preserved bit-for-bit across the move.
        let back: Payload = store.read(&moved).await.unwrap();
        assert_eq!(back, payload());
    }

    #[tokio::test]
    async fn transfer_of_vanished_unit_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let unit = store
            .enqueue(Queue::Hpss, Uuid::new_v4(), &payload())
            .await
            .unwrap();
        store.delete(&unit).await.unwrap();

        let err = store.transfer(&unit, Queue::Globus).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_ignores_tmp_files_and_sidecars() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let id = Uuid::new_v4();
        store.enqueue(Queue::Inbox, id, &payload()).await.unwrap();

        // A half-written unit and a failure sidecar must stay invisible.
        let dir = store.queue_dir(Queue::Inbox);
        std::fs::write(dir.join(format!("{}.json.tmp", Uuid::new_v4())), b"{").unwrap();
        std::fs::write(dir.join(format!("{id}.failure.json")), b"{}").unwrap();
        std::fs::write(dir.join("README"), b"not a unit").unwrap();

        let units = store.list_ready(Queue::Inbox).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, id);
    }

    #[tokio::test]
    async fn update_rewrites_in_place() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let unit = store
            .enqueue(Queue::Globus, Uuid::new_v4(), &payload())
            .await
            .unwrap();

        let updated = Payload {
            name: "unit".to_string(),
            value: 8,
        };
        store.update(&unit, &updated).await.unwrap();

        let back: Payload = store.read(&unit).await.unwrap();
        assert_eq!(back.value, 8);
        assert_eq!(store.list_ready(Queue::Globus).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_of_corrupt_unit_is_decode_error() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let id = Uuid::new_v4();
        let unit = store.enqueue(Queue::Inbox, id, &payload()).await.unwrap();
        std::fs::write(unit.path(), b"not json").unwrap();

        let err = store.read::<Payload>(&unit).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}
