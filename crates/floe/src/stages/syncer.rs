//! Request intake: expand a sync request into tape-grouped jobs.
//!
//! For each request in the inbox, resolve the dataset against the archive
//! namespace, query tape residency, partition the files into per-tape
//! groups (minimizing tape mounts), enqueue one job per group, and move
//! the request into tracking. Job ids are UUIDv5 of (request, tape,
//! chunk), so a rerun after a mid-intake crash regenerates identical ids
//! and skips the jobs it already enqueued instead of duplicating them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSetBuilder};
use snafu::prelude::*;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StageError, StoreSnafu};
use crate::hsi::{HpssFile, TapeArchive};
use crate::stages::runner::{Loaded, Outcome, StageWorker, load_unit};
use floe_core::store::{Queue, UnitRef, WorkStore};
use floe_core::types::{Stage, SyncFile, SyncJob, SyncRequest};

pub struct Syncer {
    store: Arc<WorkStore>,
    archive: Arc<dyn TapeArchive>,
    /// Archive namespace root all request patterns resolve against.
    base_path: String,
    /// Optional split point for oversized tape groups.
    max_group_bytes: Option<u64>,
}

impl Syncer {
    pub fn new(
        store: Arc<WorkStore>,
        archive: Arc<dyn TapeArchive>,
        base_path: String,
        max_group_bytes: Option<u64>,
    ) -> Self {
        Self {
            store,
            archive,
            base_path,
            max_group_bytes,
        }
    }
}

#[async_trait]
impl StageWorker for Syncer {
    fn stage(&self) -> Stage {
        Stage::Syncer
    }

    fn input_queue(&self) -> Queue {
        Queue::Inbox
    }

    async fn process_unit(&mut self, unit: &UnitRef) -> Result<Outcome, StageError> {
        let request: SyncRequest = match load_unit(&self.store, unit).await? {
            Loaded::Unit(request) => request,
            Loaded::Corrupt(reason) => {
                return Ok(Outcome::quarantine("decode sync request", reason));
            }
            Loaded::Vanished => return Ok(Outcome::Defer),
        };

        // Resolve the dataset against the archive namespace.
        let listing = match self.archive.list_files(&self.base_path).await {
            Ok(listing) => listing,
            Err(e) => return Ok(Outcome::quarantine("list archive namespace", e.to_string())),
        };

        let matched = match filter_by_pattern(listing, &request.pattern) {
            Ok(matched) => matched,
            Err(e) => {
                return Ok(Outcome::quarantine(
                    "compile request pattern",
                    e.to_string(),
                ));
            }
        };

        if matched.is_empty() {
            // A request selecting nothing is already satisfied.
            info!(
                request = %request.request_id,
                pattern = %request.pattern,
                "Request matched no files; completing immediately"
            );
            return Ok(Outcome::Advance(Queue::Finished));
        }

        let metadata = match self.archive.tape_metadata(&matched).await {
            Ok(metadata) => metadata,
            Err(e) => return Ok(Outcome::quarantine("query tape metadata", e.to_string())),
        };

        let groups = group_by_tape(metadata, self.max_group_bytes);
        info!(
            request = %request.request_id,
            files = matched.len(),
            groups = groups.len(),
            "Partitioned request by tape residency"
        );

        for (tape, chunk, group) in groups {
            let work_id = job_id(request.request_id, &tape, chunk);
            if self
                .store
                .exists(Queue::Hpss, work_id)
                .await
                .context(StoreSnafu)?
            {
                // Rerun after a crash mid-intake: this job already exists.
                debug!(job = %work_id, "Job already enqueued; skipping");
                continue;
            }

            let job = match build_job(&request, work_id, &tape, group) {
                Ok(job) => job,
                Err(reason) => return Ok(Outcome::quarantine("build sync job", reason)),
            };

            info!(
                job = %work_id,
                tape = %job.tape,
                files = job.files.len(),
                bytes = job.size,
                "Enqueuing sync job"
            );
            self.store
                .enqueue(Queue::Hpss, work_id, &job)
                .await
                .context(StoreSnafu)?;
        }

        Ok(Outcome::Advance(Queue::Requests))
    }
}

/// Filter archive paths by the request's glob pattern.
fn filter_by_pattern(paths: Vec<String>, pattern: &str) -> Result<Vec<String>, globset::Error> {
    let glob = Glob::new(pattern)?;
    let set = GlobSetBuilder::new().add(glob).build()?;
    Ok(paths.into_iter().filter(|path| set.is_match(path)).collect())
}

/// Sort by tape geometry and partition into per-tape groups, splitting a
/// group when it would exceed `max_group_bytes`.
///
/// Returns `(tape, chunk, files)` triples; `chunk` numbers the splits
/// within one tape so job ids stay deterministic across reruns.
fn group_by_tape(
    mut files: Vec<HpssFile>,
    max_group_bytes: Option<u64>,
) -> Vec<(String, u32, Vec<HpssFile>)> {
    files.sort_by(|a, b| {
        a.tape
            .cmp(&b.tape)
            .then_with(|| a.tape_num.cmp(&b.tape_num))
            .then_with(|| a.tape_offset.cmp(&b.tape_offset))
            .then_with(|| a.hpss_path.cmp(&b.hpss_path))
    });

    let mut groups: Vec<(String, u32, Vec<HpssFile>)> = Vec::new();
    let mut current: Vec<HpssFile> = Vec::new();
    let mut current_bytes = 0u64;
    let mut chunk = 0u32;

    for file in files {
        let same_tape = current
            .first()
            .is_none_or(|head| head.tape == file.tape);
        let over_budget = max_group_bytes
            .is_some_and(|max| !current.is_empty() && current_bytes + file.size > max);

        if !current.is_empty() && (!same_tape || over_budget) {
            let tape = current[0].tape.clone();
            groups.push((tape, chunk, std::mem::take(&mut current)));
            chunk = if same_tape { chunk + 1 } else { 0 };
            current_bytes = 0;
        }

        current_bytes += file.size;
        current.push(file);
    }

    if !current.is_empty() {
        let tape = current[0].tape.clone();
        groups.push((tape, chunk, current));
    }

    groups
}

/// Deterministic job id: identical across intake reruns of one request.
fn job_id(request_id: Uuid, tape: &str, chunk: u32) -> Uuid {
    Uuid::new_v5(&request_id, format!("{tape}/{chunk}").as_bytes())
}

fn build_job(
    request: &SyncRequest,
    work_id: Uuid,
    tape: &str,
    group: Vec<HpssFile>,
) -> Result<SyncJob, String> {
    let mut files = Vec::with_capacity(group.len());
    let mut size = 0u64;

    for hpss_file in group {
        let file_name = Path::new(&hpss_file.hpss_path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| format!("no file name in archive path: {}", hpss_file.hpss_path))?;
        size += hpss_file.size;
        files.push(SyncFile {
            file_name,
            hpss_path: hpss_file.hpss_path,
            size: hpss_file.size,
            tape_num: hpss_file.tape_num,
            tape_offset: hpss_file.tape_offset,
        });
    }

    Ok(SyncJob {
        work_id,
        date_created: Utc::now(),
        tape: tape.to_string(),
        size,
        request_id: request.request_id,
        files,
        transfer: Default::default(),
        timeout_strikes: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hpss_file(path: &str, size: u64, tape: &str, num: u64, offset: u64) -> HpssFile {
        HpssFile {
            hpss_path: path.to_string(),
            size,
            tape: tape.to_string(),
            tape_num: num,
            tape_offset: offset,
        }
    }

    #[test]
    fn groups_by_tape_in_geometry_order() {
        let files = vec![
            hpss_file("/a/late.zip", 1, "B", 5, 100),
            hpss_file("/a/first.zip", 1, "A", 1, 0),
            hpss_file("/a/second.zip", 1, "A", 1, 50),
        ];

        let groups = group_by_tape(files, None);
        assert_eq!(groups.len(), 2);

        let (tape, chunk, group) = &groups[0];
        assert_eq!(tape, "A");
        assert_eq!(*chunk, 0);
        assert_eq!(group[0].hpss_path, "/a/first.zip");
        assert_eq!(group[1].hpss_path, "/a/second.zip");

        assert_eq!(groups[1].0, "B");
    }

    #[test]
    fn splits_oversized_tape_groups() {
        let files = vec![
            hpss_file("/a/1.zip", 60, "A", 1, 0),
            hpss_file("/a/2.zip", 60, "A", 2, 0),
            hpss_file("/a/3.zip", 60, "A", 3, 0),
        ];

        let groups = group_by_tape(files, Some(100));
        assert_eq!(groups.len(), 3);
        // Chunks number the splits within the tape.
        assert_eq!(groups[0].1, 0);
        assert_eq!(groups[1].1, 1);
        assert_eq!(groups[2].1, 2);
    }

    #[test]
    fn chunk_counter_resets_across_tapes() {
        let files = vec![
            hpss_file("/a/1.zip", 60, "A", 1, 0),
            hpss_file("/a/2.zip", 60, "A", 2, 0),
            hpss_file("/b/1.zip", 10, "B", 1, 0),
        ];

        let groups = group_by_tape(files, Some(100));
        assert_eq!(groups.len(), 3);
        assert_eq!((groups[2].0.as_str(), groups[2].1), ("B", 0));
    }

    #[test]
    fn job_ids_are_deterministic() {
        let request = Uuid::new_v4();
        assert_eq!(job_id(request, "A", 0), job_id(request, "A", 0));
        assert_ne!(job_id(request, "A", 0), job_id(request, "A", 1));
        assert_ne!(job_id(request, "A", 0), job_id(request, "B", 0));
    }

    #[test]
    fn pattern_filter_selects_matching_paths() {
        let paths = vec![
            "/archive/2011/PFRaw/a.zip".to_string(),
            "/archive/2011/PFRaw".to_string(),
            "/archive/2012/other/b.dat".to_string(),
        ];
        let matched = filter_by_pattern(paths, "/archive/2011/**/*.zip").unwrap();
        assert_eq!(matched, vec!["/archive/2011/PFRaw/a.zip".to_string()]);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(filter_by_pattern(Vec::new(), "a{b").is_err());
    }
}
