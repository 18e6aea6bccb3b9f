//! End-to-end pipeline tests over a real queue tree with mocked external
//! services.
//!
//! The `hsi` and `globus` CLIs are replaced by in-memory trait
//! implementations; everything else — the queue store, locks, quarantine,
//! stage workers, drain harness — runs for real against a tempdir
//! workspace.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use floe::HsiError;
use floe::globus::{TransferItem, TransferService, TransferStatus};
use floe::hsi::{HpssFile, Retrieval, StageRequest, TapeArchive};
use floe::stages::{Finisher, GlobusXfer, Reaper, Retriever, StageRunner, StageWorker, Syncer};
use floe::staging;
use floe_core::polling::run_stage_loop;
use floe_core::quarantine::QuarantineManager;
use floe_core::store::{Queue, WorkStore};
use floe_core::types::{Stage, SyncJob, SyncRequest, TransferState};

// ============ Mock external services ============

struct MockArchive {
    files: Vec<HpssFile>,
    /// Archive paths retrieve() pretends it could not stage.
    unstageable: HashSet<String>,
}

impl MockArchive {
    fn new(files: Vec<HpssFile>) -> Self {
        Self {
            files,
            unstageable: HashSet::new(),
        }
    }
}

#[async_trait]
impl TapeArchive for MockArchive {
    async fn list_files(&self, _base_path: &str) -> Result<Vec<String>, HsiError> {
        Ok(self.files.iter().map(|f| f.hpss_path.clone()).collect())
    }

    async fn tape_metadata(&self, paths: &[String]) -> Result<Vec<HpssFile>, HsiError> {
        Ok(self
            .files
            .iter()
            .filter(|f| paths.contains(&f.hpss_path))
            .cloned()
            .collect())
    }

    async fn retrieve(&self, files: &[StageRequest]) -> Result<Retrieval, HsiError> {
        let mut missing = Vec::new();
        for request in files {
            if self.unstageable.contains(&request.hpss_path) {
                missing.push(request.destination.clone());
                continue;
            }
            tokio::fs::write(&request.destination, b"data").await.unwrap();
        }
        if missing.is_empty() {
            Ok(Retrieval::Complete)
        } else {
            Ok(Retrieval::Partial { missing })
        }
    }
}

#[derive(Default)]
struct MockTransfer {
    submissions: Mutex<Vec<usize>>,
    poll_results: Mutex<VecDeque<TransferStatus>>,
}

impl MockTransfer {
    fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    fn push_poll(&self, status: TransferStatus) {
        self.poll_results.lock().unwrap().push_back(status);
    }
}

#[async_trait]
impl TransferService for MockTransfer {
    async fn submit(
        &self,
        _label: &str,
        items: &[TransferItem],
    ) -> Result<Uuid, floe::GlobusError> {
        self.submissions.lock().unwrap().push(items.len());
        Ok(Uuid::new_v4())
    }

    async fn poll(&self, _task_id: Uuid) -> Result<TransferStatus, floe::GlobusError> {
        Ok(self
            .poll_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransferStatus::Succeeded))
    }
}

// ============ Harness ============

struct Pipeline {
    _workspace: TempDir,
    _buffer: TempDir,
    store: Arc<WorkStore>,
    buffer_dir: std::path::PathBuf,
    archive: Arc<MockArchive>,
    transfer: Arc<MockTransfer>,
}

const BASE: &str = "/archive/data";

fn hpss_file(name: &str, size: u64, tape: &str, num: u64, offset: u64) -> HpssFile {
    HpssFile {
        hpss_path: format!("{BASE}/{name}"),
        size,
        tape: tape.to_string(),
        tape_num: num,
        tape_offset: offset,
    }
}

impl Pipeline {
    async fn new(archive: MockArchive) -> Self {
        let workspace = TempDir::new().unwrap();
        let buffer = TempDir::new().unwrap();
        let store = Arc::new(WorkStore::open(workspace.path()).await.unwrap());
        let buffer_dir = buffer.path().to_path_buf();
        Self {
            _workspace: workspace,
            _buffer: buffer,
            store,
            buffer_dir,
            archive: Arc::new(archive),
            transfer: Arc::new(MockTransfer::default()),
        }
    }

    async fn submit_request(&self, pattern: &str) -> Uuid {
        let request = SyncRequest {
            request_id: Uuid::new_v4(),
            date_created: Utc::now(),
            source: BASE.to_string(),
            dest: "/warehouse".to_string(),
            pattern: pattern.to_string(),
        };
        self.store
            .enqueue(Queue::Inbox, request.request_id, &request)
            .await
            .unwrap();
        request.request_id
    }

    /// Run one drain cycle of a worker, run-once style.
    async fn cycle<W: StageWorker>(&self, worker: W) {
        let mut runner = StageRunner::new(worker, self.store.clone(), Duration::from_secs(86_400));
        run_stage_loop(
            &mut runner,
            Duration::from_secs(1),
            0,
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    fn syncer(&self) -> Syncer {
        Syncer::new(
            self.store.clone(),
            self.archive.clone(),
            BASE.to_string(),
            None,
        )
    }

    fn retriever(&self) -> Retriever {
        Retriever::new(
            self.store.clone(),
            self.archive.clone(),
            self.buffer_dir.clone(),
            u64::MAX,
            3,
        )
    }

    fn globus_xfer(&self) -> GlobusXfer {
        GlobusXfer::new(
            self.store.clone(),
            self.transfer.clone(),
            self.buffer_dir.clone(),
            BASE.to_string(),
            "/warehouse".to_string(),
            3,
        )
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(self.store.clone(), self.buffer_dir.clone())
    }

    fn finisher(&self) -> Finisher {
        Finisher::new(self.store.clone())
    }

    async fn jobs_in(&self, queue: Queue) -> Vec<SyncJob> {
        let mut jobs = Vec::new();
        for unit in self.store.list_ready(queue).await.unwrap() {
            jobs.push(self.store.read::<SyncJob>(&unit).await.unwrap());
        }
        jobs
    }

    fn push_in_progress(&self, count: usize) {
        for _ in 0..count {
            self.transfer.push_poll(TransferStatus::InProgress);
        }
    }
}

// ============ Tests ============

#[tokio::test]
async fn end_to_end_two_tapes() {
    let pipeline = Pipeline::new(MockArchive::new(vec![
        hpss_file("2011/b.zip", 10, "A", 2, 0),
        hpss_file("2011/a.zip", 10, "A", 1, 0),
        hpss_file("2012/c.zip", 10, "B", 7, 50),
    ]))
    .await;

    let request_id = pipeline.submit_request("/archive/data/**/*.zip").await;

    // Intake: one job per tape, files in tape order.
    pipeline.cycle(pipeline.syncer()).await;
    assert!(pipeline.store.exists(Queue::Requests, request_id).await.unwrap());

    let jobs = pipeline.jobs_in(Queue::Hpss).await;
    assert_eq!(jobs.len(), 2);
    let tape_a = jobs.iter().find(|j| j.tape == "A").unwrap();
    assert_eq!(tape_a.files.len(), 2);
    assert_eq!(tape_a.files[0].file_name, "a.zip");
    assert_eq!(tape_a.files[1].file_name, "b.zip");
    assert!(jobs.iter().all(|j| j.request_id == request_id));

    // Retrieval: both jobs staged into per-job buffer directories.
    pipeline.cycle(pipeline.retriever()).await;
    let jobs = pipeline.jobs_in(Queue::Globus).await;
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        let dir = staging::job_dir(&pipeline.buffer_dir, job.work_id);
        for file in &job.files {
            assert!(dir.join(&file.file_name).exists());
        }
    }

    // Transfer, cycle 1: submissions recorded, jobs deferred in place.
    pipeline.cycle(pipeline.globus_xfer()).await;
    assert_eq!(pipeline.transfer.submission_count(), 2);
    let jobs = pipeline.jobs_in(Queue::Globus).await;
    assert!(
        jobs.iter()
            .all(|j| matches!(j.transfer, TransferState::Submitted { .. }))
    );

    // Transfer, cycle 2: both polls succeed, jobs advance to the reaper.
    pipeline.cycle(pipeline.globus_xfer()).await;
    assert_eq!(pipeline.jobs_in(Queue::Reaper).await.len(), 2);

    // Reap: buffer reclaimed, jobs finished.
    pipeline.cycle(pipeline.reaper()).await;
    let finished_jobs = pipeline.jobs_in(Queue::Finished).await;
    assert_eq!(finished_jobs.len(), 2);
    for job in &finished_jobs {
        assert!(!staging::job_dir(&pipeline.buffer_dir, job.work_id).exists());
    }

    // Finish: no jobs remain anywhere for the request.
    pipeline.cycle(pipeline.finisher()).await;
    assert!(pipeline.store.exists(Queue::Finished, request_id).await.unwrap());
    assert!(!pipeline.store.exists(Queue::Requests, request_id).await.unwrap());
}

#[tokio::test]
async fn zero_file_request_finishes_immediately() {
    let pipeline = Pipeline::new(MockArchive::new(vec![hpss_file(
        "2011/a.zip",
        10,
        "A",
        1,
        0,
    )]))
    .await;

    let request_id = pipeline.submit_request("/elsewhere/**/*.zip").await;
    pipeline.cycle(pipeline.syncer()).await;

    assert!(pipeline.store.exists(Queue::Finished, request_id).await.unwrap());
    assert!(pipeline.jobs_in(Queue::Hpss).await.is_empty());
}

#[tokio::test]
async fn transfer_failure_quarantines_job_and_pins_request() {
    let pipeline = Pipeline::new(MockArchive::new(vec![hpss_file(
        "2011/a.zip",
        10,
        "A",
        1,
        0,
    )]))
    .await;

    let request_id = pipeline.submit_request("/archive/data/**/*.zip").await;
    pipeline.cycle(pipeline.syncer()).await;
    pipeline.cycle(pipeline.retriever()).await;
    pipeline.cycle(pipeline.globus_xfer()).await; // submit

    pipeline
        .transfer
        .push_poll(TransferStatus::Failed {
            reason: "disk full".to_string(),
        });
    pipeline.cycle(pipeline.globus_xfer()).await; // poll -> failed

    // The job is quarantined with the service's report...
    let quarantined = pipeline.jobs_in(Queue::Quarantine(Stage::GlobusXfer)).await;
    assert_eq!(quarantined.len(), 1);
    assert!(matches!(
        &quarantined[0].transfer,
        TransferState::Failed { reason, .. } if reason == "disk full"
    ));

    let quarantine = QuarantineManager::new(pipeline.store.clone());
    let record = quarantine
        .failure_record(Stage::GlobusXfer, quarantined[0].work_id)
        .await
        .unwrap()
        .expect("failure sidecar must exist");
    assert!(record.reason.contains("disk full"));

    // ...and the request stays tracked indefinitely.
    pipeline.cycle(pipeline.finisher()).await;
    assert!(pipeline.store.exists(Queue::Requests, request_id).await.unwrap());
    assert!(!pipeline.store.exists(Queue::Finished, request_id).await.unwrap());
}

#[tokio::test]
async fn submitted_job_is_never_resubmitted() {
    let pipeline = Pipeline::new(MockArchive::new(vec![hpss_file(
        "2011/a.zip",
        10,
        "A",
        1,
        0,
    )]))
    .await;

    pipeline.submit_request("/archive/data/**/*.zip").await;
    pipeline.cycle(pipeline.syncer()).await;
    pipeline.cycle(pipeline.retriever()).await;

    pipeline.cycle(pipeline.globus_xfer()).await; // submit
    assert_eq!(pipeline.transfer.submission_count(), 1);

    // Re-running while the transfer is in progress must only poll.
    pipeline.push_in_progress(2);
    pipeline.cycle(pipeline.globus_xfer()).await;
    pipeline.cycle(pipeline.globus_xfer()).await;
    assert_eq!(pipeline.transfer.submission_count(), 1);

    // Job is still waiting, untouched, in the transfer queue.
    let jobs = pipeline.jobs_in(Queue::Globus).await;
    assert_eq!(jobs.len(), 1);
    assert!(matches!(jobs[0].transfer, TransferState::Submitted { .. }));
}

#[tokio::test]
async fn partial_retrieval_quarantines_with_all_or_none_buffer() {
    let mut archive = MockArchive::new(vec![
        hpss_file("2011/a.zip", 10, "A", 1, 0),
        hpss_file("2011/b.zip", 10, "A", 2, 0),
        hpss_file("2011/c.zip", 10, "A", 3, 0),
    ]);
    archive
        .unstageable
        .insert(format!("{BASE}/2011/b.zip"));
    let pipeline = Pipeline::new(archive).await;

    pipeline.submit_request("/archive/data/**/*.zip").await;
    pipeline.cycle(pipeline.syncer()).await;
    pipeline.cycle(pipeline.retriever()).await;

    // The job quarantined instead of advancing with 2 of 3 files.
    assert!(pipeline.jobs_in(Queue::Globus).await.is_empty());
    let quarantined = pipeline.jobs_in(Queue::Quarantine(Stage::Retriever)).await;
    assert_eq!(quarantined.len(), 1);

    // All-or-none: no file of the job remains staged.
    let dir = staging::job_dir(&pipeline.buffer_dir, quarantined[0].work_id);
    if dir.exists() {
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
}

#[tokio::test]
async fn busy_stage_lock_means_no_mutation() {
    let pipeline = Pipeline::new(MockArchive::new(vec![hpss_file(
        "2011/a.zip",
        10,
        "A",
        1,
        0,
    )]))
    .await;
    let request_id = pipeline.submit_request("/archive/data/**/*.zip").await;

    // Another "process" already holds the syncer lock.
    let locks = floe_core::lock::StageLock::new(pipeline.store.semaphore_dir());
    let guard = match locks
        .try_acquire(Stage::Syncer, "other", Duration::from_secs(86_400))
        .await
        .unwrap()
    {
        floe_core::lock::Acquire::Held(guard) => guard,
        floe_core::lock::Acquire::Busy { .. } => panic!("test setup"),
    };

    pipeline.cycle(pipeline.syncer()).await;

    // Zero mutations: the request never left the inbox, no jobs appeared.
    assert!(pipeline.store.exists(Queue::Inbox, request_id).await.unwrap());
    assert!(pipeline.jobs_in(Queue::Hpss).await.is_empty());

    guard.release().await.unwrap();
}

#[tokio::test]
async fn corrupt_request_is_quarantined_not_fatal() {
    let pipeline = Pipeline::new(MockArchive::new(vec![hpss_file(
        "2011/a.zip",
        10,
        "A",
        1,
        0,
    )]))
    .await;

    // A healthy request and a corrupt one side by side.
    let healthy = pipeline.submit_request("/archive/data/**/*.zip").await;
    let corrupt_id = Uuid::new_v4();
    let corrupt = pipeline
        .store
        .enqueue(Queue::Inbox, corrupt_id, &serde_json::json!({}))
        .await
        .unwrap();
    std::fs::write(corrupt.path(), b"definitely not json").unwrap();

    pipeline.cycle(pipeline.syncer()).await;

    // The corrupt unit is isolated; its sibling still advanced.
    assert!(
        pipeline
            .store
            .exists(Queue::Quarantine(Stage::Syncer), corrupt_id)
            .await
            .unwrap()
    );
    assert!(pipeline.store.exists(Queue::Requests, healthy).await.unwrap());
}

#[tokio::test]
async fn syncer_rerun_after_crash_does_not_duplicate_jobs() {
    let pipeline = Pipeline::new(MockArchive::new(vec![
        hpss_file("2011/a.zip", 10, "A", 1, 0),
        hpss_file("2012/c.zip", 10, "B", 7, 0),
    ]))
    .await;

    let request_id = pipeline.submit_request("/archive/data/**/*.zip").await;
    pipeline.cycle(pipeline.syncer()).await;
    assert_eq!(pipeline.jobs_in(Queue::Hpss).await.len(), 2);

    // Simulate the crash window: jobs enqueued but the request's move to
    // tracking never happened. Put the request back in the inbox.
    let tracked = pipeline.store.list_ready(Queue::Requests).await.unwrap();
    pipeline
        .store
        .transfer(&tracked[0], Queue::Inbox)
        .await
        .unwrap();

    pipeline.cycle(pipeline.syncer()).await;

    // Deterministic job ids absorbed the rerun.
    assert_eq!(pipeline.jobs_in(Queue::Hpss).await.len(), 2);
    assert!(pipeline.store.exists(Queue::Requests, request_id).await.unwrap());
}
