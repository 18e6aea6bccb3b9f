//! CLI wiring: configuration loading, dependency construction, and stage
//! dispatch.
//!
//! Exit status reports only "ran without internal fault"; per-unit
//! outcomes live in queue state and quarantine. A worker that finds its
//! stage lock busy exits cleanly — that is a scheduling fact, not a
//! fault.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{
    AppError, InitMetricsSnafu, LoadConfigSnafu, MetricsAddrSnafu, OpenStoreSnafu, StageFaultSnafu,
};
use crate::globus::{GlobusCli, TransferService};
use crate::hsi::{HsiClient, TapeArchive};
use crate::stages::{Finisher, GlobusXfer, Reaper, Retriever, StageRunner, Syncer};
use floe_core::polling::run_stage_loop;
use floe_core::store::WorkStore;
use floe_core::types::Stage;
use floe_core::{Config, shutdown_signal};

/// Tape-to-tape archival sync pipeline.
#[derive(Debug, Parser)]
#[command(name = "floe", version)]
pub struct CliArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Run a single drain cycle and exit (for external schedulers).
    #[arg(long)]
    pub once: bool,

    #[command(subcommand)]
    pub stage: StageCommand,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum StageCommand {
    /// Expand inbox requests into tape-grouped sync jobs.
    Syncer,
    /// Stage queued jobs from tape into the transfer buffer.
    Retriever,
    /// Submit and poll bulk transfers for staged jobs.
    GlobusXfer,
    /// Reclaim transfer-buffer space for shipped jobs.
    Reaper,
    /// Close out requests whose jobs have all completed.
    Finisher,
    /// Run every stage loop concurrently in one process.
    All,
}

impl StageCommand {
    fn stage(self) -> Option<Stage> {
        match self {
            StageCommand::Syncer => Some(Stage::Syncer),
            StageCommand::Retriever => Some(Stage::Retriever),
            StageCommand::GlobusXfer => Some(Stage::GlobusXfer),
            StageCommand::Reaper => Some(Stage::Reaper),
            StageCommand::Finisher => Some(Stage::Finisher),
            StageCommand::All => None,
        }
    }
}

/// Run the selected stage (or all of them) to completion.
pub async fn run(args: CliArgs) -> Result<(), AppError> {
    let config = Arc::new(Config::from_path(&args.config).context(LoadConfigSnafu)?);

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(MetricsAddrSnafu)?;
        floe_core::metrics::init_global(addr).context(InitMetricsSnafu)?;
    }

    let store = Arc::new(
        WorkStore::open(&config.workspace.root)
            .await
            .context(OpenStoreSnafu)?,
    );
    info!(
        root = %config.workspace.root.display(),
        "Work-unit store opened"
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let run_once = args.once || config.stages.run_once;

    match args.stage.stage() {
        Some(stage) => run_stage(stage, config, store, run_once, shutdown)
            .await
            .context(StageFaultSnafu),
        None => run_all(config, store, run_once, shutdown).await,
    }
}

/// Run every stage loop concurrently with shared shutdown handling.
async fn run_all(
    config: Arc<Config>,
    store: Arc<WorkStore>,
    run_once: bool,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let mut handles: JoinSet<(Stage, Result<(), crate::error::StageError>)> = JoinSet::new();

    for stage in Stage::ALL {
        let config = config.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        handles.spawn(async move {
            let result = run_stage(stage, config, store, run_once, shutdown).await;
            (stage, result)
        });
    }

    info!("Spawned {} stage workers", handles.len());

    let mut first_fault = None;
    while let Some(result) = handles.join_next().await {
        match result {
            Ok((stage, Ok(()))) => info!(stage = %stage, "Stage worker completed"),
            Ok((stage, Err(e))) => {
                error!(stage = %stage, error = %e, "Stage worker faulted");
                first_fault.get_or_insert(e);
            }
            Err(e) => error!(error = %e, "Stage worker panicked"),
        }
    }

    match first_fault {
        Some(fault) => Err(fault).context(StageFaultSnafu),
        None => Ok(()),
    }
}

async fn run_stage(
    stage: Stage,
    config: Arc<Config>,
    store: Arc<WorkStore>,
    run_once: bool,
    shutdown: CancellationToken,
) -> Result<(), crate::error::StageError> {
    let interval = config.poll_interval();
    let jitter = config.stages.poll_jitter_secs;
    let stale_after = config.lock_stale();
    let strikes = config.stages.max_timeout_strikes;

    info!(
        stage = %stage,
        run_once,
        poll_interval_secs = interval.as_secs(),
        "Starting stage worker"
    );

    match stage {
        Stage::Syncer => {
            let archive = tape_archive(&store, &config);
            let worker = Syncer::new(
                store.clone(),
                archive,
                config.hpss.base_path.clone(),
                config.syncer.max_group_bytes,
            );
            let mut runner = StageRunner::new(worker, store, stale_after);
            run_stage_loop(&mut runner, interval, jitter, run_once, shutdown).await
        }
        Stage::Retriever => {
            let archive = tape_archive(&store, &config);
            let worker = Retriever::new(
                store.clone(),
                archive,
                config.workspace.transfer_dir.clone(),
                config.retriever.transfer_quota_bytes,
                strikes,
            );
            let mut runner = StageRunner::new(worker, store, stale_after);
            run_stage_loop(&mut runner, interval, jitter, run_once, shutdown).await
        }
        Stage::GlobusXfer => {
            let transfer: Arc<dyn TransferService> =
                Arc::new(GlobusCli::new(&config.globus, config.command_timeout()));
            let worker = GlobusXfer::new(
                store.clone(),
                transfer,
                config.workspace.transfer_dir.clone(),
                config.hpss.base_path.clone(),
                config.globus.dest_base_path.clone(),
                strikes,
            );
            let mut runner = StageRunner::new(worker, store, stale_after);
            run_stage_loop(&mut runner, interval, jitter, run_once, shutdown).await
        }
        Stage::Reaper => {
            let worker = Reaper::new(store.clone(), config.workspace.transfer_dir.clone());
            let mut runner = StageRunner::new(worker, store, stale_after);
            run_stage_loop(&mut runner, interval, jitter, run_once, shutdown).await
        }
        Stage::Finisher => {
            let worker = Finisher::new(store.clone());
            let mut runner = StageRunner::new(worker, store, stale_after);
            run_stage_loop(&mut runner, interval, jitter, run_once, shutdown).await
        }
    }
}

fn tape_archive(store: &Arc<WorkStore>, config: &Config) -> Arc<dyn TapeArchive> {
    Arc::new(HsiClient::new(
        store.semaphore_dir(),
        config.command_timeout(),
    ))
}
