//! Generic stage polling harness.
//!
//! Every stage worker is a [`StageProcessor`]: `prepare()` acquires the
//! stage lock and snapshots the input queue (returning `None` when the
//! lock is busy or there is nothing to do), and `process()` drains the
//! snapshot. [`run_stage_loop`] drives a processor either once (the
//! run-once-and-exit contract for external schedulers) or on an interval
//! with jitter, racing every step against the shutdown token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};
use crate::types::Stage;

/// Result of a single drain iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Units were processed.
    ProcessedItems,
    /// No units were available to process.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// Trait for implementing a polling-based stage worker.
#[async_trait]
pub trait StageProcessor {
    /// State prepared for one iteration (typically the held lock plus a
    /// queue snapshot).
    type State: Send;
    /// Systemic error type; a returned error aborts the invocation
    /// without mutating further units.
    type Error: std::error::Error + Send;

    /// The stage this processor drives, for logging and metrics.
    fn stage(&self) -> Stage;

    /// Set up one iteration. `None` means there is no work to do this
    /// cycle (empty queue, or another worker holds the stage lock).
    async fn prepare(&mut self) -> Result<Option<Self::State>, Self::Error>;

    /// Drain the prepared state.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Random jitter up to `max_secs`, to spread concurrent pollers.
fn random_jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
}

/// Drive a [`StageProcessor`].
///
/// With `run_once` the loop performs exactly one iteration and returns —
/// per-unit outcomes live in queue state and quarantine, so the exit
/// status only reports "ran without internal fault". Otherwise it
/// iterates on `poll_interval` (plus jitter) until shutdown.
pub async fn run_stage_loop<P: StageProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    run_once: bool,
    shutdown: CancellationToken,
) -> Result<(), P::Error> {
    loop {
        let iteration_start = Instant::now();
        let stage = processor.stage();

        let state = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(stage = %stage, "Shutdown requested before iteration");
                return Ok(());
            }

            result = processor.prepare() => result?,
        };

        let result = match state {
            Some(state) => {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!(stage = %stage, "Shutdown requested during processing");
                        IterationResult::Shutdown
                    }

                    result = processor.process(state) => result?,
                }
            }
            None => {
                debug!(stage = %stage, "No units to process");
                IterationResult::NoItems
            }
        };

        match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems => {
                emit!(IterationCompleted {
                    stage: stage.as_str(),
                    result: IterationResultType::NoItems,
                });
            }
            IterationResult::ProcessedItems => {
                emit!(IterationCompleted {
                    stage: stage.as_str(),
                    result: IterationResultType::Processed,
                });
            }
        }
        emit!(IterationDuration {
            stage: stage.as_str(),
            duration: iteration_start.elapsed(),
        });

        if run_once {
            info!(stage = %stage, "Single invocation complete");
            break;
        }

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        debug!(
            stage = %stage,
            wait_secs = sleep_duration.as_secs(),
            "Waiting before next drain cycle"
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(stage = %stage, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Processor that counts iterations and reports work on each.
    struct Counting {
        prepares: u32,
        processes: u32,
    }

    #[async_trait]
    impl StageProcessor for Counting {
        type State = ();
        type Error = std::io::Error;

        fn stage(&self) -> Stage {
            Stage::Reaper
        }

        async fn prepare(&mut self) -> Result<Option<()>, Self::Error> {
            self.prepares += 1;
            Ok(Some(()))
        }

        async fn process(&mut self, _state: ()) -> Result<IterationResult, Self::Error> {
            self.processes += 1;
            Ok(IterationResult::ProcessedItems)
        }
    }

    #[tokio::test]
    async fn run_once_performs_exactly_one_iteration() {
        let mut processor = Counting {
            prepares: 0,
            processes: 0,
        };
        run_stage_loop(
            &mut processor,
            Duration::from_secs(3600),
            0,
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(processor.prepares, 1);
        assert_eq!(processor.processes, 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_work() {
        let mut processor = Counting {
            prepares: 0,
            processes: 0,
        };
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        run_stage_loop(&mut processor, Duration::from_secs(1), 0, false, shutdown)
            .await
            .unwrap();

        assert_eq!(processor.prepares, 0);
    }
}
