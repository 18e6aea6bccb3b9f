//! Error types for the floe stage workers using snafu.

use std::path::PathBuf;
use std::time::Duration;

use snafu::prelude::*;
use uuid::Uuid;

use floe_core::error::{LockError, QuarantineError, StoreError};

// ============ Tape archive (hsi) ============

/// Errors from the `hsi` tape-archive wrapper.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HsiError {
    #[snafu(display("failed to run hsi: {source}"))]
    HsiSpawn { source: std::io::Error },

    /// The operation exceeded its wall-clock budget; retried with strike
    /// escalation rather than quarantined outright.
    #[snafu(display("hsi timed out after {timeout:?}"))]
    HsiTimeout { timeout: Duration },

    #[snafu(display("hsi produced non-utf8 output"))]
    HsiOutput { source: std::string::FromUtf8Error },

    #[snafu(display("malformed hsi metadata record: {line}"))]
    HsiMetadata { line: String },

    #[snafu(display("failed to write hsi batch file {}: {source}", path.display()))]
    HsiBatchFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl HsiError {
    /// Timeouts are transient; everything else is a per-unit failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HsiError::HsiTimeout { .. })
    }
}

// ============ Transfer service (globus) ============

/// Errors from the `globus` CLI wrapper.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GlobusError {
    #[snafu(display("failed to run globus: {source}"))]
    GlobusSpawn { source: std::io::Error },

    #[snafu(display("globus timed out after {timeout:?}"))]
    GlobusTimeout { timeout: Duration },

    #[snafu(display("globus produced non-utf8 output"))]
    GlobusOutput { source: std::string::FromUtf8Error },

    #[snafu(display("globus returned malformed JSON: {source}"))]
    GlobusDecode { source: serde_json::Error },

    #[snafu(display("globus rejected the transfer ({code}): {message}"))]
    GlobusRejected { code: String, message: String },

    /// The CLI answered for a different task than the one we asked about.
    #[snafu(display("globus answered for task {answered} instead of {asked}"))]
    GlobusTaskMismatch { asked: Uuid, answered: Uuid },
}

impl GlobusError {
    /// Transient errors stay queued with strike escalation; permanent
    /// rejections quarantine immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GlobusError::GlobusSpawn { .. }
                | GlobusError::GlobusTimeout { .. }
                | GlobusError::GlobusOutput { .. }
        )
    }
}

// ============ Transfer buffer ============

/// Errors from transfer-buffer bookkeeping.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StagingError {
    #[snafu(display("transfer buffer operation failed at {}: {source}", path.display()))]
    StagingIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Stage workers ============

/// Systemic faults that abort a whole stage invocation.
///
/// Per-unit failures never surface here — they become quarantine moves
/// and the drain continues with the next unit.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StageError {
    #[snafu(display("work-unit store failure: {source}"))]
    Store { source: StoreError },

    #[snafu(display("stage lock failure: {source}"))]
    Lock { source: LockError },

    #[snafu(display("quarantine failure: {source}"))]
    Quarantine { source: QuarantineError },
}

// ============ Application ============

/// Top-level faults from the `floe` binary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("failed to load configuration: {source}"))]
    LoadConfig {
        source: floe_core::error::ConfigError,
    },

    #[snafu(display("invalid metrics address: {source}"))]
    MetricsAddr { source: std::net::AddrParseError },

    #[snafu(display("failed to initialize metrics: {source}"))]
    InitMetrics {
        source: floe_core::error::MetricsError,
    },

    #[snafu(display("failed to open work-unit store: {source}"))]
    OpenStore { source: StoreError },

    #[snafu(display("stage worker fault: {source}"))]
    StageFault { source: StageError },
}
