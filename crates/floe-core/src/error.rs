//! Error types for the floe core engine using snafu.
//!
//! One enum per concern; context selectors are public so callers build
//! errors with `.context(...)` at the failure site.

use std::path::PathBuf;

use snafu::prelude::*;
use uuid::Uuid;

use crate::types::Stage;

// ============ Work-unit store ============

/// Errors from the filesystem work-unit store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The unit vanished from its source queue before the operation ran.
    ///
    /// Inside a stage's exclusive window this should not happen; callers
    /// treat it defensively (skip the unit) rather than as fatal.
    #[snafu(display("work unit not found: {}", path.display()))]
    NotFound { path: PathBuf },

    /// Underlying storage failure; non-fatal, retried on the next invocation.
    #[snafu(display("storage failure at {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The unit's payload is not valid JSON for the expected type.
    #[snafu(display("malformed work unit {}: {source}", path.display()))]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("failed to encode work unit {}: {source}", path.display()))]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Check whether this error means the unit was not where we expected it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

// ============ Exclusion lock ============

/// Errors from the per-stage exclusion lock.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LockError {
    #[snafu(display("failed to create lock record {}: {source}", path.display()))]
    LockCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read lock record {}: {source}", path.display()))]
    LockRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to release lock record {}: {source}", path.display()))]
    LockRelease {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to reclaim stale lock record {}: {source}", path.display()))]
    LockReclaim {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Quarantine ============

/// Errors from the quarantine manager.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QuarantineError {
    /// Failure diagnostics could not be recorded alongside the unit.
    #[snafu(display("failed to record failure diagnostics for {unit}: {source}"))]
    RecordFailure { unit: Uuid, source: StoreError },

    /// The unit could not be moved into the quarantine area.
    #[snafu(display("failed to isolate {unit} in {stage} quarantine: {source}"))]
    Isolate {
        unit: Uuid,
        stage: Stage,
        source: StoreError,
    },

    /// The unit could not be re-injected out of quarantine.
    #[snafu(display("failed to release {unit} from {stage} quarantine: {source}"))]
    ReleaseUnit {
        unit: Uuid,
        stage: Stage,
        source: StoreError,
    },
}

// ============ Configuration ============

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("workspace root cannot be empty"))]
    EmptyWorkspaceRoot,

    #[snafu(display("transfer buffer directory cannot be empty"))]
    EmptyTransferDir,

    #[snafu(display("hpss base path cannot be empty"))]
    EmptyHpssBasePath,

    #[snafu(display("globus {which} endpoint cannot be empty"))]
    EmptyEndpoint { which: String },

    #[snafu(display("environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    #[snafu(display("failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    #[snafu(display("failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    #[snafu(display("failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    #[snafu(display("metrics already initialized"))]
    MetricsAlreadyInitialized,
}
