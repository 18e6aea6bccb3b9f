//! Configuration for the floe pipeline.
//!
//! One YAML document per deployment, loaded once at startup and passed
//! explicitly to every stage worker. Environment variables only enter
//! through `${VAR}` interpolation in the document itself — no stage reads
//! the environment directly.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{
    ConfigError, EmptyEndpointSnafu, EmptyHpssBasePathSnafu, EmptyTransferDirSnafu,
    EmptyWorkspaceRootSnafu, EnvInterpolationSnafu, ReadFileSnafu, YamlParseSnafu,
};

/// Main configuration for the floe pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub hpss: HpssConfig,
    pub globus: GlobusConfig,
    #[serde(default)]
    pub syncer: SyncerConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Workspace layout: queue tree root and the shared transfer buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root of the durable queue directory tree.
    pub root: PathBuf,
    /// Shared staging buffer between tape retrieval and bulk transfer.
    pub transfer_dir: PathBuf,
}

/// Source tape archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HpssConfig {
    /// Archive namespace root all request patterns are resolved against.
    pub base_path: String,
}

/// Bulk-transfer service endpoints and options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobusConfig {
    pub source_endpoint: String,
    pub dest_endpoint: String,
    /// Destination root the archive-relative paths are grafted onto.
    pub dest_base_path: String,
    #[serde(default = "default_sync_level")]
    pub sync_level: String,
    #[serde(default = "default_verify_checksum")]
    pub verify_checksum: bool,
}

impl Default for GlobusConfig {
    fn default() -> Self {
        Self {
            source_endpoint: String::new(),
            dest_endpoint: String::new(),
            dest_base_path: String::new(),
            sync_level: default_sync_level(),
            verify_checksum: default_verify_checksum(),
        }
    }
}

fn default_sync_level() -> String {
    "mtime".to_string()
}

fn default_verify_checksum() -> bool {
    true
}

/// Request intake tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncerConfig {
    /// Optional split point for oversized tape groups, in bytes.
    /// Unset means one job per tape, however large.
    #[serde(default)]
    pub max_group_bytes: Option<u64>,
}

/// Tape retrieval tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Transfer-buffer quota in bytes; retrieval halts for the cycle when
    /// staging a job would exceed it.
    #[serde(default = "default_transfer_quota")]
    pub transfer_quota_bytes: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            transfer_quota_bytes: default_transfer_quota(),
        }
    }
}

fn default_transfer_quota() -> u64 {
    // 10 TiB
    10 * 1024 * 1024 * 1024 * 1024
}

/// Shared stage-worker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Seconds between drain cycles when looping.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Random jitter added to each cycle's wait, in seconds.
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_secs: u64,
    /// Age after which a stage lock is presumed abandoned.
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,
    /// Operation-level timeout for external commands.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Consecutive external timeouts before a job is quarantined.
    #[serde(default = "default_max_timeout_strikes")]
    pub max_timeout_strikes: u32,
    /// Run a single drain cycle and exit (for external schedulers).
    #[serde(default)]
    pub run_once: bool,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_jitter_secs: default_poll_jitter(),
            lock_stale_secs: default_lock_stale(),
            command_timeout_secs: default_command_timeout(),
            max_timeout_strikes: default_max_timeout_strikes(),
            run_once: false,
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}

fn default_poll_jitter() -> u64 {
    30
}

fn default_lock_stale() -> u64 {
    86_400
}

fn default_command_timeout() -> u64 {
    14_400
}

fn default_max_timeout_strikes() -> u32 {
    3
}

/// Prometheus endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load and validate configuration from a YAML file, interpolating
    /// `${VAR}` references from the environment.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate(contents);
        ensure!(
            interpolated.is_ok(),
            EnvInterpolationSnafu {
                message: interpolated.errors.join("\n"),
            }
        );

        let config: Config = serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            !self.workspace.root.as_os_str().is_empty(),
            EmptyWorkspaceRootSnafu
        );
        ensure!(
            !self.workspace.transfer_dir.as_os_str().is_empty(),
            EmptyTransferDirSnafu
        );
        ensure!(!self.hpss.base_path.is_empty(), EmptyHpssBasePathSnafu);
        ensure!(
            !self.globus.source_endpoint.is_empty(),
            EmptyEndpointSnafu { which: "source" }
        );
        ensure!(
            !self.globus.dest_endpoint.is_empty(),
            EmptyEndpointSnafu { which: "dest" }
        );
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.stages.poll_interval_secs)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_secs(self.stages.lock_stale_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.stages.command_timeout_secs)
    }
}
