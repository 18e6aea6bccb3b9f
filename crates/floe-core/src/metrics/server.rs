//! Prometheus metrics endpoint with singleton-based initialization.
//!
//! `OnceLock` ensures the recorder installs exactly once per process even
//! when the `all` command runs every stage loop together. The HTTP
//! endpoint serves `/metrics` (Prometheus text format) and `/health`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsAlreadyInitializedSnafu, MetricsError, PrometheusInitSnafu};

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

struct MetricsController {
    handle: PrometheusHandle,
}

/// Initialize the metrics recorder and start the HTTP endpoint.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or fails to
/// initialize.
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| MetricsAlreadyInitializedSnafu.build())?;

    // Serve the endpoint in the background for the life of the process.
    tokio::spawn(run_server(addr));

    info!(%addr, "Metrics endpoint started");
    Ok(())
}

/// Initialize the metrics recorder for tests, without an HTTP endpoint.
///
/// Safe to call from multiple test threads; later calls are no-ops.
pub fn init_test() {
    if CONTROLLER.get().is_some() {
        return;
    }
    if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
        let _ = CONTROLLER.set(MetricsController { handle });
    }
}

async fn run_server(addr: SocketAddr) {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics endpoint");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics endpoint terminated");
    }
}

async fn render_metrics() -> String {
    CONTROLLER
        .get()
        .map(|controller| controller.handle.render())
        .unwrap_or_default()
}

async fn health() -> &'static str {
    "OK"
}
