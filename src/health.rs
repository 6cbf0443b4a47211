//! HTTP health endpoint.
//!
//! `GET /health` answers `{"status": "ok" | "unhealthy", "runner": {...}}`
//! with HTTP 503 once the control-plane link has exhausted its connect
//! attempts.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::runner_info::RunnerInfo;
use crate::runner::Runner;
use crate::{AppError, Result};

/// Body of a health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok` or `unhealthy`.
    pub status: &'static str,
    /// Runner snapshot.
    pub runner: RunnerInfo,
}

/// Build the health report for `runner`.
#[must_use]
pub fn report(runner: &Runner) -> (StatusCode, HealthReport) {
    let healthy = runner.is_healthy();
    let body = HealthReport {
        status: if healthy { "ok" } else { "unhealthy" },
        runner: runner.runner_info(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, body)
}

async fn health(State(runner): State<Arc<Runner>>) -> (StatusCode, Json<HealthReport>) {
    let (code, body) = report(&runner);
    (code, Json(body))
}

/// Router exposing `/health`.
pub fn router(runner: Arc<Runner>) -> Router {
    Router::new().route("/health", get(health)).with_state(runner)
}

/// Serve the health endpoint on `127.0.0.1:port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound, or
/// `AppError::Io` if the server fails.
pub async fn serve(runner: Arc<Runner>, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind health port {port}: {err}")))?;
    info!(%bind, "health endpoint listening");

    axum::serve(listener, router(runner))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("health server failed: {err}")))
}
