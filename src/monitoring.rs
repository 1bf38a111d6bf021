//! HTTP monitoring server for the control plane.
//!
//! Startup/health probes plus a read-only view of the compaction
//! controller, backed by its `State` query.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerHandle;

/// Shared state for the monitoring server.
pub struct MonitoringState {
    /// Whether the service finished starting up.
    pub ready: AtomicBool,
    pub controller: ControllerHandle,
}

impl MonitoringState {
    pub fn new(controller: ControllerHandle) -> Self {
        Self {
            ready: AtomicBool::new(false),
            controller,
        }
    }
}

/// Run the HTTP monitoring server until the cancellation token fires.
pub async fn run_monitoring_server(
    addr: &str,
    state: Arc<MonitoringState>,
    cancel_token: CancellationToken,
) {
    let app = Router::new()
        .route("/monitoring/startup", get(startup_handler))
        .route("/monitoring/health", get(health_handler))
        .route("/state/compaction", get(compaction_state_handler))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %addr, error = %err, "Failed to bind monitoring server");
            return;
        }
    };
    tracing::info!(addr = %addr, "Monitoring server listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel_token.cancelled_owned())
        .await
    {
        tracing::error!(error = %err, "Monitoring server error");
    }
}

async fn startup_handler(State(state): State<Arc<MonitoringState>>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn compaction_state_handler(State(state): State<Arc<MonitoringState>>) -> Response {
    match state.controller.state().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}
