pub mod monitoring;
use crate::orchestrator::OrchestratorStatus;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use monitoring::{GOVERNOR_METRICS, QUEUE_METRICS, SCAN_METRICS, SCHEDULER_METRICS};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|err| {
        error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

/// Governor budgets, queue depth, scheduler tiers and active scans in one document.
async fn status_handler(state: State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status().await)
}

/// Stops queue workers from claiming new jobs; reports whether the state changed.
async fn pause_queue_handler(state: State<Arc<AppState>>) -> Json<serde_json::Value> {
    let changed = state.orchestrator.pause_queue();
    Json(serde_json::json!({ "paused": true, "changed": changed }))
}

async fn resume_queue_handler(state: State<Arc<AppState>>) -> Json<serde_json::Value> {
    let changed = state.orchestrator.resume_queue();
    Json(serde_json::json!({ "paused": false, "changed": changed }))
}

/// Registers every metric family the sync components publish into the shared registry.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;

    GOVERNOR_METRICS
        .get_or_init(|| async { monitoring::GovernorMetrics::register(&mut registry, "governor") })
        .await;

    QUEUE_METRICS
        .get_or_init(|| async { monitoring::QueueMetrics::register(&mut registry, "sync_queue") })
        .await;

    SCAN_METRICS
        .get_or_init(|| async { monitoring::ScanMetrics::register(&mut registry, "scan") })
        .await;

    SCHEDULER_METRICS
        .get_or_init(|| async { monitoring::SchedulerMetrics::register(&mut registry, "scheduler") })
        .await;

    monitoring::register_build_info_metric(&mut registry, "rider_sync");
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route("/status", get(status_handler))
        .route("/queue/pause", post(pause_queue_handler))
        .route("/queue/resume", post(resume_queue_handler))
        .with_state(state)
}

/// Starts the health/metrics/status HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(event = "status_server_listening", addr = %local_addr, "status server listening");

    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "status_server_failed", error = %err, "status server exited with error");
        }
    });

    Ok(server_handle)
}
