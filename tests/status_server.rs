mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::StaticFetcher;
use rider_sync_lib::config::categories::{EVENT_RESULTS, RIDER_INDIVIDUAL};
use rider_sync_lib::config::{CategoryTable, TierIntervals};
use rider_sync_lib::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use rider_sync_lib::queue::worker::SyncWorkerConfig;
use rider_sync_lib::queue::Priority;
use rider_sync_lib::remote::RetryPolicy;
use rider_sync_lib::scanner::ScannerConfig;
use rider_sync_lib::server::{register_metrics, router};
use rider_sync_lib::state::AppState;
use rider_sync_lib::store::SqliteSyncStore;
use tokio_util::sync::CancellationToken;

async fn serve() -> (SocketAddr, Arc<AppState>) {
    let store = Arc::new(SqliteSyncStore::open_in_memory().expect("in-memory sqlite"));
    let shutdown = CancellationToken::new();
    let orchestrator = SyncOrchestrator::new(
        &CategoryTable::builtin(),
        Arc::new(StaticFetcher::default()),
        store.clone(),
        store,
        OrchestratorConfig {
            worker: SyncWorkerConfig {
                worker_count: 1,
                category: RIDER_INDIVIDUAL.to_string(),
                retry_policy: RetryPolicy::no_retry(),
            },
            scanner: ScannerConfig::new(EVENT_RESULTS),
            tier_intervals: TierIntervals::default(),
        },
        &shutdown,
    )
    .expect("builtin categories cover workers and scans");
    let state = Arc::new(AppState::new(Arc::new(orchestrator), shutdown.clone()));
    register_metrics(&state).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .expect("server runs");
    });
    (addr, state)
}

#[tokio::test]
async fn health_status_and_metrics_endpoints_respond() {
    let (addr, state) = serve().await;
    state.orchestrator.enqueue(77, Priority::P1, "operator");
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health request");
    assert!(health.status().is_success());
    assert_eq!(health.text().await.expect("body"), "Healthy");

    let status: serde_json::Value = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status is JSON");
    assert_eq!(status["queue"]["pending"], 1);
    assert_eq!(status["queue"]["active"][0]["entity_id"], 77);
    assert_eq!(status["governor"].as_array().map(Vec::len), Some(7));
    assert_eq!(status["scheduler"]["running"], false);

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("rider_sync_build_info"), "{metrics}");
    assert!(metrics.contains("sync_queue_enqueued_total"), "{metrics}");

    state.shutdown_token.cancel();
}

#[tokio::test]
async fn queue_can_be_paused_and_resumed_over_http() {
    let (addr, state) = serve().await;
    let client = reqwest::Client::new();

    let paused: serde_json::Value = client
        .post(format!("http://{addr}/queue/pause"))
        .send()
        .await
        .expect("pause request")
        .json()
        .await
        .expect("pause reply is JSON");
    assert_eq!(paused["paused"], true);
    assert_eq!(paused["changed"], true);
    assert!(state.orchestrator.queue().is_paused());

    let status: serde_json::Value = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status is JSON");
    assert_eq!(status["queue"]["paused"], true);

    let resumed: serde_json::Value = client
        .post(format!("http://{addr}/queue/resume"))
        .send()
        .await
        .expect("resume request")
        .json()
        .await
        .expect("resume reply is JSON");
    assert_eq!(resumed["paused"], false);
    assert_eq!(resumed["changed"], true);
    assert!(!state.orchestrator.queue().is_paused());

    state.shutdown_token.cancel();
}
