use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::SyncOrchestrator;

pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, shutdown_token: CancellationToken) -> Self {
        Self {
            orchestrator,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
