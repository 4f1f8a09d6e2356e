//! Explicitly constructed owner of the rate governor, job queue, scheduler and scanner.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CategoryTable, TierIntervals};
use crate::queue::worker::{SyncJobProcessor, SyncWorkerConfig, WorkerPool};
use crate::queue::{EnqueueOutcome, Priority, QueueStatus, SyncJobQueue};
use crate::rate_governor::{CategoryStatus, RateGovernor};
use crate::remote::RemoteFetcher;
use crate::scanner::{RangeScanner, ScanCheckpoint, ScanError, ScanHandle, ScanRequest, ScannerConfig};
use crate::scheduler::{PriorityScheduler, SchedulerError, SchedulerStatus};
use crate::store::{EntityRoster, SyncStore};
use crate::{EntityId, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub worker: SyncWorkerConfig,
    pub scanner: ScannerConfig,
    pub tier_intervals: TierIntervals,
}

/// Point-in-time view of every component, served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub governor: Vec<CategoryStatus>,
    pub queue: QueueStatus,
    pub scheduler: SchedulerStatus,
    pub scans: Vec<ScanCheckpoint>,
}

pub struct SyncOrchestrator {
    governor: Arc<RateGovernor>,
    queue: Arc<SyncJobQueue>,
    scheduler: PriorityScheduler,
    scanner: RangeScanner,
    processor: Arc<SyncJobProcessor>,
    worker_count: usize,
    tier_intervals: TierIntervals,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    /// Fails when the worker or scanner category is missing from `categories`.
    pub fn new(
        categories: &CategoryTable,
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn SyncStore>,
        roster: Arc<dyn EntityRoster>,
        config: OrchestratorConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, Error> {
        categories.require(&config.worker.category)?;
        categories.require(&config.scanner.category)?;

        let governor = Arc::new(RateGovernor::new(categories));
        let queue = Arc::new(SyncJobQueue::default());
        let scheduler = PriorityScheduler::new(Arc::clone(&queue), roster, shutdown);
        let scanner = RangeScanner::new(
            Arc::clone(&governor),
            Arc::clone(&fetcher),
            Arc::clone(&store),
            config.scanner,
            shutdown,
        )?;
        let processor = Arc::new(SyncJobProcessor::new(
            Arc::clone(&governor),
            fetcher,
            store,
            &config.worker,
        ));

        Ok(Self {
            governor,
            queue,
            scheduler,
            scanner,
            processor,
            worker_count: config.worker.worker_count,
            tier_intervals: config.tier_intervals,
            workers: tokio::sync::Mutex::new(None),
            shutdown: shutdown.clone(),
        })
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn queue(&self) -> &Arc<SyncJobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub fn scanner(&self) -> &RangeScanner {
        &self.scanner
    }

    pub fn enqueue(&self, entity_id: EntityId, priority: Priority, requested_by: &str) -> EnqueueOutcome {
        self.queue.enqueue(entity_id, priority, requested_by)
    }

    /// Spawns the worker pool once; later calls are no-ops.
    pub async fn start_workers(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            warn!(event = "sync_workers_already_started", "worker pool already running");
            return;
        }
        *workers = Some(WorkerPool::spawn(
            self.worker_count,
            Arc::clone(&self.queue),
            Arc::clone(&self.processor),
            &self.shutdown,
        ));
    }

    /// Holds queued jobs; jobs already processing finish. Returns whether the state changed.
    pub fn pause_queue(&self) -> bool {
        self.queue.pause()
    }

    pub fn resume_queue(&self) -> bool {
        self.queue.resume()
    }

    pub async fn start_scheduler(&self) -> Result<(), SchedulerError> {
        self.scheduler.start(self.tier_intervals).await
    }

    /// Restarts only the scheduler; workers and scans keep running.
    pub async fn reload_intervals(&self, intervals: TierIntervals) -> Result<(), SchedulerError> {
        info!(event = "tier_intervals_reloading", "reloading scheduler tier intervals");
        self.scheduler.restart(intervals).await
    }

    pub async fn start_scan(&self, request: ScanRequest) -> Result<ScanHandle, ScanError> {
        self.scanner.start_scan(request).await
    }

    pub async fn resume_scan(&self, scan_id: &str) -> Result<ScanHandle, ScanError> {
        self.scanner.resume_scan(scan_id).await
    }

    pub fn cancel_scan(&self, scan_id: &str) -> Result<(), ScanError> {
        self.scanner.cancel_scan(scan_id)
    }

    pub async fn get_checkpoint(&self, scan_id: &str) -> Result<ScanCheckpoint, ScanError> {
        self.scanner.get_checkpoint(scan_id).await
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            governor: self.governor.status_all(),
            queue: self.queue.status(),
            scheduler: self.scheduler.status().await,
            scans: self.scanner.active_scans(),
        }
    }

    /// Cancels scans, stops the scheduler, and waits for the workers to settle their jobs.
    pub async fn shutdown(&self) {
        self.scanner.cancel_all();
        match self.scheduler.stop().await {
            Ok(()) | Err(SchedulerError::NotRunning) => {}
            Err(err) => warn!(
                event = "scheduler_stop_failed",
                error = %err,
                "scheduler did not stop cleanly"
            ),
        }
        if let Some(workers) = self.workers.lock().await.take() {
            workers.shutdown().await;
        }
        info!(event = "orchestrator_stopped", "sync orchestrator stopped");
    }
}
