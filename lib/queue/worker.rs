use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use super::{SyncJob, SyncJobQueue};
use crate::rate_governor::{GovernorError, RateGovernor};
use crate::remote::retry::run_with_retry;
use crate::remote::{FetchError, FetchResponse, RemoteFetcher, RetryPolicy};
use crate::server::monitoring::QUEUE_METRICS;
use crate::store::{SyncStore, SyncedEntity};
use crate::EntityId;

const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWorkerConfig {
    pub worker_count: usize,
    /// Endpoint category each job fetches from.
    pub category: String,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Synced { attempts: u32 },
    Failed { reason: String, attempts: u32 },
    Interrupted,
    Panicked { message: String },
}

#[derive(Debug)]
enum AttemptError {
    Governor(GovernorError),
    Fetch(FetchError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_retryable())
    }
}

/// Runs one job: governed fetch with micro-retry, then persistence.
pub struct SyncJobProcessor {
    governor: Arc<RateGovernor>,
    fetcher: Arc<dyn RemoteFetcher>,
    store: Arc<dyn SyncStore>,
    category: String,
    retry_policy: RetryPolicy,
}

impl SyncJobProcessor {
    pub fn new(
        governor: Arc<RateGovernor>,
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn SyncStore>,
        config: &SyncWorkerConfig,
    ) -> Self {
        Self {
            governor,
            fetcher,
            store,
            category: config.category.clone(),
            retry_policy: config.retry_policy,
        }
    }

    async fn fetch_once(
        &self,
        entity_id: EntityId,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, AttemptError> {
        let category = self.category.as_str();
        match self
            .governor
            .execute_with_limit(category, cancel, || self.fetcher.fetch(category, entity_id))
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(AttemptError::Fetch(err)),
            Err(err) => Err(AttemptError::Governor(err)),
        }
    }

    pub async fn process(&self, job: &SyncJob, cancel: &CancellationToken) -> JobResult {
        let outcome = run_with_retry(
            &self.retry_policy,
            job.entity_id,
            cancel,
            |_| self.fetch_once(job.entity_id, cancel),
            AttemptError::is_retryable,
        )
        .await;

        match outcome {
            Ok((FetchResponse::Found(item), attempts)) => {
                let entity = SyncedEntity::from_item(&self.category, &item);
                match self.store.save_entity(&entity).await {
                    Ok(()) => JobResult::Synced { attempts },
                    Err(err) => JobResult::Failed {
                        reason: format!("failed to persist entity: {err}"),
                        attempts,
                    },
                }
            }
            Ok((FetchResponse::NotFound, attempts)) => JobResult::Failed {
                reason: format!("entity {} not found upstream", job.entity_id),
                attempts,
            },
            Err(terminal) => match terminal.error {
                AttemptError::Governor(GovernorError::Cancelled { .. }) => JobResult::Interrupted,
                AttemptError::Governor(err) => JobResult::Failed {
                    reason: err.to_string(),
                    attempts: terminal.attempts,
                },
                AttemptError::Fetch(err) => JobResult::Failed {
                    reason: err.to_string(),
                    attempts: terminal.attempts,
                },
            },
        }
    }
}

fn settle(queue: &SyncJobQueue, job: &SyncJob, result: JobResult) {
    let settled = match &result {
        JobResult::Synced { attempts } => {
            info!(
                event = "sync_job_done",
                job_id = job.id,
                entity_id = job.entity_id,
                attempts,
                "synced entity"
            );
            queue.mark_done(job.id)
        }
        JobResult::Failed { reason, .. } => queue.mark_failed(job.id, reason),
        JobResult::Interrupted => queue.mark_failed(job.id, "interrupted by shutdown"),
        JobResult::Panicked { message } => {
            error!(
                event = "sync_job_panicked",
                job_id = job.id,
                entity_id = job.entity_id,
                panic = %message,
                "sync job panicked"
            );
            queue.mark_failed(job.id, &format!("worker panicked: {message}"))
        }
    };
    if let Err(err) = settled {
        warn!(
            event = "sync_job_settle_failed",
            job_id = job.id,
            error = %err,
            "could not record job outcome"
        );
    }
}

async fn run_worker(
    worker_idx: usize,
    queue: Arc<SyncJobQueue>,
    processor: Arc<SyncJobProcessor>,
    cancel: CancellationToken,
) {
    while let Some(job) = queue.next_job(&cancel).await {
        let span = tracing::info_span!(
            "sync_job",
            worker_idx,
            job_id = job.id,
            entity_id = job.entity_id,
            priority = job.priority.get()
        );
        let result = AssertUnwindSafe(processor.process(&job, &cancel))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|payload| JobResult::Panicked {
                message: panic_message(payload.as_ref()),
            });
        settle(&queue, &job, result);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// How a worker task ended, tagged with its index.
struct WorkerExit {
    worker_idx: usize,
    panic: Option<String>,
}

fn spawn_worker(
    workers: &mut JoinSet<WorkerExit>,
    worker_idx: usize,
    queue: &Arc<SyncJobQueue>,
    processor: &Arc<SyncJobProcessor>,
    cancel: &CancellationToken,
) {
    let worker = run_worker(
        worker_idx,
        Arc::clone(queue),
        Arc::clone(processor),
        cancel.clone(),
    );
    workers.spawn(async move {
        let panic = AssertUnwindSafe(worker)
            .catch_unwind()
            .await
            .err()
            .map(|payload| panic_message(payload.as_ref()));
        WorkerExit { worker_idx, panic }
    });
}

/// Supervised set of queue workers; crashed workers are replaced until shutdown.
pub struct WorkerPool {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl WorkerPool {
    pub fn spawn(
        worker_count: usize,
        queue: Arc<SyncJobQueue>,
        processor: Arc<SyncJobProcessor>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let supervisor = tokio::spawn(supervise(
            worker_count.max(1),
            queue,
            processor,
            cancel.clone(),
        ));
        Self { cancel, supervisor }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.supervisor.await {
            error!(
                event = "worker_supervisor_join_failed",
                error = %err,
                "worker supervisor did not exit cleanly"
            );
        }
    }
}

async fn supervise(
    worker_count: usize,
    queue: Arc<SyncJobQueue>,
    processor: Arc<SyncJobProcessor>,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();
    for worker_idx in 0..worker_count {
        spawn_worker(&mut workers, worker_idx, &queue, &processor, &cancel);
    }
    if let Some(metrics) = QUEUE_METRICS.get() {
        metrics.workers_alive.set(worker_count as i64);
    }
    info!(event = "sync_workers_started", worker_count, "sync workers started");

    let mut next_spare_idx = worker_count;
    while let Some(joined) = workers.join_next().await {
        if cancel.is_cancelled() {
            continue;
        }
        let worker_idx = match joined {
            Ok(WorkerExit {
                worker_idx,
                panic: Some(message),
            }) => {
                error!(
                    event = "sync_worker_panicked",
                    worker_idx,
                    panic = %message,
                    "sync worker panicked; restarting"
                );
                worker_idx
            }
            Ok(WorkerExit {
                worker_idx,
                panic: None,
            }) => {
                warn!(
                    event = "sync_worker_exited",
                    worker_idx,
                    "sync worker exited unexpectedly; restarting"
                );
                worker_idx
            }
            Err(err) => {
                let worker_idx = next_spare_idx;
                next_spare_idx += 1;
                error!(
                    event = "sync_worker_join_failed",
                    worker_idx,
                    error = %err,
                    "sync worker task failed; starting a replacement"
                );
                worker_idx
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => continue,
            _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
        }
        spawn_worker(&mut workers, worker_idx, &queue, &processor, &cancel);
    }

    if let Some(metrics) = QUEUE_METRICS.get() {
        metrics.workers_alive.set(0);
    }
    info!(event = "sync_workers_stopped", "sync workers stopped");
}
