//! In-memory sync job queue with single-flight per entity.
//!
//! Jobs are served by priority (1 first) and FIFO within a priority. The set of
//! non-terminal jobs keyed by entity is the only thing that decides whether an entity
//! already has work in flight.

mod types;
pub mod worker;


use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::monitoring::QUEUE_METRICS;
use crate::{epoch_millis, EntityId};

pub use types::{EnqueueOutcome, JobId, JobState, Priority, QueueError, QueueStatus, SyncJob};

pub const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Default)]
struct QueueInner {
    next_id: JobId,
    jobs: HashMap<JobId, SyncJob>,
    active_by_entity: HashMap<EntityId, JobId>,
    // Job ids grow monotonically, so ordering by (priority, id) is FIFO within a tier.
    pending: BTreeSet<(Priority, JobId)>,
    history: VecDeque<SyncJob>,
    completed_total: u64,
    failed_total: u64,
    duplicates_total: u64,
    paused: bool,
}

impl QueueInner {
    fn state_of(&self, job_id: JobId) -> Option<JobState> {
        self.jobs
            .get(&job_id)
            .map(|job| job.state)
            .or_else(|| {
                self.history
                    .iter()
                    .find(|job| job.id == job_id)
                    .map(|job| job.state)
            })
    }

    /// Moves a job from `from` to a terminal state and drops it from the active set.
    fn finish(
        &mut self,
        job_id: JobId,
        from: JobState,
        to: JobState,
        reason: Option<String>,
    ) -> Result<SyncJob, QueueError> {
        let current = self.state_of(job_id).ok_or(QueueError::UnknownJob(job_id))?;
        if current != from {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: current,
                to,
            });
        }

        let mut job = self
            .jobs
            .remove(&job_id)
            .ok_or(QueueError::UnknownJob(job_id))?;
        self.pending.remove(&(job.priority, job_id));
        self.active_by_entity.remove(&job.entity_id);

        job.state = to;
        job.finished_at_ms = Some(epoch_millis());
        job.failure_reason = reason;
        match to {
            JobState::Done => self.completed_total += 1,
            _ => self.failed_total += 1,
        }
        Ok(job)
    }
}

pub struct SyncJobQueue {
    inner: Mutex<QueueInner>,
    job_ready: Notify,
    history_limit: usize,
}

impl Default for SyncJobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl SyncJobQueue {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_id: 1,
                ..QueueInner::default()
            }),
            job_ready: Notify::new(),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a pending job unless the entity already has a non-terminal one.
    pub fn enqueue(
        &self,
        entity_id: EntityId,
        priority: Priority,
        requested_by: &str,
    ) -> EnqueueOutcome {
        let outcome = {
            let mut inner = self.lock();
            if let Some(existing) = inner.active_by_entity.get(&entity_id).copied() {
                inner.duplicates_total += 1;
                let state = inner
                    .jobs
                    .get(&existing)
                    .map(|job| job.state)
                    .unwrap_or(JobState::Pending);
                EnqueueOutcome::Duplicate {
                    job_id: existing,
                    state,
                }
            } else {
                let job_id = inner.next_id;
                inner.next_id += 1;
                inner.jobs.insert(
                    job_id,
                    SyncJob {
                        id: job_id,
                        entity_id,
                        priority,
                        requested_by: requested_by.to_string(),
                        state: JobState::Pending,
                        enqueued_at_ms: epoch_millis(),
                        started_at_ms: None,
                        finished_at_ms: None,
                        failure_reason: None,
                    },
                );
                inner.active_by_entity.insert(entity_id, job_id);
                inner.pending.insert((priority, job_id));
                self.publish_depth(&inner);
                EnqueueOutcome::Enqueued { job_id }
            }
        };

        match outcome {
            EnqueueOutcome::Enqueued { job_id } => {
                debug!(
                    event = "sync_job_enqueued",
                    job_id,
                    entity_id,
                    priority = priority.get(),
                    requested_by,
                    "queued sync job"
                );
                if let Some(metrics) = QUEUE_METRICS.get() {
                    metrics.enqueued_total.inc();
                }
                self.job_ready.notify_one();
            }
            EnqueueOutcome::Duplicate { job_id, state } => {
                debug!(
                    event = "sync_job_duplicate",
                    job_id,
                    entity_id,
                    existing_state = ?state,
                    requested_by,
                    "entity already has an active sync job"
                );
                if let Some(metrics) = QUEUE_METRICS.get() {
                    metrics.duplicates_total.inc();
                }
            }
        }
        outcome
    }

    pub fn enqueue_bulk<I>(&self, entries: I, requested_by: &str) -> Vec<(EntityId, EnqueueOutcome)>
    where
        I: IntoIterator<Item = (EntityId, Priority)>,
    {
        let outcomes: Vec<_> = entries
            .into_iter()
            .map(|(entity_id, priority)| {
                (entity_id, self.enqueue(entity_id, priority, requested_by))
            })
            .collect();
        let queued = outcomes.iter().filter(|(_, o)| !o.is_duplicate()).count();
        info!(
            event = "sync_jobs_bulk_enqueued",
            requested_by,
            submitted = outcomes.len(),
            queued,
            duplicates = outcomes.len() - queued,
            "bulk enqueue finished"
        );
        outcomes
    }

    /// Claims the next job, marking it processing in the same critical section.
    pub fn dequeue_next(&self) -> Option<SyncJob> {
        let mut inner = self.lock();
        self.claim(&mut inner)
    }

    fn claim(&self, inner: &mut QueueInner) -> Option<SyncJob> {
        let (priority, job_id) = inner.pending.pop_first()?;
        let job = match inner.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => {
                warn!(
                    event = "sync_job_orphaned",
                    job_id,
                    priority = priority.get(),
                    "pending entry without a job record; skipping"
                );
                return None;
            }
        };
        job.state = JobState::Processing;
        job.started_at_ms = Some(epoch_millis());
        let claimed = job.clone();
        self.publish_depth(inner);
        Some(claimed)
    }

    /// Waits for a job to claim while the queue is not paused. Returns `None` once
    /// `cancel` fires.
    pub async fn next_job(&self, cancel: &CancellationToken) -> Option<SyncJob> {
        loop {
            let ready = self.job_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let claimed = {
                let mut inner = self.lock();
                if inner.paused {
                    None
                } else {
                    self.claim(&mut inner)
                }
            };
            if let Some(job) = claimed {
                return Some(job);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut ready => {}
            }
        }
    }

    /// Stops workers from claiming jobs. Jobs already processing run to completion and
    /// enqueueing keeps working.
    pub fn pause(&self) -> bool {
        let changed = !std::mem::replace(&mut self.lock().paused, true);
        if changed {
            info!(event = "sync_queue_paused", "sync queue paused");
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = std::mem::replace(&mut self.lock().paused, false);
        if changed {
            info!(event = "sync_queue_resumed", "sync queue resumed");
            self.job_ready.notify_waiters();
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn mark_done(&self, job_id: JobId) -> Result<SyncJob, QueueError> {
        let job = self.finish(job_id, JobState::Processing, JobState::Done, None)?;
        if let Some(metrics) = QUEUE_METRICS.get() {
            metrics.completed_total.inc();
        }
        Ok(job)
    }

    /// Fails a processing job. There is no automatic retry; see [`SyncJobQueue::retry`].
    pub fn mark_failed(&self, job_id: JobId, reason: &str) -> Result<SyncJob, QueueError> {
        let job = self.finish(
            job_id,
            JobState::Processing,
            JobState::Failed,
            Some(reason.to_string()),
        )?;
        warn!(
            event = "sync_job_failed",
            job_id,
            entity_id = job.entity_id,
            reason,
            "sync job failed"
        );
        if let Some(metrics) = QUEUE_METRICS.get() {
            metrics.failed_total.inc();
        }
        Ok(job)
    }

    /// Withdraws a job that has not been claimed yet.
    pub fn cancel(&self, job_id: JobId) -> Result<SyncJob, QueueError> {
        let job = self.finish(
            job_id,
            JobState::Pending,
            JobState::Failed,
            Some("cancelled before processing".to_string()),
        )?;
        info!(
            event = "sync_job_cancelled",
            job_id,
            entity_id = job.entity_id,
            "cancelled pending sync job"
        );
        Ok(job)
    }

    /// Re-enqueues a failed job's entity at its original priority.
    pub fn retry(&self, job_id: JobId) -> Result<EnqueueOutcome, QueueError> {
        let (entity_id, priority) = {
            let inner = self.lock();
            if let Some(active) = inner.jobs.get(&job_id) {
                return Err(QueueError::InvalidTransition {
                    job_id,
                    from: active.state,
                    to: JobState::Pending,
                });
            }
            let job = inner
                .history
                .iter()
                .find(|job| job.id == job_id)
                .ok_or(QueueError::UnknownJob(job_id))?;
            if job.state != JobState::Failed {
                return Err(QueueError::InvalidTransition {
                    job_id,
                    from: job.state,
                    to: JobState::Pending,
                });
            }
            (job.entity_id, job.priority)
        };
        Ok(self.enqueue(entity_id, priority, "retry"))
    }

    /// Re-enqueues every failed job still in history.
    pub fn retry_all_failed(&self) -> Vec<(EntityId, EnqueueOutcome)> {
        let failed: Vec<(EntityId, Priority)> = {
            let inner = self.lock();
            let mut seen = std::collections::HashSet::new();
            inner
                .history
                .iter()
                .filter(|job| job.state == JobState::Failed)
                .filter(|job| seen.insert(job.entity_id))
                .map(|job| (job.entity_id, job.priority))
                .collect()
        };
        self.enqueue_bulk(failed, "retry")
    }

    pub fn job(&self, job_id: JobId) -> Option<SyncJob> {
        let inner = self.lock();
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .or_else(|| inner.history.iter().find(|job| job.id == job_id).cloned())
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.lock();
        let mut active: Vec<SyncJob> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Processing)
            .cloned()
            .collect();
        active.sort_by_key(|job| job.id);
        let processing = active.len();
        active.extend(
            inner
                .pending
                .iter()
                .filter_map(|(_, job_id)| inner.jobs.get(job_id).cloned()),
        );

        QueueStatus {
            paused: inner.paused,
            pending: inner.pending.len(),
            processing,
            completed_total: inner.completed_total,
            failed_total: inner.failed_total,
            duplicates_total: inner.duplicates_total,
            active,
            recent: inner.history.iter().cloned().collect(),
        }
    }

    fn finish(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
        reason: Option<String>,
    ) -> Result<SyncJob, QueueError> {
        let mut inner = self.lock();
        let job = inner.finish(job_id, from, to, reason)?;
        self.archive(&mut inner, job.clone());
        self.publish_depth(&inner);
        Ok(job)
    }

    fn archive(&self, inner: &mut QueueInner, job: SyncJob) {
        inner.history.push_front(job);
        inner.history.truncate(self.history_limit);
    }

    fn publish_depth(&self, inner: &QueueInner) {
        if let Some(metrics) = QUEUE_METRICS.get() {
            metrics.pending_jobs.set(inner.pending.len() as i64);
        }
    }
}
