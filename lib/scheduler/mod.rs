//! Periodic per-tier enqueueing of tracked entities.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::config::tiers::TierIntervals;
use crate::epoch_millis;
use crate::queue::{Priority, SyncJobQueue};
use crate::server::monitoring::{TierLabels, SCHEDULER_METRICS};
use crate::store::{EntityRoster, StoreError};

#[cfg(test)]
mod scheduler_tests;

pub const SCHEDULER_REQUESTER: &str = "scheduler";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("failed to load {priority} roster: {source}")]
    Roster {
        priority: Priority,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierRunSummary {
    pub at_ms: u64,
    pub total: usize,
    pub queued: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub priority: Priority,
    pub interval_minutes: u64,
    /// `None` while the scheduler is stopped.
    pub next_run_in_secs: Option<u64>,
    pub last_run: Option<TierRunSummary>,
    pub runs_total: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tiers: Vec<TierStatus>,
}

#[derive(Debug, Default)]
struct TierStats {
    next_run_at: Option<Instant>,
    last_run: Option<TierRunSummary>,
    runs_total: u64,
    last_error: Option<String>,
}

struct Shared {
    queue: Arc<SyncJobQueue>,
    roster: Arc<dyn EntityRoster>,
    intervals: Mutex<TierIntervals>,
    tiers: Mutex<[TierStats; 4]>,
}

impl Shared {
    fn tiers(&self) -> MutexGuard<'_, [TierStats; 4]> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn intervals(&self) -> TierIntervals {
        *self.intervals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_next_run(&self, priority: Priority, at: Option<Instant>) {
        self.tiers()[priority.index()].next_run_at = at;
    }

    async fn run_tier(&self, priority: Priority) -> Result<TierRunSummary, SchedulerError> {
        let loaded = self.roster.entities_with_priority(priority).await;
        let entities = match loaded {
            Ok(entities) => entities,
            Err(source) => {
                let err = SchedulerError::Roster { priority, source };
                self.tiers()[priority.index()].last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let outcomes = self.queue.enqueue_bulk(
            entities.iter().map(|entity_id| (*entity_id, priority)),
            SCHEDULER_REQUESTER,
        );
        let queued = outcomes.iter().filter(|(_, o)| !o.is_duplicate()).count();
        let summary = TierRunSummary {
            at_ms: epoch_millis(),
            total: outcomes.len(),
            queued,
            duplicates: outcomes.len() - queued,
        };

        {
            let mut tiers = self.tiers();
            let stats = &mut tiers[priority.index()];
            stats.last_run = Some(summary.clone());
            stats.runs_total += 1;
            stats.last_error = None;
        }
        if let Some(metrics) = SCHEDULER_METRICS.get() {
            let labels = TierLabels {
                tier: priority.to_string(),
            };
            metrics.tier_runs_total.get_or_create(&labels).inc();
            metrics
                .entities_queued_total
                .get_or_create(&labels)
                .inc_by(queued as u64);
        }
        info!(
            event = "scheduler_tier_run",
            tier = %priority,
            total = summary.total,
            queued = summary.queued,
            duplicates = summary.duplicates,
            "tier run enqueued entities"
        );
        Ok(summary)
    }
}

struct Runtime {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

pub struct PriorityScheduler {
    shared: Arc<Shared>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
    shutdown: CancellationToken,
}

impl PriorityScheduler {
    pub fn new(
        queue: Arc<SyncJobQueue>,
        roster: Arc<dyn EntityRoster>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                roster,
                intervals: Mutex::new(TierIntervals::default()),
                tiers: Mutex::new(Default::default()),
            }),
            runtime: tokio::sync::Mutex::new(None),
            shutdown: shutdown.clone(),
        }
    }

    /// Spawns one periodic task per tier. The first run of each tier happens one period
    /// after start.
    pub async fn start(&self, intervals: TierIntervals) -> Result<(), SchedulerError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        *self
            .shared
            .intervals
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = intervals;
        let cancel = self.shutdown.child_token();
        let mut tasks = JoinSet::new();
        let now = Instant::now();
        for priority in Priority::ALL {
            let period = intervals.period(priority);
            self.shared.set_next_run(priority, Some(now + period));
            let span = tracing::info_span!("scheduler_tier", tier = %priority);
            tasks.spawn(
                run_tier_loop(Arc::clone(&self.shared), priority, now, period, cancel.clone())
                    .instrument(span),
            );
        }
        *runtime = Some(Runtime { cancel, tasks });

        info!(
            event = "scheduler_started",
            p1_minutes = intervals.minutes(Priority::P1),
            p2_minutes = intervals.minutes(Priority::P2),
            p3_minutes = intervals.minutes(Priority::P3),
            p4_minutes = intervals.minutes(Priority::P4),
            "priority scheduler started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut runtime = self.runtime.lock().await;
        let Some(Runtime { cancel, mut tasks }) = runtime.take() else {
            return Err(SchedulerError::NotRunning);
        };
        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(
                    event = "scheduler_tier_join_failed",
                    error = %err,
                    "scheduler tier task did not exit cleanly"
                );
            }
        }
        for priority in Priority::ALL {
            self.shared.set_next_run(priority, None);
        }
        info!(event = "scheduler_stopped", "priority scheduler stopped");
        Ok(())
    }

    /// Stops if running, then starts with `intervals`.
    pub async fn restart(&self, intervals: TierIntervals) -> Result<(), SchedulerError> {
        match self.stop().await {
            Ok(()) | Err(SchedulerError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        self.start(intervals).await
    }

    /// Enqueues a tier immediately, independent of its periodic trigger.
    pub async fn run_tier_now(&self, priority: Priority) -> Result<TierRunSummary, SchedulerError> {
        self.shared.run_tier(priority).await
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.is_running().await;
        let intervals = self.shared.intervals();
        let now = Instant::now();
        let tiers = self.shared.tiers();
        SchedulerStatus {
            running,
            tiers: Priority::ALL
                .into_iter()
                .map(|priority| {
                    let stats = &tiers[priority.index()];
                    TierStatus {
                        priority,
                        interval_minutes: intervals.minutes(priority),
                        next_run_in_secs: stats
                            .next_run_at
                            .map(|at| at.saturating_duration_since(now).as_secs()),
                        last_run: stats.last_run.clone(),
                        runs_total: stats.runs_total,
                        last_error: stats.last_error.clone(),
                    }
                })
                .collect(),
        }
    }
}

async fn run_tier_loop(
    shared: Arc<Shared>,
    priority: Priority,
    started: Instant,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(started + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        shared.set_next_run(priority, Some(Instant::now() + period));
        if let Err(err) = shared.run_tier(priority).await {
            warn!(
                event = "scheduler_tier_failed",
                tier = %priority,
                error = %err,
                "tier run failed; will retry next period"
            );
        }
    }
}
