use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ScanCheckpoint, ScanError, ScanOutcome, ScanStatus, ScannerConfig, TerminalReason};
use crate::epoch_millis;
use crate::rate_governor::{GovernorError, RateGovernor};
use crate::remote::{FetchError, FetchResponse, RemoteFetcher};
use crate::server::monitoring::SCAN_METRICS;
use crate::store::{SyncStore, SyncedEntity};

const PROGRESS_LOG_EVERY: u64 = 50;

/// Progress shared between a running scan and its observers.
pub(super) struct LiveCheckpoint {
    inner: Mutex<ScanCheckpoint>,
}

impl LiveCheckpoint {
    pub(super) fn new(checkpoint: ScanCheckpoint) -> Self {
        Self {
            inner: Mutex::new(checkpoint),
        }
    }

    pub(super) fn snapshot(&self) -> ScanCheckpoint {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, checkpoint: &ScanCheckpoint) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = checkpoint.clone();
    }
}

enum Step {
    Match,
    Miss,
}

pub(super) struct ScanExecutor {
    governor: Arc<RateGovernor>,
    fetcher: Arc<dyn RemoteFetcher>,
    store: Arc<dyn SyncStore>,
    config: ScannerConfig,
}

impl ScanExecutor {
    pub(super) fn new(
        governor: Arc<RateGovernor>,
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn SyncStore>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            governor,
            fetcher,
            store,
            config,
        }
    }

    pub(super) fn category(&self) -> &str {
        &self.config.category
    }

    pub(super) async fn load(&self, scan_id: &str) -> Result<Option<ScanCheckpoint>, ScanError> {
        Ok(self.store.load_checkpoint(scan_id).await?)
    }

    pub(super) async fn save(&self, checkpoint: &mut ScanCheckpoint) -> Result<(), ScanError> {
        let previous = checkpoint.last_saved_at_ms.replace(epoch_millis());
        if let Err(err) = self.store.save_checkpoint(checkpoint).await {
            checkpoint.last_saved_at_ms = previous;
            return Err(err.into());
        }
        debug!(
            event = "scan_checkpoint_saved",
            scan_id = %checkpoint.scan_id,
            position = checkpoint.current_position,
            items_scanned = checkpoint.items_scanned,
            status = checkpoint.status.as_str(),
            "saved scan checkpoint"
        );
        Ok(())
    }

    /// Walks from the checkpoint's current position until a stop condition holds, the
    /// scan is cancelled, or a step fails. Every exit path persists the checkpoint, and a
    /// failed save pauses the scan with the save error as its reason.
    ///
    /// Cancellation is honored while waiting for budget or pacing and between steps. A
    /// fetch already sent upstream is allowed to finish so its call is recorded.
    pub(super) async fn run(
        &self,
        live: &LiveCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ScanError> {
        let mut checkpoint = live.snapshot();
        let mut pacer = self.pacer();
        let mut steps_since_save: u32 = 0;

        loop {
            if let Some(reason) = checkpoint.terminal_reason() {
                return self.complete(live, checkpoint, reason).await;
            }
            if cancel.is_cancelled() {
                return self.cancelled(live, checkpoint).await;
            }

            if let Some(pacer) = pacer.as_mut() {
                tokio::select! {
                    _ = cancel.cancelled() => return self.cancelled(live, checkpoint).await,
                    _ = pacer.tick() => {}
                }
            }

            let position = checkpoint.current_position;
            let step = self.fetch_step(&checkpoint, position, cancel).await;

            match step {
                Ok(Step::Match) => {
                    checkpoint.record_match();
                    info!(
                        event = "scan_match",
                        scan_id = %checkpoint.scan_id,
                        position,
                        matches_found = checkpoint.matches_found,
                        expected_matches = checkpoint.expected_matches,
                        "found item involving target"
                    );
                    if let Some(metrics) = SCAN_METRICS.get() {
                        metrics.matches_total.inc();
                    }
                }
                Ok(Step::Miss) => checkpoint.record_miss(),
                Err(ScanError::Governor(GovernorError::Cancelled { .. })) => {
                    return self.cancelled(live, checkpoint).await;
                }
                Err(err) => return self.pause(live, checkpoint, err).await,
            }
            if let Some(metrics) = SCAN_METRICS.get() {
                metrics.items_scanned_total.inc();
            }

            if checkpoint.terminal_reason().is_none() {
                checkpoint.advance();
            }

            if checkpoint.items_scanned % PROGRESS_LOG_EVERY == 0 {
                info!(
                    event = "scan_progress",
                    scan_id = %checkpoint.scan_id,
                    position = checkpoint.current_position,
                    items_scanned = checkpoint.items_scanned,
                    matches_found = checkpoint.matches_found,
                    consecutive_misses = checkpoint.consecutive_misses,
                    "scan progress"
                );
            }

            steps_since_save += 1;
            if steps_since_save >= self.config.save_interval {
                if let Err(err) = self.save(&mut checkpoint).await {
                    return self.pause(live, checkpoint, err).await;
                }
                steps_since_save = 0;
            }
            live.publish(&checkpoint);
        }
    }

    fn pacer(&self) -> Option<Interval> {
        let delay = self.config.step_delay.filter(|delay| !delay.is_zero())?;
        let mut pacer = interval(delay);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(pacer)
    }

    async fn fetch_step(
        &self,
        checkpoint: &ScanCheckpoint,
        position: i64,
        cancel: &CancellationToken,
    ) -> Result<Step, ScanError> {
        let category = self.config.category.as_str();
        let fetched = self
            .governor
            .execute_with_limit(category, cancel, || self.fetcher.fetch(category, position))
            .await?;

        let item = match fetched {
            Ok(FetchResponse::Found(item)) => item,
            Ok(FetchResponse::NotFound) => return Ok(Step::Miss),
            Err(source) => return Err(transport(checkpoint, position, source)),
        };
        if !item.involves(checkpoint.target_entity) {
            return Ok(Step::Miss);
        }

        self.store
            .save_entity(&SyncedEntity::from_item(category, &item))
            .await?;
        Ok(Step::Match)
    }

    async fn complete(
        &self,
        live: &LiveCheckpoint,
        mut checkpoint: ScanCheckpoint,
        reason: TerminalReason,
    ) -> Result<ScanOutcome, ScanError> {
        checkpoint.set_status(ScanStatus::Completed, Some(reason.as_str().to_string()));
        if let Err(err) = self.save(&mut checkpoint).await {
            return self.pause(live, checkpoint, err).await;
        }
        live.publish(&checkpoint);
        if let Some(metrics) = SCAN_METRICS.get() {
            metrics.scans_completed_total.inc();
        }

        info!(
            event = "scan_completed",
            scan_id = %checkpoint.scan_id,
            reason = reason.as_str(),
            final_position = checkpoint.current_position,
            items_scanned = checkpoint.items_scanned,
            matches_found = checkpoint.matches_found,
            expected_matches = checkpoint.expected_matches,
            efficiency_percent = checkpoint.efficiency_percent(),
            "scan finished"
        );
        Ok(ScanOutcome::Completed { checkpoint, reason })
    }

    async fn cancelled(
        &self,
        live: &LiveCheckpoint,
        mut checkpoint: ScanCheckpoint,
    ) -> Result<ScanOutcome, ScanError> {
        checkpoint.set_status(ScanStatus::Paused, Some("cancelled".to_string()));
        if let Err(err) = self.save(&mut checkpoint).await {
            return self.pause(live, checkpoint, err).await;
        }
        live.publish(&checkpoint);
        if let Some(metrics) = SCAN_METRICS.get() {
            metrics.scans_paused_total.inc();
        }

        info!(
            event = "scan_cancelled",
            scan_id = %checkpoint.scan_id,
            position = checkpoint.current_position,
            items_scanned = checkpoint.items_scanned,
            "scan cancelled; checkpoint saved"
        );
        Ok(ScanOutcome::Cancelled { checkpoint })
    }

    /// A failed fetch does not consume its position, so a resume retries it. The paused
    /// state is published even when it cannot be persisted.
    async fn pause(
        &self,
        live: &LiveCheckpoint,
        mut checkpoint: ScanCheckpoint,
        err: ScanError,
    ) -> Result<ScanOutcome, ScanError> {
        checkpoint.set_status(ScanStatus::Paused, Some(err.to_string()));
        if let Err(save_err) = self.save(&mut checkpoint).await {
            warn!(
                event = "scan_pause_save_failed",
                scan_id = %checkpoint.scan_id,
                error = %save_err,
                "could not persist paused checkpoint"
            );
        }
        live.publish(&checkpoint);
        if let Some(metrics) = SCAN_METRICS.get() {
            metrics.scans_paused_total.inc();
        }

        warn!(
            event = "scan_paused",
            scan_id = %checkpoint.scan_id,
            position = checkpoint.current_position,
            items_scanned = checkpoint.items_scanned,
            error = %err,
            "scan paused; resume to retry from the failed position"
        );
        Err(err)
    }
}

fn transport(checkpoint: &ScanCheckpoint, position: i64, source: FetchError) -> ScanError {
    ScanError::Transport {
        scan_id: checkpoint.scan_id.clone(),
        position,
        source,
    }
}
