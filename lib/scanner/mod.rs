//! Resumable, checkpointed walks over a numeric id space.
//!
//! A scan fetches one position at a time through the rate governor, counts items whose
//! participants include the target entity, and stops on the first of: enough matches, a
//! long enough miss streak, or leaving the range. Progress is persisted every
//! `save_interval` steps and whenever the scan pauses, is cancelled, or completes.

mod checkpoint;
mod executor;


use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::epoch_millis;
use crate::rate_governor::{GovernorError, RateGovernor};
use crate::remote::{FetchError, RemoteFetcher};
use crate::server::monitoring::SCAN_METRICS;
use crate::store::{StoreError, SyncStore};

pub use checkpoint::{ScanCheckpoint, ScanDirection, ScanRequest, ScanStatus, TerminalReason};
use executor::{LiveCheckpoint, ScanExecutor};

pub const DEFAULT_SAVE_INTERVAL: u32 = 25;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("no checkpoint for scan `{0}`")]
    NotFound(String),

    #[error("scan `{0}` is already running")]
    AlreadyRunning(String),

    #[error("scan `{0}` already exists; resume it instead")]
    AlreadyExists(String),

    #[error("scan `{scan_id}` already completed ({reason})")]
    AlreadyComplete { scan_id: String, reason: String },

    #[error("scan `{0}` is not running")]
    NotRunning(String),

    #[error("scan `{scan_id}` was recorded against `{recorded}` but this scanner fetches `{configured}`")]
    CategoryMismatch {
        scan_id: String,
        recorded: String,
        configured: String,
    },

    #[error("scan `{scan_id}` paused at position {position}: {source}")]
    Transport {
        scan_id: String,
        position: i64,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("scan task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Endpoint category every scan fetches from.
    pub category: String,
    pub save_interval: u32,
    /// Minimum spacing between steps, on top of the governor's budget.
    pub step_delay: Option<Duration>,
}

impl ScannerConfig {
    pub fn new(category: &str) -> Self {
        Self {
            category: category.to_string(),
            save_interval: DEFAULT_SAVE_INTERVAL,
            step_delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed {
        checkpoint: ScanCheckpoint,
        reason: TerminalReason,
    },
    Cancelled {
        checkpoint: ScanCheckpoint,
    },
}

impl ScanOutcome {
    pub fn checkpoint(&self) -> &ScanCheckpoint {
        match self {
            Self::Completed { checkpoint, .. } | Self::Cancelled { checkpoint } => checkpoint,
        }
    }
}

struct ActiveScan {
    cancel: CancellationToken,
    live: Arc<LiveCheckpoint>,
}

#[derive(Default)]
struct ScanRegistry {
    active: HashMap<String, ActiveScan>,
    /// Last published state of scans that stopped on an error; the store may be behind it.
    failed: HashMap<String, ScanCheckpoint>,
}

type SharedRegistry = Arc<Mutex<ScanRegistry>>;

fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, ScanRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running scan. Dropping the handle detaches it; the scan keeps going.
pub struct ScanHandle {
    scan_id: String,
    cancel: CancellationToken,
    live: Arc<LiveCheckpoint>,
    join: JoinHandle<Result<ScanOutcome, ScanError>>,
}

impl ScanHandle {
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn checkpoint(&self) -> ScanCheckpoint {
        self.live.snapshot()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<ScanOutcome, ScanError> {
        self.join.await?
    }
}

pub struct RangeScanner {
    executor: Arc<ScanExecutor>,
    registry: SharedRegistry,
    shutdown: CancellationToken,
}

impl RangeScanner {
    pub fn new(
        governor: Arc<RateGovernor>,
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn SyncStore>,
        config: ScannerConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, ScanError> {
        if !governor.has_category(&config.category) {
            return Err(GovernorError::UnknownCategory(config.category).into());
        }
        Ok(Self {
            executor: Arc::new(ScanExecutor::new(governor, fetcher, store, config)),
            registry: SharedRegistry::default(),
            shutdown: shutdown.clone(),
        })
    }

    pub fn category(&self) -> &str {
        self.executor.category()
    }

    /// Persists an initial checkpoint and starts walking from `range_start`.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<ScanHandle, ScanError> {
        request.validate()?;
        if self.is_active(&request.scan_id) {
            return Err(ScanError::AlreadyRunning(request.scan_id));
        }
        if self.executor.load(&request.scan_id).await?.is_some() {
            return Err(ScanError::AlreadyExists(request.scan_id));
        }

        let mut checkpoint = ScanCheckpoint::new(&request, self.category(), epoch_millis());
        self.executor.save(&mut checkpoint).await?;
        info!(
            event = "scan_created",
            scan_id = %checkpoint.scan_id,
            target_entity = checkpoint.target_entity,
            direction = checkpoint.direction.as_str(),
            range_start = checkpoint.range_start,
            range_end = checkpoint.range_end,
            expected_matches = checkpoint.expected_matches,
            miss_threshold = checkpoint.miss_threshold,
            "created scan"
        );
        self.launch(checkpoint)
    }

    /// Continues an unfinished scan from its last known position: the state it failed with
    /// in this process if there is one, otherwise its persisted checkpoint.
    pub async fn resume_scan(&self, scan_id: &str) -> Result<ScanHandle, ScanError> {
        if self.is_active(scan_id) {
            return Err(ScanError::AlreadyRunning(scan_id.to_string()));
        }
        let remembered = lock_registry(&self.registry).failed.get(scan_id).cloned();
        let mut checkpoint = match remembered {
            Some(checkpoint) => checkpoint,
            None => self
                .executor
                .load(scan_id)
                .await?
                .ok_or_else(|| ScanError::NotFound(scan_id.to_string()))?,
        };
        checkpoint.request().validate()?;
        if checkpoint.category != self.category() {
            return Err(ScanError::CategoryMismatch {
                scan_id: scan_id.to_string(),
                recorded: checkpoint.category,
                configured: self.category().to_string(),
            });
        }
        if checkpoint.is_completed() {
            return Err(ScanError::AlreadyComplete {
                scan_id: scan_id.to_string(),
                reason: checkpoint.status_reason.unwrap_or_default(),
            });
        }

        info!(
            event = "scan_resuming",
            scan_id,
            position = checkpoint.current_position,
            items_scanned = checkpoint.items_scanned,
            matches_found = checkpoint.matches_found,
            previous_status = checkpoint.status.as_str(),
            "resuming scan from checkpoint"
        );
        checkpoint.set_status(ScanStatus::Running, None);
        self.launch(checkpoint)
    }

    fn launch(&self, checkpoint: ScanCheckpoint) -> Result<ScanHandle, ScanError> {
        let scan_id = checkpoint.scan_id.clone();
        let cancel = self.shutdown.child_token();
        let live = Arc::new(LiveCheckpoint::new(checkpoint));
        {
            let mut registry = lock_registry(&self.registry);
            if registry.active.contains_key(&scan_id) {
                return Err(ScanError::AlreadyRunning(scan_id));
            }
            registry.failed.remove(&scan_id);
            registry.active.insert(
                scan_id.clone(),
                ActiveScan {
                    cancel: cancel.clone(),
                    live: Arc::clone(&live),
                },
            );
            if let Some(metrics) = SCAN_METRICS.get() {
                metrics.active_scans.set(registry.active.len() as i64);
            }
        }

        let span = tracing::info_span!("scan", scan_id = %scan_id);
        let join = tokio::spawn({
            let executor = Arc::clone(&self.executor);
            let registry = Arc::clone(&self.registry);
            let cancel = cancel.clone();
            let live = Arc::clone(&live);
            let scan_id = scan_id.clone();
            async move {
                let result = executor.run(&live, &cancel).await;
                let mut registry = lock_registry(&registry);
                if result.is_err() {
                    registry.failed.insert(scan_id.clone(), live.snapshot());
                }
                registry.active.remove(&scan_id);
                if let Some(metrics) = SCAN_METRICS.get() {
                    metrics.active_scans.set(registry.active.len() as i64);
                }
                result
            }
            .instrument(span)
        });

        Ok(ScanHandle {
            scan_id,
            cancel,
            live,
            join,
        })
    }

    /// Asks a running scan to stop; it saves a paused checkpoint on its way out.
    pub fn cancel_scan(&self, scan_id: &str) -> Result<(), ScanError> {
        let registry = lock_registry(&self.registry);
        let scan = registry
            .active
            .get(scan_id)
            .ok_or_else(|| ScanError::NotRunning(scan_id.to_string()))?;
        scan.cancel.cancel();
        info!(event = "scan_cancel_requested", scan_id, "cancelling scan");
        Ok(())
    }

    pub fn cancel_all(&self) {
        for scan in lock_registry(&self.registry).active.values() {
            scan.cancel.cancel();
        }
    }

    /// Live progress for a running scan, then the state a failed scan stopped with, then
    /// the last persisted checkpoint.
    pub async fn get_checkpoint(&self, scan_id: &str) -> Result<ScanCheckpoint, ScanError> {
        let known = {
            let registry = lock_registry(&self.registry);
            registry
                .active
                .get(scan_id)
                .map(|scan| scan.live.snapshot())
                .or_else(|| registry.failed.get(scan_id).cloned())
        };
        if let Some(checkpoint) = known {
            return Ok(checkpoint);
        }
        self.executor
            .load(scan_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(scan_id.to_string()))
    }

    pub fn active_scans(&self) -> Vec<ScanCheckpoint> {
        let mut scans: Vec<ScanCheckpoint> = lock_registry(&self.registry)
            .active
            .values()
            .map(|scan| scan.live.snapshot())
            .collect();
        scans.sort_by(|a, b| a.scan_id.cmp(&b.scan_id));
        scans
    }

    fn is_active(&self, scan_id: &str) -> bool {
        lock_registry(&self.registry).active.contains_key(scan_id)
    }
}
