//! Per-endpoint-category call budgets over sliding windows.
//!
//! Every category has its own FIFO gate. A caller holds the gate while it evaluates, waits
//! for, and reserves budget, so concurrent callers of one category are served in arrival
//! order and never race for the same slot. Reserved slots count against the ceiling until
//! the permit is recorded or dropped.

mod window;

#[cfg(test)]
mod governor_tests;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CategoryTable, EndpointCategory};
use crate::remote::FetchError;
use crate::server::monitoring::{CategoryLabels, GOVERNOR_METRICS};
use window::{Admission, CallWindow};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("unknown endpoint category `{0}`")]
    UnknownCategory(String),

    #[error("authorization for `{category}` was cancelled")]
    Cancelled { category: String },
}

/// Lets [`RateGovernor::execute_with_limit`] recognise an upstream "too many requests".
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;
}

impl RateLimitSignal for FetchError {
    fn is_rate_limited(&self) -> bool {
        FetchError::is_rate_limited(self)
    }
}

struct CategoryState {
    policy: EndpointCategory,
    gate: tokio::sync::Mutex<()>,
    window: Mutex<CallWindow>,
    released: Notify,
    waiters: AtomicUsize,
}

impl CategoryState {
    fn window(&self) -> MutexGuard<'_, CallWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn labels(&self) -> CategoryLabels {
        CategoryLabels {
            category: self.policy.key.clone(),
        }
    }
}

/// Authorization for exactly one upstream call.
///
/// Call [`CallPermit::record_usage`] once the call went out. Dropping the permit unrecorded
/// hands the slot back.
#[must_use = "a permit holds budget until it is recorded or dropped"]
pub struct CallPermit {
    state: Arc<CategoryState>,
    settled: bool,
}

impl CallPermit {
    pub fn category(&self) -> &str {
        &self.state.policy.key
    }

    pub fn record_usage(mut self) {
        self.settle(true);
    }

    fn settle(&mut self, record: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        {
            let mut window = self.state.window();
            if record {
                window.record(Instant::now());
            } else {
                window.release();
            }
        }
        self.state.released.notify_waiters();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.settle(false);
    }
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("category", &self.state.policy.key)
            .field("settled", &self.settled)
            .finish()
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Budget snapshot for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStatus {
    pub category: String,
    pub friendly_name: String,
    pub used: u32,
    pub reserved: u32,
    pub max_calls: u32,
    pub window_secs: u64,
    pub penalty_secs: u64,
    /// Callers queued on or holding the category gate.
    pub waiters: usize,
    /// Zero when a call could be authorized right now.
    pub next_available_in_ms: u64,
}

pub struct RateGovernor {
    categories: HashMap<String, Arc<CategoryState>>,
}

impl RateGovernor {
    pub fn new(table: &CategoryTable) -> Self {
        let categories = table
            .iter()
            .map(|policy| {
                (
                    policy.key.clone(),
                    Arc::new(CategoryState {
                        policy: policy.clone(),
                        gate: tokio::sync::Mutex::new(()),
                        window: Mutex::new(CallWindow::default()),
                        released: Notify::new(),
                        waiters: AtomicUsize::new(0),
                    }),
                )
            })
            .collect();
        Self { categories }
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    fn state(&self, category: &str) -> Result<&Arc<CategoryState>, GovernorError> {
        self.categories
            .get(category)
            .ok_or_else(|| GovernorError::UnknownCategory(category.to_string()))
    }

    /// Suspends until a call in `category` fits the window, then reserves it.
    ///
    /// Cancellation while queued or waiting returns [`GovernorError::Cancelled`] and leaves
    /// the budget untouched.
    pub async fn authorize(
        &self,
        category: &str,
        cancel: &CancellationToken,
    ) -> Result<CallPermit, GovernorError> {
        let state = self.state(category)?;
        let _waiting = WaiterGuard::enter(&state.waiters);

        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled(state)),
            gate = state.gate.lock() => gate,
        };

        loop {
            let released = state.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let now = Instant::now();
            let admission = state.window().admit(now, &state.policy);
            match admission {
                Admission::Admitted => {
                    if let Some(metrics) = GOVERNOR_METRICS.get() {
                        metrics.authorized_total.get_or_create(&state.labels()).inc();
                    }
                    return Ok(CallPermit {
                        state: Arc::clone(state),
                        settled: false,
                    });
                }
                Admission::WaitUntil(deadline) => {
                    let (used, reserved) = {
                        let window = state.window();
                        (window.used(), window.reserved())
                    };
                    info!(
                        event = "rate_limit_wait",
                        category,
                        wait_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                        used,
                        reserved,
                        max_calls = state.policy.max_calls,
                        "category budget exhausted; waiting for the window to reopen"
                    );
                    if let Some(metrics) = GOVERNOR_METRICS.get() {
                        metrics.waits_total.get_or_create(&state.labels()).inc();
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(self.cancelled(state)),
                        _ = &mut released => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Admission::WaitForRelease => {
                    debug!(
                        event = "rate_limit_wait_release",
                        category,
                        "category budget held by outstanding permits"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(self.cancelled(state)),
                        _ = &mut released => {}
                    }
                }
            }
        }
    }

    fn cancelled(&self, state: &CategoryState) -> GovernorError {
        state.window().clear_block();
        if let Some(metrics) = GOVERNOR_METRICS.get() {
            metrics.cancelled_total.get_or_create(&state.labels()).inc();
        }
        GovernorError::Cancelled {
            category: state.policy.key.clone(),
        }
    }

    /// Marks the permit's call as made. Equivalent to [`CallPermit::record_usage`].
    pub fn record_usage(&self, permit: CallPermit) {
        permit.record_usage();
    }

    /// Authorizes, runs `call`, and records usage when the call succeeded or the upstream
    /// rejected it for exceeding its rate limit. Any other failure returns the slot.
    pub async fn execute_with_limit<T, E, F, Fut>(
        &self,
        category: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Result<T, E>, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimitSignal,
    {
        let permit = self.authorize(category, cancel).await?;
        let result = call().await;
        match &result {
            Ok(_) => permit.record_usage(),
            Err(err) if err.is_rate_limited() => {
                warn!(
                    event = "remote_rate_limit_rejection",
                    category,
                    "upstream rejected an authorized call; recording it in the window"
                );
                if let Some(metrics) = GOVERNOR_METRICS.get() {
                    metrics
                        .remote_rejections_total
                        .get_or_create(&CategoryLabels {
                            category: category.to_string(),
                        })
                        .inc();
                }
                permit.record_usage();
            }
            Err(_) => drop(permit),
        }
        Ok(result)
    }

    pub fn status(&self, category: &str) -> Result<CategoryStatus, GovernorError> {
        let state = self.state(category)?;
        let now = Instant::now();
        let mut window = state.window();
        let next_available = match window.peek(now, &state.policy) {
            Admission::Admitted => None,
            Admission::WaitUntil(deadline) => Some(deadline),
            Admission::WaitForRelease => window.blocked_until(),
        };

        Ok(CategoryStatus {
            category: state.policy.key.clone(),
            friendly_name: state.policy.display_name().to_string(),
            used: window.used(),
            reserved: window.reserved(),
            max_calls: state.policy.max_calls,
            window_secs: state.policy.window_secs,
            penalty_secs: state.policy.penalty_secs,
            waiters: state.waiters.load(Ordering::SeqCst),
            next_available_in_ms: next_available
                .map(|at| at.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
        })
    }

    /// Status of every category, ordered by key.
    pub fn status_all(&self) -> Vec<CategoryStatus> {
        let mut keys: Vec<&String> = self.categories.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| self.status(key).ok())
            .collect()
    }
}
