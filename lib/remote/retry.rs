use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Micro-retry settings for one job's fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub struct RetryTerminal<E> {
    pub error: E,
    pub attempts: u32,
    pub exhausted_retryable: bool,
}

/// Runs `op` until it succeeds, returns a non-retryable error, or attempts run out.
///
/// Backoff sleeps stop early on cancellation, in which case the last error is returned.
pub async fn run_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    key: i64,
    cancel: &CancellationToken,
    mut op: F,
    mut is_retryable: R,
) -> Result<(T, u32), RetryTerminal<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => error,
        };

        let retryable = is_retryable(&error);
        if !retryable || attempt >= max_attempts {
            return Err(RetryTerminal {
                error,
                attempts: attempt,
                exhausted_retryable: retryable,
            });
        }

        let delay = compute_backoff_delay(policy, attempt, key);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryTerminal {
                    error,
                    attempts: attempt,
                    exhausted_retryable: false,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, key: i64) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let exponential = policy
        .initial_backoff
        .saturating_mul(1u32 << shift)
        .min(policy.max_backoff);

    let jitter_cap = policy.jitter.as_millis() as u64;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        splitmix(key as u64 ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            % (jitter_cap + 1)
    };

    exponential.saturating_add(Duration::from_millis(jitter))
}

/// Deterministic per-key jitter so concurrent workers spread their retries.
fn splitmix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}
