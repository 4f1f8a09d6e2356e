use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::queue::Priority;

pub const DEFAULT_TIER_MINUTES: [u64; 4] = [15, 30, 60, 120];
pub const MIN_TIER_MINUTES: i64 = 5;
pub const MAX_TIER_MINUTES: i64 = 180;

/// Scheduler period per priority tier, always within `[5, 180]` minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierIntervals {
    minutes: [u64; 4],
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_TIER_MINUTES,
        }
    }
}

impl TierIntervals {
    /// Replaces missing or out-of-range values with the tier default.
    pub fn sanitized(raw: [Option<i64>; 4]) -> Self {
        let mut minutes = DEFAULT_TIER_MINUTES;
        for (priority, value) in Priority::ALL.into_iter().zip(raw) {
            minutes[priority.index()] = sanitize_interval(priority, value);
        }
        Self { minutes }
    }

    /// Reads `SCHEDULER_P1_INTERVAL`..`SCHEDULER_P4_INTERVAL`; `overrides` win when set.
    pub fn from_env_with_overrides(overrides: [Option<i64>; 4]) -> Self {
        let mut raw = [None; 4];
        for (priority, override_value) in Priority::ALL.into_iter().zip(overrides) {
            raw[priority.index()] = override_value.or_else(|| read_env_minutes(priority));
        }
        Self::sanitized(raw)
    }

    pub fn from_env() -> Self {
        Self::from_env_with_overrides([None; 4])
    }

    pub fn minutes(&self, priority: Priority) -> u64 {
        self.minutes[priority.index()]
    }

    pub fn period(&self, priority: Priority) -> Duration {
        Duration::from_secs(self.minutes(priority) * 60)
    }
}

pub fn env_var_name(priority: Priority) -> String {
    format!("SCHEDULER_P{}_INTERVAL", priority.get())
}

fn read_env_minutes(priority: Priority) -> Option<i64> {
    let name = env_var_name(priority);
    let raw = std::env::var(&name).ok()?;
    match raw.trim().parse::<i64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                event = "tier_interval_unparseable",
                var = %name,
                value = %raw,
                "ignoring non-numeric tier interval"
            );
            None
        }
    }
}

fn sanitize_interval(priority: Priority, value: Option<i64>) -> u64 {
    let default = DEFAULT_TIER_MINUTES[priority.index()];
    match value {
        None => default,
        Some(minutes) if (MIN_TIER_MINUTES..=MAX_TIER_MINUTES).contains(&minutes) => {
            minutes as u64
        }
        Some(minutes) => {
            warn!(
                event = "tier_interval_out_of_range",
                tier = priority.get(),
                requested_minutes = minutes,
                default_minutes = default,
                min_minutes = MIN_TIER_MINUTES,
                max_minutes = MAX_TIER_MINUTES,
                "tier interval out of range; using default"
            );
            default
        }
    }
}
