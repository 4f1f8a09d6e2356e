use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ScanError;
use crate::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    Forward,
    Backward,
}

impl ScanDirection {
    pub fn step(self) -> i64 {
        match self {
            Self::Forward => 1,
            Self::Backward => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

impl FromStr for ScanDirection {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "forward" => Ok(Self::Forward),
            "backward" => Ok(Self::Backward),
            other => Err(format!("unknown scan direction `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Paused,
    Completed,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown scan status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    ExpectedMatchesFound,
    MissThresholdReached,
    RangeExhausted,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpectedMatchesFound => "expected_matches_found",
            Self::MissThresholdReached => "miss_threshold_reached",
            Self::RangeExhausted => "range_exhausted",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a new scan. Both thresholds are supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_id: String,
    /// Entity whose participation the scan looks for.
    pub target_entity: EntityId,
    pub range_start: i64,
    pub range_end: i64,
    pub direction: ScanDirection,
    pub expected_matches: u32,
    pub miss_threshold: u32,
}

impl ScanRequest {
    pub fn validate(&self) -> Result<(), ScanError> {
        let invalid = |reason: String| Err(ScanError::InvalidRequest(reason));
        if self.scan_id.trim().is_empty() {
            return invalid("scan id must not be empty".to_string());
        }
        if self.expected_matches == 0 {
            return invalid("expected matches must be > 0".to_string());
        }
        if self.miss_threshold == 0 {
            return invalid("miss threshold must be > 0".to_string());
        }
        let ordered = match self.direction {
            ScanDirection::Forward => self.range_start <= self.range_end,
            ScanDirection::Backward => self.range_start >= self.range_end,
        };
        if !ordered {
            return invalid(format!(
                "a {} scan cannot go from {} to {}",
                self.direction.as_str(),
                self.range_start,
                self.range_end
            ));
        }
        // Exhaustion is detected one step past the end, which must be representable.
        if self.range_end.checked_add(self.direction.step()).is_none() {
            return invalid(format!(
                "a {} scan cannot end at {}",
                self.direction.as_str(),
                self.range_end
            ));
        }
        Ok(())
    }
}

/// Durable progress of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    pub scan_id: String,
    pub target_entity: EntityId,
    pub category: String,
    pub direction: ScanDirection,
    pub range_start: i64,
    pub range_end: i64,
    /// Next position to fetch; after a match or miss streak ends the scan, the last one fetched.
    pub current_position: i64,
    pub expected_matches: u32,
    pub miss_threshold: u32,
    pub matches_found: u32,
    pub items_scanned: u64,
    pub consecutive_misses: u32,
    pub status: ScanStatus,
    pub status_reason: Option<String>,
    pub started_at_ms: u64,
    pub last_saved_at_ms: Option<u64>,
}

impl ScanCheckpoint {
    pub fn new(request: &ScanRequest, category: &str, started_at_ms: u64) -> Self {
        Self {
            scan_id: request.scan_id.clone(),
            target_entity: request.target_entity,
            category: category.to_string(),
            direction: request.direction,
            range_start: request.range_start,
            range_end: request.range_end,
            current_position: request.range_start,
            expected_matches: request.expected_matches,
            miss_threshold: request.miss_threshold,
            matches_found: 0,
            items_scanned: 0,
            consecutive_misses: 0,
            status: ScanStatus::Running,
            status_reason: None,
            started_at_ms,
            last_saved_at_ms: None,
        }
    }

    /// The request this checkpoint was started from.
    pub fn request(&self) -> ScanRequest {
        ScanRequest {
            scan_id: self.scan_id.clone(),
            target_entity: self.target_entity,
            range_start: self.range_start,
            range_end: self.range_end,
            direction: self.direction,
            expected_matches: self.expected_matches,
            miss_threshold: self.miss_threshold,
        }
    }

    pub fn in_range(&self, position: i64) -> bool {
        let (low, high) = if self.range_start <= self.range_end {
            (self.range_start, self.range_end)
        } else {
            (self.range_end, self.range_start)
        };
        (low..=high).contains(&position)
    }

    /// Match and miss limits are checked before the range bound.
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        if self.matches_found >= self.expected_matches {
            Some(TerminalReason::ExpectedMatchesFound)
        } else if self.consecutive_misses >= self.miss_threshold {
            Some(TerminalReason::MissThresholdReached)
        } else if !self.in_range(self.current_position) {
            Some(TerminalReason::RangeExhausted)
        } else {
            None
        }
    }

    pub(super) fn record_match(&mut self) {
        self.items_scanned += 1;
        self.matches_found += 1;
        self.consecutive_misses = 0;
    }

    pub(super) fn record_miss(&mut self) {
        self.items_scanned += 1;
        self.consecutive_misses += 1;
    }

    pub(super) fn advance(&mut self) {
        self.current_position += self.direction.step();
    }

    pub(super) fn set_status(&mut self, status: ScanStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
    }

    pub fn is_completed(&self) -> bool {
        self.status == ScanStatus::Completed
    }

    /// Matches per hundred scanned items.
    pub fn efficiency_percent(&self) -> f64 {
        if self.items_scanned == 0 {
            return 0.0;
        }
        f64::from(self.matches_found) * 100.0 / self.items_scanned as f64
    }
}
