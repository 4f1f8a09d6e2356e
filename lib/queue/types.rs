use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EntityId;

pub type JobId = u64;

/// Sync priority tier; `1` is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const P1: Priority = Priority(1);
    pub const P2: Priority = Priority(2);
    pub const P3: Priority = Priority(3);
    pub const P4: Priority = Priority(4);
    pub const ALL: [Priority; 4] = [Self::P1, Self::P2, Self::P3, Self::P4];

    pub fn new(value: u8) -> Result<Self, QueueError> {
        if (1..=4).contains(&value) {
            Ok(Self(value))
        } else {
            Err(QueueError::InvalidPriority(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncJob {
    pub id: JobId,
    pub entity_id: EntityId,
    pub priority: Priority,
    pub requested_by: String,
    pub state: JobState,
    pub enqueued_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued { job_id: JobId },
    /// The entity already has a non-terminal job.
    Duplicate { job_id: JobId, state: JobState },
}

impl EnqueueOutcome {
    pub fn job_id(self) -> JobId {
        match self {
            Self::Enqueued { job_id } | Self::Duplicate { job_id, .. } => job_id,
        }
    }

    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub paused: bool,
    pub pending: usize,
    pub processing: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub duplicates_total: u64,
    /// Non-terminal jobs, processing first, then in dequeue order.
    pub active: Vec<SyncJob>,
    /// Most recent terminal jobs, newest first.
    pub recent: Vec<SyncJob>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("priority must be between 1 and 4, got {0}")]
    InvalidPriority(u8),

    #[error("job {0} not found")]
    UnknownJob(JobId),

    #[error("job {job_id} is {from:?} and cannot become {to:?}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
}
