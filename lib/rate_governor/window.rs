use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::EndpointCategory;

/// Outcome of evaluating one category's budget at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Admission {
    Admitted,
    /// Budget is full of recorded calls; the oldest leaves the window (plus penalty) here.
    WaitUntil(Instant),
    /// Budget is held entirely by outstanding permits.
    WaitForRelease,
}

/// Sliding-window state for one endpoint category.
///
/// Recorded calls stay until they are older than the window. Reserved slots belong to
/// permits that were handed out but not yet recorded or dropped.
#[derive(Debug, Default)]
pub(super) struct CallWindow {
    records: VecDeque<Instant>,
    reserved: u32,
    blocked_until: Option<Instant>,
}

impl CallWindow {
    pub(super) fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.records.front() {
            if now.saturating_duration_since(*oldest) < window {
                break;
            }
            self.records.pop_front();
        }
    }

    /// Reserves a slot when one is free, otherwise reports how long to wait.
    pub(super) fn admit(&mut self, now: Instant, policy: &EndpointCategory) -> Admission {
        let admission = self.peek(now, policy);
        match admission {
            Admission::Admitted => {
                self.reserved += 1;
                self.blocked_until = None;
            }
            Admission::WaitUntil(deadline) => self.blocked_until = Some(deadline),
            Admission::WaitForRelease => self.blocked_until = None,
        }
        admission
    }

    pub(super) fn peek(&mut self, now: Instant, policy: &EndpointCategory) -> Admission {
        self.prune(now, policy.window());
        if self.in_use() < policy.max_calls {
            return Admission::Admitted;
        }
        match self.records.front() {
            Some(oldest) => Admission::WaitUntil(*oldest + policy.window() + policy.penalty()),
            None => Admission::WaitForRelease,
        }
    }

    pub(super) fn record(&mut self, at: Instant) {
        self.reserved = self.reserved.saturating_sub(1);
        self.records.push_back(at);
    }

    pub(super) fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    pub(super) fn clear_block(&mut self) {
        self.blocked_until = None;
    }

    pub(super) fn used(&self) -> u32 {
        self.records.len() as u32
    }

    pub(super) fn reserved(&self) -> u32 {
        self.reserved
    }

    pub(super) fn blocked_until(&self) -> Option<Instant> {
        self.blocked_until
    }

    fn in_use(&self) -> u32 {
        self.used().saturating_add(self.reserved)
    }
}
