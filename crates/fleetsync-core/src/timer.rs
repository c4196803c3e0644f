// ── Deadline / poll-interval helper ──
//
// Built on `tokio::time` so paused-clock tests drive quiesce and firmware
// waits without real sleeping.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`PollSchedule`] stopped yielding ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEnd {
    Expired,
    Cancelled,
}

/// Fixed-interval polling bounded by an absolute deadline.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    deadline: Instant,
    interval: Duration,
    timeout: Duration,
}

impl PollSchedule {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            interval,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Sleep until the next poll is due, never past the deadline.
    ///
    /// Returns `Err` when the deadline had already passed or `cancel` fired
    /// while sleeping.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<(), PollEnd> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(PollEnd::Expired);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PollEnd::Cancelled),
            () = tokio::time::sleep(self.interval.min(remaining)) => Ok(()),
        }
    }
}
