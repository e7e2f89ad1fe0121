//! Fixed-interval retry schedule used by exit-code and connect polling.

use std::time::Duration;

use tokio::time::Instant;

/// A polling schedule with a fixed interval and a hard deadline.
///
/// The caller drives the loop: probe, check [`expired`](Self::expired),
/// [`wait`](Self::wait), repeat. Keeping the loop in the caller lets
/// each site decide what a probe is and which error a timeout maps to.
pub(crate) struct RetrySchedule {
    interval: Duration,
    deadline: Instant,
}

impl RetrySchedule {
    pub(crate) fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + timeout,
        }
    }

    /// Whether the retry budget is spent.
    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Sleeps one interval, clamped to the deadline.
    pub(crate) async fn wait(&self) {
        let next = Instant::now() + self.interval;
        tokio::time::sleep_until(next.min(self.deadline)).await;
    }
}
