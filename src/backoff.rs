//! Reconnect pacing for the connection workers.

use rand::Rng;
use tokio::time::Duration;

/// Exponential backoff with random spread.
///
/// Each call to [Backoff::advance] yields the current delay (plus up to a
/// quarter of it in jitter, so a herd of workers does not reconnect in
/// lockstep) and doubles the next one, capped at `max`.
#[derive(Debug)]
pub(crate) struct Backoff {
    start: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            current: start,
            max,
        }
    }

    /// Forget accumulated failures, e.g. after a successful connect.
    pub(crate) fn reset(&mut self) {
        self.current = self.start;
    }

    pub(crate) fn advance(&mut self) -> Duration {
        let spread = self.current / 4;
        let jitter = rand::rng().random_range(0..=spread.as_nanos() as u64);
        let delay = self.current.saturating_add(Duration::from_nanos(jitter));
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }
}
