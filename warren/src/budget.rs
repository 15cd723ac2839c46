//! Windowed failure accounting for consumer errors.

use std::time::{Duration, Instant};

use tracing::{debug, info};

/// A rolling error window.
///
/// Every consumer failure is recorded here. Failures separated by more than
/// the window start a fresh count; once the count reaches the threshold the
/// worker must cancel its consumer, close its connection and reconnect. The
/// count is reset again whenever a connection is (re)established.
#[derive(Debug)]
pub(crate) struct ErrorBudget {
    /// Failures recorded within the current window.
    count: usize,
    /// Failure count at which the budget trips.
    threshold: usize,
    /// Two failures further apart than this restart the count.
    window: Duration,
    /// When the most recent failure was recorded.
    last_failure: Option<Instant>,
}

impl ErrorBudget {
    /// Creates a fresh budget.
    pub(crate) fn new(threshold: usize, window: Duration) -> Self {
        Self {
            count: 0,
            threshold,
            window,
            last_failure: None,
        }
    }

    /// Records one failure at `now`. Returns true when the budget trips,
    /// i.e. the count has reached the threshold.
    pub(crate) fn record_failure(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_failure {
            let since = now.saturating_duration_since(last);
            if since > self.window {
                info!(
                    "Resetting failure window, {}s since the last failure",
                    since.as_secs()
                );
                self.count = 0;
            }
        }
        self.count += 1;
        self.last_failure = Some(now);
        self.count >= self.threshold
    }

    /// Failures recorded within the current window.
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Resets the count, as on a completed (re)connect.
    pub(crate) fn reset(&mut self) {
        debug!("Resetting the error counter");
        self.count = 0;
    }
}
