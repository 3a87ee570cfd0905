//! Retry pacing with exponential backoff and jitter.
//!
//! [`RetryWaiter`] paces an outer retry loop that owns its own attempt
//! structure: the caller reports failures and asks the waiter to sleep
//! before the next pass. Jitter avoids thundering herd when many agents
//! bootstrap against the same servers at once.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default floor for the first backoff delay.
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(1);

/// Default ceiling for backoff delays.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10 * 60);

/// Cancel-aware exponential backoff.
///
/// Each recorded failure doubles the delay, starting at `min_wait` and
/// capped at `max_wait`, with a 0.5x-1.5x jitter applied per sleep.
#[derive(Clone, Debug)]
pub struct RetryWaiter {
    min_wait: Duration,
    max_wait: Duration,
    failures: u32,
}

impl RetryWaiter {
    /// Create a waiter with explicit bounds.
    pub fn new(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_wait,
            max_wait,
            failures: 0,
        }
    }

    /// Number of consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget accumulated failures after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// The delay the next [`RetryWaiter::wait`] call will use, before jitter.
    pub fn next_delay(&self) -> Duration {
        let exp = self.failures.min(31);
        let scaled = self
            .min_wait
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_wait);
        scaled.max(self.min_wait)
    }

    /// Record a failure and sleep before the next attempt.
    ///
    /// Returns `false` without sleeping out the full delay if `cancel` fires
    /// first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let base = self.next_delay();
        self.failures = self.failures.saturating_add(1);

        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(base.as_secs_f64() * jitter);

        debug!(
            failures = self.failures,
            delay_ms = delay.as_millis(),
            "backing off before retry"
        );

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for RetryWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_WAIT, DEFAULT_MAX_WAIT)
    }
}
