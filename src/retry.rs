//! Shared retry-with-backoff logic for manifest and segment downloads.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::MonitorError;

/// Exponential backoff policy with an overall elapsed budget.
///
/// The delay for attempt `n` is `initial_delay * 2^n` capped at `max_delay`,
/// plus optional jitter of up to half the initial delay. Once the elapsed
/// time plus the next delay would exceed `max_elapsed`, the last error is
/// surfaced instead of sleeping again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry. Doubles on every subsequent attempt.
    pub initial_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Total budget across all attempts, including backoff sleeps.
    /// `None` retries indefinitely.
    pub max_elapsed: Option<Duration>,
    /// When true, adds random jitter of [0, initial_delay/2) to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            max_elapsed: Some(Duration::from_secs(10)),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries. Useful for tests and one-shot probes.
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_elapsed: Some(Duration::ZERO),
            jitter: false,
        }
    }

    /// Compute the delay for a given attempt number (0-indexed).
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt with a checked shift so large attempt numbers saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let jitter_range_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::rng().random_range(0..jitter_range_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Whether another retry fits into the elapsed budget after sleeping
    /// `delay`.
    pub(crate) fn within_budget(&self, started: Instant, delay: Duration) -> bool {
        match self.max_elapsed {
            Some(budget) => started.elapsed() + delay < budget,
            None => true,
        }
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// Permanent errors (see [`MonitorError::is_retryable`]) are returned
/// immediately; transient errors sleep and retry until the policy's elapsed
/// budget runs out. Cancellation interrupts both the operation's backoff
/// sleeps and the loop itself.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, MonitorError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MonitorError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                if !policy.within_budget(started, delay) {
                    return Err(err);
                }
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(MonitorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
