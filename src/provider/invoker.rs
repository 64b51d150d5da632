//! Bounded-retry wrapper around a single external provider call.
//!
//! This is the transport-level retry layer: it absorbs transient failures
//! (rate limits, 5xx, dropped connections) inside one logical call. The
//! attempt-level regeneration loop in the orchestrator has its own,
//! independent budget — the two are deliberately never folded together.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::ProviderError;

/// Default total call attempts per invocation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry; doubles after every retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Retry budget and backoff schedule for one provider call.
///
/// The schedule is pure: `delay_for(n)` is the wait after the n-th failed
/// attempt (1-based), and `total_backoff()` bounds the worst-case time
/// spent sleeping at `initial_delay * (2^(max_retries-1) - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total call attempts, including the first (must be >= 1).
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_delay,
        }
    }

    /// Backoff to wait after the `attempt`-th failure (1-based):
    /// `initial_delay * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Sum of all backoff waits when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_retries).map(|a| self.delay_for(a)).sum()
    }
}

/// Execute `op` with bounded retries and exponential backoff.
///
/// `op` receives the 1-based attempt number. On success the response is
/// returned immediately. On failure: non-retryable errors and final-attempt
/// errors propagate unchanged — no success is ever synthesized. Retryable
/// errors with budget remaining sleep the scheduled backoff and try again.
///
/// Backoff uses `tokio::time::sleep`, so waiting never blocks other
/// assets' loops.
pub async fn invoke<T, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, ProviderError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max = policy.max_retries.max(1);
    let mut attempt = 1u32;

    loop {
        match op(attempt).await {
            Ok(response) => return Ok(response),
            Err(err) if !err.retryable || attempt >= max => {
                if attempt >= max && err.retryable {
                    warn!(kind = %err.kind, attempts = attempt, "retry budget exhausted");
                }
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    kind = %err.kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
