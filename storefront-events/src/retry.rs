//! Bounded retry with exponential backoff.
//!
//! Used for the connect budget of the log backend and for re-running a
//! failed handler before a record is dead-lettered.
//!
//! # Example
//!
//! ```rust,no_run
//! use storefront_events::retry::{with_retry, RetryConfig};
//!
//! async fn example() -> Result<u32, String> {
//!     with_retry(&RetryConfig::connect(), "probe broker", || async {
//!         Ok(3)
//!     })
//!     .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Growth factor applied to the delay after each failure
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Budget for establishing a broker connection at startup.
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }

    /// Budget for re-running a failed handler on the log backend.
    pub fn handler() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// Run exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Same policy with a different attempt count (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute `f` until it succeeds or the attempt budget is spent.
///
/// Returns the last error when every attempt failed.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: &str, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, operation, f, |_| true).await
}

/// Like [`with_retry`], returning immediately on errors `is_retryable` rejects.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
    mut is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(operation, attempts = attempt, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!(operation, error = %e, "Error is not retryable");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(operation, attempts = attempt, error = %e, "Retry budget exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_after(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
