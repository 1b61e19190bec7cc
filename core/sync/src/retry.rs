//! Retry strategy with exponential backoff for failed transfers.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use fieldsync_common::{Error, Result};

/// Configuration for retry behavior.
///
/// The attempt cap is not part of the config; it comes from the persisted
/// strategy at each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a retry configuration doubling from `initial_delay`.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay slept before retry number `retry` (0-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Result of the last attempt.
    pub result: Result<T>,
    /// Attempts actually made.
    pub attempts: u32,
}

/// Retry executor for running operations with backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` up to `max_attempts` times, retrying transient errors.
    ///
    /// Sleeps between attempts but never after the last one. With
    /// `max_attempts == 0` nothing is attempted.
    pub async fn execute<F, Fut, T>(&self, max_attempts: u32, operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(max_attempts, operation, Self::is_retryable)
            .await
    }

    /// Execute with a custom retry condition. An error for which
    /// `should_retry` is false ends the sequence at once.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        max_attempts: u32,
        mut operation: F,
        should_retry: C,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = self.config.delay_for_retry(attempts - 1);
                debug!("Retrying in {:?} (attempt {} of {})", delay, attempts + 1, max_attempts);
                sleep(delay).await;
            }

            attempts += 1;
            match operation(attempts).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!("Operation succeeded after {} attempts", attempts);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) if !should_retry(&err) => {
                    warn!("Attempt {} failed, not retrying: {}", attempts, err);
                    return RetryOutcome {
                        result: Err(err),
                        attempts,
                    };
                }
                Err(err) => {
                    warn!("Attempt {} of {} failed: {}", attempts, max_attempts, err);
                    last_error = Some(err);
                }
            }
        }

        let result = match last_error {
            Some(err) => Err(err),
            None => Err(Error::InvalidInput("No attempts allowed".to_string())),
        };
        RetryOutcome { result, attempts }
    }

    /// Losing the network is not a transfer failure; the run aborts instead.
    pub fn is_retryable(err: &Error) -> bool {
        !err.is_connectivity()
    }
}
