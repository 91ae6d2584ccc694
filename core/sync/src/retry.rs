//! Retry strategy with exponential backoff for transient errors.
//!
//! Blocking: the executor sleeps on the calling thread between attempts.

use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

use ledgersync_common::{Error, Result};

use crate::config::SyncConfig;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Retry settings from a sync config.
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self::new(config.max_retries)
            .with_initial_delay(Duration::from_millis(config.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(config.retry_max_delay_ms))
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
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

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs fallible calls, retrying the transient failures.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, retrying errors for which
    /// [`Error::is_retryable`] holds.
    pub fn execute<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.execute_with_condition(operation, Error::is_retryable)
    }

    /// Run `operation`, retrying errors accepted by `should_retry`.
    ///
    /// When attempts run out the last error is returned.
    pub fn execute_with_condition<F, T, C>(&self, mut operation: F, should_retry: C) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation() {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(
                            "Operation failed after {} attempts: {}",
                            attempt, err
                        );
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    sleep(delay);
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Run `operation` with default retry settings.
pub fn retry<F, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    RetryExecutor::default().execute(operation)
}

/// Run `operation` with custom retry settings.
pub fn retry_with_config<F, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    RetryExecutor::new(config).execute(operation)
}
