//! Bounded retry for transient remote failures
//!
//! The loop is an explicit iteration over attempts; the delay between them
//! comes from an injected [`BackoffPolicy`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ServiceError};

use super::{BackoffPolicy, ExponentialBackoffPolicy};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means no retries)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_interval: Duration,

    /// Maximum backoff duration
    pub max_interval: Duration,

    /// Multiplier for backoff between retries
    pub multiplier: f64,

    /// Jitter applied to each interval (0.0-1.0)
    pub randomization_factor: f64,

    /// Maximum total time to spend retrying
    pub max_elapsed_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.2,
            max_elapsed_time: Some(Duration::from_secs(30)),
        }
    }
}

impl fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryConfig {{ max_retries: {}, initial_interval: {:?}, max_interval: {:?}, multiplier: {}, randomization_factor: {}, max_elapsed_time: {:?} }}",
            self.max_retries,
            self.initial_interval,
            self.max_interval,
            self.multiplier,
            self.randomization_factor,
            self.max_elapsed_time
        )
    }
}

/// Result of a retried operation together with how many attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result
    pub result: Result<T>,

    /// Attempts made, including the first
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Retries made after the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Executor for retry operations
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    policy: Arc<dyn BackoffPolicy>,
}

impl RetryExecutor {
    /// Create a retry executor with exponential backoff derived from `config`
    pub fn new(config: RetryConfig) -> Self {
        let policy = Arc::new(ExponentialBackoffPolicy::new(config.clone()));
        Self { config, policy }
    }

    /// Create a retry executor with a custom backoff policy
    pub fn with_policy(config: RetryConfig, policy: Arc<dyn BackoffPolicy>) -> Self {
        Self { config, policy }
    }

    /// Execute a fallible operation with retries, returning only the result
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_attempts(operation).await.result
    }

    /// Execute a fallible operation with retries and report the attempt count
    pub async fn execute_with_attempts<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut schedule = self.policy.schedule();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let err = match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(err) => err,
            };

            if !self.should_retry(&err) || attempts > self.config.max_retries {
                return RetryOutcome {
                    result: Err(annotate(err, attempts)),
                    attempts,
                };
            }

            match schedule.next_backoff() {
                Some(delay) => {
                    log::warn!(
                        "Operation failed with retryable error, retrying in {:?} (attempt {}/{}): {}",
                        delay,
                        attempts,
                        self.config.max_retries,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    // Max elapsed time exceeded
                    return RetryOutcome {
                        result: Err(annotate(err, attempts)),
                        attempts,
                    };
                }
            }
        }
    }

    /// Determine if an error should be retried
    fn should_retry(&self, error: &ServiceError) -> bool {
        error.is_retryable()
    }

    /// Get the current retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

fn annotate(err: ServiceError, attempts: u32) -> ServiceError {
    if attempts > 1 {
        err.with_context_value("attempts", attempts)
    } else {
        err
    }
}
