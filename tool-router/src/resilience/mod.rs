//! Resilience patterns for the remote path
//!
//! This module provides:
//! - Bounded retry with a pluggable backoff policy
//! - A per-target circuit breaker with RAII call permits

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};

use std::fmt::Debug;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;

/// Produces the delay schedule for one retry sequence.
///
/// A fresh schedule is taken for every call, so policies themselves stay
/// stateless and can be shared between concurrent calls.
pub trait BackoffPolicy: Debug + Send + Sync {
    /// Start a new schedule
    fn schedule(&self) -> Box<dyn Backoff + Send>;
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    config: RetryConfig,
}

impl ExponentialBackoffPolicy {
    /// Create a policy from retry settings
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn schedule(&self) -> Box<dyn Backoff + Send> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_interval,
            max_interval: self.config.max_interval,
            multiplier: self.config.multiplier,
            randomization_factor: self.config.randomization_factor,
            max_elapsed_time: self.config.max_elapsed_time,
            ..ExponentialBackoff::default()
        };
        // Struct-literal construction leaves current_interval at the crate default
        backoff.reset();
        Box::new(backoff)
    }
}

/// Same delay before every retry; mostly useful in tests
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoffPolicy {
    delay: Duration,
}

impl FixedBackoffPolicy {
    /// Wait `delay` between attempts
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Retry immediately
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl BackoffPolicy for FixedBackoffPolicy {
    fn schedule(&self) -> Box<dyn Backoff + Send> {
        Box::new(Constant::new(self.delay))
    }
}
