//! # Tool Router
//!
//! Routes named tool invocations to a remote executor service or to an
//! in-process executor, and keeps the calls flowing when the remote path
//! degrades.
//!
//! This crate provides:
//!
//! - Gradual rollout of the remote path through feature flags
//! - Cached, single-flight health probing of remote targets
//! - A per-target circuit breaker and bounded retry with backoff
//! - A router implementing the fallback protocol
//! - A recovery harness that validates all of the above under injected faults
//!
//! ## Architecture
//!
//! - `Executor`: the capability both execution paths implement
//! - `FeatureFlagEngine`: decides remote eligibility per caller
//! - `HealthChecker`: TTL-cached health signal per remote target
//! - `CircuitBreaker`: CLOSED / OPEN / HALF_OPEN per remote target
//! - `RemoteExecutorClient`: remote calls with timeout and retry
//! - `LocalExecutorFallback`: in-process executors keyed by tool name
//! - `ToolRouter`: consults the deciders and picks a path
//! - `RecoveryTestHarness`: fault injection and strategy validation

pub mod core;
pub use crate::core::{
    Arguments, CallContext, ExecutionOutcome, Executor, PathUsed, RemoteTarget, RouterBuilder,
    ToolInvocation, ToolRegistration, ToolRegistry,
};

// Re-export error handling
pub mod error;
pub use error::{ErrorContext, ErrorKind, Result, ServiceError};

// Re-export configuration management
pub mod config;
pub use config::{ConfigProvider, RouterConfig, ServiceConfig};

pub mod flags;
pub use flags::{FeatureFlag, FeatureFlagEngine};

pub mod health;
pub use health::{HealthChecker, HealthProbe, HealthRecord, HttpHealthProbe};

// Re-export resilience patterns
pub mod resilience;
pub use resilience::{
    BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryExecutor,
};

pub mod remote;
pub use remote::{HttpTransport, RemoteCall, RemoteExecutorClient};

pub mod local;
pub use local::{FnExecutor, LocalExecutorFallback};

pub mod router;
pub use router::{MetricsSnapshot, ToolRouter};

pub mod harness;
pub use harness::{
    CaseResult, ExpectedOutcome, FaultInjectingExecutor, RecoveryStrategy, RecoveryTestCase,
    RecoveryTestHarness, SuiteReport,
};

// Utility module for common functionality
pub mod util;

#[cfg(test)]
mod tests;

/// Create a new default router builder
pub fn router() -> RouterBuilder {
    RouterBuilder::new()
}

/// Create a router builder seeded from `TOOL_ROUTER_*` environment variables
pub fn router_from_env() -> Result<RouterBuilder> {
    let config = RouterConfig::from_env()?;
    RouterBuilder::from_config(&config)
}
