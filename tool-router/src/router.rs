//! Routing of tool invocations between the remote and local paths
//!
//! Every invocation runs through the same gates in order: registry
//! validation, remote capability, feature flag, circuit breaker, health.
//! The first gate that declines sends the call to the local executor. A
//! remote failure after all gates passed is reported to the circuit breaker
//! and answered from the local executor, tagged with the remote error kind.
//!
//! Tools without a local executor are remote-only: when a gate declines or
//! the remote fails they surface a handled `REMOTE` failure instead of
//! falling back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{
    Arguments, CallContext, ExecutionOutcome, Executor, PathUsed, ToolInvocation, ToolRegistry,
};
use crate::core::registry::RemoteBinding;
use crate::error::{ErrorKind, ServiceError};
use crate::flags::FeatureFlagEngine;
use crate::health::HealthChecker;
use crate::local::LocalExecutorFallback;
use crate::remote::RemoteExecutorClient;
use crate::resilience::CircuitBreaker;
use crate::util::{measure_time_async, sanitize_for_logging, truncate_string};

/// Longest error detail written to a log line
const MAX_LOGGED_ERROR: usize = 200;

/// Routing counters
#[derive(Debug, Default)]
pub struct RouterMetrics {
    remote_successes: AtomicU64,
    remote_failures: AtomicU64,
    fallbacks: AtomicU64,
    local_direct: AtomicU64,
    validation_rejections: AtomicU64,
}

/// Point-in-time copy of [`RouterMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Calls answered by the remote path
    pub remote_successes: u64,

    /// Remote calls that failed after retries
    pub remote_failures: u64,

    /// Local executions triggered by a remote failure
    pub fallbacks: u64,

    /// Calls sent to the local path by a gate, without remote I/O
    pub local_direct: u64,

    /// Invocations rejected before routing
    pub validation_rejections: u64,
}

impl RouterMetrics {
    /// Current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            remote_successes: self.remote_successes.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            local_direct: self.local_direct.load(Ordering::Relaxed),
            validation_rejections: self.validation_rejections.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why a call went local without touching the remote
#[derive(Debug, Clone, Copy)]
enum Bypass {
    NotRemoteCapable,
    FlagIneligible,
    CircuitOpen,
    Unhealthy,
}

impl Bypass {
    fn as_str(&self) -> &'static str {
        match self {
            Bypass::NotRemoteCapable => "not remote-capable",
            Bypass::FlagIneligible => "flag ineligible",
            Bypass::CircuitOpen => "circuit open",
            Bypass::Unhealthy => "target unhealthy",
        }
    }

    /// Error kind reported when a remote-only tool is declined
    fn error_kind(&self) -> ErrorKind {
        match self {
            Bypass::CircuitOpen => ErrorKind::CircuitOpen,
            _ => ErrorKind::Unavailable,
        }
    }
}

/// Orchestrates flag, circuit and health decisions and the fallback protocol
pub struct ToolRouter {
    pub(crate) registry: ToolRegistry,
    pub(crate) flags: Arc<FeatureFlagEngine>,
    pub(crate) health: Arc<HealthChecker>,
    pub(crate) circuit_breaker: Arc<CircuitBreaker>,
    pub(crate) remotes: HashMap<String, RemoteExecutorClient>,
    pub(crate) local: LocalExecutorFallback,
    pub(crate) default_token: Option<String>,
    pub(crate) metrics: RouterMetrics,
}

impl ToolRouter {
    /// Invoke a tool on behalf of a caller
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: Arguments,
        caller_identity: &str,
    ) -> ExecutionOutcome {
        self.dispatch(ToolInvocation::new(tool_name, arguments, caller_identity))
            .await
    }

    /// Route one invocation. Never panics and never returns internal detail;
    /// failures are reported through `error_kind`.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> ExecutionOutcome {
        let (outcome, elapsed) = measure_time_async(|| self.route(&invocation)).await;
        let outcome = outcome.with_latency(elapsed);

        let target = self
            .registry
            .get(&invocation.tool_name)
            .and_then(|registration| registration.remote.as_ref())
            .map(|binding| binding.target.as_str())
            .unwrap_or("-");
        let error_kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("none");

        tracing::info!(
            tool = %invocation.tool_name,
            remote_target = %target,
            path = %outcome.path_used,
            success = outcome.success,
            error_kind = %error_kind,
            fallback = outcome.fallback,
            remote_attempts = outcome.remote_attempts,
            latency_ms = outcome.latency_ms,
            "tool invocation routed"
        );
        log::debug!(
            "{} -> {} via {} (success={}, error_kind={}, {:.1}ms)",
            invocation.tool_name,
            outcome.path_used,
            target,
            outcome.success,
            error_kind,
            outcome.latency_ms
        );

        outcome
    }

    async fn route(&self, invocation: &ToolInvocation) -> ExecutionOutcome {
        let registration = match self.registry.validate(invocation) {
            Ok(registration) => registration,
            Err(e) => {
                RouterMetrics::incr(&self.metrics.validation_rejections);
                log::warn!("Rejected invocation of {}: {}", invocation.tool_name, e);
                return ExecutionOutcome::failed(PathUsed::Local, ErrorKind::Validation);
            }
        };

        let has_local = self.local.has_tool(&invocation.tool_name);

        let binding = match &registration.remote {
            Some(binding) => binding,
            None => return self.bypass(invocation, Bypass::NotRemoteCapable).await,
        };

        let client = match self.remotes.get(&binding.target) {
            Some(client) => client,
            None => {
                log::error!(
                    "Tool {} is bound to unknown target {}",
                    invocation.tool_name,
                    binding.target
                );
                return if has_local {
                    self.bypass(invocation, Bypass::NotRemoteCapable).await
                } else {
                    ExecutionOutcome::failed(PathUsed::Remote, ErrorKind::Configuration)
                };
            }
        };

        if !self
            .flags
            .is_remote_eligible(&binding.flag, &invocation.caller_identity)
        {
            return self
                .decline(invocation, has_local, Bypass::FlagIneligible)
                .await;
        }

        let permit = match self.circuit_breaker.try_acquire(&binding.target) {
            Ok(permit) => permit,
            Err(e) => {
                log::debug!("{}", e);
                return self.decline(invocation, has_local, Bypass::CircuitOpen).await;
            }
        };

        if !self.health.is_healthy(client.target()).await {
            // Permit dropped unrecorded: neither success nor failure
            drop(permit);
            return self.decline(invocation, has_local, Bypass::Unhealthy).await;
        }

        let context = self.call_context(invocation, client);
        let call = client
            .call_with_context(&invocation.tool_name, &invocation.arguments, &context)
            .await;
        let attempts = call.attempts;

        match call.result {
            Ok(value) => {
                permit.record_success();
                RouterMetrics::incr(&self.metrics.remote_successes);
                ExecutionOutcome::succeeded(PathUsed::Remote, value).with_remote_attempts(attempts)
            }
            Err(e) => {
                if e.counts_against_circuit() {
                    permit.record_failure();
                } else {
                    drop(permit);
                }
                RouterMetrics::incr(&self.metrics.remote_failures);
                self.log_remote_failure(invocation, binding, &e);

                if has_local {
                    RouterMetrics::incr(&self.metrics.fallbacks);
                    self.run_local(invocation)
                        .await
                        .as_fallback(e.kind())
                        .with_remote_attempts(attempts)
                } else {
                    ExecutionOutcome::failed(PathUsed::Remote, e.kind())
                        .with_remote_attempts(attempts)
                }
            }
        }
    }

    async fn decline(
        &self,
        invocation: &ToolInvocation,
        has_local: bool,
        reason: Bypass,
    ) -> ExecutionOutcome {
        if has_local {
            return self.bypass(invocation, reason).await;
        }

        log::warn!(
            "Remote-only tool {} unavailable: {}",
            invocation.tool_name,
            reason.as_str()
        );
        ExecutionOutcome::failed(PathUsed::Remote, reason.error_kind())
    }

    async fn bypass(&self, invocation: &ToolInvocation, reason: Bypass) -> ExecutionOutcome {
        log::debug!(
            "Routing {} locally: {}",
            invocation.tool_name,
            reason.as_str()
        );
        RouterMetrics::incr(&self.metrics.local_direct);
        self.run_local(invocation).await
    }

    async fn run_local(&self, invocation: &ToolInvocation) -> ExecutionOutcome {
        let context = CallContext::new(invocation.caller_identity.clone(), self.local_timeout())
            .with_auth_token(invocation.auth_token.clone());

        let result = self
            .local
            .execute(&invocation.tool_name, &invocation.arguments, &context)
            .await;

        if let Err(e) = &result {
            log::error!(
                "Local execution of {} failed: {}",
                invocation.tool_name,
                truncate_string(&sanitize_for_logging(&e.to_string()), MAX_LOGGED_ERROR)
            );
        }

        ExecutionOutcome::from_result(PathUsed::Local, result)
    }

    fn call_context(
        &self,
        invocation: &ToolInvocation,
        client: &RemoteExecutorClient,
    ) -> CallContext {
        let token = invocation
            .auth_token
            .clone()
            .or_else(|| self.default_token.clone());
        CallContext::new(invocation.caller_identity.clone(), client.default_timeout())
            .with_auth_token(token)
    }

    fn local_timeout(&self) -> std::time::Duration {
        self.remotes
            .values()
            .map(RemoteExecutorClient::default_timeout)
            .max()
            .unwrap_or(std::time::Duration::from_secs(30))
    }

    fn log_remote_failure(
        &self,
        invocation: &ToolInvocation,
        binding: &RemoteBinding,
        error: &ServiceError,
    ) {
        log::warn!(
            "Remote execution of {} on {} failed ({}): {}",
            invocation.tool_name,
            binding.target,
            error.kind(),
            truncate_string(&sanitize_for_logging(&error.to_string()), MAX_LOGGED_ERROR)
        );
    }

    /// Feature flag engine, for administrative updates
    pub fn flags(&self) -> &Arc<FeatureFlagEngine> {
        &self.flags
    }

    /// Circuit breaker shared by all remote targets
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Health checker shared by all remote targets
    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    /// Tool capability table
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Local executors
    pub fn local(&self) -> &LocalExecutorFallback {
        &self.local
    }

    /// Remote client for a target
    pub fn remote_client(&self, target: &str) -> Option<&RemoteExecutorClient> {
        self.remotes.get(target)
    }

    /// Routing counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for ToolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRouter")
            .field("tools", &self.registry.names())
            .field("targets", &self.remotes.keys().collect::<Vec<_>>())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}
