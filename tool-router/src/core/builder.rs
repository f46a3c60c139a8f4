//! Router builder implementation
//!
//! Assembles a [`ToolRouter`] from tools, remote targets and resilience
//! settings. Registration errors are collected and reported by `build`, so
//! the builder can be chained freely.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as ReqwestClient;
use serde_json::Value;

use crate::config::RouterConfig;
use crate::core::{Arguments, Executor, RemoteTarget, ToolRegistration, ToolRegistry};
use crate::error::{Result, ServiceError};
use crate::flags::{FeatureFlag, FeatureFlagEngine};
use crate::health::{HealthChecker, HealthProbe, HttpHealthProbe};
use crate::local::LocalExecutorFallback;
use crate::remote::{HttpTransport, RemoteExecutorClient};
use crate::resilience::{BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryExecutor};
use crate::router::{RouterMetrics, ToolRouter};

/// A remote target and, optionally, the executor serving it
struct TargetEntry {
    target: RemoteTarget,
    executor: Option<Arc<dyn Executor>>,
}

/// Builder for [`ToolRouter`]
pub struct RouterBuilder {
    /// Tool capability table
    registry: ToolRegistry,

    /// In-process executors
    local: LocalExecutorFallback,

    /// Remote targets keyed by name
    targets: HashMap<String, TargetEntry>,

    /// Per-attempt remote timeout
    remote_timeout: Duration,

    /// Retry configuration
    retry_config: RetryConfig,

    /// Backoff policy override
    backoff_policy: Option<Arc<dyn BackoffPolicy>>,

    /// Default circuit breaker configuration
    circuit_breaker_config: CircuitBreakerConfig,

    /// Per-target circuit overrides
    target_circuits: HashMap<String, CircuitBreakerConfig>,

    /// Health record lifetime
    health_ttl: Duration,

    /// Health probe timeout
    health_timeout: Duration,

    /// Health probe override
    health_probe: Option<Arc<dyn HealthProbe>>,

    /// Shared flag engine
    flags: Arc<FeatureFlagEngine>,

    /// Bearer token used when the caller supplies none
    service_token: Option<String>,

    /// Custom headers to include with all remote requests
    custom_headers: HashMap<String, String>,

    /// User agent
    user_agent: Option<String>,

    /// Errors deferred until build
    errors: Vec<ServiceError>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        let config = RouterConfig::default();
        Self {
            registry: ToolRegistry::new(),
            local: LocalExecutorFallback::new(),
            targets: HashMap::new(),
            remote_timeout: config.remote_timeout(),
            retry_config: config.retry_config(),
            backoff_policy: None,
            circuit_breaker_config: config.circuit_breaker_config(),
            target_circuits: HashMap::new(),
            health_ttl: config.health_check_ttl(),
            health_timeout: config.health_check_timeout(),
            health_probe: None,
            flags: Arc::new(FeatureFlagEngine::new()),
            service_token: None,
            custom_headers: HashMap::new(),
            user_agent: Some(format!("tool-router/{}", env!("CARGO_PKG_VERSION"))),
            errors: Vec::new(),
        }
    }
}

impl RouterBuilder {
    /// Create a new router builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder from loaded configuration: the remote target, its
    /// flag, timeouts, retry and circuit settings.
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let target = config.remote_target()?;
        let flag = FeatureFlag::new(
            config.remote_flag_name.clone(),
            config.remote_execution_enabled,
            i64::from(config.remote_rollout_percentage),
        );

        let mut builder = Self::new()
            .remote_target(target)
            .flag(flag)
            .remote_timeout(config.remote_timeout())
            .retry_config(config.retry_config())
            .circuit_breaker(config.circuit_breaker_config())
            .health_check(config.health_check_ttl(), config.health_check_timeout());
        builder.service_token = config.service_token.clone();
        Ok(builder)
    }

    /// Register a tool
    pub fn tool(mut self, registration: ToolRegistration) -> Self {
        if let Err(e) = self.registry.register(registration) {
            self.errors.push(e);
        }
        self
    }

    /// Register a local-only tool with its executor
    pub fn local_tool(self, name: &str, executor: Arc<dyn Executor>) -> Self {
        self.tool(ToolRegistration::local(name))
            .local_executor(name, executor)
    }

    /// Attach a local executor to a registered tool
    pub fn local_executor(mut self, name: &str, executor: Arc<dyn Executor>) -> Self {
        self.local.register(name, executor);
        self
    }

    /// Attach a closure as a tool's local executor
    pub fn local_fn<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value> + Send + Sync + 'static,
    {
        self.local.register_fn(name, func);
        self
    }

    /// Add a remote target served over HTTP
    pub fn remote_target(mut self, target: RemoteTarget) -> Self {
        self.targets.insert(
            target.name.clone(),
            TargetEntry {
                target,
                executor: None,
            },
        );
        self
    }

    /// Add a remote target served by a custom executor
    pub fn remote_executor(mut self, target: RemoteTarget, executor: Arc<dyn Executor>) -> Self {
        self.targets.insert(
            target.name.clone(),
            TargetEntry {
                target,
                executor: Some(executor),
            },
        );
        self
    }

    /// Set the per-attempt remote timeout
    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Configure retry behavior
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Replace the exponential backoff schedule
    pub fn backoff_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff_policy = Some(policy);
        self
    }

    /// Configure the default circuit breaker
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    /// Override the circuit breaker of one target
    pub fn target_circuit(mut self, target: &str, config: CircuitBreakerConfig) -> Self {
        self.target_circuits.insert(target.to_string(), config);
        self
    }

    /// Configure health record lifetime and probe timeout
    pub fn health_check(mut self, ttl: Duration, probe_timeout: Duration) -> Self {
        self.health_ttl = ttl;
        self.health_timeout = probe_timeout;
        self
    }

    /// Replace the HTTP health probe
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    /// Create or replace a flag
    pub fn flag(self, flag: FeatureFlag) -> Self {
        self.flags.load_flags([flag]);
        self
    }

    /// Share an existing flag engine
    pub fn flags(mut self, engine: Arc<FeatureFlagEngine>) -> Self {
        self.flags = engine;
        self
    }

    /// Bearer token used when a caller supplies none
    pub fn service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }

    /// Add a custom header to every remote request
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    /// Set user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build an HTTP client with the configured settings
    pub fn build_http_client(&self) -> Result<ReqwestClient> {
        let mut builder = ReqwestClient::builder();

        // Set user agent
        if let Some(ref user_agent) = self.user_agent {
            builder = builder.user_agent(user_agent);
        }

        // Build default headers
        let mut headers = HeaderMap::new();
        for (key, value) in &self.custom_headers {
            let header_name = HeaderName::from_str(key)
                .map_err(|e| ServiceError::configuration(format!("Invalid header name: {}", e)))?;

            let header_value = HeaderValue::from_str(value)
                .map_err(|e| ServiceError::configuration(format!("Invalid header value: {}", e)))?;

            headers.insert(header_name, header_value);
        }
        builder = builder.default_headers(headers);

        // Build the client
        builder
            .build()
            .map_err(|e| ServiceError::configuration(format!("Failed to build HTTP client: {}", e)))
    }

    /// Build the router, checking that every tool can be executed somewhere
    pub fn build(mut self) -> Result<ToolRouter> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        for name in self.registry.names() {
            let Some(registration) = self.registry.get(&name) else {
                continue;
            };

            match &registration.remote {
                Some(binding) => {
                    if !self.targets.contains_key(&binding.target) {
                        return Err(ServiceError::configuration(format!(
                            "Tool {} is bound to unknown remote target {}",
                            name, binding.target
                        )));
                    }
                    if !self.local.has_tool(&name) {
                        log::info!("Tool {} is remote-only", name);
                    }
                }
                None if !self.local.has_tool(&name) => {
                    return Err(ServiceError::configuration(format!(
                        "Local tool {} has no executor",
                        name
                    )));
                }
                None => {}
            }
        }

        for name in self.local.tools() {
            if self.registry.get(&name).is_none() {
                log::warn!("Local executor for unregistered tool {} will never run", name);
            }
        }

        let client = self.build_http_client()?;

        let circuit_breaker = Arc::new(CircuitBreaker::new(self.circuit_breaker_config.clone()));
        for (target, config) in self.target_circuits {
            circuit_breaker.configure_target(&target, config);
        }

        let probe = self
            .health_probe
            .unwrap_or_else(|| Arc::new(HttpHealthProbe::with_client(client.clone())));
        let health = Arc::new(HealthChecker::new(probe, self.health_ttl, self.health_timeout));

        let mut remotes = HashMap::new();
        for (name, entry) in self.targets {
            let executor: Arc<dyn Executor> = match entry.executor {
                Some(executor) => executor,
                None => Arc::new(HttpTransport::new(client.clone(), entry.target.clone())),
            };

            let mut remote = RemoteExecutorClient::new(
                entry.target,
                executor,
                self.retry_config.clone(),
                self.remote_timeout,
            );
            if let Some(policy) = &self.backoff_policy {
                remote = remote.with_retry_executor(RetryExecutor::with_policy(
                    self.retry_config.clone(),
                    Arc::clone(policy),
                ));
            }
            remotes.insert(name, remote);
        }

        log::info!(
            "Tool router built with {} tools and {} remote target(s)",
            self.registry.len(),
            remotes.len()
        );

        Ok(ToolRouter {
            registry: self.registry,
            flags: self.flags,
            health,
            circuit_breaker,
            remotes,
            local: self.local,
            default_token: self.service_token,
            metrics: RouterMetrics::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn target() -> RemoteTarget {
        RemoteTarget::new("bmad-api", "http://localhost:9").unwrap()
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = RouterBuilder::new()
            .tool(ToolRegistration::remote_capable("t", "missing", "remote_execution"))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_local_tool_without_executor_rejected() {
        let err = RouterBuilder::new()
            .tool(ToolRegistration::local("t"))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_duplicate_tool_reported_at_build() {
        let err = RouterBuilder::new()
            .tool(ToolRegistration::local("t"))
            .tool(ToolRegistration::local("t"))
            .local_fn("t", |_| Ok(json!(1)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let builder = RouterBuilder::new().header("bad header", "x");
        assert!(builder.build_http_client().is_err());
    }

    #[test]
    fn test_from_config_seeds_target_and_flag() {
        let config = RouterConfig {
            remote_execution_enabled: true,
            remote_rollout_percentage: 40,
            service_token: Some("svc".to_string()),
            ..RouterConfig::default()
        };

        let router = RouterBuilder::from_config(&config)
            .unwrap()
            .tool(ToolRegistration::remote_capable("t", "bmad-api", "remote_execution"))
            .local_fn("t", |_| Ok(json!("local")))
            .build()
            .unwrap();

        let flag = router.flags().get_flag("remote_execution").unwrap();
        assert!(flag.enabled);
        assert_eq!(flag.rollout_percentage, 40);
        assert!(router.remote_client("bmad-api").is_some());
        assert_eq!(router.default_token.as_deref(), Some("svc"));
    }

    #[test]
    fn test_remote_only_tool_allowed() {
        let router = RouterBuilder::new()
            .remote_target(target())
            .tool(ToolRegistration::remote_capable("t", "bmad-api", "remote_execution"))
            .build()
            .unwrap();
        assert!(!router.local().has_tool("t"));
    }
}
