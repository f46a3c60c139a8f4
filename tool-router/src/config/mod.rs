//! Configuration management for the tool router
//!
//! This module provides utilities for loading and validating router
//! configuration, with support for environment variables. Values that are
//! present but malformed are rejected at startup rather than defaulted.

use std::collections::HashMap;
use std::env;
use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::RemoteTarget;
use crate::error::{Result, ServiceError};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Base trait for configuration providers
pub trait ConfigProvider: Send + Sync {
    /// Look up a raw string value. `Ok(None)` means the key is not set.
    fn lookup(&self, key: &str) -> Result<Option<String>>;
}

/// Extension methods for configuration providers
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a required string configuration value
    fn get_string(&self, key: &str) -> Result<String> {
        self.lookup(key)?
            .ok_or_else(|| ServiceError::configuration(format!("Configuration key not set: {}", key)))
    }

    /// Get a typed value, falling back to `default` only when the key is absent
    fn get_parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.lookup(key)? {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                ServiceError::configuration(format!("Invalid value for key {}: {} ({})", key, raw, e))
            }),
        }
    }

    /// Get a boolean configuration value with a default
    fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.lookup(key)? {
            None => Ok(default),
            Some(value) => match value.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(ServiceError::configuration(format!(
                    "Invalid boolean value for key {}: {}",
                    key, value
                ))),
            },
        }
    }

    /// Get a string configuration value with a default
    fn get_string_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.lookup(key)?.unwrap_or_else(|| default.to_string()))
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProviderExt for T {}

/// Environment variable based configuration provider
#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider {
    /// Optional prefix for environment variables
    prefix: Option<String>,
}

impl EnvConfigProvider {
    /// Create a new environment variable config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a prefix for environment variables
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Format a configuration key as an environment variable
    fn format_key(&self, key: &str) -> String {
        let mut env_key = String::new();

        if let Some(ref prefix) = self.prefix {
            env_key.push_str(prefix);
            env_key.push('_');
        }

        env_key.push_str(&key.to_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_"));
        env_key
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn lookup(&self, key: &str) -> Result<Option<String>> {
        let env_key = self.format_key(key);

        match env::var(&env_key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => Err(ServiceError::configuration(format!(
                "Environment variable is not valid unicode: {}",
                env_key
            ))),
        }
    }
}

/// In-memory config provider for testing or static configuration
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigProvider {
    values: HashMap<String, String>,
}

impl MemoryConfigProvider {
    /// Create a new empty memory config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory config provider with initial values
    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Set a configuration value
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: ToString,
    {
        self.values.insert(key.into(), value.to_string());
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn lookup(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}

/// A composite config provider that tries multiple providers in order
#[derive(Default)]
pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    /// Create a new composite config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider to the end of the chain
    pub fn add_provider(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl ConfigProvider for CompositeConfigProvider {
    fn lookup(&self, key: &str) -> Result<Option<String>> {
        for provider in &self.providers {
            if let Some(value) = provider.lookup(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Global default configuration provider
pub static DEFAULT_PROVIDER: Lazy<Arc<EnvConfigProvider>> =
    Lazy::new(|| Arc::new(EnvConfigProvider::new().with_prefix("TOOL_ROUTER")));

/// Trait for validated configuration sections
pub trait ServiceConfig: Debug + Send + Sync {
    /// Validate this configuration
    fn validate(&self) -> Result<()>;

    /// Section name
    fn service_name(&self) -> &str;
}

/// Router configuration consumed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Base URL of the remote executor service
    pub remote_base_url: String,

    /// Logical name of the remote target
    pub remote_target_name: String,

    /// Per-attempt timeout for remote calls
    pub remote_timeout_seconds: u64,

    /// Timeout for a single health probe
    pub health_check_timeout_seconds: u64,

    /// How long a health record stays authoritative
    pub health_check_ttl_seconds: u64,

    /// Consecutive failures before the circuit opens
    pub circuit_failure_threshold: u32,

    /// How long an open circuit rejects calls before a trial
    pub circuit_recovery_timeout_seconds: u64,

    /// Retries after the first remote attempt
    pub retry_max_retries: u32,

    /// First backoff interval
    pub retry_initial_interval_ms: u64,

    /// Backoff ceiling
    pub retry_max_interval_ms: u64,

    /// Flag gating remote execution
    pub remote_flag_name: String,

    /// Initial enablement of the remote flag
    pub remote_execution_enabled: bool,

    /// Initial rollout percentage of the remote flag
    pub remote_rollout_percentage: u8,

    /// Default bearer token used when a caller supplies none
    #[serde(skip_serializing)]
    pub service_token: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            remote_base_url: "http://localhost:8080".to_string(),
            remote_target_name: "bmad-api".to_string(),
            remote_timeout_seconds: 30,
            health_check_timeout_seconds: 5,
            health_check_ttl_seconds: 30,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout_seconds: 30,
            retry_max_retries: 2,
            retry_initial_interval_ms: 100,
            retry_max_interval_ms: 2000,
            remote_flag_name: "remote_execution".to_string(),
            remote_execution_enabled: false,
            remote_rollout_percentage: 0,
            service_token: None,
        }
    }
}

impl RouterConfig {
    /// Load configuration from the default (environment) provider
    pub fn from_env() -> Result<Self> {
        Self::from_provider(&**DEFAULT_PROVIDER)
    }

    /// Load configuration from a config provider
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            remote_base_url: provider.get_string("remote_base_url")?,
            remote_target_name: provider
                .get_string_or("remote_target_name", &defaults.remote_target_name)?,
            remote_timeout_seconds: provider
                .get_parsed_or("remote_timeout_seconds", defaults.remote_timeout_seconds)?,
            health_check_timeout_seconds: provider.get_parsed_or(
                "health_check_timeout_seconds",
                defaults.health_check_timeout_seconds,
            )?,
            health_check_ttl_seconds: provider
                .get_parsed_or("health_check_ttl_seconds", defaults.health_check_ttl_seconds)?,
            circuit_failure_threshold: provider
                .get_parsed_or("circuit_failure_threshold", defaults.circuit_failure_threshold)?,
            circuit_recovery_timeout_seconds: provider.get_parsed_or(
                "circuit_recovery_timeout_seconds",
                defaults.circuit_recovery_timeout_seconds,
            )?,
            retry_max_retries: provider
                .get_parsed_or("retry_max_retries", defaults.retry_max_retries)?,
            retry_initial_interval_ms: provider
                .get_parsed_or("retry_initial_interval_ms", defaults.retry_initial_interval_ms)?,
            retry_max_interval_ms: provider
                .get_parsed_or("retry_max_interval_ms", defaults.retry_max_interval_ms)?,
            remote_flag_name: provider
                .get_string_or("remote_flag_name", &defaults.remote_flag_name)?,
            remote_execution_enabled: provider
                .get_bool_or("remote_execution_enabled", defaults.remote_execution_enabled)?,
            remote_rollout_percentage: provider
                .get_parsed_or("remote_rollout_percentage", defaults.remote_rollout_percentage)?,
            service_token: provider.lookup("service_token")?.filter(|t| !t.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Per-attempt remote timeout
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_seconds)
    }

    /// Health probe timeout
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }

    /// Health record time-to-live
    pub fn health_check_ttl(&self) -> Duration {
        Duration::from_secs(self.health_check_ttl_seconds)
    }

    /// The remote target described by this configuration
    pub fn remote_target(&self) -> Result<RemoteTarget> {
        RemoteTarget::new(self.remote_target_name.clone(), &self.remote_base_url)
    }

    /// Retry settings for the remote client
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max_retries,
            initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
            max_interval: Duration::from_millis(self.retry_max_interval_ms),
            ..RetryConfig::default()
        }
    }

    /// Default circuit breaker settings
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_recovery_timeout_seconds),
        }
    }
}

impl ServiceConfig for RouterConfig {
    fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.remote_base_url).map_err(|e| {
            ServiceError::configuration(format!(
                "Invalid remote base URL {}: {}",
                self.remote_base_url, e
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ServiceError::configuration(format!(
                "Remote base URL must be http or https: {}",
                self.remote_base_url
            )));
        }

        if self.remote_target_name.trim().is_empty() {
            return Err(ServiceError::configuration("Remote target name is required"));
        }

        if self.remote_flag_name.trim().is_empty() {
            return Err(ServiceError::configuration("Remote flag name is required"));
        }

        if self.remote_timeout_seconds == 0 {
            return Err(ServiceError::configuration("Remote timeout must be positive"));
        }

        if self.health_check_timeout_seconds == 0 {
            return Err(ServiceError::configuration("Health check timeout must be positive"));
        }

        if self.health_check_ttl_seconds == 0 {
            return Err(ServiceError::configuration("Health check TTL must be positive"));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(ServiceError::configuration(
                "Circuit failure threshold must be at least 1",
            ));
        }

        if self.circuit_recovery_timeout_seconds == 0 {
            return Err(ServiceError::configuration(
                "Circuit recovery timeout must be positive",
            ));
        }

        if self.retry_initial_interval_ms > self.retry_max_interval_ms {
            return Err(ServiceError::configuration(
                "Retry initial interval exceeds the maximum interval",
            ));
        }

        if self.remote_rollout_percentage > 100 {
            return Err(ServiceError::configuration(format!(
                "Rollout percentage must be within 0..=100, got {}",
                self.remote_rollout_percentage
            )));
        }

        Ok(())
    }

    fn service_name(&self) -> &str {
        "tool-router"
    }
}
