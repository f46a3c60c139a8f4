//! Core abstractions for the tool router
//!
//! This module provides the fundamental types every component shares:
//!
//! - `Executor`: the capability both execution paths implement
//! - `ToolInvocation`: one immutable call through the gateway
//! - `ExecutionOutcome`: the response produced once per invocation
//! - `RemoteTarget`: a remote service backing one or more tools
//! - `ToolRegistry`: the capability table built at startup
//! - `RouterBuilder`: builder pattern for assembling a router

pub mod builder;
pub mod registry;

pub use builder::RouterBuilder;
pub use registry::{ToolRegistration, ToolRegistry};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{ErrorKind, Result, ServiceError};

/// Tool arguments, in caller-supplied order
pub type Arguments = serde_json::Map<String, Value>;

/// Per-call information an executor may need besides the arguments
#[derive(Clone)]
pub struct CallContext {
    /// Identity of the caller
    pub caller_identity: String,

    /// Opaque bearer token, forwarded unmodified
    pub auth_token: Option<String>,

    /// Deadline for a single attempt
    pub timeout: Duration,

    /// Correlation id for logs and the remote
    pub request_id: String,
}

impl CallContext {
    /// Create a context with a fresh request id
    pub fn new(caller_identity: impl Into<String>, timeout: Duration) -> Self {
        Self {
            caller_identity: caller_identity.into(),
            auth_token: None,
            timeout,
            request_id: crate::util::generate_request_id(),
        }
    }

    /// Attach a bearer token
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("caller_identity", &self.caller_identity)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// The capability shared by remote and local execution paths.
///
/// The tool catalog itself lives behind this trait; the router never knows
/// what a tool computes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `tool_name` with `arguments`
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &CallContext,
    ) -> Result<Value>;
}

/// A single call through the gateway
#[derive(Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Registered tool name
    pub tool_name: String,

    /// Tool arguments
    pub arguments: Arguments,

    /// Caller identity used for rollout bucketing
    pub caller_identity: String,

    /// Optional bearer token supplied by the caller
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

impl ToolInvocation {
    /// Create an invocation without a token
    pub fn new(
        tool_name: impl Into<String>,
        arguments: Arguments,
        caller_identity: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            caller_identity: caller_identity.into(),
            auth_token: None,
        }
    }

    /// Attach a bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

impl fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("tool_name", &self.tool_name)
            .field("arguments", &self.arguments)
            .field("caller_identity", &self.caller_identity)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Which execution path produced an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PathUsed {
    /// Cluster-hosted executor
    Remote,
    /// In-process executor
    Local,
}

impl fmt::Display for PathUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathUsed::Remote => write!(f, "REMOTE"),
            PathUsed::Local => write!(f, "LOCAL"),
        }
    }
}

/// The response to one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the tool produced a result
    pub success: bool,

    /// Path that produced the final answer
    pub path_used: PathUsed,

    /// Tool result on success
    pub result: Option<Value>,

    /// Set whenever `success` is false, and on fallbacks to record why
    pub error_kind: Option<ErrorKind>,

    /// Wall-clock time spent in the router
    pub latency_ms: f64,

    /// Remote attempts made, including retries
    pub remote_attempts: u32,

    /// True when the local path ran because the remote path failed
    pub fallback: bool,
}

impl ExecutionOutcome {
    /// Successful outcome
    pub fn succeeded(path_used: PathUsed, result: Value) -> Self {
        Self {
            success: true,
            path_used,
            result: Some(result),
            error_kind: None,
            latency_ms: 0.0,
            remote_attempts: 0,
            fallback: false,
        }
    }

    /// Failed outcome carrying only the error classification
    pub fn failed(path_used: PathUsed, error_kind: ErrorKind) -> Self {
        Self {
            success: false,
            path_used,
            result: None,
            error_kind: Some(error_kind),
            latency_ms: 0.0,
            remote_attempts: 0,
            fallback: false,
        }
    }

    /// Build from an executor result
    pub fn from_result(path_used: PathUsed, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::succeeded(path_used, value),
            Err(err) => Self::failed(path_used, err.kind()),
        }
    }

    pub(crate) fn with_remote_attempts(mut self, attempts: u32) -> Self {
        self.remote_attempts = attempts;
        self
    }

    pub(crate) fn as_fallback(mut self, original: ErrorKind) -> Self {
        self.fallback = true;
        // Local failures keep their own kind; successes carry the remote kind
        if self.success {
            self.error_kind = Some(original);
        }
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_secs_f64() * 1000.0;
        self
    }
}

/// A remote service backing one or more tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Logical name, the key for health and circuit state
    pub name: String,

    /// Base URL of the service
    pub base_url: Url,
}

impl RemoteTarget {
    /// Create a target, validating the URL
    pub fn new(name: impl Into<String>, base_url: &str) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServiceError::configuration("Remote target name is required"));
        }

        let mut base_url = Url::parse(base_url).map_err(|e| {
            ServiceError::configuration(format!("Invalid base URL for {}: {}", name, e))
        })?;

        // Url::join replaces the last segment unless the path ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { name, base_url })
    }

    /// Resolve a path relative to the base URL
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ServiceError::configuration(format!("Invalid endpoint {}: {}", path, e)))
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.base_url)
    }
}
