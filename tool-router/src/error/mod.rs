//! Error handling for the tool router
//!
//! This module provides the error taxonomy used across the routing core:
//! - Categorizes errors by kind (transport, auth, rate limit, etc.)
//! - Decides which errors are retried and which count against a circuit
//! - Adds rich context to errors for logging without leaking it to callers
//! - Provides convenient Result type alias

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mapping;

/// Result type for tool router operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Flat, serializable classification of a failure.
///
/// This is the only error information that crosses the invocation boundary;
/// messages and context stay in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS or other transport failure
    Transport,
    /// The call did not complete within its deadline
    Timeout,
    /// Authentication or authorization rejected by the remote
    Auth,
    /// The remote asked us to slow down
    RateLimit,
    /// Caller-supplied arguments are invalid
    Validation,
    /// The remote answered with a non-success status
    Remote,
    /// The in-process executor failed
    LocalExecution,
    /// The circuit for the target is open
    CircuitOpen,
    /// The target reported itself unhealthy
    Unavailable,
    /// Configuration is missing or malformed
    Configuration,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::Transport,
        ErrorKind::Timeout,
        ErrorKind::Auth,
        ErrorKind::RateLimit,
        ErrorKind::Validation,
        ErrorKind::Remote,
        ErrorKind::LocalExecution,
        ErrorKind::CircuitOpen,
        ErrorKind::Unavailable,
        ErrorKind::Configuration,
        ErrorKind::Internal,
    ];

    /// Snake-case name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Validation => "validation",
            ErrorKind::Remote => "remote",
            ErrorKind::LocalExecution => "local_execution",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a failure of this kind is safe to retry against the remote
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::RateLimit
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ServiceError::validation(format!("Unknown error kind: {}", s)))
    }
}

/// Main error type for the tool router
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Network or connection errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Deadline exceeded
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Authentication or authorization errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Caller-supplied argument errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Non-success answer from the remote executor
    #[error("Remote error: {0}")]
    Remote(String),

    /// Failure inside the in-process executor
    #[error("Local execution error: {0}")]
    LocalExecution(String),

    /// Circuit breaker open errors
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Target is unhealthy
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Errors with additional context
    #[error("{inner}")]
    WithContext {
        inner: Box<ServiceError>,
        context: ErrorContext,
    },
}

impl ServiceError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        ServiceError::Transport(message.into())
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        ServiceError::Timeout(message.into())
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        ServiceError::Auth(message.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(message: impl Into<String>) -> Self {
        ServiceError::RateLimit(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    /// Create a remote error
    pub fn remote(message: impl Into<String>) -> Self {
        ServiceError::Remote(message.into())
    }

    /// Create a local execution error
    pub fn local_execution(message: impl Into<String>) -> Self {
        ServiceError::LocalExecution(message.into())
    }

    /// Create a circuit open error
    pub fn circuit_open(message: impl Into<String>) -> Self {
        ServiceError::CircuitOpen(message.into())
    }

    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        ServiceError::Unavailable(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        ServiceError::Configuration(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal(message.into())
    }

    /// Build an error of the given kind with a message
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transport => ServiceError::Transport(message),
            ErrorKind::Timeout => ServiceError::Timeout(message),
            ErrorKind::Auth => ServiceError::Auth(message),
            ErrorKind::RateLimit => ServiceError::RateLimit(message),
            ErrorKind::Validation => ServiceError::Validation(message),
            ErrorKind::Remote => ServiceError::Remote(message),
            ErrorKind::LocalExecution => ServiceError::LocalExecution(message),
            ErrorKind::CircuitOpen => ServiceError::CircuitOpen(message),
            ErrorKind::Unavailable => ServiceError::Unavailable(message),
            ErrorKind::Configuration => ServiceError::Configuration(message),
            ErrorKind::Internal => ServiceError::Internal(message),
        }
    }

    /// Add context to an existing error
    pub fn with_context(self, context: ErrorContext) -> Self {
        ServiceError::WithContext {
            inner: Box::new(self),
            context,
        }
    }

    /// Add a single context key/value to an existing error
    pub fn with_context_value(self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        match self {
            ServiceError::WithContext { inner, mut context } => {
                context.add(key, value);
                ServiceError::WithContext { inner, context }
            }
            other => {
                let mut context = ErrorContext::new();
                context.add(key, value);
                other.with_context(context)
            }
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Transport(_) => ErrorKind::Transport,
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::Auth(_) => ErrorKind::Auth,
            ServiceError::RateLimit(_) => ErrorKind::RateLimit,
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::Remote(_) => ErrorKind::Remote,
            ServiceError::LocalExecution(_) => ErrorKind::LocalExecution,
            ServiceError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            ServiceError::Unavailable(_) => ErrorKind::Unavailable,
            ServiceError::Configuration(_) => ErrorKind::Configuration,
            ServiceError::Internal(_) => ErrorKind::Internal,
            ServiceError::WithContext { inner, .. } => inner.kind(),
        }
    }

    /// Get the HTTP status code if available
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ServiceError::WithContext { context, inner } => {
                context.status_code.or_else(|| inner.status_code())
            }
            _ => None,
        }
    }

    /// Get a context value if present
    pub fn context_value(&self, key: &str) -> Option<&str> {
        match self {
            ServiceError::WithContext { context, inner } => context
                .data
                .get(key)
                .map(String::as_str)
                .or_else(|| inner.context_value(key)),
            _ => None,
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Check if this is a permanent error (not retryable)
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// Whether a remote-path failure of this kind should be reported to the
    /// circuit breaker. Validation never reaches the remote, so it never counts.
    pub fn counts_against_circuit(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Configuration | ErrorKind::CircuitOpen
        )
    }
}

/// Error context information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component or target that generated the error
    pub service: String,

    /// When the error was created
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,

    /// HTTP status code if applicable
    pub status_code: Option<u16>,

    /// Request ID for tracing
    pub request_id: Option<String>,

    /// Endpoint that was called
    pub endpoint: Option<String>,

    /// Additional context data
    pub data: HashMap<String, String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            service: "unknown".to_string(),
            timestamp: Some(chrono::Utc::now()),
            status_code: None,
            request_id: None,
            endpoint: None,
            data: HashMap::new(),
        }
    }
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new error context for a specific service
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    /// Add an HTTP status code
    pub fn status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Add a request ID
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Add an endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Add a context value
    pub fn add<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.data.insert(key.into(), value.to_string());
    }

    /// Add a context value and return self (builder pattern)
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.add(key, value);
        self
    }
}

/// Convert reqwest errors to ServiceError
impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        let mut context = ErrorContext::for_service("http_client");
        if let Some(url) = err.url() {
            context = context.endpoint(url.path());
        }

        // Builder errors come from request construction, never from the remote
        let service_error = if err.is_builder() {
            ServiceError::configuration(format!("Invalid request: {}", err))
        } else if err.is_timeout() {
            ServiceError::timeout(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            ServiceError::transport(format!("Connection error: {}", err))
        } else if err.is_redirect() {
            ServiceError::transport(format!("Too many redirects: {}", err))
        } else if err.is_decode() || err.is_body() {
            ServiceError::remote(format!("Response decode error: {}", err))
        } else if err.is_request() {
            ServiceError::transport(format!("Request failed: {}", err))
        } else {
            ServiceError::internal(format!("HTTP client error: {}", err))
        };

        // Add status code if available
        if let Some(status) = err.status() {
            service_error.with_context(context.status_code(status.as_u16()))
        } else {
            service_error.with_context(context)
        }
    }
}

/// Convert serde_json errors to ServiceError
impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::remote(format!("JSON error: {}", err))
            .with_context(ErrorContext::for_service("json"))
    }
}
