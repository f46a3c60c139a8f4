//! Remote execution path
//!
//! [`HttpTransport`] performs exactly one HTTP attempt against the remote
//! executor service. [`RemoteExecutorClient`] wraps any [`Executor`] with a
//! per-attempt deadline and bounded retry of transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::{Arguments, CallContext, Executor, RemoteTarget};
use crate::error::{mapping, ErrorContext, Result, ServiceError};
use crate::resilience::{RetryConfig, RetryExecutor, RetryOutcome};

/// Header carrying the correlation id
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Header carrying the caller identity
pub const CALLER_IDENTITY_HEADER: &str = "X-Caller-Identity";

/// Result of a remote call with the number of attempts it took
pub type RemoteCall = RetryOutcome<Value>;

/// Single-attempt HTTP transport to a remote executor
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    target: RemoteTarget,
}

impl HttpTransport {
    /// Create a transport for `target` sharing `client`'s connection pool
    pub fn new(client: Client, target: RemoteTarget) -> Self {
        Self { client, target }
    }

    /// The target this transport talks to
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }
}

#[async_trait]
impl Executor for HttpTransport {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &CallContext,
    ) -> Result<Value> {
        let url = self.target.endpoint(&format!("tools/{}", tool_name))?;
        log::debug!("Sending request to {}: POST {}", self.target.name, url);

        let mut builder = self
            .client
            .post(url.clone())
            .header(REQUEST_ID_HEADER, header_value("request id", &context.request_id)?)
            .header(
                CALLER_IDENTITY_HEADER,
                header_value("caller identity", &context.caller_identity)?,
            )
            .json(&json!({ "arguments": arguments }));

        // Forwarded unmodified; the remote side owns validation
        if let Some(token) = &context.auth_token {
            let mut value = header_value("bearer token", &format!("Bearer {}", token))?;
            value.set_sensitive(true);
            builder = builder.header(AUTHORIZATION, value);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            let body: Value = response.json().await?;
            // Services may wrap the payload; bare results are accepted as-is
            return Ok(match body {
                Value::Object(mut map) if map.contains_key("result") => {
                    map.remove("result").unwrap_or(Value::Null)
                }
                other => other,
            });
        }

        let body = response.text().await.unwrap_or_default();
        log::warn!(
            "Remote executor {} answered {} ({}) for tool {}",
            self.target.name,
            status,
            mapping::classify_http_error(status),
            tool_name
        );

        let mut error_context = ErrorContext::for_service(self.target.name.clone())
            .request_id(context.request_id.clone())
            .endpoint(url.path());
        let error = mapping::map_http_error(status, &body, &mut error_context);
        Err(error.with_context(error_context))
    }
}

/// Header value from caller-supplied text. Anything outside visible ASCII is
/// a validation error raised before any I/O.
fn header_value(what: &str, raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|_| {
        ServiceError::validation(format!("{} is not a valid HTTP header value", what))
    })
}

/// Remote executor client with per-attempt timeout and bounded retry
#[derive(Clone)]
pub struct RemoteExecutorClient {
    target: RemoteTarget,
    inner: Arc<dyn Executor>,
    retry: RetryExecutor,
    default_timeout: Duration,
}

impl RemoteExecutorClient {
    /// Wrap an executor
    pub fn new(
        target: RemoteTarget,
        inner: Arc<dyn Executor>,
        retry_config: RetryConfig,
        default_timeout: Duration,
    ) -> Self {
        Self {
            target,
            inner,
            retry: RetryExecutor::new(retry_config),
            default_timeout,
        }
    }

    /// Client speaking HTTP to `target`
    pub fn http(
        client: Client,
        target: RemoteTarget,
        retry_config: RetryConfig,
        default_timeout: Duration,
    ) -> Self {
        let transport = Arc::new(HttpTransport::new(client, target.clone()));
        Self::new(target, transport, retry_config, default_timeout)
    }

    /// Replace the retry executor, e.g. to inject a backoff policy
    pub fn with_retry_executor(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Target served by this client
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Per-attempt timeout used when the caller supplies none
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Retry settings in effect
    pub fn retry_config(&self) -> &RetryConfig {
        self.retry.config()
    }

    /// Call a tool with an optional bearer token and per-attempt timeout
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        auth_token: Option<&str>,
        timeout: Option<Duration>,
    ) -> RemoteCall {
        let context = CallContext::new("", timeout.unwrap_or(self.default_timeout))
            .with_auth_token(auth_token.map(str::to_string));
        self.call_with_context(tool_name, arguments, &context).await
    }

    /// Call a tool with a prepared context. Every attempt shares its request id.
    pub async fn call_with_context(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &CallContext,
    ) -> RemoteCall {
        let inner = &self.inner;
        let target = &self.target;

        let outcome = self
            .retry
            .execute_with_attempts(|| async move {
                match tokio::time::timeout(
                    context.timeout,
                    inner.execute(tool_name, arguments, context),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::timeout(format!(
                        "Call to {} on {} exceeded {:?}",
                        tool_name, target.name, context.timeout
                    ))),
                }
            })
            .await;

        match &outcome.result {
            Ok(_) => log::debug!(
                "Remote call {} on {} succeeded after {} attempt(s)",
                tool_name,
                target.name,
                outcome.attempts
            ),
            Err(e) => log::warn!(
                "Remote call {} on {} failed after {} attempt(s): {}",
                tool_name,
                target.name,
                outcome.attempts,
                crate::util::sanitize_for_logging(&e.to_string())
            ),
        }

        outcome
    }
}

impl std::fmt::Debug for RemoteExecutorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutorClient")
            .field("target", &self.target)
            .field("retry", self.retry.config())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
