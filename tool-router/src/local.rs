//! In-process execution path

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Arguments, CallContext, Executor};
use crate::error::{Result, ServiceError};

/// Adapts a synchronous closure to [`Executor`]
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Arguments) -> Result<Value> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Executor for FnExecutor<F>
where
    F: Fn(&Arguments) -> Result<Value> + Send + Sync,
{
    async fn execute(
        &self,
        _tool_name: &str,
        arguments: &Arguments,
        _context: &CallContext,
    ) -> Result<Value> {
        (self.func)(arguments)
    }
}

/// Local executors keyed by tool name
#[derive(Default, Clone)]
pub struct LocalExecutorFallback {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl LocalExecutorFallback {
    /// Create an empty fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a tool, replacing any previous one
    pub fn register(&mut self, tool_name: impl Into<String>, executor: Arc<dyn Executor>) {
        let tool_name = tool_name.into();
        if self.executors.insert(tool_name.clone(), executor).is_some() {
            log::warn!("Local executor for {} replaced", tool_name);
        }
    }

    /// Register a closure as a tool's executor
    pub fn register_fn<F>(&mut self, tool_name: impl Into<String>, func: F)
    where
        F: Fn(&Arguments) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(tool_name, Arc::new(FnExecutor::new(func)));
    }

    /// Whether a local executor exists for the tool
    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.executors.contains_key(tool_name)
    }

    /// Tools with a local executor, sorted
    pub fn tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.executors.keys().cloned().collect();
        tools.sort();
        tools
    }
}

#[async_trait]
impl Executor for LocalExecutorFallback {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &CallContext,
    ) -> Result<Value> {
        let executor = self.executors.get(tool_name).ok_or_else(|| {
            ServiceError::local_execution(format!("No local executor for tool {}", tool_name))
        })?;

        executor
            .execute(tool_name, arguments, context)
            .await
            .map_err(|e| match e {
                ServiceError::LocalExecution(_) => e,
                other => {
                    log::warn!("Local execution of {} failed: {}", tool_name, other);
                    ServiceError::local_execution(format!("{} failed locally: {}", tool_name, other))
                }
            })
    }
}

impl fmt::Debug for LocalExecutorFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutorFallback")
            .field("tools", &self.tools())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::time::Duration;

    fn context() -> CallContext {
        CallContext::new("user-1", Duration::from_secs(1))
    }

    fn fallback() -> LocalExecutorFallback {
        let mut fallback = LocalExecutorFallback::new();
        fallback.register_fn("echo", |args| Ok(Value::Object(args.clone())));
        fallback.register_fn("broken", |_| Err(ServiceError::internal("disk full")));
        fallback
    }

    #[tokio::test]
    async fn test_executes_registered_tool() {
        let mut args = Arguments::new();
        args.insert("q".to_string(), json!("rust"));

        let result = fallback().execute("echo", &args, &context()).await.unwrap();
        assert_eq!(result, json!({"q": "rust"}));
    }

    #[tokio::test]
    async fn test_failures_become_local_execution_errors() {
        let err = fallback()
            .execute("broken", &Arguments::new(), &context())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalExecution);
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let err = fallback()
            .execute("absent", &Arguments::new(), &context())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalExecution);
    }

    #[test]
    fn test_tools_listing() {
        let fallback = fallback();
        assert!(fallback.has_tool("echo"));
        assert!(!fallback.has_tool("absent"));
        assert_eq!(fallback.tools(), vec!["broken", "echo"]);
    }
}
