//! Tool capability table
//!
//! Maps tool names to what the router needs to know about them: whether they
//! can run remotely, which target and flag gate them, and which arguments
//! are required. Built once at startup; lookups are plain map reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::ToolInvocation;
use crate::error::{Result, ServiceError};

/// Remote binding of a remote-capable tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBinding {
    /// Name of the remote target serving the tool
    pub target: String,

    /// Feature flag deciding remote eligibility
    pub flag: String,
}

/// Registration of one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRegistration {
    /// Tool name
    pub name: String,

    /// Present when the tool can run remotely
    pub remote: Option<RemoteBinding>,

    /// Arguments that must be present in every invocation
    pub required_args: Vec<String>,
}

impl ToolRegistration {
    /// A tool that only runs in-process
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: None,
            required_args: Vec::new(),
        }
    }

    /// A tool that may run on `target`, gated by `flag`
    pub fn remote_capable(
        name: impl Into<String>,
        target: impl Into<String>,
        flag: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            remote: Some(RemoteBinding {
                target: target.into(),
                flag: flag.into(),
            }),
            required_args: Vec::new(),
        }
    }

    /// Declare required arguments
    pub fn require<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Whether the tool has a remote binding
    pub fn is_remote_capable(&self) -> bool {
        self.remote.is_some()
    }
}

/// Registered tools keyed by name
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolRegistration>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; names are unique
    pub fn register(&mut self, registration: ToolRegistration) -> Result<()> {
        if registration.name.trim().is_empty() {
            return Err(ServiceError::configuration("Tool name must not be empty"));
        }

        if self.tools.contains_key(&registration.name) {
            return Err(ServiceError::configuration(format!(
                "Tool already registered: {}",
                registration.name
            )));
        }

        log::debug!(
            "Registered tool {} (remote: {})",
            registration.name,
            registration
                .remote
                .as_ref()
                .map(|r| r.target.as_str())
                .unwrap_or("none")
        );
        self.tools.insert(registration.name.clone(), registration);
        Ok(())
    }

    /// Look up a tool
    pub fn get(&self, name: &str) -> Option<&ToolRegistration> {
        self.tools.get(name)
    }

    /// Registered tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check an invocation against the table before anything is routed
    pub fn validate(&self, invocation: &ToolInvocation) -> Result<&ToolRegistration> {
        let registration = self.get(&invocation.tool_name).ok_or_else(|| {
            ServiceError::validation(format!("Unknown tool: {}", invocation.tool_name))
        })?;

        if invocation.caller_identity.trim().is_empty() {
            return Err(ServiceError::validation("Caller identity is required"));
        }

        let missing: Vec<&str> = registration
            .required_args
            .iter()
            .filter(|arg| {
                invocation
                    .arguments
                    .get(arg.as_str())
                    .map_or(true, |value| value.is_null())
            })
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(ServiceError::validation(format!(
                "Missing required arguments for {}: {}",
                registration.name,
                missing.join(", ")
            )));
        }

        Ok(registration)
    }
}
