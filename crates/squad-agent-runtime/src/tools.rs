//! External tool integration surface.
//!
//! Tools (git sandboxes, repository indexers, webhooks) are consumed
//! through this narrow call interface; their implementations live outside
//! the core.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::{AgentResult, AgentRuntimeError};

/// A callable external tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str {
        ""
    }

    /// Invoke the tool.
    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Registry of tools available to an agent.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Invoke a registered tool by name.
    pub async fn call(&self, name: &str, args: serde_json::Value) -> AgentResult<serde_json::Value> {
        let tool = self
            .tools
            .get(name)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| AgentRuntimeError::UnknownTool(name.to_string()))?;
        debug!(tool = name, "tool call");
        tool.call(args)
            .await
            .map_err(|reason| AgentRuntimeError::ToolFailure {
                tool: name.to_string(),
                reason,
            })
    }

    /// Names of all registered tools.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, String> {
            Ok(args)
        }
    }

    struct Flaky;

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn call(&self, _args: serde_json::Value) -> Result<serde_json::Value, String> {
            Err("connection reset".to_string())
        }
    }

    #[tokio::test]
    async fn call_routes_to_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        let out = registry.call("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn failures_carry_tool_name() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Flaky));

        match registry.call("flaky", json!(null)).await.unwrap_err() {
            AgentRuntimeError::ToolFailure { tool, reason } => {
                assert_eq!(tool, "flaky");
                assert_eq!(reason, "connection reset");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            registry.call("missing", json!(null)).await.unwrap_err(),
            AgentRuntimeError::UnknownTool(_)
        ));
    }
}
