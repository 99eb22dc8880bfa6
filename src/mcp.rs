//! Server-side tool execution for the Responses agent loop.
//!
//! A [`ToolExecutor`] is anything that can list and run tools; how it talks
//! to its server is its own business. Executors are registered by server
//! name and attached to models through `mcp.servers` in the model YAML.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use openai_protocol::common::{Function, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::model::ModelConfig;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),
}

/// A tool as advertised by its server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_tools(&self) -> McpResult<Vec<ToolInfo>>;

    /// Run `name` with a JSON object of arguments; returns the textual output.
    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<String>;
}

/// Executors by server name.
#[derive(Default)]
pub struct McpRegistry {
    servers: DashMap<String, Arc<dyn ToolExecutor>>,
}

impl fmt::Debug for McpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("McpRegistry").field("servers", &names).finish()
    }
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        let server = server.into();
        debug!(server = %server, "Registered tool executor");
        self.servers.insert(server, executor);
    }

    pub fn get(&self, server: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.servers.get(server).map(|e| e.value().clone())
    }

    /// Collect the tools of every server the model lists. Servers that are
    /// not registered or fail to list are skipped with a warning.
    pub async fn toolset_for(&self, config: &ModelConfig) -> Toolset {
        let mut toolset = Toolset::default();
        for server in &config.mcp.servers {
            let Some(executor) = self.get(server) else {
                warn!(model = %config.name, server = %server, "Model references unknown tool server");
                continue;
            };
            match executor.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        if toolset.owners.contains_key(&tool.name) {
                            warn!(server = %server, tool = %tool.name, "Tool name already provided by another server");
                            continue;
                        }
                        toolset.owners.insert(tool.name.clone(), executor.clone());
                        toolset.tools.push(tool);
                    }
                }
                Err(e) => warn!(server = %server, error = %e, "Failed to list tools"),
            }
        }
        toolset
    }
}

/// Tools available to one request, with the executor owning each.
#[derive(Default, Clone)]
pub struct Toolset {
    tools: Vec<ToolInfo>,
    owners: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl fmt::Debug for Toolset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.iter().map(|t| &t.name)).finish()
    }
}

impl Toolset {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn owns(&self, name: &str) -> bool {
        self.owners.contains_key(name)
    }

    /// The tools as function definitions offered to the model.
    pub fn as_tools(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|t| Tool {
                tool_type: "function".to_string(),
                function: Function {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                    strict: None,
                },
            })
            .collect()
    }

    /// Execute a call whose `arguments` is the JSON string the model produced.
    pub async fn call(&self, name: &str, arguments: &str) -> McpResult<String> {
        let executor = self
            .owners
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        let arguments: Value = if arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(arguments).map_err(|e| McpError::InvalidArguments(e.to_string()))?
        };
        executor.call_tool(name, arguments).await
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::EchoExecutor, *};

    #[tokio::test]
    async fn toolset_follows_model_servers() {
        let registry = McpRegistry::new();
        let echo = Arc::new(EchoExecutor::default());
        registry.register("local", echo.clone());

        let mut config = ModelConfig::for_model_file("m");
        assert!(registry.toolset_for(&config).await.is_empty());

        config.mcp.servers = vec!["local".into(), "missing".into()];
        let toolset = registry.toolset_for(&config).await;
        assert!(toolset.owns("echo"));
        assert_eq!(toolset.as_tools()[0].function.name, "echo");

        let out = toolset.call("echo", r#"{"text":"hi"}"#).await.unwrap();
        assert_eq!(out, "hi");
        assert_eq!(echo.calls.lock().len(), 1);
        assert!(matches!(toolset.call("nope", "{}").await, Err(McpError::ToolNotFound(_))));
        assert!(matches!(
            toolset.call("echo", "{not json").await,
            Err(McpError::InvalidArguments(_))
        ));
    }
}
