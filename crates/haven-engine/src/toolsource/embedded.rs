use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

use super::{Catalog, ToolInfo, ToolOutput, Transport};

/// An in-process tool exposed through the embedded transport.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, EngineError>;
}

/// Transport over a fixed set of in-process tools. Connect and ping cannot
/// fail; there is no wire.
pub struct EmbeddedTransport {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl EmbeddedTransport {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools: tools
                .into_iter()
                .map(|t| (t.name().to_string(), t))
                .collect(),
        }
    }
}

#[async_trait]
impl Transport for EmbeddedTransport {
    async fn connect(&self) -> Result<Catalog, EngineError> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Catalog {
            tools,
            resources: Vec::new(),
        })
    }

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::ToolNotFound(name.to_string()))?;
        tool.invoke(arguments).await
    }

    async fn disconnect(&self) {}
}
