pub mod client;
pub mod embedded;
pub mod http;
pub mod registry;
pub mod subprocess;

pub use client::{ConnectionState, ToolSourceClient};
pub use registry::{ToolSourceConfig, ToolSourceRegistry, TransportConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// MCP protocol revision spoken on subprocess and HTTP transports.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool advertised by a source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A resource advertised by a source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default)]
    pub name: String,
}

/// Tool + resource catalog, refreshed on every successful (re)connect.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub tools: Vec<ToolInfo>,
    pub resources: Vec<ResourceInfo>,
}

/// Outcome of one tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// One tool-source transport. Implementations own their own wire state; the
/// client wrapping them owns the connection state machine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the transport and load the catalog.
    async fn connect(&self) -> Result<Catalog, EngineError>;

    /// Cheap liveness probe of an established transport.
    async fn ping(&self) -> Result<(), EngineError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, EngineError>;

    /// Tear down. Must be safe to call when already down.
    async fn disconnect(&self);
}

/// JSON-RPC 2.0 request frame.
#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn call(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response frame.
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Extract the catalog from a `tools/list` result.
pub(crate) fn parse_tool_list(result: &Value) -> Vec<ToolInfo> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Convert a `tools/call` result into a ToolOutput: text blocks concatenated,
/// `isError` honored.
pub(crate) fn parse_tool_output(result: &Value) -> ToolOutput {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let content = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    ToolOutput { content, is_error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_info_defaults_schema() {
        let info: ToolInfo = serde_json::from_value(serde_json::json!({"name": "toggle"})).unwrap();
        assert_eq!(info.name, "toggle");
        assert_eq!(info.input_schema["type"], "object");
    }

    #[test]
    fn request_frames() {
        let call = JsonRpcRequest::call(7, "tools/list", None);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert!(json.get("params").is_none());

        let note = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("id").is_none());
    }

    #[test]
    fn parse_tool_list_extracts_entries() {
        let result = serde_json::json!({
            "tools": [
                {"name": "toggle", "description": "flip a light", "inputSchema": {"type": "object"}},
                {"name": "scene"}
            ]
        });
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "toggle");
        assert_eq!(tools[1].description, "");
    }

    #[test]
    fn parse_tool_output_joins_text_blocks() {
        let result = serde_json::json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"}
            ],
            "isError": false
        });
        let output = parse_tool_output(&result);
        assert_eq!(output.content, "line one\nline two");
        assert!(!output.is_error);
    }

    #[test]
    fn parse_tool_output_error_flag() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        });
        assert!(parse_tool_output(&result).is_error);
    }
}
