use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{instrument, warn};

use haven_core::messages::ToolSchema;

use crate::toolsource::{ToolOutput, ToolSourceRegistry};

/// How many layers of string-wrapped JSON to peel before giving up. Some
/// models double or triple encode arguments under load.
const MAX_DECODE_DEPTH: usize = 5;

/// Bridges the tool-source registry and the model: composite-named schemas
/// out, tool invocations in.
pub struct ToolExecutor {
    registry: Arc<ToolSourceRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolSourceRegistry>) -> Self {
        Self { registry }
    }

    /// Function schemas for the model, restricted to `source_ids` when given
    /// and minus any composite names on the exclusion list.
    pub async fn schemas(
        &self,
        source_ids: Option<&[String]>,
        excluded: &[String],
    ) -> Vec<ToolSchema> {
        self.registry
            .catalog(source_ids)
            .await
            .into_iter()
            .filter_map(|entry| {
                let composite =
                    ToolSourceRegistry::composite_name(&entry.source_id, &entry.tool.name);
                if excluded.iter().any(|name| name == &composite) {
                    return None;
                }
                let description = if entry.tool.description.is_empty() {
                    format!("Tool from {}", entry.source_display_name)
                } else {
                    entry.tool.description
                };
                Some(ToolSchema::function(
                    composite,
                    description,
                    entry.tool.input_schema,
                ))
            })
            .collect()
    }

    /// Run one tool call. Failures come back as an error-flagged output, not
    /// an Err; a broken tool must not abort the step that requested it.
    #[instrument(skip(self, raw_arguments), fields(tool = %composite))]
    pub async fn execute(&self, composite: &str, raw_arguments: &str) -> ToolOutput {
        let arguments = decode_arguments(raw_arguments);
        match self.registry.call(composite, arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "tool call failed");
                ToolOutput::error(e.to_string())
            }
        }
    }
}

/// Decode model-provided arguments, unwrapping up to five layers of
/// JSON-in-a-string. Anything still opaque degrades to an empty object.
pub fn decode_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }

    let mut current = trimmed.to_string();
    for _ in 0..MAX_DECODE_DEPTH {
        match serde_json::from_str::<Value>(&current) {
            Ok(Value::String(inner)) => current = inner,
            Ok(value) => return value,
            Err(_) => {
                warn!("undecodable tool arguments, using empty object");
                return json!({});
            }
        }
    }
    warn!("tool arguments still string-wrapped after {MAX_DECODE_DEPTH} decodes");
    json!({})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::toolsource::embedded::Tool;
    use async_trait::async_trait;

    #[test]
    fn plain_object_decodes() {
        let value = decode_arguments(r#"{"room": "kitchen"}"#);
        assert_eq!(value["room"], "kitchen");
    }

    #[test]
    fn nested_string_layers_unwrap() {
        // Object wrapped twice in JSON strings.
        let once = serde_json::to_string(&json!({"room": "kitchen"})).unwrap();
        let twice = serde_json::to_string(&once).unwrap();
        let value = decode_arguments(&twice);
        assert_eq!(value["room"], "kitchen");
    }

    #[test]
    fn too_deep_nesting_falls_back_to_empty() {
        let mut encoded = serde_json::to_string(&json!({"a": 1})).unwrap();
        for _ in 0..6 {
            encoded = serde_json::to_string(&encoded).unwrap();
        }
        assert_eq!(decode_arguments(&encoded), json!({}));
    }

    #[test]
    fn garbage_and_empty_fall_back_to_empty() {
        assert_eq!(decode_arguments("not json at all"), json!({}));
        assert_eq!(decode_arguments(""), json!({}));
        assert_eq!(decode_arguments("   "), json!({}));
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "returns its input"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn invoke(&self, arguments: Value) -> Result<ToolOutput, EngineError> {
            Ok(ToolOutput::text(
                arguments
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("<none>"),
            ))
        }
    }

    async fn executor_with_echo() -> ToolExecutor {
        let registry = Arc::new(ToolSourceRegistry::new());
        registry
            .add_embedded("home", "Home", vec![Arc::new(Echo)])
            .await
            .unwrap();
        ToolExecutor::new(registry)
    }

    #[tokio::test]
    async fn schemas_use_composite_names_and_exclusions() {
        let executor = executor_with_echo().await;

        let all = executor.schemas(None, &[]).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].function.name, "home___echo");

        let none = executor
            .schemas(None, &["home___echo".to_string()])
            .await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn execute_routes_and_decodes() {
        let executor = executor_with_echo().await;
        let out = executor
            .execute("home___echo", r#"{"text": "hi"}"#)
            .await;
        assert_eq!(out.content, "hi");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn execute_unknown_source_is_error_output() {
        let executor = executor_with_echo().await;
        let out = executor.execute("ghost___echo", "{}").await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn execute_bad_arguments_still_runs() {
        let executor = executor_with_echo().await;
        let out = executor.execute("home___echo", "garbage").await;
        assert_eq!(out.content, "<none>");
        assert!(!out.is_error);
    }
}
