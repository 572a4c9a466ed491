use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::EngineError;

use super::client::{ConnectionState, ToolSourceClient};
use super::embedded::{EmbeddedTransport, Tool};
use super::http::{HttpTransport, HttpVariant};
use super::subprocess::SubprocessTransport;
use super::{ToolInfo, ToolOutput, Transport};

/// Separator between client id and tool name in composite tool names.
/// Not escaped: source ids must not contain it.
pub const NAME_SEPARATOR: &str = "___";

/// Id of the built-in embedded source. Excluded from status reports.
pub const DEFAULT_SOURCE_ID: &str = "builtin";

const STATUS_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire configuration for one external tool source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        keep_alive: bool,
    },
    HttpSse {
        endpoint: String,
        #[serde(default)]
        auth_token: Option<String>,
    },
    StreamableHttp {
        endpoint: String,
        #[serde(default)]
        auth_token: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSourceConfig {
    pub id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// One tool as the model sees it: composite-named, carrying its source.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub source_id: String,
    pub source_display_name: String,
    pub tool: ToolInfo,
}

#[derive(Clone, Debug)]
pub struct SourceStatus {
    pub id: String,
    pub display_name: String,
    pub state: ConnectionState,
}

/// All known tool sources, keyed by client id. `add`, `update`, and `remove`
/// are the only mutators; everything else reads.
#[derive(Default)]
pub struct ToolSourceRegistry {
    clients: DashMap<String, Arc<ToolSourceClient>>,
}

impl ToolSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn composite_name(client_id: &str, tool_name: &str) -> String {
        format!("{client_id}{NAME_SEPARATOR}{tool_name}")
    }

    /// Split a composite name on the FIRST separator occurrence, so tool
    /// names containing the separator survive.
    pub fn split_composite(composite: &str) -> Result<(&str, &str), EngineError> {
        let idx = composite.find(NAME_SEPARATOR).ok_or_else(|| {
            EngineError::ToolNotFound(format!("not a composite tool name: {composite}"))
        })?;
        Ok((&composite[..idx], &composite[idx + NAME_SEPARATOR.len()..]))
    }

    pub fn get(&self, id: &str) -> Result<Arc<ToolSourceClient>, EngineError> {
        self.clients
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::SourceNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Register a source and attempt its first connect. If the id is already
    /// taken the old client is fully torn down before the replacement goes
    /// in. A failed connect leaves the client registered Disconnected; the
    /// next use retries via ensure_connected.
    #[instrument(skip(self, config), fields(source_id = %config.id))]
    pub async fn add(&self, config: ToolSourceConfig) -> Result<(), EngineError> {
        let transport = build_transport(&config.transport)?;
        let client = Arc::new(ToolSourceClient::new(
            config.id.clone(),
            config.display_name,
            transport,
        ));

        if let Some((_, old)) = self.clients.remove(&config.id) {
            old.disconnect().await;
        }
        self.clients.insert(config.id.clone(), client.clone());

        client.ensure_connected().await
    }

    /// Replace a source's configuration. Same contract as `add`.
    pub async fn update(&self, config: ToolSourceConfig) -> Result<(), EngineError> {
        self.add(config).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let (_, client) = self
            .clients
            .remove(id)
            .ok_or_else(|| EngineError::SourceNotFound(id.to_string()))?;
        client.disconnect().await;
        Ok(())
    }

    /// Register the built-in embedded source.
    pub async fn add_embedded(
        &self,
        id: &str,
        display_name: &str,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<(), EngineError> {
        let client = Arc::new(ToolSourceClient::new(
            id,
            display_name,
            Arc::new(EmbeddedTransport::new(tools)),
        ));
        if let Some((_, old)) = self.clients.remove(id) {
            old.disconnect().await;
        }
        self.clients.insert(id.to_string(), client.clone());
        client.ensure_connected().await
    }

    /// Connect every configured source concurrently. One source failing to
    /// come up never blocks the others; failures are logged and the client
    /// stays registered for later retry.
    pub async fn init_all(&self, configs: Vec<ToolSourceConfig>) {
        let results = futures::future::join_all(configs.into_iter().map(|config| {
            let id = config.id.clone();
            async move { (id, self.add(config).await) }
        }))
        .await;

        for (id, result) in results {
            match result {
                Ok(()) => info!(source_id = %id, "tool source ready"),
                Err(e) => warn!(source_id = %id, error = %e, "tool source failed to connect"),
            }
        }
    }

    /// Composite-named tool catalog across sources, optionally restricted to
    /// a set of source ids. Sources that cannot connect contribute nothing.
    pub async fn catalog(&self, source_ids: Option<&[String]>) -> Vec<CatalogEntry> {
        let clients: Vec<Arc<ToolSourceClient>> = self
            .clients
            .iter()
            .filter(|e| {
                source_ids
                    .map(|ids| ids.iter().any(|id| id == e.key()))
                    .unwrap_or(true)
            })
            .map(|e| e.value().clone())
            .collect();

        let results = futures::future::join_all(clients.into_iter().map(|client| async move {
            if let Err(e) = client.ensure_connected().await {
                warn!(source_id = %client.id(), error = %e, "skipping source in catalog");
                return Vec::new();
            }
            let display = client.display_name().to_string();
            let id = client.id().to_string();
            client
                .tools()
                .await
                .into_iter()
                .map(|tool| CatalogEntry {
                    source_id: id.clone(),
                    source_display_name: display.clone(),
                    tool,
                })
                .collect()
        }))
        .await;

        let mut entries: Vec<CatalogEntry> = results.into_iter().flatten().collect();
        entries.sort_by(|a, b| {
            (a.source_id.as_str(), a.tool.name.as_str())
                .cmp(&(b.source_id.as_str(), b.tool.name.as_str()))
        });
        entries
    }

    /// Invoke a tool by composite name.
    pub async fn call(&self, composite: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        let (source_id, tool_name) = Self::split_composite(composite)?;
        let client = self.get(source_id)?;
        client.call_tool(tool_name, arguments).await
    }

    /// Ping every non-default source concurrently, each under a fixed
    /// timeout, and report the resulting states.
    pub async fn status(&self) -> Vec<SourceStatus> {
        let clients: Vec<Arc<ToolSourceClient>> = self
            .clients
            .iter()
            .filter(|e| e.key() != DEFAULT_SOURCE_ID)
            .map(|e| e.value().clone())
            .collect();

        let mut statuses =
            futures::future::join_all(clients.into_iter().map(|client| async move {
                let state = match tokio::time::timeout(STATUS_PING_TIMEOUT, client.check()).await {
                    Ok(state) => state,
                    Err(_) => ConnectionState::Disconnected,
                };
                SourceStatus {
                    id: client.id().to_string(),
                    display_name: client.display_name().to_string(),
                    state,
                }
            }))
            .await;

        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Disconnect everything; used on shutdown.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<ToolSourceClient>> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(clients.iter().map(|c| c.disconnect())).await;
    }
}

fn build_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, EngineError> {
    Ok(match config {
        TransportConfig::Subprocess {
            command,
            args,
            env,
            working_dir,
            keep_alive,
        } => Arc::new(SubprocessTransport::new(
            command.clone(),
            args.clone(),
            env.clone(),
            working_dir.clone().map(PathBuf::from),
            *keep_alive,
        )),
        TransportConfig::HttpSse {
            endpoint,
            auth_token,
        } => Arc::new(HttpTransport::new(
            endpoint.clone(),
            HttpVariant::Sse,
            auth_token.clone().map(SecretString::from),
        )?),
        TransportConfig::StreamableHttp {
            endpoint,
            auth_token,
        } => Arc::new(HttpTransport::new(
            endpoint.clone(),
            HttpVariant::Streamable,
            auth_token.clone().map(SecretString::from),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolsource::embedded::Tool;
    use async_trait::async_trait;

    struct Toggle;

    #[async_trait]
    impl Tool for Toggle {
        fn name(&self) -> &str {
            "toggle_light"
        }

        fn description(&self) -> &str {
            "toggle a light"
        }

        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, EngineError> {
            Ok(ToolOutput::text("toggled"))
        }
    }

    #[test]
    fn composite_round_trip() {
        let composite = ToolSourceRegistry::composite_name("hue", "toggle_light");
        assert_eq!(composite, "hue___toggle_light");
        let (id, tool) = ToolSourceRegistry::split_composite(&composite).unwrap();
        assert_eq!(id, "hue");
        assert_eq!(tool, "toggle_light");
    }

    #[test]
    fn split_uses_first_separator() {
        let (id, tool) = ToolSourceRegistry::split_composite("hue___set___brightness").unwrap();
        assert_eq!(id, "hue");
        assert_eq!(tool, "set___brightness");
    }

    #[test]
    fn split_without_separator_errors() {
        let err = ToolSourceRegistry::split_composite("plain_name").unwrap_err();
        assert!(matches!(err, EngineError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn embedded_source_serves_catalog_and_calls() {
        let registry = ToolSourceRegistry::new();
        registry
            .add_embedded(DEFAULT_SOURCE_ID, "Built-in", vec![Arc::new(Toggle)])
            .await
            .unwrap();

        let entries = registry.catalog(None).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_id, DEFAULT_SOURCE_ID);
        assert_eq!(entries[0].tool.name, "toggle_light");

        let composite = ToolSourceRegistry::composite_name(DEFAULT_SOURCE_ID, "toggle_light");
        let out = registry.call(&composite, Value::Null).await.unwrap();
        assert_eq!(out.content, "toggled");
    }

    #[tokio::test]
    async fn catalog_filter_restricts_sources() {
        let registry = ToolSourceRegistry::new();
        registry
            .add_embedded("a", "A", vec![Arc::new(Toggle)])
            .await
            .unwrap();
        registry
            .add_embedded("b", "B", vec![Arc::new(Toggle)])
            .await
            .unwrap();

        let only_b = registry.catalog(Some(&["b".to_string()])).await;
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].source_id, "b");
    }

    #[tokio::test]
    async fn add_replaces_and_remove_drops() {
        let registry = ToolSourceRegistry::new();
        registry
            .add_embedded("x", "First", vec![Arc::new(Toggle)])
            .await
            .unwrap();
        registry
            .add_embedded("x", "Second", vec![Arc::new(Toggle)])
            .await
            .unwrap();
        assert_eq!(registry.get("x").unwrap().display_name(), "Second");

        registry.remove("x").await.unwrap();
        assert!(matches!(
            registry.get("x"),
            Err(EngineError::SourceNotFound(_))
        ));
        assert!(matches!(
            registry.remove("x").await,
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn init_all_isolates_failures() {
        let registry = ToolSourceRegistry::new();
        let configs = vec![
            ToolSourceConfig {
                id: "broken".into(),
                display_name: "Broken".into(),
                transport: TransportConfig::Subprocess {
                    command: "definitely-not-a-real-binary".into(),
                    args: vec![],
                    env: HashMap::new(),
                    working_dir: None,
                    keep_alive: false,
                },
            },
            ToolSourceConfig {
                id: "http".into(),
                display_name: "Http".into(),
                transport: TransportConfig::StreamableHttp {
                    endpoint: "http://127.0.0.1:1/rpc".into(),
                    auth_token: None,
                },
            },
        ];

        registry.init_all(configs).await;

        // Both stay registered (Disconnected) for later retry.
        assert_eq!(registry.ids().len(), 2);
        for status in registry.status().await {
            assert_eq!(status.state, ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn status_skips_default_source() {
        let registry = ToolSourceRegistry::new();
        registry
            .add_embedded(DEFAULT_SOURCE_ID, "Built-in", vec![Arc::new(Toggle)])
            .await
            .unwrap();
        registry
            .add_embedded("hue", "Hue", vec![Arc::new(Toggle)])
            .await
            .unwrap();

        let statuses = registry.status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, "hue");
        assert_eq!(statuses[0].state, ConnectionState::Connected);
    }

    #[test]
    fn config_deserializes_kebab_case_transport() {
        let config: ToolSourceConfig = serde_json::from_value(serde_json::json!({
            "id": "hue",
            "display_name": "Hue Bridge",
            "transport": "streamable-http",
            "endpoint": "http://hub.local/rpc"
        }))
        .unwrap();
        assert!(matches!(
            config.transport,
            TransportConfig::StreamableHttp { .. }
        ));
    }
}
