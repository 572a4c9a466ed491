use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;

use super::{
    parse_tool_list, parse_tool_output, Catalog, JsonRpcRequest, JsonRpcResponse, ResourceInfo,
    Transport, ToolOutput, PROTOCOL_VERSION,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SESSION_HEADER: &str = "mcp-session-id";

/// Which HTTP dialect the remote speaks. Both POST JSON-RPC to one endpoint;
/// streamable additionally frames responses as SSE and threads a session id
/// header across calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpVariant {
    Sse,
    Streamable,
}

/// Tool source reached over HTTP with optional bearer auth.
pub struct HttpTransport {
    endpoint: String,
    variant: HttpVariant,
    auth_token: Option<SecretString>,
    client: reqwest::Client,
    next_id: AtomicU64,
    session: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        variant: HttpVariant,
        auth_token: Option<SecretString>,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Transport(format!("http client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into(),
            variant,
            auth_token,
            client,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
        })
    }

    async fn post_rpc(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::call(id, method, params);

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/json, text/event-stream")
            .json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(session) = self.session.lock().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("{method}: {e}")))?;

        if self.variant == HttpVariant::Streamable {
            if let Some(session) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                *self.session.lock() = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "{method} returned {status}: {body}"
            )));
        }

        let is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Transport(format!("{method} body: {e}")))?;

        let rpc = if is_sse {
            parse_sse_response(&body, id)
                .ok_or_else(|| EngineError::Protocol(format!("{method}: no rpc frame in stream")))?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)
                .map_err(|e| EngineError::Protocol(format!("{method}: {e}")))?
        };

        if let Some(error) = rpc.error {
            return Err(EngineError::Protocol(format!(
                "{method} error {}: {}",
                error.code, error.message
            )));
        }
        rpc.result
            .ok_or_else(|| EngineError::Protocol(format!("{method} returned no result")))
    }

    async fn post_notification(&self, method: &str) {
        let request = JsonRpcRequest::notification(method, None);
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(session) = self.session.lock().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        if let Err(e) = builder.send().await {
            debug!(error = %e, "notification not delivered");
        }
    }
}

/// Pull the JSON-RPC response for `id` out of an SSE-framed body: scan `data:`
/// lines, skip frames that do not decode or answer another id.
fn parse_sse_response(body: &str, id: u64) -> Option<JsonRpcResponse> {
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcResponse>(data) {
            Ok(resp) if resp.id == Some(id) => return Some(resp),
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "skipping malformed sse frame");
                continue;
            }
        }
    }
    None
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<Catalog, EngineError> {
        *self.session.lock() = None;

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "haven", "version": env!("CARGO_PKG_VERSION")}
        });
        self.post_rpc("initialize", Some(params)).await?;
        self.post_notification("notifications/initialized").await;

        let tools = parse_tool_list(&self.post_rpc("tools/list", None).await?);
        let resources = match self.post_rpc("resources/list", None).await {
            Ok(result) => result
                .get("resources")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|r| serde_json::from_value::<ResourceInfo>(r.clone()).ok())
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        Ok(Catalog { tools, resources })
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.post_rpc("ping", None).await.map(|_| ())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let result = self.post_rpc("tools/call", Some(params)).await?;
        Ok(parse_tool_output(&result))
    }

    async fn disconnect(&self) {
        *self.session.lock() = None;
    }
}
