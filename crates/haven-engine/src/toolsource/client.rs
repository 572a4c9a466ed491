use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;

use super::{Catalog, ToolInfo, ToolOutput, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

struct ClientState {
    connection: ConnectionState,
    catalog: Catalog,
}

/// One tool source: a transport plus its connection state machine.
///
/// The state lock serializes `ensure_connected` so concurrent callers never
/// race into multiple reconnect attempts for the same source.
pub struct ToolSourceClient {
    id: String,
    display_name: String,
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
}

impl ToolSourceClient {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            transport,
            state: Mutex::new(ClientState {
                connection: ConnectionState::Disconnected,
                catalog: Catalog::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.connection
    }

    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.state.lock().await.catalog.tools.clone()
    }

    pub async fn catalog(&self) -> Catalog {
        self.state.lock().await.catalog.clone()
    }

    /// Bring the source to Connected, doing the least work that can prove
    /// liveness: a connected source is pinged; a ping failure demotes and
    /// triggers at most one reconnect; a disconnected source gets exactly
    /// one connect attempt. Never loops.
    #[instrument(skip(self), fields(source_id = %self.id))]
    pub async fn ensure_connected(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;

        if state.connection == ConnectionState::Connected {
            match self.transport.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "ping failed, reconnecting");
                    state.connection = ConnectionState::Disconnected;
                    self.transport.disconnect().await;
                }
            }
        }

        let catalog = self.transport.connect().await?;
        info!(tools = catalog.tools.len(), "tool source connected");
        state.catalog = catalog;
        state.connection = ConnectionState::Connected;
        Ok(())
    }

    /// Invoke a tool by its unqualified name. A transport failure demotes the
    /// source so the next caller reconnects.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        self.ensure_connected().await?;
        match self.transport.call_tool(name, arguments).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if e.is_recoverable() {
                    self.state.lock().await.connection = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Liveness check without a reconnect attempt, for status reporting.
    pub async fn check(&self) -> ConnectionState {
        let mut state = self.state.lock().await;
        if state.connection == ConnectionState::Connected && self.transport.ping().await.is_err() {
            state.connection = ConnectionState::Disconnected;
        }
        state.connection
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        debug!(source_id = %self.id, "disconnecting tool source");
        self.transport.disconnect().await;
        state.connection = ConnectionState::Disconnected;
        state.catalog = Catalog::default();
    }
}
