use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use haven_core::errors::HavenError;
use haven_core::messages::{ChatChunk, ChatRequest, ChatResponse};

/// What a client is used for. Planning drives the think-act-observe loop;
/// vision answers trigger-rule condition checks over camera frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Planning,
    Vision,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Vision => "vision",
        }
    }
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, HavenError>> + Send>>;

/// Chat-completions client with blocking and streaming call modes.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, HavenError>;

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, HavenError>;
}

impl std::fmt::Debug for dyn ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("model", &self.model())
            .finish()
    }
}

/// Purpose-addressed client registry. A missing binding is a configuration
/// error surfaced immediately, never retried.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Purpose, Arc<dyn ChatClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, purpose: Purpose, client: Arc<dyn ChatClient>) {
        self.clients.write().insert(purpose, client);
    }

    pub fn get(&self, purpose: Purpose) -> Result<Arc<dyn ChatClient>, HavenError> {
        self.clients
            .read()
            .get(&purpose)
            .cloned()
            .ok_or_else(|| HavenError::ConfigurationMissing(purpose.as_str().to_string()))
    }

    pub fn is_bound(&self, purpose: Purpose) -> bool {
        self.clients.read().contains_key(&purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChatClient;

    #[test]
    fn missing_purpose_is_configuration_error() {
        let registry = ClientRegistry::new();
        let err = registry.get(Purpose::Vision).unwrap_err();
        assert!(matches!(err, HavenError::ConfigurationMissing(p) if p == "vision"));
    }

    #[test]
    fn bind_and_get() {
        let registry = ClientRegistry::new();
        registry.bind(Purpose::Planning, Arc::new(MockChatClient::new(vec![])));
        assert!(registry.is_bound(Purpose::Planning));
        assert!(!registry.is_bound(Purpose::Vision));
        assert!(registry.get(Purpose::Planning).is_ok());
    }

    #[test]
    fn rebind_replaces() {
        let registry = ClientRegistry::new();
        registry.bind(Purpose::Vision, Arc::new(MockChatClient::new(vec![])));
        registry.bind(Purpose::Vision, Arc::new(MockChatClient::new(vec![])));
        assert!(registry.get(Purpose::Vision).is_ok());
    }
}
