use std::time::Duration;

use haven_core::errors::HavenError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] HavenError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("tool source not found: {0}")]
    SourceNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("ask timed out after {0:?}")]
    AskTimeout(Duration),

    #[error("agent exited")]
    AgentExited,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Recoverable errors may be retried once via ensure_connected; the rest
    /// surface to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::AskTimeout(_))
    }
}
