use haven_core::errors::HavenError;
use haven_engine::EngineError;
use haven_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Core(#[from] HavenError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("frame fetch failed: {0}")]
    FrameFetch(String),

    #[error("{0}")]
    Internal(String),
}
