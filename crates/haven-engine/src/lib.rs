pub mod agents;
pub mod context;
pub mod dialog;
pub mod error;
pub mod executor;
pub mod runner;
pub mod toolsource;

pub use error::EngineError;
