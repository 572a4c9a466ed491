pub mod dynamic;
pub mod error;
pub mod filters;
pub mod frames;
pub mod gate;
pub mod motion;
pub mod scheduler;
pub mod vision;

pub use error::TriggerError;
pub use frames::{FrameSource, SnapshotFrameSource};
pub use scheduler::{SchedulerConfig, TriggerScheduler};
