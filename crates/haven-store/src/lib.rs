pub mod config;
pub mod database;
pub mod error;
pub mod frames;
pub mod rule_logs;
pub mod rules;
pub mod schema;

pub use config::ConfigRepo;
pub use database::Database;
pub use error::StoreError;
pub use frames::FrameStore;
pub use rule_logs::RuleLogRepo;
pub use rules::RuleRepo;
