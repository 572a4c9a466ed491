pub mod envelope;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod rules;
