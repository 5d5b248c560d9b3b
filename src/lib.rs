// Core modules
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod reports;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{TickOutcome, TradingEngine};
pub use error::{DenialReason, EngineError};
pub use models::*;
pub use reports::ReportBundle;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
