// Core modules
pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod gateway;
pub mod history;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod risk;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{TradeDecision, TradingEngine};
pub use error::TradingError;
pub use events::{Event, EventBus};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
