use std::time::Duration;
use thiserror::Error;

/// Failures of a single technical analysis run
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("Insufficient data for {symbol}: {available} candles, need {required} ({} short)", .required - .available)]
    InsufficientData {
        symbol: String,
        required: usize,
        available: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Itemized order validation failure
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Order validation failed: {}", .errors.join("; "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

/// Failures reported by the market/execution gateway or budget provider
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("Rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::RateLimited { .. } => true,
            // -1001 disconnected, -1003 too many requests, -1007 timeout
            GatewayError::Exchange { code, .. } => matches!(code, -1001 | -1003 | -1007),
            GatewayError::NotFound(_) | GatewayError::InvalidResponse(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Sizing and risk validation failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Risk rejection for {symbol}: {reason}")]
    Rejection { symbol: String, reason: String },
}

/// Umbrella error for the trading pipeline
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Trading engine is already running")]
    AlreadyRunning,

    #[error("Trading engine is not running")]
    NotRunning,

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for TradingError {
    fn from(e: config::ConfigError) -> Self {
        TradingError::Config(e.to_string())
    }
}
