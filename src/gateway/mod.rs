// Exchange and budget boundaries
// The pipeline only talks to these traits; `paper` provides in-process implementations

#[cfg(test)]
pub mod mock;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::models::{Candle, OrderAck, OrderRef, OrderRequest, PortfolioBudget, Ticker};

pub use paper::{PaperConfig, PaperGateway, PortfolioSettings, StaticBudgetProvider};

/// Snapshot of the gateway's request quota
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub requests_per_second: u32,
    /// Whether the next request would currently be rejected
    pub is_limited: bool,
}

/// Market data and order execution on a spot exchange
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Candles for `symbol`, oldest first, at most `limit` of them
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderAck, GatewayError>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, GatewayError>;

    fn rate_limit_status(&self) -> RateLimitStatus;
}

/// Portfolio budgets and the symbols each portfolio trades
#[async_trait]
pub trait BudgetProvider: Send + Sync {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioBudget, GatewayError>;
}
