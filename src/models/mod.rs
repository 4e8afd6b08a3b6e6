use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLCV candlestick, ordered by open time and immutable once closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest price snapshot for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume_24h: f64,
    pub timestamp: DateTime<Utc>,
}

/// Budget view of a portfolio, as reported by the budget provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioBudget {
    pub portfolio_id: String,
    /// Cash available for new positions
    pub budget: f64,
    /// Total portfolio value (cash + positions), used as the risk denominator
    pub total_value: f64,
    pub symbols: Vec<String>,
}

/// Action a trade decision resolves to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            TradeAction::Buy => Some(OrderSide::Buy),
            TradeAction::Sell => Some(OrderSide::Sell),
            TradeAction::Hold => None,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
            TradeAction::Hold => write!(f, "HOLD"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
    LimitMaker,
}

impl OrderType {
    /// Whether the exchange requires a limit price for this order type
    pub fn requires_price(&self) -> bool {
        matches!(
            self,
            OrderType::Limit
                | OrderType::StopLossLimit
                | OrderType::TakeProfitLimit
                | OrderType::LimitMaker
        )
    }

    /// Whether the exchange requires a trigger price for this order type
    pub fn requires_stop_price(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::StopLossLimit
                | OrderType::TakeProfit
                | OrderType::TakeProfitLimit
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Order placement request as handed to the order manager.
///
/// `side` and `quantity` are optional so that malformed requests coming from
/// strategy code can be reported field by field instead of failing to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub order_type: OrderType,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Some(side),
            order_type: OrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            time_in_force: None,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Some(side),
            order_type: OrderType::Limit,
            quantity: Some(quantity),
            price: Some(price),
            stop_price: None,
            time_in_force: Some(TimeInForce::Gtc),
            client_order_id: None,
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_client_order_id(mut self, client_order_id: String) -> Self {
        self.client_order_id = Some(client_order_id);
        self
    }
}

/// How an order is addressed on the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    OrderId(String),
    ClientOrderId(String),
}

/// Exchange acknowledgement of an order (placement, query or cancel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub orig_qty: f64,
    pub executed_qty: f64,
    pub price: Option<f64>,
    pub avg_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub transact_time: DateTime<Utc>,
}

/// Order tracked by the order manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub executed_quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_ack(ack: &OrderAck) -> Self {
        Self {
            order_id: ack.order_id.clone(),
            client_order_id: ack.client_order_id.clone(),
            symbol: ack.symbol.clone(),
            side: ack.side,
            order_type: ack.order_type,
            quantity: ack.orig_qty,
            executed_quantity: ack.executed_qty,
            price: ack.price,
            stop_price: ack.stop_price,
            avg_fill_price: ack.avg_price,
            status: ack.status,
            created_at: ack.transact_time,
            updated_at: ack.transact_time,
        }
    }

    /// Apply a fresher acknowledgement from the exchange
    pub fn apply_ack(&mut self, ack: &OrderAck) {
        self.status = ack.status;
        self.executed_quantity = ack.executed_qty;
        if ack.avg_price.is_some() {
            self.avg_fill_price = ack.avg_price;
        }
        self.updated_at = Utc::now();
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.executed_quantity).max(0.0)
    }

    /// Best known execution price: average fill, then limit price
    pub fn fill_price(&self) -> Option<f64> {
        self.avg_fill_price.or(self.price)
    }
}
