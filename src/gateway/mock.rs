//! Scripted gateway for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{BudgetProvider, MarketGateway, RateLimitStatus};
use crate::error::GatewayError;
use crate::models::{
    Candle, OrderAck, OrderRef, OrderRequest, OrderSide, OrderStatus, OrderType, PortfolioBudget,
    Ticker,
};

/// Candles following `closes`, one minute apart
pub fn candles_from_closes(symbol: &str, closes: &[f64]) -> Vec<Candle> {
    let start = Utc::now() - chrono::Duration::minutes(closes.len() as i64);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            symbol: symbol.to_string(),
            open_time: start + chrono::Duration::minutes(i as i64),
            open: close,
            high: close * 1.002,
            low: close * 0.998,
            close,
            volume: 1000.0,
        })
        .collect()
}

pub fn uptrend_closes(n: usize) -> Vec<f64> {
    (0..n).map(|i| 100.0 * 1.005f64.powi(i as i32)).collect()
}

pub fn downtrend_closes(n: usize) -> Vec<f64> {
    (0..n).map(|i| 100.0 * 0.995f64.powi(i as i32)).collect()
}

pub fn filled_ack(request: &OrderRequest, fill_price: f64) -> OrderAck {
    ack_for(request, OrderStatus::Filled, 1.0, Some(fill_price))
}

/// Ack executing `fill_ratio` of the requested quantity
pub fn ack_for(
    request: &OrderRequest,
    status: OrderStatus,
    fill_ratio: f64,
    avg_price: Option<f64>,
) -> OrderAck {
    let quantity = request.quantity.unwrap_or(0.0);
    OrderAck {
        order_id: String::new(),
        client_order_id: request.client_order_id.clone().unwrap_or_default(),
        symbol: request.symbol.clone(),
        side: request.side.unwrap_or(OrderSide::Buy),
        order_type: request.order_type,
        status,
        orig_qty: quantity,
        executed_qty: quantity * fill_ratio,
        price: request.price,
        avg_price,
        stop_price: request.stop_price,
        transact_time: Utc::now(),
    }
}

type PlaceResponder = Box<dyn Fn(&OrderRequest) -> Result<OrderAck, GatewayError> + Send + Sync>;

/// Gateway whose responses are scripted per test
///
/// Order placements pop from a queue of responders; once the queue is empty
/// every order fills at the ticker price.
#[derive(Default)]
pub struct MockGateway {
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    tickers: Mutex<HashMap<String, f64>>,
    candle_errors: Mutex<HashMap<String, GatewayError>>,
    place_script: Mutex<VecDeque<PlaceResponder>>,
    orders: Mutex<HashMap<String, OrderAck>>,
    status_error: Mutex<Option<GatewayError>>,
    cancel_error: Mutex<Option<GatewayError>>,
    fill_on_cancel: Mutex<Option<f64>>,
    next_id: AtomicU64,
    pub place_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
    pub placed: Mutex<Vec<OrderRequest>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candles(self, symbol: &str, candles: Vec<Candle>) -> Self {
        if let Some(last) = candles.last() {
            self.tickers.lock().unwrap().insert(symbol.to_string(), last.close);
        }
        self.candles.lock().unwrap().insert(symbol.to_string(), candles);
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.tickers.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn fail_candles(&self, symbol: &str, error: GatewayError) {
        self.candle_errors.lock().unwrap().insert(symbol.to_string(), error);
    }

    pub fn push_place<F>(&self, responder: F)
    where
        F: Fn(&OrderRequest) -> Result<OrderAck, GatewayError> + Send + Sync + 'static,
    {
        self.place_script.lock().unwrap().push_back(Box::new(responder));
    }

    pub fn push_place_error(&self, error: GatewayError) {
        self.push_place(move |_| Err(error.clone()));
    }

    pub fn set_status_error(&self, error: Option<GatewayError>) {
        *self.status_error.lock().unwrap() = error;
    }

    pub fn set_cancel_error(&self, error: Option<GatewayError>) {
        *self.cancel_error.lock().unwrap() = error;
    }

    /// Fraction of the original quantity reported filled by the next cancels
    pub fn set_fill_on_cancel(&self, fill_ratio: Option<f64>) {
        *self.fill_on_cancel.lock().unwrap() = fill_ratio;
    }

    /// Overwrite the exchange-side state of an order
    pub fn update_order(&self, order_id: &str, status: OrderStatus, executed_qty: f64) {
        if let Some(ack) = self.orders.lock().unwrap().get_mut(order_id) {
            ack.status = status;
            ack.executed_qty = executed_qty;
        }
    }

    fn price(&self, symbol: &str) -> Option<f64> {
        self.tickers.lock().unwrap().get(symbol).copied()
    }
}

#[async_trait]
impl MarketGateway for MockGateway {
    async fn get_candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
        _start: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, GatewayError> {
        if let Some(err) = self.candle_errors.lock().unwrap().get(symbol) {
            return Err(err.clone());
        }
        let candles = self.candles.lock().unwrap().get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let last_price = self
            .price(symbol)
            .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last_price,
            bid: None,
            ask: None,
            volume_24h: 0.0,
            timestamp: Utc::now(),
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        self.placed.lock().unwrap().push(request.clone());

        let responder = self.place_script.lock().unwrap().pop_front();
        let mut ack = match responder {
            Some(respond) => respond(request)?,
            None => {
                let price = request.price.or_else(|| self.price(&request.symbol)).unwrap_or(100.0);
                if request.order_type == OrderType::Market {
                    filled_ack(request, price)
                } else {
                    ack_for(request, OrderStatus::New, 0.0, None)
                }
            }
        };

        ack.order_id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.orders.lock().unwrap().insert(ack.order_id.clone(), ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, _symbol: &str, order: &OrderRef) -> Result<OrderAck, GatewayError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.cancel_error.lock().unwrap().clone() {
            return Err(err);
        }
        let OrderRef::OrderId(id) = order else {
            return Err(GatewayError::NotFound("client order id".to_string()));
        };
        let mut orders = self.orders.lock().unwrap();
        let ack = orders
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.clone()))?;
        if let Some(ratio) = *self.fill_on_cancel.lock().unwrap() {
            ack.executed_qty = ack.orig_qty * ratio;
        }
        ack.status = OrderStatus::Canceled;
        Ok(ack.clone())
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderAck, GatewayError> {
        if let Some(err) = self.status_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus {
            requests_per_second: 0,
            is_limited: false,
        }
    }
}

/// Budget provider with fixed portfolios
#[derive(Default)]
pub struct MockBudgets {
    portfolios: Mutex<HashMap<String, PortfolioBudget>>,
}

impl MockBudgets {
    pub fn with_portfolio(self, portfolio_id: &str, budget: f64, symbols: &[&str]) -> Self {
        self.portfolios.lock().unwrap().insert(
            portfolio_id.to_string(),
            PortfolioBudget {
                portfolio_id: portfolio_id.to_string(),
                budget,
                total_value: budget,
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }
}

#[async_trait]
impl BudgetProvider for MockBudgets {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioBudget, GatewayError> {
        self.portfolios
            .lock()
            .unwrap()
            .get(portfolio_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(portfolio_id.to_string()))
    }
}
