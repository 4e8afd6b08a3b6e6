//! In-process paper exchange
//!
//! Generates seeded random-walk candles per symbol, fills MARKET orders at the
//! last price with random adverse slippage, keeps LIMIT orders resting until
//! the price crosses them, and enforces a request quota the same way a real
//! exchange would (as `RateLimited` rejections).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BudgetProvider, MarketGateway, RateLimitStatus};
use crate::error::{GatewayError, TradingError};
use crate::models::{
    Candle, OrderAck, OrderRef, OrderRequest, OrderSide, OrderStatus, OrderType, PortfolioBudget,
    Ticker,
};

type PaperRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PaperConfig {
    /// Seed for reproducible markets
    pub seed: u64,
    pub base_price: f64,
    /// Starting price per symbol, overriding `base_price`
    pub initial_prices: HashMap<String, f64>,
    pub base_volume: f64,
    /// Max relative move per candle
    pub volatility: f64,
    /// Relative drift per candle
    pub drift: f64,
    pub interval_minutes: i64,
    /// Candles generated when a symbol is first seen
    pub history_candles: usize,
    /// Max adverse fill slippage for MARKET orders
    pub max_fill_slippage: f64,
    pub partial_fill_probability: f64,
    pub partial_fill_ratio: f64,
    pub requests_per_second: u32,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            base_price: 100.0,
            initial_prices: HashMap::new(),
            base_volume: 1_000_000.0,
            volatility: 0.004,        // ±0.4% per candle
            drift: 0.0,
            interval_minutes: 1,
            history_candles: 500,
            max_fill_slippage: 0.002, // up to 0.2% adverse
            partial_fill_probability: 0.0,
            partial_fill_ratio: 0.5,
            requests_per_second: 100,
        }
    }
}

impl PaperConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.base_price <= 0.0 || self.initial_prices.values().any(|p| *p <= 0.0) {
            return Err(TradingError::Config("paper prices must be positive".to_string()));
        }
        if self.volatility < 0.0 || self.volatility >= 1.0 || self.max_fill_slippage < 0.0 {
            return Err(TradingError::Config(
                "paper volatility must be within [0, 1) and slippage non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.partial_fill_probability)
            || !(0.0..1.0).contains(&self.partial_fill_ratio)
        {
            return Err(TradingError::Config("paper partial fill settings out of range".to_string()));
        }
        if self.history_candles == 0 || self.interval_minutes <= 0 || self.requests_per_second == 0 {
            return Err(TradingError::Config(
                "paper history, interval and request quota must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct PaperMarket {
    rng: StdRng,
    candles: HashMap<String, Vec<Candle>>,
    orders: HashMap<String, OrderAck>,
    next_order_id: u64,
}

impl PaperMarket {
    fn ensure_symbol(&mut self, symbol: &str, config: &PaperConfig) {
        if self.candles.contains_key(symbol) {
            return;
        }

        let start_price = config
            .initial_prices
            .get(symbol)
            .copied()
            .unwrap_or(config.base_price);
        let interval = Duration::minutes(config.interval_minutes);
        let start_time = Utc::now() - interval * config.history_candles as i32;

        let mut series = Vec::with_capacity(config.history_candles);
        let mut prev = Candle {
            symbol: symbol.to_string(),
            open_time: start_time,
            open: start_price,
            high: start_price,
            low: start_price,
            close: start_price,
            volume: config.base_volume,
        };
        series.push(prev.clone());

        for _ in 1..config.history_candles {
            prev = next_candle(&mut self.rng, &prev, config);
            series.push(prev.clone());
        }

        self.candles.insert(symbol.to_string(), series);
    }

    /// Let one interval pass on `symbol`
    fn advance(&mut self, symbol: &str, config: &PaperConfig) {
        self.ensure_symbol(symbol, config);
        let Some(series) = self.candles.get_mut(symbol) else {
            return;
        };

        let next = series.last().map(|last| next_candle(&mut self.rng, last, config));
        if let Some(candle) = next {
            series.push(candle);
        }

        let excess = series.len().saturating_sub(config.history_candles * 2);
        if excess > 0 {
            series.drain(..excess);
        }
    }

    fn last_price(&mut self, symbol: &str, config: &PaperConfig) -> f64 {
        self.ensure_symbol(symbol, config);
        self.candles
            .get(symbol)
            .and_then(|series| series.last())
            .map(|c| c.close)
            .unwrap_or(config.base_price)
    }

    fn next_order_id(&mut self) -> String {
        self.next_order_id += 1;
        self.next_order_id.to_string()
    }

    /// Fill a resting LIMIT order once the market trades through its price
    fn match_resting(&mut self, order_id: &str, config: &PaperConfig) {
        let Some(ack) = self.orders.get(order_id) else {
            return;
        };
        if ack.status.is_terminal() || ack.order_type != OrderType::Limit {
            return;
        }
        let (symbol, side, limit) = (ack.symbol.clone(), ack.side, ack.price);
        let last = self.last_price(&symbol, config);

        let crossed = match (side, limit) {
            (OrderSide::Buy, Some(limit)) => last <= limit,
            (OrderSide::Sell, Some(limit)) => last >= limit,
            _ => false,
        };

        if let (true, Some(ack)) = (crossed, self.orders.get_mut(order_id)) {
            ack.status = OrderStatus::Filled;
            ack.executed_qty = ack.orig_qty;
            ack.avg_price = ack.price;
            ack.transact_time = Utc::now();
        }
    }
}

/// Random-walk step from the previous candle
fn next_candle(rng: &mut StdRng, prev: &Candle, config: &PaperConfig) -> Candle {
    let vol = config.volatility;
    let change = config.drift + rng.gen_range(-vol..=vol);
    let open = prev.close;
    let close = (open * (1.0 + change)).max(f64::EPSILON);

    let wick = rng.gen_range(0.0..=vol / 2.0);
    let high = open.max(close) * (1.0 + wick);
    let low = open.min(close) * (1.0 - wick);
    let volume = config.base_volume * rng.gen_range(0.5..=1.5);

    Candle {
        symbol: prev.symbol.clone(),
        open_time: prev.open_time + Duration::minutes(config.interval_minutes),
        open,
        high,
        low,
        close,
        volume,
    }
}

#[derive(Clone)]
pub struct PaperGateway {
    config: PaperConfig,
    market: Arc<Mutex<PaperMarket>>,
    limiter: Arc<PaperRateLimiter>,
    limited: Arc<AtomicBool>,
}

impl PaperGateway {
    pub fn new(config: PaperConfig) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        let market = PaperMarket {
            rng: StdRng::seed_from_u64(config.seed),
            candles: HashMap::new(),
            orders: HashMap::new(),
            next_order_id: 0,
        };

        Self {
            config,
            market: Arc::new(Mutex::new(market)),
            limiter,
            limited: Arc::new(AtomicBool::new(false)),
        }
    }

    fn market(&self) -> MutexGuard<'_, PaperMarket> {
        self.market.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn throttle(&self) -> Result<(), GatewayError> {
        match self.limiter.check() {
            Ok(()) => {
                self.limited.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(not_until) => {
                self.limited.store(true, Ordering::Relaxed);
                Err(GatewayError::RateLimited {
                    retry_after: not_until.wait_time_from(DefaultClock::default().now()),
                })
            }
        }
    }

    /// Force the next candle of `symbol` to close at `price`
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut market = self.market();
        market.ensure_symbol(symbol, &self.config);
        if let Some(series) = market.candles.get_mut(symbol) {
            if let Some(last) = series.last().cloned() {
                series.push(Candle {
                    open_time: last.open_time + Duration::minutes(self.config.interval_minutes),
                    open: last.close,
                    high: last.close.max(price),
                    low: last.close.min(price),
                    close: price,
                    ..last
                });
            }
        }
    }
}

#[async_trait]
impl MarketGateway for PaperGateway {
    async fn get_candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.throttle()?;
        if symbol.trim().is_empty() {
            return Err(GatewayError::NotFound("empty symbol".to_string()));
        }

        let mut market = self.market();
        market.advance(symbol, &self.config);

        let candles: Vec<Candle> = market
            .candles
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| start.map_or(true, |s| c.open_time >= s))
                    .filter(|c| end.map_or(true, |e| c.open_time <= e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        self.throttle()?;
        if symbol.trim().is_empty() {
            return Err(GatewayError::NotFound("empty symbol".to_string()));
        }

        let mut market = self.market();
        let last_price = market.last_price(symbol, &self.config);
        let volume_24h = market
            .candles
            .get(symbol)
            .map(|series| series.iter().rev().take(24 * 60).map(|c| c.volume).sum())
            .unwrap_or(0.0);

        Ok(Ticker {
            symbol: symbol.to_string(),
            last_price,
            bid: Some(last_price * 0.9995),
            ask: Some(last_price * 1.0005),
            volume_24h,
            timestamp: Utc::now(),
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.throttle()?;

        let side = request.side.ok_or_else(|| GatewayError::Exchange {
            code: -1102,
            message: "Mandatory parameter 'side' was not sent".to_string(),
        })?;
        let quantity = request
            .quantity
            .filter(|q| q.is_finite() && *q > 0.0)
            .ok_or_else(|| GatewayError::Exchange {
                code: -1013,
                message: "Invalid quantity".to_string(),
            })?;

        let mut market = self.market();
        let last = market.last_price(&request.symbol, &self.config);
        let order_id = market.next_order_id();

        let (status, executed_qty, avg_price) = match request.order_type {
            OrderType::Market => {
                let slippage = market.rng.gen_range(0.0..=self.config.max_fill_slippage);
                let fill = match side {
                    OrderSide::Buy => last * (1.0 + slippage),
                    OrderSide::Sell => last * (1.0 - slippage),
                };
                let partial = market
                    .rng
                    .gen_bool(self.config.partial_fill_probability.clamp(0.0, 1.0));
                if partial {
                    (
                        OrderStatus::PartiallyFilled,
                        quantity * self.config.partial_fill_ratio,
                        Some(fill),
                    )
                } else {
                    (OrderStatus::Filled, quantity, Some(fill))
                }
            }
            order_type => {
                if order_type.requires_price() && request.price.is_none() {
                    return Err(GatewayError::Exchange {
                        code: -1102,
                        message: "Mandatory parameter 'price' was not sent".to_string(),
                    });
                }
                (OrderStatus::New, 0.0, None)
            }
        };

        let ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: request
                .client_order_id
                .clone()
                .unwrap_or_else(|| format!("paper-{order_id}")),
            symbol: request.symbol.clone(),
            side,
            order_type: request.order_type,
            status,
            orig_qty: quantity,
            executed_qty,
            price: request.price,
            avg_price,
            stop_price: request.stop_price,
            transact_time: Utc::now(),
        };

        market.orders.insert(order_id, ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderAck, GatewayError> {
        self.throttle()?;

        let mut market = self.market();
        let order_id = match order {
            OrderRef::OrderId(id) => Some(id.clone()),
            OrderRef::ClientOrderId(client_id) => market
                .orders
                .values()
                .find(|o| &o.client_order_id == client_id)
                .map(|o| o.order_id.clone()),
        };

        let ack = order_id
            .and_then(|id| market.orders.get_mut(&id))
            .filter(|o| o.symbol == symbol)
            .ok_or_else(|| GatewayError::NotFound(format!("order {order:?} on {symbol}")))?;

        if ack.status.is_terminal() {
            return Err(GatewayError::Exchange {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            });
        }

        ack.status = OrderStatus::Canceled;
        ack.transact_time = Utc::now();
        Ok(ack.clone())
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, GatewayError> {
        self.throttle()?;

        let mut market = self.market();
        market.match_resting(order_id, &self.config);
        market
            .orders
            .get(order_id)
            .filter(|o| o.symbol == symbol)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("order {order_id} on {symbol}")))
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus {
            requests_per_second: self.config.requests_per_second,
            is_limited: self.limited.load(Ordering::Relaxed),
        }
    }
}

/// Portfolio entry in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioSettings {
    pub id: String,
    pub budget: f64,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Default for PortfolioSettings {
    fn default() -> Self {
        Self {
            id: "main".to_string(),
            budget: 10_000.0,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        }
    }
}

/// Budget provider backed by configured portfolios
#[derive(Clone, Default)]
pub struct StaticBudgetProvider {
    portfolios: Arc<DashMap<String, PortfolioBudget>>,
}

impl StaticBudgetProvider {
    pub fn new(portfolios: &[PortfolioSettings]) -> Self {
        let provider = Self::default();
        for p in portfolios {
            provider.set_portfolio(PortfolioBudget {
                portfolio_id: p.id.clone(),
                budget: p.budget,
                total_value: p.budget,
                symbols: p.symbols.clone(),
            });
        }
        provider
    }

    pub fn set_portfolio(&self, portfolio: PortfolioBudget) {
        self.portfolios.insert(portfolio.portfolio_id.clone(), portfolio);
    }
}

#[async_trait]
impl BudgetProvider for StaticBudgetProvider {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioBudget, GatewayError> {
        self.portfolios
            .get(portfolio_id)
            .map(|p| p.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("portfolio {portfolio_id}")))
    }
}
