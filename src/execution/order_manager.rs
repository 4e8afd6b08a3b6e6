//! Order placement, tracking and cancellation
//!
//! Wraps the gateway with validation, bounded retries, rate-limit waits and
//! per-symbol order history. Every state change is published on the event bus.
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::slippage::{SlippageAnalysis, SlippageHandler};
use crate::error::{GatewayError, TradingError, ValidationError};
use crate::events::{Event, EventBus};
use crate::gateway::MarketGateway;
use crate::history::{SymbolHistory, DEFAULT_HISTORY_CAPACITY};
use crate::models::{Order, OrderAck, OrderRef, OrderRequest, OrderStatus, OrderType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrderManagerConfig {
    /// Total placement attempts for transient failures
    pub retry_attempts: u32,
    /// First backoff delay, doubled per retry
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Rate-limit waits allowed per placement, not counted as attempts
    pub max_rate_limit_waits: u32,
    pub max_rate_limit_wait_ms: u64,
    pub enable_order_validation: bool,
    pub min_quantity_warning: f64,
    pub max_quantity_warning: f64,
    pub history_limit: usize,
    pub monitor_interval_ms: u64,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            max_rate_limit_waits: 5,
            max_rate_limit_wait_ms: 60_000,
            enable_order_validation: true,
            min_quantity_warning: 1e-6,
            max_quantity_warning: 1e6,
            history_limit: DEFAULT_HISTORY_CAPACITY,
            monitor_interval_ms: 5_000,
        }
    }
}

impl OrderManagerConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.retry_attempts == 0 {
            return Err(TradingError::Config("retry_attempts must be at least 1".to_string()));
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return Err(TradingError::Config(
                "retry_delay_ms must not exceed max_retry_delay_ms".to_string(),
            ));
        }
        if self.history_limit == 0 || self.monitor_interval_ms == 0 {
            return Err(TradingError::Config(
                "history_limit and monitor_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff before retry number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_delay_ms.saturating_mul(factor).min(self.max_retry_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Outcome of a slippage-controlled placement, possibly over several orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub orders: Vec<Order>,
    pub executed_quantity: f64,
    /// Quantity-weighted fill price across all orders
    pub average_price: Option<f64>,
    pub slippage: Vec<SlippageAnalysis>,
}

impl ExecutionReport {
    /// The order that carries the final state of the execution
    pub fn last_order(&self) -> Option<&Order> {
        self.orders.last()
    }
}

#[derive(Clone)]
pub struct OrderManager {
    gateway: Arc<dyn MarketGateway>,
    slippage: SlippageHandler,
    config: Arc<RwLock<OrderManagerConfig>>,
    active: Arc<DashMap<String, Order>>,
    history: SymbolHistory<Order>,
    events: EventBus,
}

impl OrderManager {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        slippage: SlippageHandler,
        config: OrderManagerConfig,
        events: EventBus,
    ) -> Self {
        let history = SymbolHistory::new(config.history_limit.max(1));
        Self {
            gateway,
            slippage,
            config: Arc::new(RwLock::new(config)),
            active: Arc::new(DashMap::new()),
            history,
            events,
        }
    }

    pub fn config(&self) -> OrderManagerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, config: OrderManagerConfig) -> Result<(), TradingError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.events.emit(Event::ConfigUpdated {
            section: "orders".to_string(),
        });
        Ok(())
    }

    pub fn slippage_handler(&self) -> &SlippageHandler {
        &self.slippage
    }

    /// Itemized check of a request before it reaches the exchange
    pub fn validate_order(&self, request: &OrderRequest) -> OrderValidation {
        let config = self.config();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if request.symbol.trim().is_empty() {
            errors.push("Symbol is required".to_string());
        }
        if request.side.is_none() {
            errors.push("Side is required".to_string());
        }

        match request.quantity {
            None => errors.push("Quantity is required".to_string()),
            Some(q) if !q.is_finite() || q <= 0.0 => {
                errors.push("Quantity must be greater than 0".to_string())
            }
            Some(q) if q < config.min_quantity_warning => {
                warnings.push(format!("Quantity {q} is very small"))
            }
            Some(q) if q > config.max_quantity_warning => {
                warnings.push(format!("Quantity {q} is very large"))
            }
            Some(_) => {}
        }

        if request.order_type.requires_price() {
            match request.price {
                None => errors.push(format!("Price is required for {:?} orders", request.order_type)),
                Some(p) if !p.is_finite() || p <= 0.0 => {
                    errors.push("Price must be greater than 0".to_string())
                }
                Some(_) => {}
            }
        } else if request.order_type == OrderType::Market && request.price.is_some() {
            warnings.push("Price is ignored for MARKET orders".to_string());
        }

        if request.order_type.requires_stop_price() {
            match request.stop_price {
                None => errors.push(format!(
                    "Stop price is required for {:?} orders",
                    request.order_type
                )),
                Some(p) if !p.is_finite() || p <= 0.0 => {
                    errors.push("Stop price must be greater than 0".to_string())
                }
                Some(_) => {}
            }
        }

        OrderValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Validate, submit with retries, and start tracking the order
    pub async fn place_order(&self, request: OrderRequest) -> Result<Order, TradingError> {
        let config = self.config();

        if config.enable_order_validation {
            let validation = self.validate_order(&request);
            if !validation.is_valid {
                let err = ValidationError {
                    errors: validation.errors,
                };
                self.events.emit(Event::OrderError {
                    symbol: request.symbol.clone(),
                    error: err.to_string(),
                });
                return Err(err.into());
            }
            if !validation.warnings.is_empty() {
                self.events.emit(Event::OrderWarning {
                    symbol: request.symbol.clone(),
                    warnings: validation.warnings,
                });
            }
        }

        // A stable client id keeps retried submissions idempotent on the exchange
        let request = match request.client_order_id {
            Some(_) => request,
            None => request.with_client_order_id(format!("tp-{}", Uuid::new_v4().simple())),
        };

        let ack = match self.submit_with_retry(&request, &config).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!("❌ Order failed for {}: {}", request.symbol, e);
                self.events.emit(Event::OrderError {
                    symbol: request.symbol.clone(),
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let order = Order::from_ack(&ack);
        tracing::info!(
            "✓ Order {} placed: {} {:.6} {} ({:?})",
            order.order_id,
            order.side,
            order.quantity,
            order.symbol,
            order.status
        );

        self.history.push(&order.symbol, order.clone());
        if !order.status.is_terminal() {
            self.active.insert(order.order_id.clone(), order.clone());
        }
        self.events.emit(Event::OrderPlaced(order.clone()));

        Ok(order)
    }

    async fn submit_with_retry(
        &self,
        request: &OrderRequest,
        config: &OrderManagerConfig,
    ) -> Result<OrderAck, GatewayError> {
        let max_attempts = config.retry_attempts.max(1);
        let mut attempt = 1;
        let mut rate_limit_waits = 0;

        loop {
            match self.gateway.place_order(request).await {
                Ok(ack) => return Ok(ack),
                Err(GatewayError::RateLimited { retry_after })
                    if rate_limit_waits < config.max_rate_limit_waits =>
                {
                    rate_limit_waits += 1;
                    let wait = retry_after.min(Duration::from_millis(config.max_rate_limit_wait_ms));
                    tracing::warn!(
                        "Rate limited placing {} order, waiting {}ms ({}/{})",
                        request.symbol,
                        wait.as_millis(),
                        rate_limit_waits,
                        config.max_rate_limit_waits
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = config.backoff_delay(attempt);
                    tracing::warn!(
                        "Order attempt {}/{} for {} failed: {}, retrying in {}ms",
                        attempt,
                        max_attempts,
                        request.symbol,
                        e,
                        delay.as_millis()
                    );
                    self.events.emit(Event::OrderRetry {
                        symbol: request.symbol.clone(),
                        attempt,
                        max_attempts,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Place an order and police its fills for slippage
    ///
    /// A partially filled order never stays working: its remainder is
    /// cancelled and the report counts what the exchange confirms as filled.
    /// When the slippage on that fill is unacceptable and another retry is
    /// allowed, the remainder is re-placed at a size reduced in proportion to
    /// the observed slippage.
    pub async fn place_order_with_slippage_control(
        &self,
        request: OrderRequest,
        expected_price: f64,
    ) -> Result<ExecutionReport, TradingError> {
        let mut report = ExecutionReport {
            orders: Vec::new(),
            executed_quantity: 0.0,
            average_price: None,
            slippage: Vec::new(),
        };
        let mut notional = 0.0;
        let mut retries = 0;
        let mut next_request = request;

        loop {
            let placed = self.place_order(next_request.clone()).await?;
            let partial = placed.status == OrderStatus::PartiallyFilled;
            let order = if partial {
                self.settle_partial(placed).await
            } else {
                placed
            };
            report.orders.push(order.clone());

            let Some(fill_price) = order.avg_fill_price.filter(|_| order.executed_quantity > 0.0) else {
                break;
            };

            notional += fill_price * order.executed_quantity;
            report.executed_quantity += order.executed_quantity;

            let analysis = self.slippage.calculate_slippage(
                &order.symbol,
                expected_price,
                fill_price,
                order.side,
                order.executed_quantity,
                Some(order.order_id.clone()),
            );
            report.slippage.push(analysis.clone());

            if !partial
                || order.status != OrderStatus::Canceled
                || !self.slippage.should_retry_order(&analysis, retries)
            {
                break;
            }

            let remaining = order.remaining_quantity();
            if remaining <= 0.0 {
                break;
            }

            let resized = self.slippage.calculate_optimal_order_size(
                &order.symbol,
                remaining,
                analysis.slippage_percentage,
            );
            retries += 1;
            tracing::warn!(
                "Retrying {} remainder {:.6} -> {:.6} after {:.3}% slippage (retry {})",
                order.symbol,
                remaining,
                resized,
                analysis.slippage_percentage * 100.0,
                retries
            );

            next_request = OrderRequest {
                client_order_id: None,
                ..next_request.with_quantity(resized)
            };
        }

        if report.executed_quantity > 0.0 {
            report.average_price = Some(notional / report.executed_quantity);
        }
        Ok(report)
    }

    /// Cancel the unfilled part of an order and return its final state
    ///
    /// Fills that landed before the cancel are taken from the cancel ack. If
    /// the cancel is refused, the latest exchange status is used instead.
    async fn settle_partial(&self, order: Order) -> Order {
        if let Some(settled) = self.cancel_tracked(&order.order_id).await {
            return settled;
        }
        tracing::warn!(
            "Order {} for {} could not be cancelled, remainder may still fill",
            order.order_id,
            order.symbol
        );
        match self.get_order_status(&order.order_id).await {
            Some(latest) => latest,
            None => order,
        }
    }

    /// Cancel a tracked order; false (with a `cancel_error` event) on failure
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        self.cancel_tracked(order_id).await.is_some()
    }

    async fn cancel_tracked(&self, order_id: &str) -> Option<Order> {
        let Some(order) = self.active.get(order_id).map(|o| o.clone()) else {
            self.events.emit(Event::CancelError {
                order_id: order_id.to_string(),
                error: "Order not found among active orders".to_string(),
            });
            return None;
        };

        match self
            .gateway
            .cancel_order(&order.symbol, &OrderRef::OrderId(order_id.to_string()))
            .await
        {
            Ok(ack) => {
                let mut order = order;
                order.apply_ack(&ack);
                if !order.status.is_terminal() {
                    order.status = OrderStatus::Canceled;
                }
                self.store_update(&order);
                tracing::info!("Order {} canceled ({})", order_id, order.symbol);
                self.events.emit(Event::OrderCanceled(order.clone()));
                Some(order)
            }
            Err(e) => {
                tracing::warn!("Failed to cancel order {}: {}", order_id, e);
                self.events.emit(Event::CancelError {
                    order_id: order_id.to_string(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Cancel every active order, optionally only for one symbol
    ///
    /// Returns the number of orders cancelled.
    pub async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let ids: Vec<String> = self
            .active
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .map(|o| o.order_id.clone())
            .collect();

        let mut canceled = 0;
        for id in ids {
            if self.cancel_order(&id).await {
                canceled += 1;
            }
        }
        canceled
    }

    /// Fresh status from the exchange
    ///
    /// `None` for orders this manager never placed, or when the exchange
    /// query fails (reported as `status_error`).
    pub async fn get_order_status(&self, order_id: &str) -> Option<Order> {
        let order = self.get_order(order_id)?;

        match self.gateway.get_order(&order.symbol, order_id).await {
            Ok(ack) => {
                let mut updated = order.clone();
                updated.apply_ack(&ack);
                if updated.status != order.status || updated.executed_quantity != order.executed_quantity {
                    self.store_update(&updated);
                    self.events.emit(Event::OrderUpdated(updated.clone()));
                }
                Some(updated)
            }
            Err(e) => {
                tracing::warn!("Status query failed for order {}: {}", order_id, e);
                self.events.emit(Event::StatusError {
                    order_id: order_id.to_string(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Poll every active order once; terminal orders leave the active set
    pub async fn refresh_active_orders(&self) -> Vec<Order> {
        let ids: Vec<String> = self.active.iter().map(|o| o.order_id.clone()).collect();

        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(order) = self.get_order_status(&id).await {
                updated.push(order);
            }
        }
        updated
    }

    /// Background monitor polling active orders until shutdown
    pub async fn run_monitor(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config().monitor_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.active.is_empty() {
                        self.refresh_active_orders().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Order monitor stopped");
                        break;
                    }
                }
            }
        }
    }

    fn store_update(&self, order: &Order) {
        if order.status.is_terminal() {
            self.active.remove(&order.order_id);
        } else {
            self.active.insert(order.order_id.clone(), order.clone());
        }
        self.history.update_matching(
            &order.symbol,
            |o| o.order_id == order.order_id,
            |o| *o = order.clone(),
        );
    }

    pub fn get_active_orders_for_symbol(&self, symbol: &str) -> Vec<Order> {
        self.active
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.clone())
            .collect()
    }

    pub fn get_all_active_orders(&self) -> Vec<Order> {
        self.active.iter().map(|o| o.clone()).collect()
    }

    /// Locally known state of an order, active or historical
    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        if let Some(order) = self.active.get(order_id) {
            return Some(order.clone());
        }
        self.history
            .keys()
            .iter()
            .find_map(|symbol| {
                self.history
                    .filter(symbol, |o| o.order_id == order_id)
                    .into_iter()
                    .last()
            })
    }

    pub fn get_order_history(&self, symbol: &str, limit: Option<usize>) -> Vec<Order> {
        match limit {
            Some(n) => self.history.recent(symbol, n),
            None => self.history.all(symbol),
        }
    }
}
