use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::decision::{build_reasoning, combine_scores, protective_levels, ScoreWeights, TradeDecision};
use crate::analysis::{SentimentAnalysisEngine, TechnicalAnalysisEngine};
use crate::config::Settings;
use crate::error::TradingError;
use crate::events::{Event, EventBus};
use crate::execution::{
    ExecutionReport, ExitReason, OrderManager, Position, PositionBook, SlippageHandler,
};
use crate::gateway::{BudgetProvider, MarketGateway};
use crate::history::SymbolHistory;
use crate::models::{OrderRequest, OrderSide, PortfolioBudget, TradeAction};
use crate::risk::{CircuitBreakerRegistry, PositionRiskEngine};

/// Capped sizes stay strictly inside the per-position risk limit
const RISK_HEADROOM: f64 = 0.99;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TradingConfig {
    /// |combined score| needed for BUY/SELL
    pub decision_threshold: f64,
    pub min_confidence_threshold: f64,
    pub sentiment_weight: f64,
    pub technical_weight: f64,
    pub max_concurrent_symbols: usize,
    pub candle_interval: String,
    pub candle_limit: usize,
    pub stop_loss_atr_multiplier: f64,
    pub take_profit_atr_multiplier: f64,
    /// Used when no ATR is available
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Open shorts on SELL decisions without a long to close
    pub allow_short_selling: bool,
    /// Execute actionable decisions during each cycle
    pub auto_execute: bool,
    pub trade_history_limit: usize,
    pub cycle_interval_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            decision_threshold: 0.2,
            min_confidence_threshold: 0.3,
            sentiment_weight: 0.4,
            technical_weight: 0.6,
            max_concurrent_symbols: 4,
            candle_interval: "1m".to_string(),
            candle_limit: 100,
            stop_loss_atr_multiplier: 2.0,
            take_profit_atr_multiplier: 3.0,
            stop_loss_pct: 0.02,   // -2% without ATR
            take_profit_pct: 0.04, // +4% without ATR
            allow_short_selling: false,
            auto_execute: true,
            trade_history_limit: 1000,
            cycle_interval_secs: 60,
        }
    }
}

impl TradingConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        let unit = [
            ("decision_threshold", self.decision_threshold),
            ("min_confidence_threshold", self.min_confidence_threshold),
            ("sentiment_weight", self.sentiment_weight),
            ("technical_weight", self.technical_weight),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(TradingError::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.sentiment_weight + self.technical_weight <= 0.0 {
            return Err(TradingError::Config("score weights must not both be zero".to_string()));
        }

        let positive = [
            ("stop_loss_atr_multiplier", self.stop_loss_atr_multiplier),
            ("take_profit_atr_multiplier", self.take_profit_atr_multiplier),
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(TradingError::Config(format!("{name} must be positive, got {value}")));
            }
        }

        if self.max_concurrent_symbols == 0
            || self.candle_limit == 0
            || self.trade_history_limit == 0
            || self.cycle_interval_secs == 0
        {
            return Err(TradingError::Config(
                "max_concurrent_symbols, candle_limit, trade_history_limit and cycle_interval_secs must be positive"
                    .to_string(),
            ));
        }
        if self.candle_interval.trim().is_empty() {
            return Err(TradingError::Config("candle_interval is required".to_string()));
        }
        Ok(())
    }

    pub fn score_weights(&self) -> ScoreWeights {
        ScoreWeights {
            sentiment: self.sentiment_weight,
            technical: self.technical_weight,
            decision_threshold: self.decision_threshold,
            min_confidence: self.min_confidence_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running {
        portfolio_id: String,
        symbols: Vec<String>,
        started_at: DateTime<Utc>,
    },
}

/// Components the engine drives
#[derive(Clone)]
pub struct EngineParts {
    pub technical: TechnicalAnalysisEngine,
    pub sentiment: SentimentAnalysisEngine,
    pub risk: PositionRiskEngine,
    pub breakers: CircuitBreakerRegistry,
    pub orders: OrderManager,
}

/// Orchestrates analysis, sizing, execution and position tracking
#[derive(Clone)]
pub struct TradingEngine {
    config: Arc<RwLock<TradingConfig>>,
    gateway: Arc<dyn MarketGateway>,
    budgets: Arc<dyn BudgetProvider>,
    technical: TechnicalAnalysisEngine,
    sentiment: SentimentAnalysisEngine,
    risk: PositionRiskEngine,
    breakers: CircuitBreakerRegistry,
    orders: OrderManager,
    positions: PositionBook,
    /// Decisions per portfolio
    trade_history: SymbolHistory<TradeDecision>,
    state: Arc<Mutex<EngineState>>,
    /// "portfolio:symbol" -> lock serializing decide/execute
    symbol_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventBus,
}

impl TradingEngine {
    pub fn new(
        config: TradingConfig,
        gateway: Arc<dyn MarketGateway>,
        budgets: Arc<dyn BudgetProvider>,
        parts: EngineParts,
        events: EventBus,
    ) -> Self {
        let trade_history = SymbolHistory::new(config.trade_history_limit.max(1));
        Self {
            config: Arc::new(RwLock::new(config)),
            gateway,
            budgets,
            technical: parts.technical,
            sentiment: parts.sentiment,
            risk: parts.risk,
            breakers: parts.breakers,
            orders: parts.orders,
            positions: PositionBook::default(),
            trade_history,
            state: Arc::new(Mutex::new(EngineState::Stopped)),
            symbol_locks: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Wire the whole component graph from validated settings
    pub fn from_settings(
        settings: &Settings,
        gateway: Arc<dyn MarketGateway>,
        budgets: Arc<dyn BudgetProvider>,
        events: EventBus,
    ) -> Result<Self, TradingError> {
        settings.validate()?;

        let slippage = SlippageHandler::new(settings.slippage.clone(), events.clone());
        let parts = EngineParts {
            technical: TechnicalAnalysisEngine::new(settings.technical.clone(), events.clone()),
            sentiment: SentimentAnalysisEngine::new(settings.sentiment.clone(), events.clone()),
            risk: PositionRiskEngine::new(settings.risk.clone()),
            breakers: CircuitBreakerRegistry::new(settings.circuit_breakers.clone()),
            orders: OrderManager::new(gateway.clone(), slippage, settings.orders.clone(), events.clone()),
        };

        Ok(Self::new(settings.trading.clone(), gateway, budgets, parts, events))
    }

    pub fn config(&self) -> TradingConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, config: TradingConfig) -> Result<(), TradingError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.events.emit(Event::ConfigUpdated {
            section: "trading".to_string(),
        });
        Ok(())
    }

    pub fn technical(&self) -> &TechnicalAnalysisEngine {
        &self.technical
    }

    pub fn sentiment(&self) -> &SentimentAnalysisEngine {
        &self.sentiment
    }

    pub fn risk(&self) -> &PositionRiskEngine {
        &self.risk
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running { .. })
    }

    /// Start trading a portfolio
    ///
    /// An empty `symbols` list trades the portfolio's configured symbols.
    /// Fails with `AlreadyRunning` (leaving the active session untouched)
    /// when a session is in progress.
    pub async fn start_trading(&self, portfolio_id: &str, symbols: Vec<String>) -> Result<(), TradingError> {
        if self.is_running() {
            return Err(TradingError::AlreadyRunning);
        }

        let portfolio = self.budgets.get_portfolio(portfolio_id).await?;
        let symbols = if symbols.is_empty() {
            portfolio.symbols.clone()
        } else {
            symbols
        };

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, EngineState::Running { .. }) {
                return Err(TradingError::AlreadyRunning);
            }
            *state = EngineState::Running {
                portfolio_id: portfolio_id.to_string(),
                symbols: symbols.clone(),
                started_at: Utc::now(),
            };
        }

        self.breakers.ensure_portfolio(portfolio_id, portfolio.total_value);
        self.technical.start_analysis(&symbols);
        self.sentiment.start_analysis(&symbols);

        tracing::info!(
            "🚀 Trading started for {} ({} symbols, budget ${:.2})",
            portfolio_id,
            symbols.len(),
            portfolio.budget
        );
        self.events.emit(Event::TradingStarted {
            portfolio_id: portfolio_id.to_string(),
            symbols,
        });
        Ok(())
    }

    /// Stop trading; safe to call when already stopped
    pub fn stop_trading(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, EngineState::Stopped)
        };

        self.technical.stop_analysis();
        self.sentiment.stop_analysis();

        let portfolio_id = match previous {
            EngineState::Running { portfolio_id, .. } => {
                tracing::info!("⏹ Trading stopped for {}", portfolio_id);
                Some(portfolio_id)
            }
            EngineState::Stopped => None,
        };
        self.events.emit(Event::TradingStopped { portfolio_id });
    }

    fn symbol_lock(&self, portfolio_id: &str, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks
            .entry(format!("{portfolio_id}:{symbol}"))
            .or_default()
            .clone()
    }

    /// Decide for every symbol concurrently
    ///
    /// Symbols whose data cannot be fetched or analyzed are skipped with an
    /// error event; the rest still produce decisions, returned in input order.
    pub async fn make_trading_decisions(&self, portfolio_id: &str, symbols: &[String]) -> Vec<TradeDecision> {
        let budget = match self.budgets.get_portfolio(portfolio_id).await {
            Ok(budget) => Some(budget),
            Err(e) => {
                tracing::warn!("Budget unavailable for {}: {} (decisions will not be sized)", portfolio_id, e);
                None
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config().max_concurrent_symbols.max(1)));
        let mut tasks = JoinSet::new();

        for (index, symbol) in symbols.iter().enumerate() {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            let portfolio_id = portfolio_id.to_string();
            let symbol = symbol.clone();
            let budget = budget.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                engine
                    .decide_symbol(&portfolio_id, &symbol, budget.as_ref())
                    .await
                    .map(|decision| (index, decision))
            });
        }

        let mut decisions = Vec::with_capacity(symbols.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(decision)) => decisions.push(decision),
                Ok(None) => {}
                Err(e) => tracing::error!("Decision task failed: {}", e),
            }
        }

        decisions.sort_by_key(|(index, _)| *index);
        decisions.into_iter().map(|(_, decision)| decision).collect()
    }

    async fn decide_symbol(
        &self,
        portfolio_id: &str,
        symbol: &str,
        budget: Option<&PortfolioBudget>,
    ) -> Option<TradeDecision> {
        let lock = self.symbol_lock(portfolio_id, symbol);
        let _guard = lock.lock().await;
        let config = self.config();

        let candles = match self
            .gateway
            .get_candles(symbol, &config.candle_interval, config.candle_limit, None, None)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!("Failed to fetch candles for {}: {}", symbol, e);
                self.events.emit(Event::AnalysisError {
                    symbol: symbol.to_string(),
                    error: e.to_string(),
                });
                return None;
            }
        };

        let technical = match self.technical.perform_technical_analysis(symbol, &candles) {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!("Skipping decision for {}: {}", symbol, e);
                self.events.emit(Event::DecisionError {
                    symbol: symbol.to_string(),
                    error: e.to_string(),
                });
                return None;
            }
        };

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volatility = self.risk.update_volatility_data(symbol, &closes);

        let sentiment = self.sentiment.current_sentiment(symbol);
        let sentiment_score = sentiment.as_ref().map_or(0.0, |s| s.overall_sentiment);
        let technical_score = technical.directional_strength();

        let weights = config.score_weights();
        let combined = combine_scores(sentiment_score, technical_score, &weights);
        let mut reasoning = build_reasoning(&combined, &technical, sentiment.as_ref(), &weights);
        let price = technical.price;

        let mut decision = TradeDecision {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            portfolio_id: portfolio_id.to_string(),
            action: combined.action,
            confidence: combined.confidence,
            combined_score: combined.score,
            sentiment_score,
            technical_score,
            reasoning: String::new(),
            sentiment,
            technical,
            suggested_quantity: None,
            suggested_price: Some(price),
            sizing_method: None,
            stop_loss: None,
            take_profit: None,
            timestamp: Utc::now(),
        };

        if let Some(side) = combined.action.side() {
            if let Some(note) = self.size_decision(&mut decision, side, budget, volatility, &config) {
                reasoning.push_str("; ");
                reasoning.push_str(&note);
            }
        }
        decision.reasoning = reasoning;

        tracing::info!(
            "{} {} {} (confidence {:.2}, score {:.3})",
            portfolio_id,
            decision.action,
            symbol,
            decision.confidence,
            decision.combined_score
        );

        self.trade_history.push(portfolio_id, decision.clone());
        self.events.emit(Event::TradeDecision(decision.clone()));
        Some(decision)
    }

    /// Fill quantity and protective levels; returns a note for the reasoning
    fn size_decision(
        &self,
        decision: &mut TradeDecision,
        side: OrderSide,
        budget: Option<&PortfolioBudget>,
        volatility: f64,
        config: &TradingConfig,
    ) -> Option<String> {
        let portfolio_id = decision.portfolio_id.clone();
        let symbol = decision.symbol.clone();
        let price = decision.technical.price;
        let open = self.positions.get_open_position(&portfolio_id, &symbol);

        if let Some(position) = open.as_ref().filter(|p| p.side != side) {
            decision.suggested_quantity = Some(position.quantity);
            return Some(format!("closes open {} position of {:.6}", position.side, position.quantity));
        }
        if side == OrderSide::Sell && open.is_none() && !config.allow_short_selling {
            return Some("no position to sell".to_string());
        }
        let Some(budget) = budget else {
            return Some("portfolio budget unavailable".to_string());
        };

        let committed = self.positions.committed_capital(&portfolio_id);
        let available = (budget.budget - committed).max(0.0);

        let sizing = match self.risk.calculate_position_size(
            &symbol,
            &portfolio_id,
            available,
            decision.confidence,
            price,
            volatility,
        ) {
            Ok(sizing) => sizing,
            Err(e) => {
                tracing::warn!("Sizing failed for {}: {}", symbol, e);
                return Some(format!("sizing failed: {e}"));
            }
        };

        // Existing exposure on the same side counts against the limit
        let held = open.as_ref().map_or(0.0, |p| p.quantity);
        let risk_cap =
            (self.risk.config().max_risk_per_position * budget.total_value * RISK_HEADROOM / price - held).max(0.0);
        let quantity = sizing.suggested_quantity.min(risk_cap);

        let (stop_loss, take_profit) = protective_levels(
            side,
            price,
            Some(decision.technical.indicators.atr),
            (config.stop_loss_atr_multiplier, config.take_profit_atr_multiplier),
            (config.stop_loss_pct, config.take_profit_pct),
        );

        decision.suggested_quantity = (quantity > 0.0).then_some(quantity);
        decision.sizing_method = Some(sizing.sizing_method);
        decision.stop_loss = Some(stop_loss);
        decision.take_profit = Some(take_profit);

        if quantity <= 0.0 {
            return Some(format!("no budget left (available ${available:.2})"));
        }
        Some(format!(
            "{:?} sizing {:.6} of max {:.6}",
            sizing.sizing_method, quantity, sizing.max_quantity
        ))
    }

    fn execution_error(&self, portfolio_id: &str, symbol: &str, error: String) {
        tracing::error!("❌ Execution failed for {} {}: {}", portfolio_id, symbol, error);
        self.events.emit(Event::ExecutionError {
            portfolio_id: portfolio_id.to_string(),
            symbol: symbol.to_string(),
            error,
        });
    }

    /// Act on a decision
    ///
    /// Returns `None` for HOLD, for decisions missing quantity or price, and
    /// for failures (reported as `execution_error`).
    pub async fn execute_trade(&self, decision: &TradeDecision) -> Option<ExecutionReport> {
        if !decision.is_executable() {
            tracing::debug!("Nothing to execute for {} ({})", decision.symbol, decision.action);
            return None;
        }
        let (Some(side), Some(quantity), Some(price)) = (
            decision.action.side(),
            decision.suggested_quantity,
            decision.suggested_price,
        ) else {
            return None;
        };

        let portfolio_id = decision.portfolio_id.as_str();
        let symbol = decision.symbol.as_str();
        let lock = self.symbol_lock(portfolio_id, symbol);
        let _guard = lock.lock().await;

        let report = match self.positions.get_open_position(portfolio_id, symbol) {
            Some(position) if position.side != side => {
                match self.close_with_order(&position, price, ExitReason::Signal).await {
                    Ok((report, _)) => report,
                    Err(e) => {
                        self.execution_error(portfolio_id, symbol, e.to_string());
                        return None;
                    }
                }
            }
            None if side == OrderSide::Sell && !self.config().allow_short_selling => {
                tracing::debug!("No position to sell for {} {}", portfolio_id, symbol);
                return None;
            }
            _ => self.open_with_order(decision, side, quantity, price).await?,
        };

        if let Some(order) = report.last_order() {
            self.events.emit(Event::OrderExecuted {
                decision_id: decision.id,
                portfolio_id: portfolio_id.to_string(),
                order: order.clone(),
            });
        }
        Some(report)
    }

    async fn open_with_order(
        &self,
        decision: &TradeDecision,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Option<ExecutionReport> {
        let portfolio_id = decision.portfolio_id.as_str();
        let symbol = decision.symbol.as_str();

        if let Err(trip) = self.breakers.check(portfolio_id) {
            tracing::warn!("🚨 Circuit breaker for {}: {}", portfolio_id, trip);
            self.events.emit(Event::CircuitBreakerTripped {
                portfolio_id: portfolio_id.to_string(),
                trip,
            });
            self.execution_error(portfolio_id, symbol, format!("Circuit breaker: {trip}"));
            return None;
        }

        let portfolio = match self.budgets.get_portfolio(portfolio_id).await {
            Ok(portfolio) => portfolio,
            Err(e) => {
                self.execution_error(portfolio_id, symbol, e.to_string());
                return None;
            }
        };

        let held = self
            .positions
            .get_open_position(portfolio_id, symbol)
            .map_or(0.0, |p| p.quantity);
        let validation = match self.risk.validate_position(
            symbol,
            portfolio_id,
            held + quantity,
            price,
            portfolio.total_value,
        ) {
            Ok(validation) => validation,
            Err(e) => {
                self.execution_error(portfolio_id, symbol, e.to_string());
                return None;
            }
        };
        if !validation.is_valid {
            let reason = validation.reason.unwrap_or_default();
            self.execution_error(portfolio_id, symbol, reason);
            return None;
        }

        let request = OrderRequest::market(symbol, side, quantity);
        let report = match self.orders.place_order_with_slippage_control(request, price).await {
            Ok(report) => report,
            Err(e) => {
                self.execution_error(portfolio_id, symbol, e.to_string());
                return None;
            }
        };

        if report.executed_quantity > 0.0 {
            let fill_price = report.average_price.unwrap_or(price);
            let position = self.positions.open_or_add(
                portfolio_id,
                symbol,
                side,
                report.executed_quantity,
                fill_price,
                decision.stop_loss,
                decision.take_profit,
            );

            self.register_risk(&position, portfolio.total_value);
            self.breakers.record_execution(portfolio_id);
            self.events.emit(Event::PositionOpened(position));
        }

        Some(report)
    }

    /// Track the open risk of a position at its current size
    fn register_risk(&self, position: &Position, portfolio_value: f64) {
        match self.risk.calculate_position_risk(
            &position.symbol,
            &position.portfolio_id,
            position.quantity,
            position.entry_price,
            portfolio_value,
        ) {
            Ok(risk) => self.risk.register_position_risk(risk),
            Err(e) => tracing::warn!("Could not register risk for {}: {}", position.symbol, e),
        }
    }

    /// Send the offsetting order for a position and book what filled
    async fn close_with_order(
        &self,
        position: &Position,
        expected_price: f64,
        reason: ExitReason,
    ) -> Result<(ExecutionReport, Option<Position>), TradingError> {
        let request = OrderRequest::market(&position.symbol, position.side.opposite(), position.quantity);
        let report = self
            .orders
            .place_order_with_slippage_control(request, expected_price)
            .await?;

        if report.executed_quantity <= 0.0 {
            return Ok((report, None));
        }

        let exit_price = report.average_price.unwrap_or(expected_price);
        let closed = self.positions.reduce_position(
            &position.portfolio_id,
            &position.symbol,
            report.executed_quantity,
            exit_price,
            reason,
        );

        if let Some(closed) = &closed {
            self.breakers
                .record_closed_trade(&closed.portfolio_id, closed.realized_pnl.unwrap_or(0.0));
            match self.positions.get_open_position(&closed.portfolio_id, &closed.symbol) {
                Some(remaining) => match self.budgets.get_portfolio(&remaining.portfolio_id).await {
                    Ok(portfolio) => self.register_risk(&remaining, portfolio.total_value),
                    Err(e) => tracing::warn!(
                        "Could not refresh risk for {} after partial close: {}",
                        remaining.symbol,
                        e
                    ),
                },
                None => {
                    self.risk.remove_position_risk(&closed.portfolio_id, &closed.symbol);
                }
            }
            self.events.emit(Event::PositionClosed(closed.clone()));
        }

        Ok((report, closed))
    }

    /// Close an open position at market
    pub async fn close_position(&self, portfolio_id: &str, symbol: &str, reason: ExitReason) -> Option<Position> {
        let lock = self.symbol_lock(portfolio_id, symbol);
        let _guard = lock.lock().await;

        let position = self.positions.get_open_position(portfolio_id, symbol)?;
        match self.close_with_order(&position, position.current_price, reason).await {
            Ok((_, closed)) => closed,
            Err(e) => {
                self.execution_error(portfolio_id, symbol, e.to_string());
                None
            }
        }
    }

    /// Refresh prices of every symbol with an open position
    ///
    /// Returns how many symbols were updated; fetch failures are logged and
    /// skipped.
    pub async fn update_position_prices(&self) -> usize {
        let mut updated = 0;
        for symbol in self.positions.open_symbols() {
            match self.gateway.get_ticker(&symbol).await {
                Ok(ticker) => {
                    self.positions.update_price(&symbol, ticker.last_price);
                    updated += 1;
                }
                Err(e) => tracing::warn!("Failed to refresh price for {}: {}", symbol, e),
            }
        }
        updated
    }

    /// Close positions whose stop loss or take profit has been reached
    pub async fn check_position_exits(&self) -> Vec<Position> {
        let prices: HashMap<String, f64> = self
            .positions
            .open_positions(None)
            .into_iter()
            .map(|p| (p.symbol, p.current_price))
            .collect();

        let mut closed = Vec::new();
        for signal in self.positions.check_exits(&prices) {
            tracing::info!(
                "🛑 {:?} hit for {} {} @ ${:.2}",
                signal.reason,
                signal.portfolio_id,
                signal.symbol,
                signal.price
            );
            if let Some(position) = self
                .close_position(&signal.portfolio_id, &signal.symbol, signal.reason)
                .await
            {
                closed.push(position);
            }
        }
        closed
    }

    pub fn get_open_positions(&self, portfolio_id: Option<&str>) -> Vec<Position> {
        self.positions.open_positions(portfolio_id)
    }

    pub fn get_closed_positions(&self, portfolio_id: &str, limit: Option<usize>) -> Vec<Position> {
        self.positions.closed_positions(portfolio_id, limit)
    }

    /// Decisions for a portfolio, oldest first
    pub fn get_trade_history(&self, portfolio_id: &str, limit: Option<usize>) -> Vec<TradeDecision> {
        match limit {
            Some(n) => self.trade_history.recent(portfolio_id, n),
            None => self.trade_history.all(portfolio_id),
        }
    }

    /// One pass of the trading loop for the active session
    pub async fn run_cycle(&self) -> Result<Vec<TradeDecision>, TradingError> {
        let EngineState::Running {
            portfolio_id,
            symbols,
            ..
        } = self.state()
        else {
            return Err(TradingError::NotRunning);
        };

        self.update_position_prices().await;
        self.check_position_exits().await;

        let decisions = self.make_trading_decisions(&portfolio_id, &symbols).await;

        if self.config().auto_execute {
            for decision in decisions.iter().filter(|d| d.is_executable()) {
                if !self.is_running() {
                    break;
                }
                self.execute_trade(decision).await;
            }
        }

        Ok(decisions)
    }

    /// Run cycles on the configured interval until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config().cycle_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_running() {
                        continue;
                    }
                    match self.run_cycle().await {
                        Ok(decisions) => {
                            let actionable = decisions
                                .iter()
                                .filter(|d| d.action != TradeAction::Hold)
                                .count();
                            tracing::info!(
                                "Cycle complete: {} decisions, {} actionable, {} open positions",
                                decisions.len(),
                                actionable,
                                self.positions.open_positions(None).len()
                            );
                        }
                        Err(e) => tracing::warn!("Trading cycle skipped: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        self.stop_trading();
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{SentimentConfig, SentimentPayload, TechnicalConfig};
    use crate::events::drain;
    use crate::execution::{OrderManagerConfig, SlippageConfig};
    use crate::gateway::mock::{
        ack_for, candles_from_closes, downtrend_closes, uptrend_closes, MockBudgets, MockGateway,
    };
    use crate::models::OrderStatus;
    use crate::error::GatewayError;
    use crate::risk::{CircuitBreakers, RiskConfig};
    use std::sync::atomic::Ordering;

    const PORTFOLIO: &str = "main";

    fn engine_with(
        gateway: Arc<MockGateway>,
        config: TradingConfig,
        breakers: CircuitBreakers,
    ) -> (TradingEngine, EventBus) {
        let events = EventBus::default();
        let budgets = Arc::new(MockBudgets::default().with_portfolio(
            PORTFOLIO,
            10_000.0,
            &["BTCUSDT", "ETHUSDT"],
        ));
        let orders = OrderManager::new(
            gateway.clone(),
            SlippageHandler::new(SlippageConfig::default(), events.clone()),
            OrderManagerConfig {
                retry_delay_ms: 1,
                max_retry_delay_ms: 5,
                ..Default::default()
            },
            events.clone(),
        );
        let parts = EngineParts {
            technical: TechnicalAnalysisEngine::new(TechnicalConfig::default(), events.clone()),
            sentiment: SentimentAnalysisEngine::new(SentimentConfig::default(), events.clone()),
            risk: PositionRiskEngine::new(RiskConfig::default()),
            breakers: CircuitBreakerRegistry::new(breakers),
            orders,
        };
        let engine = TradingEngine::new(config, gateway, budgets, parts, events.clone());
        (engine, events)
    }

    fn engine(gateway: Arc<MockGateway>) -> (TradingEngine, EventBus) {
        engine_with(gateway, TradingConfig::default(), CircuitBreakers::default())
    }

    fn trending_gateway() -> Arc<MockGateway> {
        Arc::new(
            MockGateway::new()
                .with_candles("BTCUSDT", candles_from_closes("BTCUSDT", &uptrend_closes(60)))
                .with_candles("ETHUSDT", candles_from_closes("ETHUSDT", &downtrend_closes(60))),
        )
    }

    fn symbols() -> Vec<String> {
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
    }

    fn names(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    async fn bullish_decision(engine: &TradingEngine) -> TradeDecision {
        engine
            .sentiment()
            .add_sentiment_data(SentimentPayload::new("BTCUSDT", 0.9, 0.8, "twitter"));
        let decisions = engine
            .make_trading_decisions(PORTFOLIO, &["BTCUSDT".to_string()])
            .await;
        decisions.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (engine, events) = engine(trending_gateway());
        let mut rx = events.subscribe();

        engine.start_trading(PORTFOLIO, vec!["BTCUSDT".to_string()]).await.unwrap();
        let err = engine.start_trading(PORTFOLIO, symbols()).await.unwrap_err();
        assert!(matches!(err, TradingError::AlreadyRunning));

        match engine.state() {
            EngineState::Running { symbols, .. } => assert_eq!(symbols, vec!["BTCUSDT".to_string()]),
            EngineState::Stopped => panic!("engine should be running"),
        }
        assert_eq!(engine.technical().active_symbols(), vec!["BTCUSDT".to_string()]);
        assert_eq!(names(&drain(&mut rx)), vec!["trading_started"]);
    }

    #[tokio::test]
    async fn test_start_uses_portfolio_symbols_and_unknown_portfolio_fails() {
        let (engine, _) = engine(trending_gateway());

        assert!(engine.start_trading("missing", Vec::new()).await.is_err());
        assert!(!engine.is_running());

        engine.start_trading(PORTFOLIO, Vec::new()).await.unwrap();
        assert_eq!(engine.sentiment().active_symbols(), symbols());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (engine, events) = engine(trending_gateway());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();

        let mut rx = events.subscribe();
        engine.stop_trading();
        engine.stop_trading();

        assert!(!engine.is_running());
        assert!(!engine.technical().is_running());
        assert!(!engine.sentiment().is_running());

        let stopped = drain(&mut rx);
        assert_eq!(names(&stopped), vec!["trading_stopped", "trading_stopped"]);
        assert!(matches!(
            &stopped[0],
            Event::TradingStopped { portfolio_id: Some(id) } if id == PORTFOLIO
        ));
        assert!(matches!(&stopped[1], Event::TradingStopped { portfolio_id: None }));
    }

    #[tokio::test]
    async fn test_failed_symbols_are_skipped() {
        let gateway = Arc::new(
            MockGateway::new()
                .with_candles("BTCUSDT", candles_from_closes("BTCUSDT", &uptrend_closes(60)))
                .with_candles("SHORTUSDT", candles_from_closes("SHORTUSDT", &uptrend_closes(20))),
        );
        gateway.fail_candles("ETHUSDT", GatewayError::Network("timeout".into()));
        let (engine, events) = engine(gateway);
        let mut rx = events.subscribe();

        let requested = vec![
            "ETHUSDT".to_string(),
            "BTCUSDT".to_string(),
            "SHORTUSDT".to_string(),
        ];
        let decisions = engine.make_trading_decisions(PORTFOLIO, &requested).await;

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTCUSDT");

        let emitted = drain(&mut rx);
        let errors: Vec<_> = emitted.iter().filter(|e| e.is_error()).collect();
        assert_eq!(errors.len(), 2);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, Event::AnalysisError { symbol, .. } if symbol == "ETHUSDT")));
        assert!(emitted
            .iter()
            .any(|e| matches!(e, Event::DecisionError { symbol, .. } if symbol == "SHORTUSDT")));
        assert!(emitted.iter().any(|e| e.name() == "trade_decision"));
    }

    #[tokio::test]
    async fn test_flat_market_holds_and_is_recorded() {
        let gateway = Arc::new(
            MockGateway::new().with_candles("BTCUSDT", candles_from_closes("BTCUSDT", &[100.0; 60])),
        );
        let (engine, events) = engine(gateway);
        let mut rx = events.subscribe();

        let decisions = engine
            .make_trading_decisions(PORTFOLIO, &["BTCUSDT".to_string()])
            .await;

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, TradeAction::Hold);
        assert!(!decisions[0].is_executable());
        assert!(engine.execute_trade(&decisions[0]).await.is_none());
        assert_eq!(engine.get_trade_history(PORTFOLIO, None).len(), 1);
        assert!(drain(&mut rx).iter().any(|e| e.name() == "trade_decision"));
    }

    #[tokio::test]
    async fn test_bullish_inputs_buy_within_risk_limit() {
        let (engine, _) = engine(trending_gateway());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();

        let decision = bullish_decision(&engine).await;

        assert_eq!(decision.action, TradeAction::Buy);
        assert!(decision.technical_score > 0.0);
        assert!(decision.sentiment.is_some());
        assert!(decision.is_executable());

        let price = decision.suggested_price.unwrap();
        let quantity = decision.suggested_quantity.unwrap();
        assert!(quantity * price <= 10_000.0 * 0.05);
        assert!(decision.stop_loss.unwrap() < price);
        assert!(decision.take_profit.unwrap() > price);
    }

    #[tokio::test]
    async fn test_sell_without_position_is_not_sized() {
        let (engine, _) = engine(trending_gateway());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        engine
            .sentiment()
            .add_sentiment_data(SentimentPayload::new("ETHUSDT", -0.9, 0.8, "news"));

        let decisions = engine
            .make_trading_decisions(PORTFOLIO, &["ETHUSDT".to_string()])
            .await;

        assert_eq!(decisions[0].action, TradeAction::Sell);
        assert!(decisions[0].suggested_quantity.is_none());
        assert!(decisions[0].reasoning.contains("no position to sell"));
        assert!(engine.execute_trade(&decisions[0]).await.is_none());
    }

    #[tokio::test]
    async fn test_short_selling_when_allowed() {
        let config = TradingConfig {
            allow_short_selling: true,
            ..Default::default()
        };
        let (engine, _) = engine_with(trending_gateway(), config, CircuitBreakers::default());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        engine
            .sentiment()
            .add_sentiment_data(SentimentPayload::new("ETHUSDT", -0.9, 0.8, "news"));

        let decision = engine
            .make_trading_decisions(PORTFOLIO, &["ETHUSDT".to_string()])
            .await
            .remove(0);
        assert!(decision.is_executable());
        assert!(decision.stop_loss.unwrap() > decision.suggested_price.unwrap());

        assert!(engine.execute_trade(&decision).await.is_some());
        let positions = engine.get_open_positions(Some(PORTFOLIO));
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_execute_opens_then_closes_position() {
        let gateway = trending_gateway();
        let (engine, events) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;

        let mut rx = events.subscribe();
        let report = engine.execute_trade(&decision).await.unwrap();
        assert!(report.executed_quantity > 0.0);

        let emitted = names(&drain(&mut rx));
        assert!(emitted.contains(&"order_placed"));
        assert!(emitted.contains(&"position_opened"));
        assert_eq!(emitted.last(), Some(&"order_executed"));

        let open = engine.get_open_positions(Some(PORTFOLIO));
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, OrderSide::Buy);
        assert_eq!(engine.risk().portfolio_risk(PORTFOLIO).positions, 1);

        // Opposite decision closes what is held
        let mut sell = decision.clone();
        sell.id = Uuid::new_v4();
        sell.action = TradeAction::Sell;
        gateway.set_price("BTCUSDT", decision.suggested_price.unwrap() * 1.01);

        assert!(engine.execute_trade(&sell).await.is_some());
        assert!(engine.get_open_positions(Some(PORTFOLIO)).is_empty());

        let closed = engine.get_closed_positions(PORTFOLIO, None);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::Signal));
        assert!(closed[0].realized_pnl.unwrap() > 0.0);
        assert_eq!(engine.risk().portfolio_risk(PORTFOLIO).positions, 0);
    }

    #[tokio::test]
    async fn test_risk_rejection_reports_error() {
        let gateway = trending_gateway();
        let (engine, events) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();

        let mut decision = bullish_decision(&engine).await;
        decision.suggested_quantity = Some(1_000.0);

        let mut rx = events.subscribe();
        assert!(engine.execute_trade(&decision).await.is_none());
        assert_eq!(gateway.place_calls.load(Ordering::SeqCst), 0);

        let emitted = drain(&mut rx);
        assert!(emitted.iter().any(|e| matches!(
            e,
            Event::ExecutionError { error, .. } if error.contains("exceeds maximum allowed")
        )));
    }

    #[tokio::test]
    async fn test_gateway_failure_reports_execution_error() {
        let gateway = trending_gateway();
        let (engine, events) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;

        gateway.push_place_error(GatewayError::Exchange {
            code: -2010,
            message: "insufficient balance".into(),
        });
        let mut rx = events.subscribe();

        assert!(engine.execute_trade(&decision).await.is_none());
        assert!(engine.get_open_positions(None).is_empty());
        assert!(drain(&mut rx).iter().any(|e| e.name() == "execution_error"));
    }

    #[tokio::test]
    async fn test_circuit_breaker_blocks_new_entries() {
        let breakers = CircuitBreakers {
            max_daily_trades: 1,
            ..Default::default()
        };
        let (engine, events) = engine_with(trending_gateway(), TradingConfig::default(), breakers);
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;

        assert!(engine.execute_trade(&decision).await.is_some());

        let mut rx = events.subscribe();
        let mut again = decision.clone();
        again.suggested_quantity = Some(0.1);
        assert!(engine.execute_trade(&again).await.is_none());

        let emitted = names(&drain(&mut rx));
        assert!(emitted.contains(&"circuit_breaker_tripped"));
        assert!(emitted.contains(&"execution_error"));
    }

    #[tokio::test]
    async fn test_price_refresh_and_stop_loss_exit() {
        let gateway = trending_gateway();
        let (engine, _) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;
        engine.execute_trade(&decision).await.unwrap();

        let stop = decision.stop_loss.unwrap();
        gateway.set_price("BTCUSDT", stop * 0.99);

        assert_eq!(engine.update_position_prices().await, 1);
        let position = engine.get_open_positions(Some(PORTFOLIO)).remove(0);
        assert!(position.unrealized_pnl < 0.0);

        let closed = engine.check_position_exits().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::StopLoss));
        assert!(engine.get_open_positions(None).is_empty());

        let state = engine.breakers().state(PORTFOLIO).unwrap();
        assert_eq!(state.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_partial_entry_books_only_settled_fill() {
        let gateway = trending_gateway();
        let (engine, _) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;

        let price = decision.suggested_price.unwrap();
        gateway.push_place(move |r| Ok(ack_for(r, OrderStatus::PartiallyFilled, 0.5, Some(price))));

        let report = engine.execute_trade(&decision).await.unwrap();
        let order_id = report.orders[0].order_id.clone();
        assert_eq!(report.orders[0].status, OrderStatus::Canceled);
        assert!(engine.orders().get_all_active_orders().is_empty());

        // A late exchange-side fill cannot grow the order behind the book
        gateway.update_order(&order_id, OrderStatus::Filled, decision.suggested_quantity.unwrap());
        engine.orders().refresh_active_orders().await;

        let order = engine.orders().get_order(&order_id).unwrap();
        let position = engine.get_open_positions(Some(PORTFOLIO)).remove(0);
        assert!((position.quantity - order.executed_quantity).abs() < 1e-12);
        assert!((position.quantity - decision.suggested_quantity.unwrap() * 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_risk_of_remainder() {
        let gateway = trending_gateway();
        let (engine, _) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;
        engine.execute_trade(&decision).await.unwrap();

        let price = decision.suggested_price.unwrap();
        gateway.push_place(move |r| Ok(ack_for(r, OrderStatus::PartiallyFilled, 0.5, Some(price))));
        let mut sell = decision.clone();
        sell.id = Uuid::new_v4();
        sell.action = TradeAction::Sell;
        assert!(engine.execute_trade(&sell).await.is_some());

        let remaining = engine.get_open_positions(Some(PORTFOLIO)).remove(0);
        assert!((remaining.quantity - decision.suggested_quantity.unwrap() * 0.5).abs() < 1e-9);
        assert_eq!(engine.get_closed_positions(PORTFOLIO, None).len(), 1);

        let risk = engine.risk().portfolio_risk(PORTFOLIO);
        assert_eq!(risk.positions, 1);
        let expected = remaining.quantity * remaining.entry_price / 10_000.0;
        assert!((risk.total_exposure - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_price_refresh_skips_failed_ticker() {
        let gateway = trending_gateway();
        let (engine, _) = engine(gateway.clone());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        let decision = bullish_decision(&engine).await;
        engine.execute_trade(&decision).await.unwrap();

        // No ticker is scripted for XRPUSDT, so its refresh fails
        engine
            .positions
            .open_or_add(PORTFOLIO, "XRPUSDT", OrderSide::Buy, 10.0, 0.5, None, None);
        let new_price = decision.suggested_price.unwrap() * 1.02;
        gateway.set_price("BTCUSDT", new_price);

        assert_eq!(engine.update_position_prices().await, 1);

        let open = engine.get_open_positions(Some(PORTFOLIO));
        let btc = open.iter().find(|p| p.symbol == "BTCUSDT").unwrap();
        let xrp = open.iter().find(|p| p.symbol == "XRPUSDT").unwrap();
        assert_eq!(btc.current_price, new_price);
        assert!(btc.unrealized_pnl > 0.0);
        assert_eq!(xrp.current_price, 0.5);
    }

    #[tokio::test]
    async fn test_stale_sentiment_is_ignored() {
        let (engine, _) = engine(trending_gateway());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();

        let mut payload = SentimentPayload::new("BTCUSDT", 0.9, 0.8, "twitter");
        payload.timestamp = Some(Utc::now() - chrono::Duration::hours(2));
        assert!(engine.sentiment().add_sentiment_data(payload).is_some());
        engine
            .sentiment()
            .update_config(SentimentConfig {
                sentiment_window_hours: 1,
                ..Default::default()
            })
            .unwrap();

        let decision = engine
            .make_trading_decisions(PORTFOLIO, &["BTCUSDT".to_string()])
            .await
            .remove(0);
        assert!(decision.sentiment.is_none());
        assert_eq!(decision.sentiment_score, 0.0);
    }

    #[tokio::test]
    async fn test_manual_close_without_position() {
        let (engine, _) = engine(trending_gateway());
        assert!(engine
            .close_position(PORTFOLIO, "BTCUSDT", ExitReason::Manual)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_run_cycle_requires_running() {
        let (engine, _) = engine(trending_gateway());
        assert!(matches!(engine.run_cycle().await, Err(TradingError::NotRunning)));

        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();
        engine
            .sentiment()
            .add_sentiment_data(SentimentPayload::new("BTCUSDT", 0.9, 0.8, "twitter"));

        let decisions = engine.run_cycle().await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(engine.get_open_positions(Some(PORTFOLIO)).len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (engine, _) = engine(trending_gateway());
        engine.start_trading(PORTFOLIO, symbols()).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let (engine, events) = engine(trending_gateway());
        let mut rx = events.subscribe();

        let invalid = TradingConfig {
            sentiment_weight: 1.5,
            ..Default::default()
        };
        assert!(engine.update_config(invalid).is_err());

        let valid = TradingConfig {
            decision_threshold: 0.3,
            ..Default::default()
        };
        engine.update_config(valid).unwrap();
        assert_eq!(engine.config().decision_threshold, 0.3);
        assert_eq!(names(&drain(&mut rx)), vec!["config_updated"]);
    }
}
