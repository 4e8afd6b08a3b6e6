use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::RiskError;

/// Circuit breakers to prevent catastrophic losses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakers {
    pub enabled: bool,
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_trades: u32,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            enabled: true,
            max_daily_loss_pct: 0.05,  // -5% daily
            max_drawdown_pct: 0.20,    // -20% from peak
            max_consecutive_losses: 5, // 5 losses in a row
            max_daily_trades: 50,      // Max 50 executions per day
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingState {
    pub portfolio_value: f64,
    pub peak_portfolio_value: f64,
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub daily_trades: u32,
    pub last_reset: DateTime<Utc>,
}

impl TradingState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            portfolio_value: initial_capital,
            peak_portfolio_value: initial_capital,
            daily_pnl: 0.0,
            consecutive_losses: 0,
            daily_trades: 0,
            last_reset: Utc::now(),
        }
    }

    pub fn update_portfolio_value(&mut self, new_value: f64) {
        self.portfolio_value = new_value;
        if new_value > self.peak_portfolio_value {
            self.peak_portfolio_value = new_value;
        }
    }

    /// Zero the daily counters once the UTC day rolls over
    pub fn reset_daily_if_needed(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.last_reset.date_naive() {
            self.daily_pnl = 0.0;
            self.daily_trades = 0;
            self.last_reset = now;
        }
    }

    /// Record a realized result from closing a position
    pub fn record_closed_trade(&mut self, pnl: f64) {
        self.daily_pnl += pnl;
        self.update_portfolio_value(self.portfolio_value + pnl);

        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerTrip {
    DailyLoss,
    MaxDrawdown,
    ConsecutiveLosses,
    DailyTradeLimit,
}

impl fmt::Display for CircuitBreakerTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerTrip::DailyLoss => write!(f, "daily loss limit reached"),
            CircuitBreakerTrip::MaxDrawdown => write!(f, "maximum drawdown reached"),
            CircuitBreakerTrip::ConsecutiveLosses => write!(f, "too many consecutive losses"),
            CircuitBreakerTrip::DailyTradeLimit => write!(f, "daily trade limit reached"),
        }
    }
}

impl CircuitBreakers {
    pub fn validate(&self) -> Result<(), RiskError> {
        let pcts = [self.max_daily_loss_pct, self.max_drawdown_pct];
        if pcts.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(RiskError::InvalidInput(
                "max_daily_loss_pct and max_drawdown_pct must be within [0, 1]".to_string(),
            ));
        }
        if self.max_consecutive_losses == 0 || self.max_daily_trades == 0 {
            return Err(RiskError::InvalidInput(
                "max_consecutive_losses and max_daily_trades must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        if !self.enabled {
            return Ok(());
        }

        // Check daily loss
        if state.portfolio_value > 0.0 {
            let daily_loss_pct = state.daily_pnl / state.portfolio_value;
            if daily_loss_pct < -self.max_daily_loss_pct {
                return Err(CircuitBreakerTrip::DailyLoss);
            }
        }

        // Check drawdown
        if state.peak_portfolio_value > 0.0 {
            let drawdown =
                (state.peak_portfolio_value - state.portfolio_value) / state.peak_portfolio_value;
            if drawdown > self.max_drawdown_pct {
                return Err(CircuitBreakerTrip::MaxDrawdown);
            }
        }

        // Check consecutive losses
        if state.consecutive_losses >= self.max_consecutive_losses {
            return Err(CircuitBreakerTrip::ConsecutiveLosses);
        }

        // Check daily trade limit
        if state.daily_trades >= self.max_daily_trades {
            return Err(CircuitBreakerTrip::DailyTradeLimit);
        }

        Ok(())
    }
}

/// Per-portfolio trading state guarded by one shared set of breakers
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: CircuitBreakers,
    states: Arc<DashMap<String, TradingState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(breakers: CircuitBreakers) -> Self {
        Self {
            breakers,
            states: Arc::new(DashMap::new()),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Seed state for a portfolio; existing state is kept
    pub fn ensure_portfolio(&self, portfolio_id: &str, portfolio_value: f64) {
        self.states
            .entry(portfolio_id.to_string())
            .or_insert_with(|| TradingState::new(portfolio_value));
    }

    pub fn update_portfolio_value(&self, portfolio_id: &str, portfolio_value: f64) {
        self.states
            .entry(portfolio_id.to_string())
            .or_insert_with(|| TradingState::new(portfolio_value))
            .update_portfolio_value(portfolio_value);
    }

    /// Whether a new execution is allowed for the portfolio
    pub fn check(&self, portfolio_id: &str) -> Result<(), CircuitBreakerTrip> {
        let Some(mut state) = self.states.get_mut(portfolio_id) else {
            return Ok(());
        };
        state.reset_daily_if_needed(Utc::now());
        self.breakers.check(&state)
    }

    pub fn record_execution(&self, portfolio_id: &str) {
        if let Some(mut state) = self.states.get_mut(portfolio_id) {
            state.reset_daily_if_needed(Utc::now());
            state.daily_trades += 1;
        }
    }

    pub fn record_closed_trade(&self, portfolio_id: &str, pnl: f64) {
        if let Some(mut state) = self.states.get_mut(portfolio_id) {
            state.reset_daily_if_needed(Utc::now());
            state.record_closed_trade(pnl);
        }
    }

    pub fn state(&self, portfolio_id: &str) -> Option<TradingState> {
        self.states.get(portfolio_id).map(|s| s.clone())
    }
}
