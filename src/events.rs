//! Typed notifications emitted by the pipeline components.
//!
//! Every component holds a clone of the same [`EventBus`]; sinks (logging,
//! the Redis journal, tests) subscribe and receive every [`Event`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::analysis::{SentimentAnalysis, TechnicalAnalysis};
use crate::engine::TradeDecision;
use crate::execution::{ExecutionAnalytics, Position, SlippageAnalysis};
use crate::models::Order;
use crate::risk::CircuitBreakerTrip;

const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TradingStarted {
        portfolio_id: String,
        symbols: Vec<String>,
    },
    TradingStopped {
        portfolio_id: Option<String>,
    },
    TradeDecision(TradeDecision),
    OrderExecuted {
        decision_id: Uuid,
        portfolio_id: String,
        order: Order,
    },
    ExecutionError {
        portfolio_id: String,
        symbol: String,
        error: String,
    },
    AnalysisError {
        symbol: String,
        error: String,
    },
    DecisionError {
        symbol: String,
        error: String,
    },
    SentimentAnalysis(SentimentAnalysis),
    TechnicalAnalysis(TechnicalAnalysis),
    SlippageAnalyzed(SlippageAnalysis),
    HighSlippage(SlippageAnalysis),
    AnalyticsUpdated {
        symbol: String,
        analytics: ExecutionAnalytics,
    },
    OrderPlaced(Order),
    OrderWarning {
        symbol: String,
        warnings: Vec<String>,
    },
    OrderRetry {
        symbol: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    OrderError {
        symbol: String,
        error: String,
    },
    OrderCanceled(Order),
    CancelError {
        order_id: String,
        error: String,
    },
    StatusError {
        order_id: String,
        error: String,
    },
    OrderUpdated(Order),
    PositionOpened(Position),
    PositionClosed(Position),
    CircuitBreakerTripped {
        portfolio_id: String,
        trip: CircuitBreakerTrip,
    },
    ConfigUpdated {
        section: String,
    },
}

impl Event {
    /// Wire name of the event, as used by notification sinks
    pub fn name(&self) -> &'static str {
        match self {
            Event::TradingStarted { .. } => "trading_started",
            Event::TradingStopped { .. } => "trading_stopped",
            Event::TradeDecision(_) => "trade_decision",
            Event::OrderExecuted { .. } => "order_executed",
            Event::ExecutionError { .. } => "execution_error",
            Event::AnalysisError { .. } => "analysis_error",
            Event::DecisionError { .. } => "decision_error",
            Event::SentimentAnalysis(_) => "sentiment_analysis",
            Event::TechnicalAnalysis(_) => "technical_analysis",
            Event::SlippageAnalyzed(_) => "slippage_analyzed",
            Event::HighSlippage(_) => "high_slippage",
            Event::AnalyticsUpdated { .. } => "analytics_updated",
            Event::OrderPlaced(_) => "order_placed",
            Event::OrderWarning { .. } => "order_warning",
            Event::OrderRetry { .. } => "order_retry",
            Event::OrderError { .. } => "order_error",
            Event::OrderCanceled(_) => "order_canceled",
            Event::CancelError { .. } => "cancel_error",
            Event::StatusError { .. } => "status_error",
            Event::OrderUpdated(_) => "order_updated",
            Event::PositionOpened(_) => "position_opened",
            Event::PositionClosed(_) => "position_closed",
            Event::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
            Event::ConfigUpdated { .. } => "config_updated",
        }
    }

    /// Symbol the event concerns, when it concerns one
    pub fn symbol(&self) -> Option<&str> {
        let symbol = match self {
            Event::TradeDecision(d) => &d.symbol,
            Event::OrderExecuted { order, .. } => &order.symbol,
            Event::ExecutionError { symbol, .. }
            | Event::AnalysisError { symbol, .. }
            | Event::DecisionError { symbol, .. }
            | Event::AnalyticsUpdated { symbol, .. }
            | Event::OrderWarning { symbol, .. }
            | Event::OrderRetry { symbol, .. }
            | Event::OrderError { symbol, .. } => symbol,
            Event::SentimentAnalysis(a) => &a.symbol,
            Event::TechnicalAnalysis(a) => &a.symbol,
            Event::SlippageAnalyzed(a) | Event::HighSlippage(a) => &a.symbol,
            Event::OrderPlaced(o) | Event::OrderCanceled(o) | Event::OrderUpdated(o) => &o.symbol,
            Event::PositionOpened(p) | Event::PositionClosed(p) => &p.symbol,
            _ => return None,
        };
        Some(symbol.as_str())
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::ExecutionError { .. }
                | Event::AnalysisError { .. }
                | Event::DecisionError { .. }
                | Event::OrderError { .. }
                | Event::CancelError { .. }
                | Event::StatusError { .. }
        )
    }
}

/// Broadcast channel shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Collect every event currently buffered on a receiver without waiting
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event receiver lagged");
            }
            Err(_) => break,
        }
    }
    events
}

/// Logging sink: renders every event as a structured tracing line
pub async fn log_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log sink lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &Event) {
    let symbol = event.symbol().unwrap_or("-");
    match event {
        Event::TradeDecision(d) => tracing::info!(
            event = event.name(),
            symbol,
            portfolio = %d.portfolio_id,
            action = %d.action,
            confidence = %format!("{:.2}", d.confidence),
            "{}",
            d.reasoning
        ),
        Event::OrderExecuted { order, .. } => tracing::info!(
            event = event.name(),
            symbol,
            side = %order.side,
            quantity = order.quantity,
            price = ?order.fill_price(),
            "Order executed"
        ),
        Event::HighSlippage(a) => tracing::warn!(
            event = event.name(),
            symbol,
            slippage_pct = %format!("{:.3}", a.slippage_percentage * 100.0),
            "Slippage above limit"
        ),
        Event::CircuitBreakerTripped { portfolio_id, trip } => tracing::warn!(
            event = event.name(),
            portfolio = %portfolio_id,
            ?trip,
            "Circuit breaker tripped"
        ),
        Event::OrderWarning { warnings, .. } => tracing::warn!(
            event = event.name(),
            symbol,
            warnings = %warnings.join("; "),
            "Order warning"
        ),
        Event::OrderRetry {
            attempt,
            max_attempts,
            error,
            ..
        } => tracing::warn!(event = event.name(), symbol, attempt, max_attempts, %error, "Retrying order"),
        Event::ExecutionError { error, .. }
        | Event::AnalysisError { error, .. }
        | Event::DecisionError { error, .. }
        | Event::OrderError { error, .. }
        | Event::CancelError { error, .. }
        | Event::StatusError { error, .. } => {
            tracing::error!(event = event.name(), symbol, %error, "Pipeline error")
        }
        Event::SentimentAnalysis(_) | Event::TechnicalAnalysis(_) | Event::SlippageAnalyzed(_) => {
            tracing::debug!(event = event.name(), symbol, "Analysis updated")
        }
        _ => tracing::info!(event = event.name(), symbol, "Event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.emit(Event::ConfigUpdated {
            section: "risk".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::TradingStarted {
            portfolio_id: "main".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
        });
        bus.emit(Event::AnalysisError {
            symbol: "BTCUSDT".to_string(),
            error: "boom".to_string(),
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "trading_started");
        assert_eq!(events[1].name(), "analysis_error");
        assert!(events[1].is_error());
        assert_eq!(events[1].symbol(), Some("BTCUSDT"));
    }

    #[test]
    fn test_serialized_tag_matches_name() {
        let event = Event::OrderRetry {
            symbol: "ETHUSDT".to_string(),
            attempt: 1,
            max_attempts: 3,
            error: "timeout".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
        assert_eq!(json["attempt"], 1);
    }
}
