use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::history::SymbolHistory;
use crate::models::OrderSide;

/// Closed positions kept per portfolio
pub const DEFAULT_CLOSED_HISTORY: usize = 1000;

/// Remainders below this quantity count as fully closed
const POSITION_DUST: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Signal, // Opposite trade decision
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub portfolio_id: String,
    /// BUY for long, SELL for short
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_price: f64, // Average entry for accumulated positions
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub unrealized_pnl: f64,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn new(
        symbol: &str,
        portfolio_id: &str,
        side: OrderSide,
        quantity: f64,
        entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            portfolio_id: portfolio_id.to_string(),
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            stop_loss,
            take_profit,
            opened_at: Utc::now(),
            unrealized_pnl: 0.0,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
        }
    }

    /// P&L of the whole position at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            OrderSide::Buy => (price - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - price) * self.quantity,
        }
    }

    /// Capital committed at entry
    pub fn cost_basis(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
    }

    /// Exit the price would trigger, stop loss checked first
    pub fn exit_trigger(&self, price: f64) -> Option<ExitReason> {
        let (stop_hit, target_hit) = match self.side {
            OrderSide::Buy => (
                self.stop_loss.is_some_and(|sl| price <= sl),
                self.take_profit.is_some_and(|tp| price >= tp),
            ),
            OrderSide::Sell => (
                self.stop_loss.is_some_and(|sl| price >= sl),
                self.take_profit.is_some_and(|tp| price <= tp),
            ),
        };

        if stop_hit {
            Some(ExitReason::StopLoss)
        } else if target_hit {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    fn close(&mut self, exit_price: f64, reason: ExitReason) {
        let pnl = self.pnl_at(exit_price);
        self.update_price(exit_price);
        self.unrealized_pnl = 0.0;
        self.status = PositionStatus::Closed;
        self.exit_price = Some(exit_price);
        self.exit_time = Some(Utc::now());
        self.exit_reason = Some(reason);
        self.realized_pnl = Some(pnl);
    }
}

/// Triggered exit found by [`PositionBook::check_exits`]
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub portfolio_id: String,
    pub symbol: String,
    pub price: f64,
    pub reason: ExitReason,
}

/// Open positions per portfolio (one per symbol) plus closed-position archive
#[derive(Clone)]
pub struct PositionBook {
    /// portfolio_id -> symbol -> open position
    open: Arc<DashMap<String, HashMap<String, Position>>>,
    closed: SymbolHistory<Position>,
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSED_HISTORY)
    }
}

impl PositionBook {
    pub fn new(closed_history: usize) -> Self {
        Self {
            open: Arc::new(DashMap::new()),
            closed: SymbolHistory::new(closed_history),
        }
    }

    /// Open a position, or add to an existing one on the same side
    ///
    /// Adding re-averages the entry price; protective levels are replaced
    /// when new ones are given.
    pub fn open_or_add(
        &self,
        portfolio_id: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Position {
        let mut book = self.open.entry(portfolio_id.to_string()).or_default();

        if let Some(existing) = book.get_mut(symbol).filter(|p| p.side == side) {
            let total_cost = existing.cost_basis() + price * quantity;
            existing.quantity += quantity;
            existing.entry_price = total_cost / existing.quantity;
            existing.stop_loss = stop_loss.or(existing.stop_loss);
            existing.take_profit = take_profit.or(existing.take_profit);
            existing.update_price(price);

            tracing::info!(
                "Accumulated {} {} @ ${:.2} (avg: ${:.2}, total qty: {:.6})",
                portfolio_id,
                symbol,
                price,
                existing.entry_price,
                existing.quantity
            );
            return existing.clone();
        }

        let position = Position::new(symbol, portfolio_id, side, quantity, price, stop_loss, take_profit);
        tracing::info!(
            "Opened {} {} {} {:.6} @ ${:.2}",
            portfolio_id,
            side,
            symbol,
            quantity,
            price
        );
        book.insert(symbol.to_string(), position.clone());
        position
    }

    /// Close the open position on `symbol` and archive it
    pub fn close_position(
        &self,
        portfolio_id: &str,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
    ) -> Option<Position> {
        let quantity = self.get_open_position(portfolio_id, symbol)?.quantity;
        self.reduce_position(portfolio_id, symbol, quantity, exit_price, reason)
    }

    /// Close `quantity` of the open position on `symbol`
    ///
    /// The closed part is archived as its own record and returned; the rest
    /// stays open at the same entry price. Reducing by the full quantity (or
    /// more) closes the position.
    pub fn reduce_position(
        &self,
        portfolio_id: &str,
        symbol: &str,
        quantity: f64,
        exit_price: f64,
        reason: ExitReason,
    ) -> Option<Position> {
        let mut book = self.open.get_mut(portfolio_id)?;
        let open_quantity = book.get(symbol)?.quantity;

        let mut position = if quantity >= open_quantity - POSITION_DUST {
            book.remove(symbol)?
        } else {
            let remaining = book.get_mut(symbol)?;
            remaining.quantity -= quantity;
            remaining.update_price(exit_price);

            let mut part = remaining.clone();
            part.id = Uuid::new_v4();
            part.quantity = quantity;
            part
        };
        drop(book);

        position.close(exit_price, reason);

        tracing::info!(
            "Closed {} {} @ ${:.2} ({:?}, P&L: ${:.2})",
            portfolio_id,
            symbol,
            exit_price,
            reason,
            position.realized_pnl.unwrap_or(0.0)
        );

        self.closed.push(portfolio_id, position.clone());
        Some(position)
    }

    pub fn get_open_position(&self, portfolio_id: &str, symbol: &str) -> Option<Position> {
        self.open.get(portfolio_id)?.get(symbol).cloned()
    }

    pub fn has_open_position(&self, portfolio_id: &str, symbol: &str) -> bool {
        self.open
            .get(portfolio_id)
            .is_some_and(|book| book.contains_key(symbol))
    }

    /// Open positions of one portfolio, or of all portfolios
    pub fn open_positions(&self, portfolio_id: Option<&str>) -> Vec<Position> {
        let mut positions: Vec<Position> = match portfolio_id {
            Some(id) => self
                .open
                .get(id)
                .map(|book| book.values().cloned().collect())
                .unwrap_or_default(),
            None => self
                .open
                .iter()
                .flat_map(|book| book.values().cloned().collect::<Vec<_>>())
                .collect(),
        };
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        positions
    }

    /// Distinct symbols with an open position in any portfolio
    pub fn open_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .open
            .iter()
            .flat_map(|book| book.keys().cloned().collect::<Vec<_>>())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Mark every open position on `symbol` to `price`; returns how many moved
    pub fn update_price(&self, symbol: &str, price: f64) -> usize {
        let mut updated = 0;
        for mut book in self.open.iter_mut() {
            if let Some(position) = book.get_mut(symbol) {
                position.update_price(price);
                updated += 1;
            }
        }
        updated
    }

    /// Stop-loss and take-profit triggers at the given prices
    pub fn check_exits(&self, prices: &HashMap<String, f64>) -> Vec<ExitSignal> {
        let mut signals = Vec::new();
        for book in self.open.iter() {
            for position in book.values() {
                let Some(&price) = prices.get(&position.symbol) else {
                    continue;
                };
                if let Some(reason) = position.exit_trigger(price) {
                    signals.push(ExitSignal {
                        portfolio_id: book.key().clone(),
                        symbol: position.symbol.clone(),
                        price,
                        reason,
                    });
                }
            }
        }
        signals
    }

    /// Capital tied up in open positions of a portfolio
    pub fn committed_capital(&self, portfolio_id: &str) -> f64 {
        self.open
            .get(portfolio_id)
            .map(|book| book.values().map(Position::cost_basis).sum())
            .unwrap_or(0.0)
    }

    pub fn unrealized_pnl(&self, portfolio_id: &str) -> f64 {
        self.open
            .get(portfolio_id)
            .map(|book| book.values().map(|p| p.unrealized_pnl).sum())
            .unwrap_or(0.0)
    }

    pub fn realized_pnl(&self, portfolio_id: &str) -> f64 {
        self.closed
            .all(portfolio_id)
            .iter()
            .filter_map(|p| p.realized_pnl)
            .sum()
    }

    /// Closed positions, oldest first
    pub fn closed_positions(&self, portfolio_id: &str, limit: Option<usize>) -> Vec<Position> {
        match limit {
            Some(n) => self.closed.recent(portfolio_id, n),
            None => self.closed.all(portfolio_id),
        }
    }
}
