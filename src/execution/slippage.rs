//! Slippage measurement and control
//!
//! Measures adverse fill slippage per execution, keeps per-symbol execution
//! analytics, and tells the order manager when a fill is bad enough to resize
//! and retry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::RiskError;
use crate::events::{Event, EventBus};
use crate::history::{SymbolHistory, DEFAULT_HISTORY_CAPACITY};
use crate::models::OrderSide;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlippageMethod {
    /// Compare relative slippage against `max_slippage`
    Percentage,
    /// Compare per-unit price difference against `max_slippage_absolute`
    Absolute,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlippageConfig {
    pub enable_slippage_protection: bool,
    pub max_slippage: f64,
    pub max_slippage_absolute: f64,
    pub slippage_tolerance: f64,
    pub calculation_method: SlippageMethod,
    pub max_retry_attempts: u32,
    /// Floor for resized orders, as a fraction of the base size
    pub min_order_fraction: f64,
    /// Upper bound of the "low" distribution bucket
    pub low_slippage_bucket: f64,
    /// Upper bound of the "medium" distribution bucket
    pub medium_slippage_bucket: f64,
    pub history_limit: usize,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            enable_slippage_protection: true,
            max_slippage: 0.02,          // 2%
            max_slippage_absolute: 1.0,
            slippage_tolerance: 0.005,   // 0.5%
            calculation_method: SlippageMethod::Percentage,
            max_retry_attempts: 3,
            min_order_fraction: 0.25,
            low_slippage_bucket: 0.01,
            medium_slippage_bucket: 0.03,
            history_limit: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl SlippageConfig {
    pub fn validate(&self) -> Result<(), RiskError> {
        if !(0.0..=1.0).contains(&self.max_slippage) || !(0.0..=1.0).contains(&self.slippage_tolerance) {
            return Err(RiskError::InvalidInput(
                "max_slippage and slippage_tolerance must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_order_fraction) || self.min_order_fraction == 0.0 {
            return Err(RiskError::InvalidInput("min_order_fraction must be within (0, 1]".to_string()));
        }
        if self.low_slippage_bucket > self.medium_slippage_bucket {
            return Err(RiskError::InvalidInput(
                "low slippage bucket must not exceed the medium bucket".to_string(),
            ));
        }
        if self.max_slippage_absolute < 0.0 || self.history_limit == 0 {
            return Err(RiskError::InvalidInput(
                "absolute limit must be non-negative and history_limit positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageAnalysis {
    pub symbol: String,
    pub expected_price: f64,
    pub actual_price: f64,
    /// Adverse slippage relative to the expected price; 0 for favorable fills
    pub slippage_percentage: f64,
    /// Per-unit price difference
    pub slippage_amount: f64,
    pub is_acceptable: bool,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlippageDistribution {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionAnalytics {
    pub total_trades: usize,
    pub average_slippage: f64,
    pub max_slippage_seen: f64,
    pub acceptable_trades: usize,
    pub distribution: SlippageDistribution,
}

#[derive(Clone)]
pub struct SlippageHandler {
    config: Arc<RwLock<SlippageConfig>>,
    history: SymbolHistory<SlippageAnalysis>,
    analytics: Arc<DashMap<String, ExecutionAnalytics>>,
    events: EventBus,
}

impl SlippageHandler {
    pub fn new(config: SlippageConfig, events: EventBus) -> Self {
        let history = SymbolHistory::new(config.history_limit.max(1));
        Self {
            config: Arc::new(RwLock::new(config)),
            history,
            analytics: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> SlippageConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, config: SlippageConfig) -> Result<(), RiskError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.events.emit(Event::ConfigUpdated {
            section: "slippage".to_string(),
        });
        Ok(())
    }

    /// Measure one execution against its expected price
    ///
    /// BUY fills above and SELL fills below the expected price are adverse;
    /// fills on the favorable side count as zero slippage.
    pub fn calculate_slippage(
        &self,
        symbol: &str,
        expected_price: f64,
        actual_price: f64,
        side: OrderSide,
        quantity: f64,
        order_id: Option<String>,
    ) -> SlippageAnalysis {
        let config = self.config();

        let adverse = match side {
            OrderSide::Buy => actual_price - expected_price,
            OrderSide::Sell => expected_price - actual_price,
        }
        .max(0.0);

        let slippage_percentage = if expected_price > 0.0 && adverse.is_finite() {
            adverse / expected_price
        } else {
            tracing::warn!("{}: cannot compute slippage against expected price {}", symbol, expected_price);
            0.0
        };

        let mut analysis = SlippageAnalysis {
            symbol: symbol.to_string(),
            expected_price,
            actual_price,
            slippage_percentage,
            slippage_amount: (actual_price - expected_price).abs(),
            is_acceptable: true,
            side,
            quantity,
            order_id,
            timestamp: Utc::now(),
        };
        analysis.is_acceptable = Self::acceptable(&config, &analysis);

        self.history.push(symbol, analysis.clone());
        let analytics = self.recompute_analytics(symbol, &config);

        if !analysis.is_acceptable {
            tracing::warn!(
                "⚠️  High slippage on {} {}: {:.3}% (expected ${:.4}, got ${:.4})",
                side,
                symbol,
                slippage_percentage * 100.0,
                expected_price,
                actual_price
            );
            self.events.emit(Event::HighSlippage(analysis.clone()));
        }
        self.events.emit(Event::SlippageAnalyzed(analysis.clone()));
        self.events.emit(Event::AnalyticsUpdated {
            symbol: symbol.to_string(),
            analytics,
        });

        analysis
    }

    fn acceptable(config: &SlippageConfig, analysis: &SlippageAnalysis) -> bool {
        if !config.enable_slippage_protection {
            return true;
        }
        match config.calculation_method {
            SlippageMethod::Percentage => analysis.slippage_percentage <= config.max_slippage,
            SlippageMethod::Absolute => {
                let adverse = analysis.slippage_percentage * analysis.expected_price;
                adverse <= config.max_slippage_absolute
            }
        }
    }

    fn recompute_analytics(&self, symbol: &str, config: &SlippageConfig) -> ExecutionAnalytics {
        let history = self.history.all(symbol);
        let mut analytics = ExecutionAnalytics {
            total_trades: history.len(),
            ..Default::default()
        };

        for a in &history {
            let pct = a.slippage_percentage;
            analytics.max_slippage_seen = analytics.max_slippage_seen.max(pct);
            if a.is_acceptable {
                analytics.acceptable_trades += 1;
            }
            if pct < config.low_slippage_bucket {
                analytics.distribution.low += 1;
            } else if pct <= config.medium_slippage_bucket {
                analytics.distribution.medium += 1;
            } else {
                analytics.distribution.high += 1;
            }
        }
        if !history.is_empty() {
            analytics.average_slippage =
                history.iter().map(|a| a.slippage_percentage).sum::<f64>() / history.len() as f64;
        }

        self.analytics.insert(symbol.to_string(), analytics.clone());
        analytics
    }

    /// Re-check an analysis against the current limits
    pub fn validate_slippage(&self, analysis: &SlippageAnalysis) -> bool {
        Self::acceptable(&self.config(), analysis)
    }

    /// Whether an order with this fill should be resized and retried
    ///
    /// `attempt` counts retries already made.
    pub fn should_retry_order(&self, analysis: &SlippageAnalysis, attempt: u32) -> bool {
        let config = self.config();
        config.enable_slippage_protection
            && !Self::acceptable(&config, analysis)
            && attempt < config.max_retry_attempts
    }

    /// Shrink an order in proportion to how far observed slippage exceeds
    /// the tolerance, never below `min_order_fraction` of the base size
    pub fn calculate_optimal_order_size(&self, symbol: &str, base_size: f64, observed_slippage: f64) -> f64 {
        let config = self.config();
        if !config.enable_slippage_protection
            || observed_slippage < config.slippage_tolerance
            || observed_slippage <= 0.0
        {
            return base_size;
        }

        let scaled = base_size * (config.slippage_tolerance / observed_slippage);
        let size = scaled.max(base_size * config.min_order_fraction).min(base_size);

        tracing::debug!(
            "{}: resizing order {:.6} -> {:.6} for {:.3}% slippage",
            symbol,
            base_size,
            size,
            observed_slippage * 100.0
        );
        size
    }

    pub fn get_slippage_history(&self, symbol: &str, limit: Option<usize>) -> Vec<SlippageAnalysis> {
        match limit {
            Some(n) => self.history.recent(symbol, n),
            None => self.history.all(symbol),
        }
    }

    pub fn get_execution_analytics(&self, symbol: &str) -> Option<ExecutionAnalytics> {
        self.analytics.get(symbol).map(|a| a.clone())
    }

    /// Average adverse slippage for a symbol, 0 without history
    pub fn average_slippage(&self, symbol: &str) -> f64 {
        self.get_execution_analytics(symbol)
            .map(|a| a.average_slippage)
            .unwrap_or(0.0)
    }
}
