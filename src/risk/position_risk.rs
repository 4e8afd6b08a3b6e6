//! Position sizing and risk scoring
//!
//! Sizing picks between fixed-fraction, Kelly and volatility-scaled methods.
//! Risk scoring blends position concentration, correlation with other open
//! positions, stored volatility and order liquidity into one weighted score.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::RiskError;
use crate::indicators::calculate_std_dev;

pub const POSITION_RISK_EXCEEDED: &str = "Position risk exceeds maximum allowed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskWeights {
    pub current: f64,
    pub correlation: f64,
    pub market: f64,
    pub liquidity: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            current: 0.4,
            correlation: 0.2,
            market: 0.25,
            liquidity: 0.15,
        }
    }
}

/// Percentage cutoffs for risk levels, ascending
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskLevelCutoffs {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskLevelCutoffs {
    fn default() -> Self {
        Self {
            medium: 25.0,
            high: 50.0,
            critical: 75.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub enable_risk_management: bool,
    pub enable_correlation_analysis: bool,
    pub max_risk_per_position: f64,
    pub max_total_risk: f64,
    pub fixed_fraction: f64,
    pub kelly_fraction: f64,
    pub kelly_payoff_ratio: f64,
    pub high_confidence_threshold: f64,
    pub volatility_threshold: f64,
    pub default_volatility: f64,
    pub correlation_threshold: f64,
    pub liquidity_reference_quantity: f64,
    pub weights: RiskWeights,
    pub cutoffs: RiskLevelCutoffs,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enable_risk_management: true,
            enable_correlation_analysis: true,
            max_risk_per_position: 0.05,       // 5% of portfolio per position
            max_total_risk: 0.5,
            fixed_fraction: 0.1,               // 10% of affordable quantity
            kelly_fraction: 0.25,              // Quarter Kelly cap
            kelly_payoff_ratio: 2.0,
            high_confidence_threshold: 0.8,
            volatility_threshold: 0.05,
            default_volatility: 0.02,
            correlation_threshold: 0.7,
            liquidity_reference_quantity: 1000.0,
            weights: RiskWeights::default(),
            cutoffs: RiskLevelCutoffs::default(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), RiskError> {
        let fractions = [
            ("max_risk_per_position", self.max_risk_per_position),
            ("fixed_fraction", self.fixed_fraction),
            ("kelly_fraction", self.kelly_fraction),
            ("high_confidence_threshold", self.high_confidence_threshold),
            ("correlation_threshold", self.correlation_threshold),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(RiskError::InvalidInput(format!("{name} must be within [0, 1]")));
            }
        }
        if self.kelly_payoff_ratio <= 0.0
            || self.volatility_threshold <= 0.0
            || self.liquidity_reference_quantity <= 0.0
            || self.max_total_risk <= 0.0
        {
            return Err(RiskError::InvalidInput(
                "payoff ratio, volatility threshold, liquidity reference and total risk must be positive"
                    .to_string(),
            ));
        }
        let c = &self.cutoffs;
        if !(0.0 < c.medium && c.medium < c.high && c.high < c.critical) {
            return Err(RiskError::InvalidInput(
                "risk level cutoffs must be positive and strictly ascending".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingMethod {
    Fixed,
    Kelly,
    Volatility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizing {
    pub symbol: String,
    pub portfolio_id: String,
    pub available_budget: f64,
    pub suggested_quantity: f64,
    pub max_quantity: f64,
    pub sizing_method: SizingMethod,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(total_risk: f64, cutoffs: &RiskLevelCutoffs) -> Self {
        let pct = total_risk * 100.0;
        if pct >= cutoffs.critical {
            RiskLevel::Critical
        } else if pct >= cutoffs.high {
            RiskLevel::High
        } else if pct >= cutoffs.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    pub portfolio_id: String,
    /// Position value over portfolio value
    pub current_risk: f64,
    pub max_risk: f64,
    pub correlation_risk: f64,
    pub market_risk: f64,
    pub liquidity_risk: f64,
    pub total_risk: f64,
    pub risk_level: RiskLevel,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionValidation {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub risk: PositionRisk,
}

/// Aggregate exposure of all registered positions in a portfolio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRisk {
    pub portfolio_id: String,
    pub positions: usize,
    pub total_exposure: f64,
    pub max_position_risk: f64,
    pub average_total_risk: f64,
    pub risk_level: RiskLevel,
}

#[derive(Clone)]
pub struct PositionRiskEngine {
    config: Arc<RwLock<RiskConfig>>,
    correlations: Arc<DashMap<(String, String), f64>>,
    volatility: Arc<DashMap<String, f64>>,
    /// portfolio_id -> symbol -> risk of the open position
    open_risks: Arc<DashMap<String, HashMap<String, PositionRisk>>>,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl PositionRiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            correlations: Arc::new(DashMap::new()),
            volatility: Arc::new(DashMap::new()),
            open_risks: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> RiskConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, config: RiskConfig) -> Result<(), RiskError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    /// Suggest a quantity for a new position
    ///
    /// # Arguments
    /// * `available_budget` - Cash the portfolio can commit
    /// * `confidence` - Decision confidence in [0, 1]
    /// * `current_price` - Must be positive
    /// * `volatility` - Recent return volatility; invalid values use the default
    pub fn calculate_position_size(
        &self,
        symbol: &str,
        portfolio_id: &str,
        available_budget: f64,
        confidence: f64,
        current_price: f64,
        volatility: f64,
    ) -> Result<PositionSizing, RiskError> {
        if !current_price.is_finite() || current_price <= 0.0 {
            return Err(RiskError::InvalidInput(format!(
                "price for {symbol} must be positive, got {current_price}"
            )));
        }
        if !available_budget.is_finite() || available_budget < 0.0 {
            return Err(RiskError::InvalidInput(format!(
                "budget for {portfolio_id} must be non-negative, got {available_budget}"
            )));
        }

        let config = self.config();
        let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        let volatility = if volatility.is_finite() && volatility > 0.0 {
            volatility
        } else {
            config.default_volatility
        };

        let max_quantity = available_budget / current_price;

        let (sizing_method, fraction) = if !config.enable_risk_management {
            (SizingMethod::Fixed, config.fixed_fraction)
        } else if confidence >= config.high_confidence_threshold {
            // Kelly: f = (b*p - q) / b
            let b = config.kelly_payoff_ratio;
            let kelly = (b * confidence - (1.0 - confidence)) / b;
            (SizingMethod::Kelly, kelly.clamp(0.0, config.kelly_fraction))
        } else if volatility > config.volatility_threshold {
            let scale = config.volatility_threshold / volatility;
            (SizingMethod::Volatility, config.fixed_fraction * scale)
        } else {
            (SizingMethod::Fixed, config.fixed_fraction)
        };

        let suggested_quantity = (max_quantity * fraction).clamp(0.0, max_quantity);

        Ok(PositionSizing {
            symbol: symbol.to_string(),
            portfolio_id: portfolio_id.to_string(),
            available_budget,
            suggested_quantity,
            max_quantity,
            sizing_method,
            confidence,
        })
    }

    pub fn calculate_position_risk(
        &self,
        symbol: &str,
        portfolio_id: &str,
        quantity: f64,
        price: f64,
        portfolio_value: f64,
    ) -> Result<PositionRisk, RiskError> {
        if !portfolio_value.is_finite() || portfolio_value <= 0.0 {
            return Err(RiskError::InvalidInput(format!(
                "portfolio value for {portfolio_id} must be positive, got {portfolio_value}"
            )));
        }
        if !quantity.is_finite() || quantity < 0.0 || !price.is_finite() || price < 0.0 {
            return Err(RiskError::InvalidInput(format!(
                "quantity and price for {symbol} must be non-negative"
            )));
        }

        let config = self.config();
        let current_risk = quantity * price / portfolio_value;

        let correlation_risk = if config.enable_correlation_analysis {
            self.correlation_risk(symbol, portfolio_id, config.correlation_threshold)
        } else {
            0.0
        };

        let market_risk = self.volatility.get(symbol).map(|v| *v).unwrap_or(0.0);
        let liquidity_risk = (quantity / config.liquidity_reference_quantity).min(1.0);

        let w = &config.weights;
        let total_risk = current_risk * w.current
            + correlation_risk * w.correlation
            + market_risk * w.market
            + liquidity_risk * w.liquidity;

        Ok(PositionRisk {
            symbol: symbol.to_string(),
            portfolio_id: portfolio_id.to_string(),
            current_risk,
            max_risk: config.max_risk_per_position,
            correlation_risk,
            market_risk,
            liquidity_risk,
            total_risk,
            risk_level: RiskLevel::from_score(total_risk, &config.cutoffs),
            timestamp: Utc::now(),
        })
    }

    fn correlation_risk(&self, symbol: &str, portfolio_id: &str, threshold: f64) -> f64 {
        let Some(open) = self.open_risks.get(portfolio_id) else {
            return 0.0;
        };

        open.values()
            .filter(|other| other.symbol != symbol)
            .filter_map(|other| {
                let corr = self.get_correlation(symbol, &other.symbol).abs();
                (corr >= threshold).then_some(corr * other.current_risk)
            })
            .sum::<f64>()
            .min(1.0)
    }

    pub fn validate_position(
        &self,
        symbol: &str,
        portfolio_id: &str,
        quantity: f64,
        price: f64,
        portfolio_value: f64,
    ) -> Result<PositionValidation, RiskError> {
        let risk = self.calculate_position_risk(symbol, portfolio_id, quantity, price, portfolio_value)?;
        let config = self.config();

        let exceeded = risk.current_risk > config.max_risk_per_position
            || risk.total_risk > config.max_total_risk;

        if exceeded {
            tracing::warn!(
                "{} position rejected: risk {:.2}% (total {:.2}%, level {:?})",
                symbol,
                risk.current_risk * 100.0,
                risk.total_risk * 100.0,
                risk.risk_level
            );
        }

        Ok(PositionValidation {
            is_valid: !exceeded,
            reason: exceeded.then(|| POSITION_RISK_EXCEEDED.to_string()),
            risk,
        })
    }

    /// Store a symmetric correlation coefficient, clamped to [-1, 1]
    pub fn update_correlation_matrix(&self, a: &str, b: &str, correlation: f64) {
        if a == b || !correlation.is_finite() {
            return;
        }
        self.correlations.insert(pair_key(a, b), correlation.clamp(-1.0, 1.0));
    }

    /// 1 for a symbol with itself, 0 for unknown pairs
    pub fn get_correlation(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        self.correlations.get(&pair_key(a, b)).map(|c| *c).unwrap_or(0.0)
    }

    /// Store the standard deviation of simple returns over `prices`
    pub fn update_volatility_data(&self, symbol: &str, prices: &[f64]) -> f64 {
        let returns: Vec<f64> = prices
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();

        let volatility = calculate_std_dev(&returns, returns.len())
            .filter(|v| v.is_finite())
            .unwrap_or_else(|| self.config().default_volatility);

        self.volatility.insert(symbol.to_string(), volatility);
        volatility
    }

    /// Stored volatility, or the default when never computed
    pub fn get_volatility(&self, symbol: &str) -> f64 {
        self.volatility
            .get(symbol)
            .map(|v| *v)
            .unwrap_or_else(|| self.config().default_volatility)
    }

    /// Track an open position so later sizing sees its correlated exposure
    pub fn register_position_risk(&self, risk: PositionRisk) {
        self.open_risks
            .entry(risk.portfolio_id.clone())
            .or_default()
            .insert(risk.symbol.clone(), risk);
    }

    pub fn remove_position_risk(&self, portfolio_id: &str, symbol: &str) -> Option<PositionRisk> {
        self.open_risks
            .get_mut(portfolio_id)
            .and_then(|mut open| open.remove(symbol))
    }

    pub fn portfolio_risk(&self, portfolio_id: &str) -> PortfolioRisk {
        let config = self.config();
        let risks: Vec<PositionRisk> = self
            .open_risks
            .get(portfolio_id)
            .map(|open| open.values().cloned().collect())
            .unwrap_or_default();

        let total_exposure: f64 = risks.iter().map(|r| r.current_risk).sum();
        let max_position_risk = risks.iter().map(|r| r.current_risk).fold(0.0, f64::max);
        let average_total_risk = if risks.is_empty() {
            0.0
        } else {
            risks.iter().map(|r| r.total_risk).sum::<f64>() / risks.len() as f64
        };

        PortfolioRisk {
            portfolio_id: portfolio_id.to_string(),
            positions: risks.len(),
            total_exposure,
            max_position_risk,
            average_total_risk,
            risk_level: RiskLevel::from_score(total_exposure, &config.cutoffs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PositionRiskEngine {
        PositionRiskEngine::new(RiskConfig::default())
    }

    #[test]
    fn test_fixed_sizing_when_risk_management_disabled() {
        let engine = PositionRiskEngine::new(RiskConfig {
            enable_risk_management: false,
            ..Default::default()
        });

        let sizing = engine
            .calculate_position_size("BTCUSDT", "main", 10000.0, 0.95, 100.0, 0.5)
            .unwrap();
        assert_eq!(sizing.sizing_method, SizingMethod::Fixed);
        assert_eq!(sizing.max_quantity, 100.0);
        assert!((sizing.suggested_quantity - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_kelly_sizing_for_high_confidence() {
        let sizing = engine()
            .calculate_position_size("BTCUSDT", "main", 10000.0, 0.9, 100.0, 0.01)
            .unwrap();

        // Kelly = (2*0.9 - 0.1) / 2 = 0.85, capped at 0.25
        assert_eq!(sizing.sizing_method, SizingMethod::Kelly);
        assert!((sizing.suggested_quantity - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_volatility_sizing_scales_down() {
        let sizing = engine()
            .calculate_position_size("BTCUSDT", "main", 10000.0, 0.5, 100.0, 0.1)
            .unwrap();

        // 0.1 * (0.05 / 0.1) of 100 affordable
        assert_eq!(sizing.sizing_method, SizingMethod::Volatility);
        assert!((sizing.suggested_quantity - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_suggested_never_exceeds_max() {
        let engine = PositionRiskEngine::new(RiskConfig {
            fixed_fraction: 1.0,
            ..Default::default()
        });
        for (confidence, volatility) in [(0.1, 0.01), (0.99, 0.01), (0.5, 0.0001), (0.5, 2.0)] {
            let sizing = engine
                .calculate_position_size("BTCUSDT", "main", 5000.0, confidence, 250.0, volatility)
                .unwrap();
            assert!(sizing.suggested_quantity <= sizing.max_quantity);
        }
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let err = engine()
            .calculate_position_size("BTCUSDT", "main", 10000.0, 0.5, 0.0, 0.02)
            .unwrap_err();
        assert!(matches!(err, RiskError::InvalidInput(_)));
    }

    #[test]
    fn test_validate_position_exceeds_maximum() {
        let validation = engine()
            .validate_position("X", "main", 100.0, 100.0, 10000.0)
            .unwrap();

        assert!(!validation.is_valid);
        assert!(validation.reason.unwrap().contains("exceeds maximum allowed"));
        assert_eq!(validation.risk.current_risk, 1.0);
    }

    #[test]
    fn test_validate_small_position() {
        let validation = engine()
            .validate_position("X", "main", 1.0, 100.0, 10000.0)
            .unwrap();

        assert!(validation.is_valid);
        assert!(validation.reason.is_none());
        assert_eq!(validation.risk.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_correlation_matrix() {
        let engine = engine();
        assert_eq!(engine.get_correlation("A", "A"), 1.0);
        assert_eq!(engine.get_correlation("A", "B"), 0.0);

        engine.update_correlation_matrix("A", "B", 0.8);
        assert_eq!(engine.get_correlation("B", "A"), 0.8);
    }

    #[test]
    fn test_correlated_positions_add_risk() {
        let engine = engine();
        engine.update_correlation_matrix("BTCUSDT", "ETHUSDT", 0.9);
        engine.update_correlation_matrix("BTCUSDT", "XRPUSDT", 0.3);

        let eth = engine
            .calculate_position_risk("ETHUSDT", "main", 1.0, 400.0, 10000.0)
            .unwrap();
        let xrp = engine
            .calculate_position_risk("XRPUSDT", "main", 1.0, 400.0, 10000.0)
            .unwrap();
        engine.register_position_risk(eth);
        engine.register_position_risk(xrp);

        let btc = engine
            .calculate_position_risk("BTCUSDT", "main", 0.01, 30000.0, 10000.0)
            .unwrap();
        // Only ETH clears the 0.7 threshold: 0.9 * 0.04
        assert!((btc.correlation_risk - 0.036).abs() < 1e-9);

        assert!(engine.remove_position_risk("main", "ETHUSDT").is_some());
        assert_eq!(engine.portfolio_risk("main").positions, 1);
    }

    #[test]
    fn test_volatility_data() {
        let engine = engine();
        assert_eq!(engine.update_volatility_data("X", &[100.0]), 0.02);

        let vol = engine.update_volatility_data("Y", &[100.0, 110.0, 99.0, 108.9]);
        assert!(vol > 0.05);
        assert_eq!(engine.get_volatility("Y"), vol);
        assert_eq!(engine.get_volatility("unknown"), 0.02);
    }

    #[test]
    fn test_risk_levels() {
        let cutoffs = RiskLevelCutoffs::default();
        assert_eq!(RiskLevel::from_score(0.1, &cutoffs), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.25, &cutoffs), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.6, &cutoffs), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.9, &cutoffs), RiskLevel::Critical);
    }

    #[test]
    fn test_config_validation() {
        let bad = RiskConfig {
            cutoffs: RiskLevelCutoffs {
                medium: 50.0,
                high: 25.0,
                critical: 75.0,
            },
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(RiskConfig::default().validate().is_ok());
    }
}
