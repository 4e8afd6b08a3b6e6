//! Technical analysis engine
//!
//! Turns a candle window into a full indicator snapshot, a trend/strength
//! reading and exactly one BUY/SELL/HOLD signal. Each run is appended to a
//! bounded per-symbol history and published as a `technical_analysis` event.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::{Strength, Trend};
use crate::error::AnalysisError;
use crate::events::{Event, EventBus};
use crate::history::{SymbolHistory, DEFAULT_HISTORY_CAPACITY};
use crate::indicators::{
    analyze_volume, calculate_atr, calculate_bollinger, calculate_ema, calculate_fibonacci,
    calculate_macd_series, calculate_rsi, calculate_sma, calculate_stochastic,
    calculate_williams_r, detect_crossover, find_support_resistance, BollingerBands,
    FibonacciLevels, MacdCrossover, MacdValue, StochasticValue, VolumeSummary,
};
use crate::models::{Candle, TradeAction};

/// Number of sub-signals voting on the technical signal
const VOTERS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TechnicalConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub sma_short_period: usize,
    pub sma_long_period: usize,
    pub ema_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
    pub stochastic_k: usize,
    pub stochastic_d: usize,
    pub stochastic_oversold: f64,
    pub stochastic_overbought: f64,
    pub williams_period: usize,
    pub atr_period: usize,
    pub volume_period: usize,
    pub volume_recent: usize,
    pub swing_window: usize,
    pub level_tolerance: f64,
    /// SMA spread below which the trend is neutral
    pub trend_threshold: f64,
    /// Spread/momentum magnitude that maps to full strength
    pub strength_scale: f64,
    pub moderate_strength: f64,
    pub strong_strength: f64,
    /// Net sub-signal votes needed for BUY/SELL
    pub min_signal_votes: i32,
    pub min_candles: usize,
    pub history_limit: usize,
}

impl Default for TechnicalConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            sma_short_period: 10,
            sma_long_period: 50,
            ema_period: 20,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
            stochastic_k: 14,
            stochastic_d: 3,
            stochastic_oversold: 20.0,
            stochastic_overbought: 80.0,
            williams_period: 14,
            atr_period: 14,
            volume_period: 20,
            volume_recent: 5,
            swing_window: 2,
            level_tolerance: 0.01,   // 1% clustering band
            trend_threshold: 0.005,  // 0.5% SMA spread
            strength_scale: 0.05,    // 5% spread = full strength
            moderate_strength: 0.3,
            strong_strength: 0.6,
            min_signal_votes: 2,
            min_candles: 50,
            history_limit: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl TechnicalConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let periods = [
            ("rsi_period", self.rsi_period),
            ("sma_short_period", self.sma_short_period),
            ("sma_long_period", self.sma_long_period),
            ("ema_period", self.ema_period),
            ("macd_fast", self.macd_fast),
            ("macd_slow", self.macd_slow),
            ("macd_signal", self.macd_signal),
            ("bollinger_period", self.bollinger_period),
            ("stochastic_k", self.stochastic_k),
            ("stochastic_d", self.stochastic_d),
            ("williams_period", self.williams_period),
            ("atr_period", self.atr_period),
            ("volume_period", self.volume_period),
            ("history_limit", self.history_limit),
        ];

        for (name, value) in periods {
            if value == 0 {
                return Err(AnalysisError::InvalidConfiguration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.macd_fast >= self.macd_slow {
            return Err(AnalysisError::InvalidConfiguration(
                "macd_fast must be shorter than macd_slow".to_string(),
            ));
        }
        if self.sma_short_period >= self.sma_long_period {
            return Err(AnalysisError::InvalidConfiguration(
                "sma_short_period must be shorter than sma_long_period".to_string(),
            ));
        }
        if self.rsi_oversold >= self.rsi_overbought
            || self.stochastic_oversold >= self.stochastic_overbought
        {
            return Err(AnalysisError::InvalidConfiguration(
                "oversold thresholds must be below overbought thresholds".to_string(),
            ));
        }
        if self.bollinger_std_dev <= 0.0 || self.strength_scale <= 0.0 {
            return Err(AnalysisError::InvalidConfiguration(
                "bollinger_std_dev and strength_scale must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Candles needed to compute every configured indicator
    pub fn required_candles(&self) -> usize {
        [
            self.min_candles,
            self.sma_long_period,
            self.ema_period,
            self.rsi_period + 1,
            self.atr_period + 1,
            self.macd_slow + self.macd_signal,
            self.bollinger_period,
            self.stochastic_k + self.stochastic_d - 1,
            self.williams_period,
            self.volume_period,
            self.sma_short_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(self.min_candles)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechnicalIndicators {
    pub rsi: f64,
    pub sma_short: f64,
    pub sma_long: f64,
    pub ema: f64,
    pub macd: MacdValue,
    pub bollinger: BollingerBands,
    pub stochastic: StochasticValue,
    pub williams_r: f64,
    pub atr: f64,
    pub volume: VolumeSummary,
    pub support: Vec<f64>,
    pub resistance: Vec<f64>,
    pub fibonacci: FibonacciLevels,
}

/// Exactly one of the flags is set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signals {
    pub buy: bool,
    pub sell: bool,
    pub hold: bool,
}

impl Signals {
    pub fn from_action(action: TradeAction) -> Self {
        Self {
            buy: action == TradeAction::Buy,
            sell: action == TradeAction::Sell,
            hold: action == TradeAction::Hold,
        }
    }

    pub fn action(&self) -> TradeAction {
        if self.buy {
            TradeAction::Buy
        } else if self.sell {
            TradeAction::Sell
        } else {
            TradeAction::Hold
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalAnalysis {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Close of the latest candle
    pub price: f64,
    pub indicators: TechnicalIndicators,
    pub trend: Trend,
    pub strength: Strength,
    pub strength_value: f64,
    pub confidence: f64,
    pub signals: Signals,
    pub reasoning: String,
}

impl TechnicalAnalysis {
    pub fn action(&self) -> TradeAction {
        self.signals.action()
    }

    /// Signed conviction in [-1, 1]
    ///
    /// Sign follows the signal, or the trend when holding; magnitude blends
    /// strength and confidence.
    pub fn directional_strength(&self) -> f64 {
        let sign = match self.action() {
            TradeAction::Buy => 1.0,
            TradeAction::Sell => -1.0,
            TradeAction::Hold => self.trend.sign(),
        };
        (sign * (self.strength_value + self.confidence) / 2.0).clamp(-1.0, 1.0)
    }
}

/// Run every indicator over `candles` and synthesize the signal
///
/// # Arguments
/// * `symbol` - Symbol the candles belong to
/// * `candles` - Oldest first, at least `config.required_candles()` long
/// * `config` - Must already be validated
pub fn analyze(
    symbol: &str,
    candles: &[Candle],
    config: &TechnicalConfig,
) -> Result<TechnicalAnalysis, AnalysisError> {
    let required = config.required_candles();
    let insufficient = || AnalysisError::InsufficientData {
        symbol: symbol.to_string(),
        required,
        available: candles.len(),
    };

    if candles.len() < required {
        return Err(insufficient());
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let price = closes[closes.len() - 1];

    let rsi = calculate_rsi(&closes, config.rsi_period).ok_or_else(&insufficient)?;
    let sma_short = calculate_sma(&closes, config.sma_short_period).ok_or_else(&insufficient)?;
    let sma_long = calculate_sma(&closes, config.sma_long_period).ok_or_else(&insufficient)?;
    let ema = calculate_ema(&closes, config.ema_period).ok_or_else(&insufficient)?;

    let macd_series =
        calculate_macd_series(&closes, config.macd_fast, config.macd_slow, config.macd_signal);
    let macd = macd_series.last().copied().ok_or_else(&insufficient)?;
    let crossover = detect_crossover(&macd_series);

    let bollinger = calculate_bollinger(&closes, config.bollinger_period, config.bollinger_std_dev)
        .ok_or_else(&insufficient)?;
    let stochastic = calculate_stochastic(candles, config.stochastic_k, config.stochastic_d)
        .ok_or_else(&insufficient)?;
    let williams_r =
        calculate_williams_r(candles, config.williams_period).ok_or_else(&insufficient)?;
    let atr = calculate_atr(candles, config.atr_period).ok_or_else(&insufficient)?;
    let volume = analyze_volume(candles, config.volume_period, config.volume_recent)
        .ok_or_else(&insufficient)?;
    let fibonacci = calculate_fibonacci(candles).ok_or_else(&insufficient)?;
    let levels = find_support_resistance(candles, config.swing_window, config.level_tolerance);

    // Trend: SMA spread confirmed by the latest price leg
    let spread = if sma_long != 0.0 { (sma_short - sma_long) / sma_long } else { 0.0 };
    let leg_start = closes[closes.len() - 1 - config.sma_short_period];
    let leg = if leg_start != 0.0 { (price - leg_start) / leg_start } else { 0.0 };

    let trend = if spread > config.trend_threshold && leg >= 0.0 {
        Trend::Bullish
    } else if spread < -config.trend_threshold && leg <= 0.0 {
        Trend::Bearish
    } else {
        Trend::Neutral
    };

    let strength_value = ((spread.abs() + leg.abs()) / (2.0 * config.strength_scale)).min(1.0);
    let strength =
        Strength::classify(strength_value, config.moderate_strength, config.strong_strength);

    let mut votes: Vec<i32> = Vec::with_capacity(VOTERS);
    let mut reasons = vec![format!(
        "Trend {} (SMA{} vs SMA{} spread {:.2}%)",
        trend,
        config.sma_short_period,
        config.sma_long_period,
        spread * 100.0
    )];
    // Trend is the primary reading and counts double
    votes.push(2 * trend.sign() as i32);

    if rsi < config.rsi_oversold {
        votes.push(1);
        reasons.push(format!("RSI {:.1} oversold", rsi));
    } else if rsi > config.rsi_overbought {
        votes.push(-1);
        reasons.push(format!("RSI {:.1} overbought", rsi));
    } else {
        votes.push(0);
    }

    match crossover {
        MacdCrossover::Bullish => {
            votes.push(1);
            reasons.push("MACD bullish crossover".to_string());
        }
        MacdCrossover::Bearish => {
            votes.push(-1);
            reasons.push("MACD bearish crossover".to_string());
        }
        // Without a cross, only a histogram confirming the MACD line counts
        MacdCrossover::None if macd.macd > 0.0 && macd.histogram > 0.0 => votes.push(1),
        MacdCrossover::None if macd.macd < 0.0 && macd.histogram < 0.0 => votes.push(-1),
        MacdCrossover::None => votes.push(0),
    }

    let percent_b = bollinger.percent_b(price);
    if percent_b <= 0.0 {
        votes.push(1);
        reasons.push("Price at or below lower Bollinger band".to_string());
    } else if percent_b >= 1.0 {
        votes.push(-1);
        reasons.push("Price at or above upper Bollinger band".to_string());
    } else {
        votes.push(0);
    }

    if stochastic.k < config.stochastic_oversold && stochastic.d < config.stochastic_oversold {
        votes.push(1);
        reasons.push(format!("Stochastic {:.1} oversold", stochastic.k));
    } else if stochastic.k > config.stochastic_overbought
        && stochastic.d > config.stochastic_overbought
    {
        votes.push(-1);
        reasons.push(format!("Stochastic {:.1} overbought", stochastic.k));
    } else {
        votes.push(0);
    }

    let net: i32 = votes.iter().sum();
    let bullish = votes.iter().filter(|v| **v > 0).count();
    let bearish = votes.iter().filter(|v| **v < 0).count();
    let active = bullish + bearish;

    // Agreement among voters that took a side, discounted by abstentions
    let confidence = if active == 0 {
        0.0
    } else {
        let agreement = bullish.max(bearish) as f64 / active as f64;
        let participation = active as f64 / VOTERS as f64;
        (agreement * (0.5 + 0.5 * participation)).clamp(0.0, 1.0)
    };

    let action = if net >= config.min_signal_votes {
        TradeAction::Buy
    } else if net <= -config.min_signal_votes {
        TradeAction::Sell
    } else {
        TradeAction::Hold
    };

    reasons.push(format!(
        "{} ({} bullish / {} bearish votes, Williams %R {:.1})",
        action, bullish, bearish, williams_r
    ));

    Ok(TechnicalAnalysis {
        symbol: symbol.to_string(),
        timestamp: Utc::now(),
        price,
        indicators: TechnicalIndicators {
            rsi,
            sma_short,
            sma_long,
            ema,
            macd,
            bollinger,
            stochastic,
            williams_r,
            atr,
            volume,
            support: levels.support,
            resistance: levels.resistance,
            fibonacci,
        },
        trend,
        strength,
        strength_value,
        confidence,
        signals: Signals::from_action(action),
        reasoning: reasons.join("; "),
    })
}

/// Stateful wrapper around [`analyze`]: tracked symbols, history and events
#[derive(Clone)]
pub struct TechnicalAnalysisEngine {
    config: Arc<RwLock<TechnicalConfig>>,
    history: SymbolHistory<TechnicalAnalysis>,
    active_symbols: Arc<DashSet<String>>,
    running: Arc<AtomicBool>,
    events: EventBus,
}

impl TechnicalAnalysisEngine {
    pub fn new(config: TechnicalConfig, events: EventBus) -> Self {
        let history = SymbolHistory::new(config.history_limit.max(1));
        Self {
            config: Arc::new(RwLock::new(config)),
            history,
            active_symbols: Arc::new(DashSet::new()),
            running: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn config(&self) -> TechnicalConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration; rejected configs leave the current one in place
    pub fn update_config(&self, config: TechnicalConfig) -> Result<(), AnalysisError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.events.emit(Event::ConfigUpdated {
            section: "technical".to_string(),
        });
        Ok(())
    }

    /// Start tracking `symbols`; a running engine keeps its current set
    pub fn start_analysis(&self, symbols: &[String]) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Technical analysis already running");
            return;
        }
        for symbol in symbols {
            self.active_symbols.insert(symbol.clone());
        }
        tracing::info!("Technical analysis started for {} symbols", symbols.len());
    }

    pub fn stop_analysis(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.active_symbols.clear();
            tracing::info!("Technical analysis stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn add_symbol(&self, symbol: &str) {
        self.active_symbols.insert(symbol.to_string());
    }

    pub fn remove_symbol(&self, symbol: &str) {
        self.active_symbols.remove(symbol);
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.active_symbols.iter().map(|s| s.clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn perform_technical_analysis(
        &self,
        symbol: &str,
        candles: &[Candle],
    ) -> Result<TechnicalAnalysis, AnalysisError> {
        let config = self.config();
        config.validate()?;

        let analysis = analyze(symbol, candles, &config)?;

        tracing::debug!(
            symbol,
            trend = %analysis.trend,
            action = %analysis.action(),
            confidence = analysis.confidence,
            "Technical analysis complete"
        );

        self.history.push(symbol, analysis.clone());
        self.events.emit(Event::TechnicalAnalysis(analysis.clone()));
        Ok(analysis)
    }

    pub fn get_latest_analysis(&self, symbol: &str) -> Option<TechnicalAnalysis> {
        self.history.latest(symbol)
    }

    /// Oldest first; `limit` keeps only the most recent entries
    pub fn get_analysis_history(&self, symbol: &str, limit: Option<usize>) -> Vec<TechnicalAnalysis> {
        match limit {
            Some(n) => self.history.recent(symbol, n),
            None => self.history.all(symbol),
        }
    }
}
