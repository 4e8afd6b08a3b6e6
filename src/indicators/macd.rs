//! MACD (Moving Average Convergence Divergence).

use serde::{Deserialize, Serialize};

use super::moving_average::calculate_ema_series;

/// Latest MACD reading
///
/// - MACD line = EMA(fast) - EMA(slow)
/// - Signal line = EMA(signal) of the MACD line
/// - Histogram = MACD line - signal line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Direction of the most recent MACD / signal line cross
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdCrossover {
    Bullish,
    Bearish,
    None,
}

/// Full MACD series, aligned to the end of the input
pub fn calculate_macd_series(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Vec<MacdValue> {
    if fast_period == 0 || signal_period == 0 || fast_period >= slow_period {
        return Vec::new();
    }
    if prices.len() < slow_period + signal_period {
        return Vec::new();
    }

    let fast = calculate_ema_series(prices, fast_period);
    let slow = calculate_ema_series(prices, slow_period);

    // Fast series starts earlier; align both on the slow series
    let offset = fast.len() - slow.len();
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(i, s)| fast[i + offset] - s)
        .collect();

    let signal_line = calculate_ema_series(&macd_line, signal_period);
    let offset = macd_line.len() - signal_line.len();

    signal_line
        .iter()
        .enumerate()
        .map(|(i, &signal)| {
            let macd = macd_line[i + offset];
            MacdValue {
                macd,
                signal,
                histogram: macd - signal,
            }
        })
        .collect()
}

pub fn calculate_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdValue> {
    calculate_macd_series(prices, fast_period, slow_period, signal_period)
        .last()
        .copied()
}

/// Detect a crossover between the last two readings of a MACD series
pub fn detect_crossover(series: &[MacdValue]) -> MacdCrossover {
    match series {
        [.., prev, curr] if prev.histogram <= 0.0 && curr.histogram > 0.0 => MacdCrossover::Bullish,
        [.., prev, curr] if prev.histogram >= 0.0 && curr.histogram < 0.0 => MacdCrossover::Bearish,
        _ => MacdCrossover::None,
    }
}
