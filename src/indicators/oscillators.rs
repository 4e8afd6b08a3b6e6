//! Range oscillators: Stochastic and Williams %R.

use serde::{Deserialize, Serialize};

use crate::models::Candle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StochasticValue {
    pub k: f64,
    pub d: f64,
}

fn range_position(window: &[Candle], close: f64) -> Option<f64> {
    let lowest_low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let highest_high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);

    if !lowest_low.is_finite() || !highest_high.is_finite() {
        return None;
    }
    if highest_high == lowest_low {
        return Some(0.5);
    }
    Some((close - lowest_low) / (highest_high - lowest_low))
}

/// Stochastic Oscillator
///
/// %K = (Close - Lowest Low) / (Highest High - Lowest Low) * 100 over `k_period`,
/// %D = SMA(`d_period`) of %K.
///
/// - Below 20: Oversold
/// - Above 80: Overbought
pub fn calculate_stochastic(
    candles: &[Candle],
    k_period: usize,
    d_period: usize,
) -> Option<StochasticValue> {
    if k_period == 0 || d_period == 0 || candles.len() < k_period + d_period - 1 {
        return None;
    }

    let k_values: Vec<f64> = candles
        .windows(k_period)
        .filter_map(|window| {
            let close = window[window.len() - 1].close;
            range_position(window, close).map(|p| p * 100.0)
        })
        .collect();

    if k_values.len() < d_period {
        return None;
    }

    let k = *k_values.last()?;
    let d = k_values.iter().rev().take(d_period).sum::<f64>() / d_period as f64;

    Some(StochasticValue { k, d })
}

/// Williams %R
///
/// (Highest High - Close) / (Highest High - Lowest Low) * -100, in [-100, 0].
///
/// - Above -20: Overbought
/// - Below -80: Oversold
pub fn calculate_williams_r(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let window = &candles[candles.len() - period..];
    let close = window[window.len() - 1].close;
    let position = range_position(window, close)?;

    Some((position - 1.0) * 100.0)
}
