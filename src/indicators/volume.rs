//! Volume analysis
//!
//! Compares recent participation against the longer average to classify
//! whether volume is building up or drying out.

use serde::{Deserialize, Serialize};

use crate::models::Candle;

/// Recent volume above this multiple of the average is "increasing"
pub const VOLUME_INCREASE_RATIO: f64 = 1.2;
/// Recent volume below this multiple of the average is "decreasing"
pub const VOLUME_DECREASE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VolumeSummary {
    pub current: f64,
    pub average: f64,
    pub trend: VolumeTrend,
}

/// Calculate average volume over a period
pub fn calculate_average_volume(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let recent_candles = &candles[candles.len() - period..];
    let total_volume: f64 = recent_candles.iter().map(|c| c.volume).sum();
    Some(total_volume / period as f64)
}

/// Summarize volume: latest bar, average over `period`, and the trend of the
/// last `recent` bars against that average
pub fn analyze_volume(candles: &[Candle], period: usize, recent: usize) -> Option<VolumeSummary> {
    let average = calculate_average_volume(candles, period)?;
    let recent_average = calculate_average_volume(candles, recent.clamp(1, period))?;
    let current = candles.last()?.volume;

    let trend = if average <= 0.0 {
        VolumeTrend::Stable
    } else {
        let ratio = recent_average / average;
        if ratio > VOLUME_INCREASE_RATIO {
            VolumeTrend::Increasing
        } else if ratio < VOLUME_DECREASE_RATIO {
            VolumeTrend::Decreasing
        } else {
            VolumeTrend::Stable
        }
    };

    Some(VolumeSummary {
        current,
        average,
        trend,
    })
}
