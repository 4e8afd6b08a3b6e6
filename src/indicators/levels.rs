//! Price level analysis: Fibonacci retracements and support/resistance
//!
//! Support and resistance come from swing points (local troughs and peaks)
//! clustered by proximity, so repeated tests of the same area count once
//! with a higher weight.

use serde::{Deserialize, Serialize};

use crate::models::Candle;

/// Maximum number of support (and of resistance) levels reported
pub const MAX_LEVELS: usize = 3;

/// Fibonacci retracement levels, level 0 at the window high and 100 at the low
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FibonacciLevels {
    pub level_0: f64,
    pub level_23_6: f64,
    pub level_38_2: f64,
    pub level_50: f64,
    pub level_61_8: f64,
    pub level_78_6: f64,
    pub level_100: f64,
}

pub fn calculate_fibonacci(candles: &[Candle]) -> Option<FibonacciLevels> {
    if candles.is_empty() {
        return None;
    }

    let high = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let range = high - low;
    let at = |ratio: f64| high - range * ratio;

    Some(FibonacciLevels {
        level_0: high,
        level_23_6: at(0.236),
        level_38_2: at(0.382),
        level_50: at(0.5),
        level_61_8: at(0.618),
        level_78_6: at(0.786),
        level_100: low,
    })
}

/// Support and resistance levels around the latest close
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SupportResistance {
    /// Nearest first, all below the current price
    pub support: Vec<f64>,
    /// Nearest first, all above the current price
    pub resistance: Vec<f64>,
}

struct Cluster {
    sum: f64,
    touches: usize,
}

impl Cluster {
    fn level(&self) -> f64 {
        self.sum / self.touches as f64
    }
}

fn cluster_levels(points: &[f64], tolerance: f64) -> Vec<(f64, usize)> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut clusters: Vec<Cluster> = Vec::new();
    for price in sorted {
        match clusters.last_mut() {
            Some(cluster) if (price - cluster.level()).abs() <= cluster.level() * tolerance => {
                cluster.sum += price;
                cluster.touches += 1;
            }
            _ => clusters.push(Cluster {
                sum: price,
                touches: 1,
            }),
        }
    }

    clusters.iter().map(|c| (c.level(), c.touches)).collect()
}

/// Strongest levels first, ties broken by proximity to price
fn pick_levels(mut clusters: Vec<(f64, usize)>, price: f64) -> Vec<f64> {
    clusters.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| (a.0 - price).abs().total_cmp(&(b.0 - price).abs()))
    });
    let mut levels: Vec<f64> = clusters.into_iter().take(MAX_LEVELS).map(|c| c.0).collect();
    levels.sort_by(|a, b| (a - price).abs().total_cmp(&(b - price).abs()));
    levels
}

/// Find support/resistance from swing points
///
/// # Arguments
/// * `swing_window` - Candles on each side a swing point must dominate
/// * `tolerance` - Relative distance under which swing points merge (0.005 = 0.5%)
pub fn find_support_resistance(
    candles: &[Candle],
    swing_window: usize,
    tolerance: f64,
) -> SupportResistance {
    let window = swing_window.max(1);
    if candles.len() < window * 2 + 1 {
        return SupportResistance::default();
    }

    let price = candles[candles.len() - 1].close;
    let mut swing_highs = Vec::new();
    let mut swing_lows = Vec::new();

    for i in window..candles.len() - window {
        let neighbours = candles[i - window..=i + window]
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != window);

        let curr = &candles[i];
        let (mut is_high, mut is_low) = (true, true);
        for (_, other) in neighbours {
            is_high &= curr.high > other.high;
            is_low &= curr.low < other.low;
        }

        if is_high {
            swing_highs.push(curr.high);
        }
        if is_low {
            swing_lows.push(curr.low);
        }
    }

    let mut all_points = swing_highs;
    all_points.extend(swing_lows);

    // A broken resistance becomes support and vice versa, so split by price
    let clusters = cluster_levels(&all_points, tolerance);
    let (below, above): (Vec<_>, Vec<_>) = clusters.into_iter().partition(|(level, _)| *level < price);

    SupportResistance {
        support: pick_levels(below, price),
        resistance: pick_levels(above, price),
    }
}
