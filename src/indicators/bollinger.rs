//! Bollinger Bands.

use serde::{Deserialize, Serialize};

use super::moving_average::{calculate_sma, calculate_std_dev};

/// Bollinger Bands
///
/// - Middle band: SMA(period)
/// - Upper band: SMA + k * StdDev
/// - Lower band: SMA - k * StdDev
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    /// Position of a price inside the bands: 0 at the lower band, 1 at the upper
    pub fn percent_b(&self, price: f64) -> f64 {
        let width = self.upper - self.lower;
        if width <= 0.0 {
            return 0.5;
        }
        (price - self.lower) / width
    }

    /// Band width relative to the middle band
    pub fn bandwidth(&self) -> f64 {
        if self.middle == 0.0 {
            return 0.0;
        }
        (self.upper - self.lower) / self.middle
    }
}

pub fn calculate_bollinger(
    prices: &[f64],
    period: usize,
    std_dev_multiplier: f64,
) -> Option<BollingerBands> {
    let middle = calculate_sma(prices, period)?;
    let std_dev = calculate_std_dev(prices, period)?;

    Some(BollingerBands {
        upper: middle + std_dev_multiplier * std_dev,
        middle,
        lower: middle - std_dev_multiplier * std_dev,
    })
}
