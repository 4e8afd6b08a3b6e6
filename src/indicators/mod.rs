// Technical indicators module
// Implements RSI, MA, MACD, Bollinger, oscillators, ATR, price levels and volume

pub mod atr;
pub mod bollinger;
pub mod levels;
pub mod macd;
pub mod moving_average;
pub mod oscillators;
pub mod rsi;
pub mod volume;

pub use atr::{calculate_atr, calculate_atr_series};
pub use bollinger::{calculate_bollinger, BollingerBands};
pub use levels::{calculate_fibonacci, find_support_resistance, FibonacciLevels, SupportResistance};
pub use macd::{calculate_macd, calculate_macd_series, detect_crossover, MacdCrossover, MacdValue};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma, calculate_std_dev};
pub use oscillators::{calculate_stochastic, calculate_williams_r, StochasticValue};
pub use rsi::calculate_rsi;
pub use volume::{analyze_volume, calculate_average_volume, VolumeSummary, VolumeTrend};
