/// Calculate Simple Moving Average (SMA) of the most recent `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA)
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema_series(prices, period).last().copied()
}

/// EMA for every point from index `period - 1` onwards, seeded with the SMA
/// of the first `period` values
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(prices.len() - period + 1);

    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    series.push(ema);

    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }

    series
}

/// Population standard deviation of the most recent `period` values
pub fn calculate_std_dev(values: &[f64], period: usize) -> Option<f64> {
    let mean = calculate_sma(values, period)?;
    let variance = values
        .iter()
        .rev()
        .take(period)
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / period as f64;

    Some(variance.sqrt())
}
