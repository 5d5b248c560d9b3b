/// Average True Range (ATR)
///
/// The volatility unit for stop placement. True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Seeded with a simple average, then smoothed with Wilder's method.

use crate::models::Candle;

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let (prev, current) = (&pair[0], &pair[1]);
            (current.high - current.low)
                .max((current.high - prev.close).abs())
                .max((current.low - prev.close).abs())
        })
        .collect()
}

/// Calculate ATR for the given candles
///
/// Returns None if there are fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(candles);

    // First ATR is simple average of first 'period' true ranges
    let first_atr: f64 = ranges.iter().take(period).sum::<f64>() / period as f64;

    let atr = ranges[period..]
        .iter()
        .fold(first_atr, |atr, tr| (atr * (period as f64 - 1.0) + tr) / period as f64);

    Some(atr)
}

/// Volatility unit for a possibly short window
///
/// Full ATR when the window allows it. A short window falls back to the mean
/// high-low range of its candles. Empty input gives None.
pub fn volatility_unit(candles: &[Candle], period: usize) -> Option<f64> {
    if let Some(atr) = calculate_atr(candles, period) {
        return Some(atr);
    }
    if candles.is_empty() {
        return None;
    }

    let total: f64 = candles.iter().map(|c| c.high - c.low).sum();
    Some(total / candles.len() as f64)
}
