// =============================================================================
// Volume and candle-body metrics
// =============================================================================
//
// Relative volume at bar i is volume_i / mean(volume[i-period .. i-1]); at
// least one full prior period is required. Body metrics express the candle
// body as a share of its full range.
// =============================================================================

use crate::market_data::Bar;

/// Relative volume of the final bar against the mean of the `period` bars
/// before it.
///
/// Returns `None` when fewer than `period + 1` bars exist, the prior mean is
/// zero, or the result is non-finite.
pub fn relative_volume(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let last = bars.last()?;
    let prior = &bars[bars.len() - 1 - period..bars.len() - 1];
    let mean = prior.iter().map(|b| b.volume).sum::<f64>() / period as f64;

    if mean <= 0.0 {
        return None;
    }

    let rel = last.volume / mean;
    rel.is_finite().then_some(rel)
}

/// Candle body as a percent of the bar's high-low range, in [0, 100].
///
/// Returns `None` for a zero-range bar (high == low).
pub fn body_percent(bar: &Bar) -> Option<f64> {
    let range = bar.high - bar.low;
    if range <= 0.0 {
        return None;
    }
    let pct = (bar.close - bar.open).abs() / range * 100.0;
    pct.is_finite().then_some(pct)
}

/// True when the candle closed above its open.
pub fn is_bullish_body(bar: &Bar) -> bool {
    bar.close > bar.open
}

/// True when the candle closed below its open.
pub fn is_bearish_body(bar: &Bar) -> bool {
    bar.close < bar.open
}
