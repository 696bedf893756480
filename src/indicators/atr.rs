// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR seeds with the SMA of the first `period` TR values and then applies
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Bar;

/// Compute the most recent ATR value over `bars` (oldest first).
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// bars (each TR needs a previous close), or any intermediate value is
/// non-finite.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let hl = w[1].high - w[1].low;
            let hc = (w[1].high - w[0].close).abs();
            let lc = (w[1].low - w[0].close).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let period_f = period as f64;
    let mut value = true_ranges[..period].iter().sum::<f64>() / period_f;
    if !value.is_finite() {
        return None;
    }

    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
        if !value.is_finite() {
            return None;
        }
    }

    Some(value)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tests::bar_ohlc;

    #[test]
    fn period_zero() {
        let bars = vec![bar_ohlc(100.0, 105.0, 95.0, 102.0); 20];
        assert!(atr(&bars, 0).is_none());
    }

    #[test]
    fn insufficient_data() {
        let bars = vec![bar_ohlc(100.0, 105.0, 95.0, 102.0); 10];
        assert!(atr(&bars, 14).is_none());
    }

    #[test]
    fn exact_minimum_data() {
        let bars = vec![
            bar_ohlc(100.0, 102.0, 98.0, 101.0),
            bar_ohlc(101.0, 104.0, 99.0, 103.0),
            bar_ohlc(103.0, 106.0, 100.0, 105.0),
            bar_ohlc(105.0, 108.0, 102.0, 107.0),
        ];
        let value = atr(&bars, 3).unwrap();
        assert!(value > 0.0 && value.is_finite());
    }

    #[test]
    fn constant_range_converges() {
        // Every bar spans 10 points; ATR must sit near 10.
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar_ohlc(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let value = atr(&bars, 14).unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected ATR near 10, got {value}");
    }

    #[test]
    fn gap_counts_via_prev_close() {
        // |H - prevClose| dominates after a gap up.
        let bars = vec![
            bar_ohlc(100.0, 105.0, 95.0, 95.0),
            bar_ohlc(110.0, 115.0, 108.0, 112.0),
            bar_ohlc(112.0, 118.0, 110.0, 115.0),
            bar_ohlc(115.0, 120.0, 113.0, 118.0),
        ];
        let value = atr(&bars, 3).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }

    #[test]
    fn nan_returns_none() {
        let bars = vec![
            bar_ohlc(100.0, 105.0, 95.0, 100.0),
            bar_ohlc(100.0, f64::NAN, 95.0, 100.0),
            bar_ohlc(100.0, 105.0, 95.0, 100.0),
            bar_ohlc(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(atr(&bars, 3).is_none());
    }
}
