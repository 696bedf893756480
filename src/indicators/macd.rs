// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line = EMA(fast) - EMA(slow)
//   Signal    = EMA(MACD line, signal_period)
//   Histogram = MACD line - Signal
//
// The confluence scorer consumes only the histogram sign; the full triple is
// exposed for completeness.
// =============================================================================

use crate::indicators::ema::ema_series;

/// MACD triple at the most recent close.
#[derive(Debug, Clone)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute MACD with the given periods (conventionally 12 / 26 / 9).
///
/// Returns `None` until enough closes exist to warm up the slow EMA plus the
/// signal EMA over the MACD line.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Both series end at the final close; align by truncating the fast one.
    let offset = fast_series.len().checked_sub(slow_series.len())?;
    let line_series: Vec<f64> = fast_series[offset..]
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&line_series, signal_period);
    let signal = *signal_series.last()?;
    let line = *line_series.last()?;
    let histogram = line - signal;

    histogram.is_finite().then_some(Macd {
        line,
        signal,
        histogram,
    })
}
