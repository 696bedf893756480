// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS)
//
// Averages are seeded with the SMA of the first `period` deltas.
// =============================================================================

/// Compute the RSI series for `closes` with look-back `period`.
///
/// One value per close starting at index `period` (the first `period + 1`
/// closes seed the averages). Empty when `period == 0` or there are fewer
/// than `period + 1` closes. With zero average loss the RSI clamps to 100;
/// with no movement at all it is 50.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    // Seed with the plain average of the first `period` deltas.
    for w in closes[..=period].windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;

    let mut series = Vec::with_capacity(closes.len() - period);
    match rsi_value(avg_gain, avg_loss) {
        Some(rsi) => series.push(rsi),
        None => return Vec::new(),
    }

    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(rsi) => series.push(rsi),
            None => break,
        }
    }

    series
}

/// The last two RSI values, `(previous, current)` — used for cross detection
/// through the oversold / overbought thresholds.
pub fn rsi_last_two(closes: &[f64], period: usize) -> Option<(f64, f64)> {
    let series = rsi_series(closes, period);
    if series.len() < 2 {
        return None;
    }
    Some((series[series.len() - 2], series[series.len() - 1]))
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    rsi.is_finite().then_some(rsi)
}
