// =============================================================================
// Volume-Weighted Average Price (VWAP) — session anchored
// =============================================================================
//
// VWAP = Σ(typical_price * volume) / Σ(volume), accumulated from the session
// open in the market's local zone. The anchor resets at the session boundary
// even if bars are missing: only bars dated to the final bar's session and at
// or after 09:30 local contribute.
// =============================================================================

use crate::market_data::Bar;
use crate::session;

/// VWAP per bar for the current session (oldest first), one value for each
/// session bar. Returns an empty series when no session bar carries volume.
pub fn session_vwap_series(bars: &[Bar]) -> Vec<f64> {
    let session_bars = current_session_bars(bars);

    let mut series = Vec::with_capacity(session_bars.len());
    let mut cum_pv = 0.0;
    let mut cum_volume = 0.0;

    for bar in session_bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        cum_pv += typical * bar.volume;
        cum_volume += bar.volume;

        if cum_volume <= 0.0 {
            // No volume yet this session — VWAP undefined so far.
            continue;
        }
        let vwap = cum_pv / cum_volume;
        if !vwap.is_finite() {
            break;
        }
        series.push(vwap);
    }

    series
}

/// The most recent session VWAP value.
pub fn session_vwap(bars: &[Bar]) -> Option<f64> {
    session_vwap_series(bars).last().copied()
}

/// The last two session VWAP values, `(previous, current)`.
pub fn vwap_last_two(bars: &[Bar]) -> Option<(f64, f64)> {
    let series = session_vwap_series(bars);
    if series.len() < 2 {
        return None;
    }
    Some((series[series.len() - 2], series[series.len() - 1]))
}

/// Restrict `bars` to those belonging to the final bar's session: same market
/// date, at or after the session open.
fn current_session_bars(bars: &[Bar]) -> &[Bar] {
    let Some(last) = bars.last() else {
        return &[];
    };
    let session_day = session::to_market(last.open_time.naive_utc()).date_naive();
    let open = session::session_open_time();

    let start = bars
        .iter()
        .position(|b| {
            let local = session::to_market(b.open_time.naive_utc());
            local.date_naive() == session_day && local.time() >= open
        })
        .unwrap_or(bars.len());

    &bars[start..]
}
