// =============================================================================
// Opening Range Breakout (ORB) levels
// =============================================================================
//
// The opening range is the high/low of the first K minutes of the session in
// the market's local zone. Breakout strategies fire when a later close crosses
// one of these levels.
// =============================================================================

use chrono::Duration;

use crate::market_data::Bar;
use crate::session;

/// High/low of the session's opening range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpeningRange {
    pub high: f64,
    pub low: f64,
}

/// Compute the opening range over the first `minutes` of the final bar's
/// session.
///
/// Returns `None` when no bar opens inside the range window — either the
/// history does not reach back to the open, or the session has not started.
pub fn opening_range(bars: &[Bar], minutes: u32) -> Option<OpeningRange> {
    let last = bars.last()?;
    let session_day = session::to_market(last.open_time.naive_utc()).date_naive();
    let open = session::session_open_time();
    let range_end = open + Duration::minutes(i64::from(minutes));

    let mut high = f64::NEG_INFINITY;
    let mut low = f64::INFINITY;
    let mut seen = false;

    for bar in bars {
        let local = session::to_market(bar.open_time.naive_utc());
        if local.date_naive() != session_day {
            continue;
        }
        let t = local.time();
        if t >= open && t < range_end {
            high = high.max(bar.high);
            low = low.min(bar.low);
            seen = true;
        }
    }

    (seen && high.is_finite() && low.is_finite()).then_some(OpeningRange { high, low })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tests::bar_hl;

    #[test]
    fn empty_input() {
        assert!(opening_range(&[], 15).is_none());
    }

    #[test]
    fn covers_first_k_minutes_only() {
        let bars = vec![
            bar_hl(9, 30, 101.0, 99.0),
            bar_hl(9, 35, 103.0, 100.0),
            bar_hl(9, 44, 102.0, 98.0),
            // Past the 15-minute range — must not extend it.
            bar_hl(9, 45, 110.0, 90.0),
            bar_hl(10, 0, 120.0, 80.0),
        ];
        let range = opening_range(&bars, 15).unwrap();
        assert!((range.high - 103.0).abs() < 1e-10);
        assert!((range.low - 98.0).abs() < 1e-10);
    }

    #[test]
    fn no_bars_inside_range() {
        let bars = vec![bar_hl(10, 30, 105.0, 95.0)];
        assert!(opening_range(&bars, 15).is_none());
    }

    #[test]
    fn ignores_prior_session() {
        let mut stale = bar_hl(9, 31, 500.0, 1.0);
        stale.open_time -= chrono::Duration::days(1);
        let bars = vec![stale, bar_hl(9, 30, 101.0, 99.0), bar_hl(9, 50, 104.0, 100.0)];
        let range = opening_range(&bars, 15).unwrap();
        assert!((range.high - 101.0).abs() < 1e-10);
        assert!((range.low - 99.0).abs() < 1e-10);
    }

    #[test]
    fn configurable_length() {
        let bars = vec![
            bar_hl(9, 30, 101.0, 99.0),
            bar_hl(9, 33, 106.0, 98.5),
            bar_hl(9, 36, 110.0, 97.0),
        ];
        let narrow = opening_range(&bars, 5).unwrap();
        assert!((narrow.high - 106.0).abs() < 1e-10);
        let wide = opening_range(&bars, 30).unwrap();
        assert!((wide.high - 110.0).abs() < 1e-10);
        assert!((wide.low - 97.0).abs() < 1e-10);
    }
}
