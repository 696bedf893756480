// =============================================================================
// Confluence scorer — count of aligned bullish / bearish factors at bar close
// =============================================================================
//
// Fixed factor set: EMA side, VWAP side, RSI state, MACD histogram sign,
// relative volume (confirming the bar's direction), candle body direction,
// and pivot proximity when a prior-session pivot is computable. The CALL
// score counts bullish factors, the PUT score counts bearish; a tie yields
// no direction.
// =============================================================================

use serde::Serialize;

use crate::indicators::{ema, macd, volume, vwap};
use crate::market_data::Bar;
use crate::session;
use crate::signals::StrategyParams;
use crate::types::Direction;

/// Outcome of one confluence evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ConfluenceScore {
    /// Winning direction, absent on a tie.
    pub direction: Option<Direction>,
    /// Score of the winning side (or the tied value).
    pub score: u32,
    /// Number of factors that were evaluable this bar.
    pub max: u32,
    pub bullish: u32,
    pub bearish: u32,
    /// Relative volume of the signal bar, when computable.
    pub relative_volume: Option<f64>,
    /// Factor names that contributed, for the audit trail.
    pub factors: Vec<String>,
}

/// Score the final bar of `bars`.
///
/// Returns `None` until the core factors (EMA stack, VWAP, RSI, MACD) are all
/// past warmup — the evaluator must not fire on partial evidence. Relative
/// volume and pivot are optional factors: when unavailable they are excluded
/// from both the score and `max`.
pub fn score_confluence(bars: &[Bar], params: &StrategyParams) -> Option<ConfluenceScore> {
    let last = bars.last()?;
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let close = last.close;

    // Core factors — all required.
    let fast = *ema::ema_series(&closes, params.ema_fast).last()?;
    let slow = *ema::ema_series(&closes, params.ema_slow).last()?;
    let vwap_now = vwap::session_vwap(bars)?;
    let rsi_now = *crate::indicators::rsi::rsi_series(&closes, params.rsi_period).last()?;
    let histogram = macd::macd(&closes, params.macd_fast, params.macd_slow, params.macd_signal)?
        .histogram;

    let mut bullish = 0u32;
    let mut bearish = 0u32;
    let mut max = 0u32;
    let mut factors = Vec::new();

    let mut tally = |name: &str, vote: Option<Direction>| {
        max += 1;
        match vote {
            Some(Direction::Call) => {
                bullish += 1;
                factors.push(format!("{name}:bull"));
            }
            Some(Direction::Put) => {
                bearish += 1;
                factors.push(format!("{name}:bear"));
            }
            None => {}
        }
    };

    // 1. EMA side: price above an upward stack / below a downward stack.
    tally(
        "ema",
        if close > fast && fast > slow {
            Some(Direction::Call)
        } else if close < fast && fast < slow {
            Some(Direction::Put)
        } else {
            None
        },
    );

    // 2. VWAP side.
    tally(
        "vwap",
        if close > vwap_now {
            Some(Direction::Call)
        } else if close < vwap_now {
            Some(Direction::Put)
        } else {
            None
        },
    );

    // 3. RSI state around the midline.
    tally(
        "rsi",
        if rsi_now > 50.0 {
            Some(Direction::Call)
        } else if rsi_now < 50.0 {
            Some(Direction::Put)
        } else {
            None
        },
    );

    // 4. MACD histogram sign.
    tally(
        "macd",
        if histogram > 0.0 {
            Some(Direction::Call)
        } else if histogram < 0.0 {
            Some(Direction::Put)
        } else {
            None
        },
    );

    // 5. Relative volume confirming the bar's direction (optional factor).
    let relative_volume = volume::relative_volume(bars, params.rel_vol_period);
    if let Some(rel) = relative_volume {
        tally(
            "rel_vol",
            if rel >= params.rel_vol_threshold {
                if volume::is_bullish_body(last) {
                    Some(Direction::Call)
                } else if volume::is_bearish_body(last) {
                    Some(Direction::Put)
                } else {
                    None
                }
            } else {
                None
            },
        );
    }

    // 6. Candle body direction.
    tally(
        "body",
        if volume::is_bullish_body(last) {
            Some(Direction::Call)
        } else if volume::is_bearish_body(last) {
            Some(Direction::Put)
        } else {
            None
        },
    );

    // 7. Pivot proximity (optional): close relative to the prior-session
    // pivot point.
    if let Some(pivot) = prior_session_pivot(bars) {
        tally(
            "pivot",
            if close > pivot {
                Some(Direction::Call)
            } else if close < pivot {
                Some(Direction::Put)
            } else {
                None
            },
        );
    }

    let (direction, score) = if bullish > bearish {
        (Some(Direction::Call), bullish)
    } else if bearish > bullish {
        (Some(Direction::Put), bearish)
    } else {
        (None, bullish)
    };

    Some(ConfluenceScore {
        direction,
        score,
        max,
        bullish,
        bearish,
        relative_volume,
        factors,
    })
}

/// Classic pivot point (H+L+C)/3 of the session before the final bar's,
/// when the ring still holds bars from it.
fn prior_session_pivot(bars: &[Bar]) -> Option<f64> {
    let last = bars.last()?;
    let today = session::to_market(last.open_time.naive_utc()).date_naive();

    let prior: Vec<&Bar> = bars
        .iter()
        .filter(|b| session::to_market(b.open_time.naive_utc()).date_naive() < today)
        .collect();
    if prior.is_empty() {
        return None;
    }

    let high = prior.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let low = prior.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    let close = prior.last()?.close;

    let pivot = (high + low + close) / 3.0;
    pivot.is_finite().then_some(pivot)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tests::offset_bar;

    /// Build a session of rising bullish bars, enough for all core warmups.
    fn bullish_session() -> Vec<Bar> {
        (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
                offset_bar(i, base, base + 0.6, base - 0.1, base + 0.5, 100.0)
            })
            .collect()
    }

    fn bearish_session() -> Vec<Bar> {
        (0..40)
            .map(|i| {
                let base = 120.0 - i as f64 * 0.5;
                offset_bar(i, base, base + 0.1, base - 0.6, base - 0.5, 100.0)
            })
            .collect()
    }

    #[test]
    fn insufficient_data_returns_none() {
        let bars = bullish_session();
        assert!(score_confluence(&bars[..10], &StrategyParams::default()).is_none());
    }

    #[test]
    fn bullish_session_scores_call() {
        let result = score_confluence(&bullish_session(), &StrategyParams::default()).unwrap();
        assert_eq!(result.direction, Some(Direction::Call));
        assert!(result.bullish >= 4, "bullish factors: {:?}", result.factors);
        assert_eq!(result.bearish, 0);
        assert!(result.max >= result.score);
    }

    #[test]
    fn bearish_session_scores_put() {
        let result = score_confluence(&bearish_session(), &StrategyParams::default()).unwrap();
        assert_eq!(result.direction, Some(Direction::Put));
        assert!(result.bearish >= 4, "bearish factors: {:?}", result.factors);
    }

    #[test]
    fn high_relative_volume_counts_with_body() {
        let mut bars = bullish_session();
        // Blow out the final bar's volume: rel-vol factor joins the bulls.
        if let Some(last) = bars.last_mut() {
            last.volume = 1000.0;
        }
        let result = score_confluence(&bars, &StrategyParams::default()).unwrap();
        assert!(result.relative_volume.unwrap() > 2.0);
        assert!(result.factors.iter().any(|f| f == "rel_vol:bull"));
    }

    #[test]
    fn pivot_excluded_without_prior_session() {
        // Single-session history: pivot cannot be computed, max shrinks.
        let result = score_confluence(&bullish_session(), &StrategyParams::default()).unwrap();
        assert!(!result.factors.iter().any(|f| f.starts_with("pivot")));
        assert!(result.max <= 6);
    }

    #[test]
    fn tie_has_no_direction() {
        // Flat bars: every factor is neutral, 0-0 tie.
        let bars: Vec<Bar> = (0..40)
            .map(|i| offset_bar(i, 100.0, 100.0, 100.0, 100.0, 100.0))
            .collect();
        let result = score_confluence(&bars, &StrategyParams::default()).unwrap();
        assert_eq!(result.direction, None);
        assert_eq!(result.score, 0);
    }
}
