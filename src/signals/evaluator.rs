// =============================================================================
// Signal Evaluator — per-strategy detection at bar close
// =============================================================================
//
// One evaluator instance per enabled (ticker, timeframe, signal type) tuple.
// `on_bar_close` is invoked with the completed bar set once per bar; it emits
// at most one signal per bar and gates every rule on indicator warmup.
//
// Optional N-bar confirmation: a raw CALL only fires after N subsequent bars
// all close above the signal bar's close (symmetric for PUT). While awaiting
// confirmation the pending signal is voided by a failing bar or by a raw
// signal in the opposite direction.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::indicators::{bollinger, ema, orb, rsi, volume, vwap};
use crate::market_data::Bar;
use crate::session;
use crate::signals::{confluence, Signal, StrategyParams};
use crate::types::{Direction, SignalKind};

/// Raw detection result before confirmation handling.
#[derive(Debug, Clone)]
struct RawSignal {
    direction: Direction,
    reason: String,
    confluence_score: Option<u32>,
    confluence_max: Option<u32>,
    relative_volume: Option<f64>,
}

#[derive(Debug, Clone)]
struct Pending {
    direction: Direction,
    anchor_close: f64,
    remaining: u32,
    raw: RawSignal,
}

/// Stateful evaluator for one strategy tuple.
pub struct SignalEvaluator {
    kind: SignalKind,
    params: StrategyParams,
    pending: Option<Pending>,
    last_evaluated: Option<DateTime<Utc>>,
}

impl SignalEvaluator {
    pub fn new(kind: SignalKind, params: StrategyParams) -> Self {
        Self {
            kind,
            params,
            pending: None,
            last_evaluated: None,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Evaluate at the close of the final bar in `bars` (completed bars,
    /// oldest first). Returns a signal at most once per bar.
    pub fn on_bar_close(&mut self, bars: &[Bar]) -> Option<Signal> {
        let last = bars.last()?;

        // Once per bar, even if the caller double-fires.
        if self.last_evaluated == Some(last.open_time) {
            return None;
        }
        self.last_evaluated = Some(last.open_time);

        let raw = self.detect(bars);

        // ── Confirmation handling ────────────────────────────────────────
        if let Some(pending) = self.pending.clone() {
            // An opposite raw signal voids the pending one.
            if let Some(ref r) = raw {
                if r.direction != pending.direction {
                    debug!(kind = %self.kind, "pending signal voided by opposite signal");
                    self.pending = None;
                    return self.admit_raw(raw, last);
                }
            }

            let confirmed_bar = match pending.direction {
                Direction::Call => last.close > pending.anchor_close,
                Direction::Put => last.close < pending.anchor_close,
            };

            if !confirmed_bar {
                debug!(kind = %self.kind, "pending signal voided by failing confirmation bar");
                self.pending = None;
                return None;
            }

            let remaining = pending.remaining - 1;
            if remaining == 0 {
                self.pending = None;
                return Some(self.emit(pending.raw, last));
            }
            self.pending = Some(Pending {
                remaining,
                ..pending
            });
            return None;
        }

        self.admit_raw(raw, last)
    }

    /// Route a fresh raw signal through the confirmation gate.
    fn admit_raw(&mut self, raw: Option<RawSignal>, last: &Bar) -> Option<Signal> {
        let raw = raw?;
        if self.params.confirm_bars == 0 {
            return Some(self.emit(raw, last));
        }
        self.pending = Some(Pending {
            direction: raw.direction,
            anchor_close: last.close,
            remaining: self.params.confirm_bars,
            raw,
        });
        None
    }

    fn emit(&self, raw: RawSignal, last: &Bar) -> Signal {
        debug!(
            kind = %self.kind,
            direction = %raw.direction,
            price = last.close,
            reason = %raw.reason,
            "signal fired"
        );
        Signal {
            timestamp: last.close_time,
            direction: raw.direction,
            underlying_price: last.close,
            reason: raw.reason,
            confluence_score: raw.confluence_score,
            confluence_max: raw.confluence_max,
            relative_volume: raw.relative_volume,
        }
    }

    // -------------------------------------------------------------------------
    // Raw detection per strategy
    // -------------------------------------------------------------------------

    fn detect(&self, bars: &[Bar]) -> Option<RawSignal> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let relative_volume = volume::relative_volume(bars, self.params.rel_vol_period);

        let basic = |direction: Direction, reason: String| RawSignal {
            direction,
            reason,
            confluence_score: None,
            confluence_max: None,
            relative_volume,
        };

        match self.kind {
            SignalKind::EmaCross => {
                let (direction, fast, slow) = self.ema_cross(&closes)?;
                Some(basic(
                    direction,
                    format!("EMA{fast} crossed EMA{slow} ({direction})"),
                ))
            }

            SignalKind::VwapCross => {
                let direction = self.vwap_cross(bars, &closes)?;
                Some(basic(direction, format!("close crossed VWAP ({direction})")))
            }

            SignalKind::EmaVwap => {
                let (direction, fast, slow) = self.ema_cross(&closes)?;
                let close = *closes.last()?;
                let vwap_now = vwap::session_vwap(bars)?;
                let aligned = match direction {
                    Direction::Call => close > vwap_now,
                    Direction::Put => close < vwap_now,
                };
                if !aligned {
                    return None;
                }
                Some(basic(
                    direction,
                    format!("EMA{fast}/EMA{slow} cross with VWAP alignment ({direction})"),
                ))
            }

            SignalKind::Orb => {
                let (direction, level) = self.orb_break(bars, &closes)?;
                Some(basic(
                    direction,
                    format!("opening-range break of {level:.2} ({direction})"),
                ))
            }

            SignalKind::OrbDirectional => {
                let (direction, level) = self.orb_break(bars, &closes)?;
                let last = bars.last()?;

                let body = volume::body_percent(last)?;
                if body < self.params.body_threshold_percent {
                    return None;
                }

                let close = last.close;
                let vwap_now = vwap::session_vwap(bars)?;
                let aligned = match direction {
                    Direction::Call => close > vwap_now,
                    Direction::Put => close < vwap_now,
                };
                if !aligned {
                    return None;
                }

                if !self.gap_fade_ok(bars, direction) {
                    return None;
                }

                Some(basic(
                    direction,
                    format!(
                        "directional opening-range break of {level:.2} \
                         (body {body:.0}%, {direction})"
                    ),
                ))
            }

            SignalKind::VwapRsi => {
                let close = *closes.last()?;
                let vwap_now = vwap::session_vwap(bars)?;
                let (prev_rsi, cur_rsi) = rsi::rsi_last_two(&closes, self.params.rsi_period)?;

                if close > vwap_now
                    && prev_rsi < self.params.rsi_oversold
                    && cur_rsi >= self.params.rsi_oversold
                {
                    return Some(basic(
                        Direction::Call,
                        format!("above VWAP with RSI up through {}", self.params.rsi_oversold),
                    ));
                }
                if close < vwap_now
                    && prev_rsi > self.params.rsi_overbought
                    && cur_rsi <= self.params.rsi_overbought
                {
                    return Some(basic(
                        Direction::Put,
                        format!(
                            "below VWAP with RSI down through {}",
                            self.params.rsi_overbought
                        ),
                    ));
                }
                None
            }

            SignalKind::BbSqueeze => {
                let direction = self.squeeze_break(&closes)?;
                Some(basic(
                    direction,
                    format!("band break out of squeeze ({direction})"),
                ))
            }

            SignalKind::RsiReversal => {
                let (prev_rsi, cur_rsi) = rsi::rsi_last_two(&closes, self.params.rsi_period)?;
                if prev_rsi < self.params.rsi_oversold && cur_rsi >= self.params.rsi_oversold {
                    return Some(basic(
                        Direction::Call,
                        format!("RSI recovered above {}", self.params.rsi_oversold),
                    ));
                }
                if prev_rsi > self.params.rsi_overbought && cur_rsi <= self.params.rsi_overbought
                {
                    return Some(basic(
                        Direction::Put,
                        format!("RSI fell below {}", self.params.rsi_overbought),
                    ));
                }
                None
            }

            SignalKind::Confluence => {
                let result = confluence::score_confluence(bars, &self.params)?;
                let direction = result.direction?;
                if result.score < self.params.min_confluence {
                    return None;
                }
                Some(RawSignal {
                    direction,
                    reason: format!(
                        "confluence {}/{} [{}]",
                        result.score,
                        result.max,
                        result.factors.join(", ")
                    ),
                    confluence_score: Some(result.score),
                    confluence_max: Some(result.max),
                    relative_volume: result.relative_volume,
                })
            }
        }
    }

    /// Fast/slow EMA cross on the final bar.
    fn ema_cross(&self, closes: &[f64]) -> Option<(Direction, usize, usize)> {
        let (prev_fast, cur_fast) = ema::ema_last_two(closes, self.params.ema_fast)?;
        let (prev_slow, cur_slow) = ema::ema_last_two(closes, self.params.ema_slow)?;

        if prev_fast <= prev_slow && cur_fast > cur_slow {
            return Some((Direction::Call, self.params.ema_fast, self.params.ema_slow));
        }
        if prev_fast >= prev_slow && cur_fast < cur_slow {
            return Some((Direction::Put, self.params.ema_fast, self.params.ema_slow));
        }
        None
    }

    /// Close crossing VWAP on the final bar.
    fn vwap_cross(&self, bars: &[Bar], closes: &[f64]) -> Option<Direction> {
        if closes.len() < 2 {
            return None;
        }
        let (prev_vwap, cur_vwap) = vwap::vwap_last_two(bars)?;
        let prev_close = closes[closes.len() - 2];
        let cur_close = closes[closes.len() - 1];

        if prev_close <= prev_vwap && cur_close > cur_vwap {
            return Some(Direction::Call);
        }
        if prev_close >= prev_vwap && cur_close < cur_vwap {
            return Some(Direction::Put);
        }
        None
    }

    /// Close crossing the opening-range high/low on the final bar. Returns
    /// the broken level with the direction.
    fn orb_break(&self, bars: &[Bar], closes: &[f64]) -> Option<(Direction, f64)> {
        if closes.len() < 2 {
            return None;
        }
        let range = orb::opening_range(bars, self.params.orb_minutes)?;
        let prev_close = closes[closes.len() - 2];
        let cur_close = closes[closes.len() - 1];

        if prev_close <= range.high && cur_close > range.high {
            return Some((Direction::Call, range.high));
        }
        if prev_close >= range.low && cur_close < range.low {
            return Some((Direction::Put, range.low));
        }
        None
    }

    /// Band break after a low-volatility compression.
    fn squeeze_break(&self, closes: &[f64]) -> Option<Direction> {
        if closes.len() < 2 {
            return None;
        }
        let bands = bollinger::bollinger(closes, self.params.bb_period, self.params.bb_std)?;
        let prev_bands = bollinger::bollinger(
            &closes[..closes.len() - 1],
            self.params.bb_period,
            self.params.bb_std,
        )?;

        // Compression over the bars before the breakout bar.
        let widths = bollinger::width_series(
            &closes[..closes.len() - 1],
            self.params.bb_period,
            self.params.bb_std,
            self.params.bb_squeeze_lookback,
        );
        if widths.is_empty() {
            return None;
        }
        let mean_width = widths.iter().sum::<f64>() / widths.len() as f64;
        if mean_width >= self.params.bb_squeeze_width {
            return None;
        }

        let prev_close = closes[closes.len() - 2];
        let cur_close = closes[closes.len() - 1];

        if prev_close <= prev_bands.upper && cur_close > bands.upper {
            return Some(Direction::Call);
        }
        if prev_close >= prev_bands.lower && cur_close < bands.lower {
            return Some(Direction::Put);
        }
        None
    }

    /// Gap-fade filter: block breakouts in the direction of an oversized
    /// overnight gap. Passes when no prior-session close is in the ring.
    fn gap_fade_ok(&self, bars: &[Bar], direction: Direction) -> bool {
        let Some(last) = bars.last() else {
            return false;
        };
        let today = session::to_market(last.open_time.naive_utc()).date_naive();

        let prior_close = bars
            .iter()
            .rev()
            .find(|b| session::to_market(b.open_time.naive_utc()).date_naive() < today)
            .map(|b| b.close);
        let today_open = bars
            .iter()
            .find(|b| session::to_market(b.open_time.naive_utc()).date_naive() == today)
            .map(|b| b.open);

        let (Some(prior_close), Some(today_open)) = (prior_close, today_open) else {
            return true;
        };
        if prior_close <= 0.0 {
            return true;
        }

        let gap_pct = (today_open - prior_close) / prior_close * 100.0;
        match direction {
            Direction::Call => gap_pct <= self.params.max_gap_percent,
            Direction::Put => gap_pct >= -self.params.max_gap_percent,
        }
    }
}
