// =============================================================================
// Signals Module
// =============================================================================
//
// Signal pipeline for the trading engine:
// - Per-strategy evaluator fired at bar close (seven named strategies)
// - Multi-factor confluence scorer
//
// Signals are in-memory values consumed exactly once by the admission
// pipeline.

pub mod confluence;
pub mod evaluator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Direction;

pub use confluence::{score_confluence, ConfluenceScore};
pub use evaluator::SignalEvaluator;

/// A directional signal emitted at the close of a bar.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub underlying_price: f64,
    pub reason: String,
    pub confluence_score: Option<u32>,
    pub confluence_max: Option<u32>,
    pub relative_volume: Option<f64>,
}

fn default_ema_fast() -> usize {
    9
}

fn default_ema_slow() -> usize {
    21
}

fn default_rsi_period() -> usize {
    14
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_orb_minutes() -> u32 {
    15
}

fn default_body_threshold_percent() -> f64 {
    50.0
}

fn default_max_gap_percent() -> f64 {
    0.5
}

fn default_bb_period() -> usize {
    20
}

fn default_bb_std() -> f64 {
    2.0
}

fn default_bb_squeeze_width() -> f64 {
    2.0
}

fn default_bb_squeeze_lookback() -> usize {
    10
}

fn default_rel_vol_period() -> usize {
    20
}

fn default_rel_vol_threshold() -> f64 {
    1.5
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_min_confluence() -> u32 {
    4
}

/// Tunable parameters for one enabled strategy. Every field has a serde
/// default so persisted parameter blobs survive schema growth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_orb_minutes")]
    pub orb_minutes: u32,
    /// Minimum candle body as a percent of range for directional breakouts.
    #[serde(default = "default_body_threshold_percent")]
    pub body_threshold_percent: f64,
    /// Session gaps beyond this percent against the breakout direction fail
    /// the gap-fade filter.
    #[serde(default = "default_max_gap_percent")]
    pub max_gap_percent: f64,
    #[serde(default = "default_bb_period")]
    pub bb_period: usize,
    #[serde(default = "default_bb_std")]
    pub bb_std: f64,
    /// Mean band width below which the market counts as compressed.
    #[serde(default = "default_bb_squeeze_width")]
    pub bb_squeeze_width: f64,
    #[serde(default = "default_bb_squeeze_lookback")]
    pub bb_squeeze_lookback: usize,
    #[serde(default = "default_rel_vol_period")]
    pub rel_vol_period: usize,
    #[serde(default = "default_rel_vol_threshold")]
    pub rel_vol_threshold: f64,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    /// Minimum confluence score required to fire.
    #[serde(default = "default_min_confluence")]
    pub min_confluence: u32,
    /// Bars of confirmation required after the raw signal (0 = immediate).
    #[serde(default)]
    pub confirm_bars: u32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty params deserialise from defaults")
    }
}
