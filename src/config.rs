// =============================================================================
// Application Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Vega trading engine. The config is built
// once at startup and treated as immutable afterwards; the only mutable knobs
// live in the small `Overrides` record, which is guarded by a lock and
// broadcast on change.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_tickers() -> Vec<String> {
    vec!["SPY".to_string(), "QQQ".to_string()]
}

fn default_quantity() -> i64 {
    1
}

fn default_delta_target() -> f64 {
    0.50
}

fn default_max_spread_percent() -> f64 {
    10.0
}

fn default_strike_count() -> u32 {
    20
}

fn default_stop_loss_percent() -> f64 {
    25.0
}

fn default_atr_stop_multiplier() -> f64 {
    2.0
}

fn default_profit_target_percent() -> f64 {
    25.0
}

fn default_trailing_stop_percent() -> f64 {
    15.0
}

fn default_max_hold_minutes() -> i64 {
    180
}

fn default_force_exit_time() -> String {
    "15:00".to_string()
}

fn default_afternoon_cutoff() -> String {
    "12:00".to_string()
}

fn default_entry_limit_timeout_secs() -> u64 {
    60
}

fn default_daily_trade_cap() -> u32 {
    10
}

fn default_consecutive_loss_cap() -> u32 {
    3
}

fn default_daily_loss_cap_dollars() -> f64 {
    500.0
}

fn default_vix_threshold() -> f64 {
    28.0
}

fn default_session_windows() -> Vec<SessionWindow> {
    vec![SessionWindow {
        start: "09:30".to_string(),
        end: "15:00".to_string(),
    }]
}

fn default_order_monitor_secs() -> u64 {
    5
}

fn default_exit_monitor_secs() -> u64 {
    10
}

fn default_max_trades_per_tick() -> usize {
    64
}

fn default_snapshot_interval_secs() -> i64 {
    15
}

fn default_quote_stale_secs() -> i64 {
    5
}

fn default_orb_minutes() -> u32 {
    15
}

fn default_double_min_score() -> u32 {
    5
}

fn default_double_min_rel_vol() -> f64 {
    2.0
}

fn default_half_max_score() -> u32 {
    2
}

fn default_calendar_path() -> String {
    "event_calendar.json".to_string()
}

fn default_database_url() -> String {
    "sqlite://vega.db?mode=rwc".to_string()
}

fn default_broker_deadline_secs() -> u64 {
    5
}

// =============================================================================
// SessionWindow
// =============================================================================

/// An allowed trading window in market local time, "HH:MM" inclusive start,
/// exclusive end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: String,
    pub end: String,
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration for the Vega engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Admission ----------------------------------------------------------

    /// Shared secret required on external webhook alerts. Overridable via the
    /// VEGA_WEBHOOK_SECRET environment variable.
    #[serde(default)]
    pub webhook_secret: String,

    /// Underlyings the engine is allowed to trade.
    #[serde(default = "default_tickers")]
    pub allowed_tickers: Vec<String>,

    /// Base contract quantity before confidence-based sizing.
    #[serde(default = "default_quantity")]
    pub default_quantity: i64,

    // --- Contract selection -------------------------------------------------

    /// Target option delta for contract selection.
    #[serde(default = "default_delta_target")]
    pub delta_target: f64,

    /// Maximum acceptable bid/ask spread as a percent of the mid price.
    #[serde(default = "default_max_spread_percent")]
    pub max_spread_percent: f64,

    /// Strikes fetched around at-the-money.
    #[serde(default = "default_strike_count")]
    pub strike_count: u32,

    // --- Stops & exits ------------------------------------------------------

    /// Fallback stop distance as a percent of entry when ATR is unavailable.
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,

    /// ATR multiplier for the primary stop-loss rule.
    #[serde(default = "default_atr_stop_multiplier")]
    pub atr_stop_multiplier: f64,

    /// Profit target as a percent of entry price.
    #[serde(default = "default_profit_target_percent")]
    pub profit_target_percent: f64,

    /// Trailing stop distance as a percent below the highest price seen.
    #[serde(default = "default_trailing_stop_percent")]
    pub trailing_stop_percent: f64,

    /// Maximum hold time in minutes before a forced exit.
    #[serde(default = "default_max_hold_minutes")]
    pub max_hold_minutes: i64,

    /// Hard end-of-day flat time in market local time ("HH:MM").
    #[serde(default = "default_force_exit_time")]
    pub force_exit_time: String,

    /// Seconds a limit entry may stay WORKING before it is cancelled.
    #[serde(default = "default_entry_limit_timeout_secs")]
    pub entry_limit_timeout_secs: u64,

    // --- Risk gate ----------------------------------------------------------

    /// Maximum non-cancelled trades per session.
    #[serde(default = "default_daily_trade_cap")]
    pub daily_trade_cap: u32,

    /// Maximum consecutive losing trades before new entries are blocked.
    #[serde(default = "default_consecutive_loss_cap")]
    pub consecutive_loss_cap: u32,

    /// Maximum cumulative session loss in dollars before new entries are
    /// blocked.
    #[serde(default = "default_daily_loss_cap_dollars")]
    pub daily_loss_cap_dollars: f64,

    /// VIX circuit-breaker threshold.
    #[serde(default = "default_vix_threshold")]
    pub vix_threshold: f64,

    /// Allowed trading windows in market local time.
    #[serde(default = "default_session_windows")]
    pub session_windows: Vec<SessionWindow>,

    /// No new entries after this time on blocked event-calendar days.
    #[serde(default = "default_afternoon_cutoff")]
    pub afternoon_cutoff: String,

    /// Path to the event-calendar JSON file (`blocked_afternoons`).
    #[serde(default = "default_calendar_path")]
    pub event_calendar_path: String,

    // --- Signals ------------------------------------------------------------

    /// Opening-range length in minutes for ORB strategies.
    #[serde(default = "default_orb_minutes")]
    pub orb_minutes: u32,

    /// Confluence score at or above which quantity doubles.
    #[serde(default = "default_double_min_score")]
    pub double_min_score: u32,

    /// Relative-volume floor required alongside `double_min_score`.
    #[serde(default = "default_double_min_rel_vol")]
    pub double_min_rel_vol: f64,

    /// Confluence score at or below which quantity halves (floor 1).
    #[serde(default = "default_half_max_score")]
    pub half_max_score: u32,

    // --- Cadence ------------------------------------------------------------

    #[serde(default = "default_order_monitor_secs")]
    pub order_monitor_interval_secs: u64,

    #[serde(default = "default_exit_monitor_secs")]
    pub exit_monitor_interval_secs: u64,

    /// Per-tick work cap for the order and exit monitors.
    #[serde(default = "default_max_trades_per_tick")]
    pub max_trades_per_tick: usize,

    /// Minimum seconds between persisted price snapshots per trade.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: i64,

    /// Seconds after which a streamed quote is considered stale.
    #[serde(default = "default_quote_stale_secs")]
    pub quote_stale_secs: i64,

    // --- Infrastructure -----------------------------------------------------

    /// SQLite connection string. Overridable via VEGA_DATABASE_URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Deadline applied to every broker network call.
    #[serde(default = "default_broker_deadline_secs")]
    pub broker_deadline_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`, then apply environment
    /// overrides.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.apply_env();

        info!(
            path = %path.display(),
            tickers = ?config.allowed_tickers,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply environment-variable overrides for secrets and infrastructure.
    pub fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("VEGA_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook_secret = secret;
            }
        }
        if let Ok(url) = std::env::var("VEGA_DATABASE_URL") {
            if !url.is_empty() {
                self.database_url = url;
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Overrides — the only mutable settings
// =============================================================================

/// Operator-controlled toggles that may change while the engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    /// Admit alerts outside the configured session windows.
    #[serde(default)]
    pub ignore_session_windows: bool,

    /// Use market orders instead of limit orders on exits.
    #[serde(default)]
    pub market_exits: bool,
}
