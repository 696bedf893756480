// =============================================================================
// Persisted entities and row mapping
// =============================================================================

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{EngineError, EngineResult};
use crate::signals::StrategyParams;
use crate::types::{
    AlertSource, AlertStatus, Direction, ExitReason, SignalKind, Timeframe, TradeEventType,
    TradeStatus,
};

/// A persisted inbound alert. Append-only once a terminal status is set; only
/// status, rejection_reason and linked_trade_id ever mutate.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub received_at: NaiveDateTime,
    pub raw_payload: String,
    pub ticker: String,
    pub direction: Option<Direction>,
    pub signal_price: Option<f64>,
    pub source: AlertSource,
    pub status: AlertStatus,
    pub rejection_reason: Option<String>,
    pub linked_trade_id: Option<String>,
}

/// A persisted trade moving through the §3 state machine.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: String,
    pub trade_date: NaiveDate,
    pub ticker: String,
    pub direction: Direction,
    pub option_symbol: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub quantity: i64,
    pub status: TradeStatus,
    pub entry_order_id: Option<String>,
    pub entry_price: Option<f64>,
    pub entry_filled_at: Option<NaiveDateTime>,
    pub stop_order_id: Option<String>,
    pub stop_loss_price: Option<f64>,
    /// Whether the broker stop is still believed to be working. Tracked
    /// explicitly: set on placement, cleared when observed non-WORKING or
    /// after a cancel.
    pub stop_active: bool,
    pub trailing_stop_price: Option<f64>,
    pub highest_price_seen: Option<f64>,
    pub exit_order_id: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_filled_at: Option<NaiveDateTime>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_dollars: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub source: AlertSource,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Strictly append-only lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub id: i64,
    pub trade_id: String,
    pub timestamp: NaiveDateTime,
    pub event_type: TradeEventType,
    pub message: String,
    pub details: serde_json::Value,
}

/// Rate-limited price observation for post-trade chart reconstruction.
#[derive(Debug, Clone, Serialize)]
pub struct PriceSnapshot {
    pub trade_id: String,
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub highest_price_seen: f64,
}

/// One row per session date, upserted by the end-of-session task.
#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub session_date: NaiveDate,
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub total_pnl: f64,
    pub computed_at: NaiveDateTime,
}

/// An admin-enabled strategy tuple.
#[derive(Debug, Clone, Serialize)]
pub struct EnabledStrategy {
    pub ticker: String,
    pub timeframe: Timeframe,
    pub signal_type: SignalKind,
    pub params: StrategyParams,
    pub enabled_at: NaiveDateTime,
}

/// A saved parameter set from the optimizer, read/write with no business
/// logic.
#[derive(Debug, Clone, Serialize)]
pub struct Favorite {
    pub id: String,
    pub ticker: String,
    pub timeframe: Timeframe,
    pub signal_type: SignalKind,
    pub params: StrategyParams,
    pub label: String,
    pub created_at: NaiveDateTime,
}

// =============================================================================
// Row mapping
// =============================================================================

fn bad_enum(column: &str, value: &str) -> EngineError {
    EngineError::InvariantViolation(format!("unrecognised {column} value '{value}' in store"))
}

pub(crate) fn alert_from_row(row: &SqliteRow) -> EngineResult<Alert> {
    let status_raw: String = row.try_get("status")?;
    let source_raw: String = row.try_get("source")?;
    let direction_raw: Option<String> = row.try_get("direction")?;

    Ok(Alert {
        id: row.try_get("id")?,
        received_at: row.try_get("received_at")?,
        raw_payload: row.try_get("raw_payload")?,
        ticker: row.try_get("ticker")?,
        direction: match direction_raw {
            Some(raw) => Some(Direction::parse(&raw).ok_or_else(|| bad_enum("direction", &raw))?),
            None => None,
        },
        signal_price: row.try_get("signal_price")?,
        source: AlertSource::parse(&source_raw).ok_or_else(|| bad_enum("source", &source_raw))?,
        status: AlertStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        rejection_reason: row.try_get("rejection_reason")?,
        linked_trade_id: row.try_get("linked_trade_id")?,
    })
}

pub(crate) fn trade_from_row(row: &SqliteRow) -> EngineResult<Trade> {
    let status_raw: String = row.try_get("status")?;
    let direction_raw: String = row.try_get("direction")?;
    let source_raw: String = row.try_get("source")?;
    let exit_reason_raw: Option<String> = row.try_get("exit_reason")?;

    Ok(Trade {
        id: row.try_get("id")?,
        trade_date: row.try_get("trade_date")?,
        ticker: row.try_get("ticker")?,
        direction: Direction::parse(&direction_raw)
            .ok_or_else(|| bad_enum("direction", &direction_raw))?,
        option_symbol: row.try_get("option_symbol")?,
        strike: row.try_get("strike")?,
        expiry: row.try_get("expiry")?,
        quantity: row.try_get("quantity")?,
        status: TradeStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        entry_order_id: row.try_get("entry_order_id")?,
        entry_price: row.try_get("entry_price")?,
        entry_filled_at: row.try_get("entry_filled_at")?,
        stop_order_id: row.try_get("stop_order_id")?,
        stop_loss_price: row.try_get("stop_loss_price")?,
        stop_active: row.try_get::<i64, _>("stop_active")? != 0,
        trailing_stop_price: row.try_get("trailing_stop_price")?,
        highest_price_seen: row.try_get("highest_price_seen")?,
        exit_order_id: row.try_get("exit_order_id")?,
        exit_price: row.try_get("exit_price")?,
        exit_filled_at: row.try_get("exit_filled_at")?,
        exit_reason: match exit_reason_raw {
            Some(raw) => {
                Some(ExitReason::parse(&raw).ok_or_else(|| bad_enum("exit_reason", &raw))?)
            }
            None => None,
        },
        pnl_dollars: row.try_get("pnl_dollars")?,
        pnl_percent: row.try_get("pnl_percent")?,
        source: AlertSource::parse(&source_raw).ok_or_else(|| bad_enum("source", &source_raw))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn event_from_row(row: &SqliteRow) -> EngineResult<TradeEvent> {
    let type_raw: String = row.try_get("event_type")?;
    let details_raw: String = row.try_get("details")?;

    let event_type = match type_raw.as_str() {
        "ALERT_RECEIVED" => TradeEventType::AlertReceived,
        "CONTRACT_SELECTED" => TradeEventType::ContractSelected,
        "ENTRY_ORDER_PLACED" => TradeEventType::EntryOrderPlaced,
        "ENTRY_FILLED" => TradeEventType::EntryFilled,
        "ENTRY_CANCELLED" => TradeEventType::EntryCancelled,
        "STOP_LOSS_PLACED" => TradeEventType::StopLossPlaced,
        "STOP_LOSS_CANCELLED" => TradeEventType::StopLossCancelled,
        "EXIT_TRIGGERED" => TradeEventType::ExitTriggered,
        "EXIT_ORDER_PLACED" => TradeEventType::ExitOrderPlaced,
        "EXIT_FILLED" => TradeEventType::ExitFilled,
        "STOP_LOSS_HIT" => TradeEventType::StopLossHit,
        "CLOSE_SIGNAL" => TradeEventType::CloseSignal,
        "MANUAL_CLOSE" => TradeEventType::ManualClose,
        other => return Err(bad_enum("event_type", other)),
    };

    Ok(TradeEvent {
        id: row.try_get("id")?,
        trade_id: row.try_get("trade_id")?,
        timestamp: row.try_get("timestamp")?,
        event_type,
        message: row.try_get("message")?,
        details: serde_json::from_str(&details_raw).unwrap_or(serde_json::Value::Null),
    })
}

pub(crate) fn snapshot_from_row(row: &SqliteRow) -> EngineResult<PriceSnapshot> {
    Ok(PriceSnapshot {
        trade_id: row.try_get("trade_id")?,
        timestamp: row.try_get("timestamp")?,
        price: row.try_get("price")?,
        highest_price_seen: row.try_get("highest_price_seen")?,
    })
}

pub(crate) fn summary_from_row(row: &SqliteRow) -> EngineResult<DailySummary> {
    Ok(DailySummary {
        session_date: row.try_get("session_date")?,
        total_trades: row.try_get("total_trades")?,
        wins: row.try_get("wins")?,
        losses: row.try_get("losses")?,
        total_pnl: row.try_get("total_pnl")?,
        computed_at: row.try_get("computed_at")?,
    })
}

pub(crate) fn strategy_from_row(row: &SqliteRow) -> EngineResult<EnabledStrategy> {
    let timeframe_raw: String = row.try_get("timeframe")?;
    let kind_raw: String = row.try_get("signal_type")?;
    let params_raw: String = row.try_get("params")?;

    Ok(EnabledStrategy {
        ticker: row.try_get("ticker")?,
        timeframe: Timeframe::parse(&timeframe_raw)
            .ok_or_else(|| bad_enum("timeframe", &timeframe_raw))?,
        signal_type: SignalKind::parse(&kind_raw)
            .ok_or_else(|| bad_enum("signal_type", &kind_raw))?,
        params: serde_json::from_str(&params_raw).unwrap_or_default(),
        enabled_at: row.try_get("enabled_at")?,
    })
}

pub(crate) fn favorite_from_row(row: &SqliteRow) -> EngineResult<Favorite> {
    let timeframe_raw: String = row.try_get("timeframe")?;
    let kind_raw: String = row.try_get("signal_type")?;
    let params_raw: String = row.try_get("params")?;

    Ok(Favorite {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        timeframe: Timeframe::parse(&timeframe_raw)
            .ok_or_else(|| bad_enum("timeframe", &timeframe_raw))?,
        signal_type: SignalKind::parse(&kind_raw)
            .ok_or_else(|| bad_enum("signal_type", &kind_raw))?,
        params: serde_json::from_str(&params_raw).unwrap_or_default(),
        label: row.try_get("label")?,
        created_at: row.try_get("created_at")?,
    })
}
