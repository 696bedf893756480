// =============================================================================
// Trade Store — persistent entities and atomic state transitions
// =============================================================================
//
// Owns every persisted entity: Alert, Trade, TradeEvent, PriceSnapshot,
// DailySummary, EnabledStrategy, Favorite. Each lifecycle operation runs in a
// single SQLite transaction, validates the trade's source state first, and
// appends the matching event in the same transaction — a transition from a
// disallowed state is an InvariantViolation, never a silent no-op.
//
// The store never yields mid-operation; callers hold the per-trade lock
// around compound read-modify-write sequences.
// =============================================================================

pub mod models;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::contracts::SelectedContract;
use crate::error::{EngineError, EngineResult};
use crate::signals::StrategyParams;
use crate::types::{
    AlertSource, AlertStatus, Direction, ExitReason, SignalKind, Timeframe, TradeEventType,
    TradeStatus,
};

pub use models::{
    Alert, DailySummary, EnabledStrategy, Favorite, PriceSnapshot, Trade, TradeEvent,
};

/// Dollars of PnL per point of option premium per contract.
const OPTION_MULTIPLIER: f64 = 100.0;

pub struct TradeStore {
    pool: SqlitePool,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl TradeStore {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub async fn connect(url: &str) -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        info!(url, "trade store connected");
        Ok(store)
    }

    /// Single-connection in-memory store for tests.
    pub async fn in_memory() -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                received_at TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                ticker TEXT NOT NULL,
                direction TEXT,
                signal_price REAL,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                linked_trade_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                trade_date TEXT NOT NULL,
                ticker TEXT NOT NULL,
                direction TEXT NOT NULL,
                option_symbol TEXT NOT NULL,
                strike REAL NOT NULL,
                expiry TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                status TEXT NOT NULL,
                entry_order_id TEXT UNIQUE,
                entry_price REAL,
                entry_filled_at TEXT,
                stop_order_id TEXT,
                stop_loss_price REAL,
                stop_active INTEGER NOT NULL DEFAULT 0,
                trailing_stop_price REAL,
                highest_price_seen REAL,
                exit_order_id TEXT,
                exit_price REAL,
                exit_filled_at TEXT,
                exit_reason TEXT,
                pnl_dollars REAL,
                pnl_percent REAL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trade_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT 'null'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS price_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                price REAL NOT NULL,
                highest_price_seen REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS daily_summaries (
                session_date TEXT PRIMARY KEY,
                total_trades INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                total_pnl REAL NOT NULL,
                computed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS enabled_strategies (
                ticker TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                params TEXT NOT NULL,
                enabled_at TEXT NOT NULL,
                PRIMARY KEY (ticker, timeframe, signal_type)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS favorites (
                id TEXT PRIMARY KEY,
                ticker TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                params TEXT NOT NULL,
                label TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    pub async fn create_alert(
        &self,
        raw_payload: &str,
        ticker: &str,
        direction: Option<Direction>,
        signal_price: Option<f64>,
        source: AlertSource,
    ) -> EngineResult<Alert> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            received_at: now(),
            raw_payload: raw_payload.to_string(),
            ticker: ticker.to_string(),
            direction,
            signal_price,
            source,
            status: AlertStatus::Received,
            rejection_reason: None,
            linked_trade_id: None,
        };

        sqlx::query(
            "INSERT INTO alerts
             (id, received_at, raw_payload, ticker, direction, signal_price, source, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&alert.id)
        .bind(alert.received_at)
        .bind(&alert.raw_payload)
        .bind(&alert.ticker)
        .bind(alert.direction.map(|d| d.as_str()))
        .bind(alert.signal_price)
        .bind(alert.source.as_str())
        .bind(alert.status.as_str())
        .execute(&self.pool)
        .await?;

        debug!(alert_id = %alert.id, ticker, "alert persisted as RECEIVED");
        Ok(alert)
    }

    async fn set_alert_terminal(
        &self,
        alert_id: &str,
        status: AlertStatus,
        reason: Option<&str>,
        linked_trade_id: Option<&str>,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: String =
            sqlx::query("SELECT status FROM alerts WHERE id = ?")
                .bind(alert_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    EngineError::InvariantViolation(format!("alert {alert_id} not found"))
                })?
                .try_get("status")?;

        if current != AlertStatus::Received.as_str() {
            return Err(EngineError::InvariantViolation(format!(
                "alert {alert_id} is {current}, cannot move to {status}"
            )));
        }

        sqlx::query(
            "UPDATE alerts SET status = ?, rejection_reason = ?, linked_trade_id = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(linked_trade_id)
        .bind(alert_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// RECEIVED -> REJECTED with the gate's reason code.
    pub async fn reject_alert(&self, alert_id: &str, reason: &str) -> EngineResult<()> {
        self.set_alert_terminal(alert_id, AlertStatus::Rejected, Some(reason), None)
            .await
    }

    /// RECEIVED -> ERROR with a descriptive reason.
    pub async fn mark_alert_error(&self, alert_id: &str, reason: &str) -> EngineResult<()> {
        self.set_alert_terminal(alert_id, AlertStatus::Error, Some(reason), None)
            .await
    }

    /// RECEIVED -> PROCESSED, linked to an existing trade (CLOSE alerts).
    pub async fn link_alert_processed(
        &self,
        alert_id: &str,
        trade_id: &str,
    ) -> EngineResult<()> {
        self.set_alert_terminal(alert_id, AlertStatus::Processed, None, Some(trade_id))
            .await
    }

    pub async fn get_alert(&self, alert_id: &str) -> EngineResult<Alert> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::InvariantViolation(format!("alert {alert_id} not found")))?;
        models::alert_from_row(&row)
    }

    pub async fn recent_alerts(&self, limit: i64) -> EngineResult<Vec<Alert>> {
        let rows = sqlx::query("SELECT * FROM alerts ORDER BY received_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(models::alert_from_row).collect()
    }

    // -------------------------------------------------------------------------
    // Trade lifecycle transitions
    // -------------------------------------------------------------------------

    async fn fetch_trade_for_update(
        tx: &mut sqlx::SqliteConnection,
        trade_id: &str,
    ) -> EngineResult<Trade> {
        let row: Option<SqliteRow> = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(tx)
            .await?;
        match row {
            Some(row) => models::trade_from_row(&row),
            None => Err(EngineError::InvariantViolation(format!(
                "trade {trade_id} not found"
            ))),
        }
    }

    fn require_status(trade: &Trade, allowed: &[TradeStatus], op: &str) -> EngineResult<()> {
        if allowed.contains(&trade.status) {
            Ok(())
        } else {
            Err(EngineError::InvariantViolation(format!(
                "{op} on trade {} in state {} (allowed: {:?})",
                trade.id, trade.status, allowed
            )))
        }
    }

    async fn append_event(
        tx: &mut sqlx::SqliteConnection,
        trade_id: &str,
        event_type: TradeEventType,
        message: &str,
        details: serde_json::Value,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO trade_events (trade_id, timestamp, event_type, message, details)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(trade_id)
        .bind(now())
        .bind(event_type.as_str())
        .bind(message)
        .bind(details.to_string())
        .execute(tx)
        .await?;
        Ok(())
    }

    /// Persist an out-of-band event (ALERT_RECEIVED, CONTRACT_SELECTED,
    /// CLOSE_SIGNAL, MANUAL_CLOSE) without a state transition.
    pub async fn add_event(
        &self,
        trade_id: &str,
        event_type: TradeEventType,
        message: &str,
        details: serde_json::Value,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::append_event(&mut *tx, trade_id, event_type, message, details).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create a PENDING trade from an accepted alert, link the alert, and
    /// record the entry order placement — one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn promote_alert_to_trade(
        &self,
        alert_id: &str,
        ticker: &str,
        direction: Direction,
        contract: &SelectedContract,
        quantity: i64,
        entry_order_id: &str,
        limit_price: f64,
        source: AlertSource,
    ) -> EngineResult<Trade> {
        let ts = now();
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            trade_date: crate::session::session_date(crate::session::market_now()),
            ticker: ticker.to_string(),
            direction,
            option_symbol: contract.option_symbol.clone(),
            strike: contract.strike,
            expiry: contract.expiry,
            quantity,
            status: TradeStatus::Pending,
            entry_order_id: Some(entry_order_id.to_string()),
            entry_price: None,
            entry_filled_at: None,
            stop_order_id: None,
            stop_loss_price: None,
            stop_active: false,
            trailing_stop_price: None,
            highest_price_seen: None,
            exit_order_id: None,
            exit_price: None,
            exit_filled_at: None,
            exit_reason: None,
            pnl_dollars: None,
            pnl_percent: None,
            source,
            created_at: ts,
            updated_at: ts,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO trades
             (id, trade_date, ticker, direction, option_symbol, strike, expiry, quantity,
              status, entry_order_id, stop_active, source, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&trade.id)
        .bind(trade.trade_date)
        .bind(&trade.ticker)
        .bind(trade.direction.as_str())
        .bind(&trade.option_symbol)
        .bind(trade.strike)
        .bind(trade.expiry)
        .bind(trade.quantity)
        .bind(trade.status.as_str())
        .bind(&trade.entry_order_id)
        .bind(trade.source.as_str())
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            &trade.id,
            TradeEventType::AlertReceived,
            &format!("alert {alert_id} ({source} {ticker} {direction})"),
            serde_json::json!({ "alert_id": alert_id }),
        )
        .await?;
        Self::append_event(
            &mut *tx,
            &trade.id,
            TradeEventType::ContractSelected,
            &format!(
                "selected {} strike {:.2} delta {:.2} spread {:.2}%",
                contract.option_symbol, contract.strike, contract.delta, contract.spread_percent
            ),
            serde_json::json!({
                "delta": contract.delta,
                "bid": contract.bid,
                "ask": contract.ask,
                "spread_percent": contract.spread_percent,
            }),
        )
        .await?;
        Self::append_event(
            &mut *tx,
            &trade.id,
            TradeEventType::EntryOrderPlaced,
            &format!(
                "limit entry {} x{} at {:.2}",
                trade.option_symbol, quantity, limit_price
            ),
            serde_json::json!({
                "order_id": entry_order_id,
                "limit_price": limit_price,
            }),
        )
        .await?;

        // Link the alert. The alert must still be RECEIVED.
        let alert_status: String = sqlx::query("SELECT status FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::InvariantViolation(format!("alert {alert_id} not found")))?
            .try_get("status")?;
        if alert_status != AlertStatus::Received.as_str() {
            return Err(EngineError::InvariantViolation(format!(
                "alert {alert_id} is {alert_status}, cannot promote"
            )));
        }
        sqlx::query(
            "UPDATE alerts SET status = ?, linked_trade_id = ? WHERE id = ?",
        )
        .bind(AlertStatus::Processed.as_str())
        .bind(&trade.id)
        .bind(alert_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(trade_id = %trade.id, symbol = %trade.option_symbol, quantity, "trade created (PENDING)");
        Ok(trade)
    }

    /// PENDING -> FILLED.
    pub async fn record_entry_fill(
        &self,
        trade_id: &str,
        price: f64,
        filled_at: NaiveDateTime,
    ) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        Self::require_status(&trade, &[TradeStatus::Pending], "record_entry_fill")?;

        sqlx::query(
            "UPDATE trades SET status = ?, entry_price = ?, entry_filled_at = ?,
             highest_price_seen = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TradeStatus::Filled.as_str())
        .bind(price)
        .bind(filled_at)
        .bind(price)
        .bind(now())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::EntryFilled,
            &format!("entry filled at {price:.2}"),
            serde_json::json!({ "price": price }),
        )
        .await?;

        tx.commit().await?;
        info!(trade_id, price, "entry fill recorded");
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// FILLED -> STOP_LOSS_PLACED. Sets `stop_active`.
    pub async fn record_stop_placement(
        &self,
        trade_id: &str,
        stop_order_id: &str,
        stop_price: f64,
    ) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        Self::require_status(&trade, &[TradeStatus::Filled], "record_stop_placement")?;

        sqlx::query(
            "UPDATE trades SET status = ?, stop_order_id = ?, stop_loss_price = ?,
             stop_active = 1, updated_at = ? WHERE id = ?",
        )
        .bind(TradeStatus::StopLossPlaced.as_str())
        .bind(stop_order_id)
        .bind(stop_price)
        .bind(now())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::StopLossPlaced,
            &format!("stop placed at {stop_price:.2}"),
            serde_json::json!({ "order_id": stop_order_id, "stop_price": stop_price }),
        )
        .await?;

        tx.commit().await?;
        info!(trade_id, stop_price, "stop placement recorded");
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// STOP_LOSS_PLACED | FILLED -> EXITING, with the triggering reason and
    /// the closing order id.
    pub async fn record_exit_trigger(
        &self,
        trade_id: &str,
        reason: ExitReason,
        exit_order_id: &str,
    ) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        Self::require_status(
            &trade,
            &[TradeStatus::StopLossPlaced, TradeStatus::Filled],
            "record_exit_trigger",
        )?;

        sqlx::query(
            "UPDATE trades SET status = ?, exit_reason = ?, exit_order_id = ?,
             stop_active = 0, updated_at = ? WHERE id = ?",
        )
        .bind(TradeStatus::Exiting.as_str())
        .bind(reason.as_str())
        .bind(exit_order_id)
        .bind(now())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::ExitTriggered,
            &format!("exit triggered: {reason}"),
            serde_json::json!({ "reason": reason.as_str() }),
        )
        .await?;
        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::ExitOrderPlaced,
            "market close order placed",
            serde_json::json!({ "order_id": exit_order_id }),
        )
        .await?;

        tx.commit().await?;
        info!(trade_id, reason = %reason, "exit trigger recorded");
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// EXITING -> CLOSED with PnL computed from the recorded entry.
    pub async fn record_exit_fill(
        &self,
        trade_id: &str,
        price: f64,
        filled_at: NaiveDateTime,
    ) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        Self::require_status(&trade, &[TradeStatus::Exiting], "record_exit_fill")?;

        let (pnl_dollars, pnl_percent) = Self::pnl(&trade, price)?;

        sqlx::query(
            "UPDATE trades SET status = ?, exit_price = ?, exit_filled_at = ?,
             pnl_dollars = ?, pnl_percent = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TradeStatus::Closed.as_str())
        .bind(price)
        .bind(filled_at)
        .bind(pnl_dollars)
        .bind(pnl_percent)
        .bind(now())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::ExitFilled,
            &format!("exit filled at {price:.2}, pnl {pnl_dollars:.2}"),
            serde_json::json!({ "price": price, "pnl_dollars": pnl_dollars }),
        )
        .await?;

        tx.commit().await?;
        info!(trade_id, price, pnl_dollars, "exit fill recorded — trade CLOSED");
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// STOP_LOSS_PLACED -> CLOSED when the broker stop itself filled.
    pub async fn record_stop_hit(
        &self,
        trade_id: &str,
        price: f64,
        filled_at: NaiveDateTime,
    ) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        Self::require_status(&trade, &[TradeStatus::StopLossPlaced], "record_stop_hit")?;

        let (pnl_dollars, pnl_percent) = Self::pnl(&trade, price)?;

        sqlx::query(
            "UPDATE trades SET status = ?, exit_price = ?, exit_filled_at = ?,
             exit_reason = ?, stop_active = 0, pnl_dollars = ?, pnl_percent = ?,
             updated_at = ? WHERE id = ?",
        )
        .bind(TradeStatus::Closed.as_str())
        .bind(price)
        .bind(filled_at)
        .bind(ExitReason::StopLossHit.as_str())
        .bind(pnl_dollars)
        .bind(pnl_percent)
        .bind(now())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::StopLossHit,
            &format!("broker stop filled at {price:.2}"),
            serde_json::json!({ "price": price }),
        )
        .await?;
        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::ExitFilled,
            &format!("exit filled at {price:.2}, pnl {pnl_dollars:.2}"),
            serde_json::json!({ "price": price, "pnl_dollars": pnl_dollars }),
        )
        .await?;

        tx.commit().await?;
        info!(trade_id, price, pnl_dollars, "stop hit recorded — trade CLOSED");
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// PENDING -> CANCELLED (limit timeout or broker reject).
    pub async fn cancel_pending(
        &self,
        trade_id: &str,
        reason: ExitReason,
    ) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        Self::require_status(&trade, &[TradeStatus::Pending], "cancel_pending")?;

        sqlx::query(
            "UPDATE trades SET status = ?, exit_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TradeStatus::Cancelled.as_str())
        .bind(reason.as_str())
        .bind(now())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::EntryCancelled,
            &format!("entry cancelled: {reason}"),
            serde_json::json!({ "reason": reason.as_str() }),
        )
        .await?;

        tx.commit().await?;
        info!(trade_id, reason = %reason, "pending trade cancelled");
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// Any non-terminal state -> ERROR (unrecoverable failure).
    pub async fn mark_trade_error(&self, trade_id: &str, detail: &str) -> EngineResult<Trade> {
        let mut tx = self.pool.begin().await?;
        let trade = Self::fetch_trade_for_update(&mut *tx, trade_id).await?;
        if trade.status.is_terminal() {
            return Err(EngineError::InvariantViolation(format!(
                "mark_trade_error on terminal trade {} ({})",
                trade.id, trade.status
            )));
        }

        sqlx::query("UPDATE trades SET status = ?, updated_at = ? WHERE id = ?")
            .bind(TradeStatus::Error.as_str())
            .bind(now())
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;

        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::ExitTriggered,
            &format!("trade marked ERROR: {detail}"),
            serde_json::json!({ "detail": detail }),
        )
        .await?;

        tx.commit().await?;
        Self::fetch_trade(&self.pool, trade_id).await
    }

    /// Record a best-effort broker stop cancellation (no state transition).
    pub async fn record_stop_cancelled(&self, trade_id: &str) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE trades SET stop_active = 0, updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        Self::append_event(
            &mut *tx,
            trade_id,
            TradeEventType::StopLossCancelled,
            "broker stop cancelled",
            serde_json::Value::Null,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Clear the stop-working belief after observing the order non-WORKING.
    pub async fn clear_stop_active(&self, trade_id: &str) -> EngineResult<()> {
        sqlx::query("UPDATE trades SET stop_active = 0, updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the ratcheted extremes. Trailing stop only ever moves up.
    pub async fn update_price_extremes(
        &self,
        trade_id: &str,
        highest_price_seen: f64,
        trailing_stop_price: f64,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE trades SET highest_price_seen = ?, trailing_stop_price = ?,
             updated_at = ? WHERE id = ?",
        )
        .bind(highest_price_seen)
        .bind(trailing_stop_price)
        .bind(now())
        .bind(trade_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Test-only clock control: rewrite a trade's fill time.
    #[cfg(test)]
    pub async fn backdate_entry_fill(
        &self,
        trade_id: &str,
        filled_at: NaiveDateTime,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE trades SET entry_filled_at = ? WHERE id = ?")
            .bind(filled_at)
            .bind(trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn pnl(trade: &Trade, exit_price: f64) -> EngineResult<(f64, f64)> {
        let entry = trade.entry_price.ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "trade {} has no entry price at exit",
                trade.id
            ))
        })?;
        let dollars = (exit_price - entry) * trade.quantity as f64 * OPTION_MULTIPLIER;
        let percent = if entry > 0.0 {
            (exit_price - entry) / entry * 100.0
        } else {
            0.0
        };
        Ok((dollars, percent))
    }

    // -------------------------------------------------------------------------
    // Price snapshots
    // -------------------------------------------------------------------------

    /// Insert a snapshot unless one exists within the last
    /// `min_interval_secs` for this trade. Returns whether a row was written.
    pub async fn maybe_snapshot(
        &self,
        trade_id: &str,
        price: f64,
        highest_price_seen: f64,
        min_interval_secs: i64,
    ) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        let last: Option<NaiveDateTime> = sqlx::query(
            "SELECT timestamp FROM price_snapshots WHERE trade_id = ?
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(trade_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("timestamp"))
        .transpose()?;

        let ts = now();
        if let Some(last) = last {
            if (ts - last).num_seconds() < min_interval_secs {
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO price_snapshots (trade_id, timestamp, price, highest_price_seen)
             VALUES (?, ?, ?, ?)",
        )
        .bind(trade_id)
        .bind(ts)
        .bind(price)
        .bind(highest_price_seen)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn snapshots_for_trade(&self, trade_id: &str) -> EngineResult<Vec<PriceSnapshot>> {
        let rows = sqlx::query(
            "SELECT * FROM price_snapshots WHERE trade_id = ? ORDER BY timestamp ASC",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(models::snapshot_from_row).collect()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    async fn fetch_trade(pool: &SqlitePool, trade_id: &str) -> EngineResult<Trade> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!("trade {trade_id} not found"))
            })?;
        models::trade_from_row(&row)
    }

    pub async fn get_trade(&self, trade_id: &str) -> EngineResult<Trade> {
        Self::fetch_trade(&self.pool, trade_id).await
    }

    pub async fn trades_with_status(&self, statuses: &[TradeStatus]) -> EngineResult<Vec<Trade>> {
        // Status lists are short; build the IN clause inline.
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM trades WHERE status IN ({placeholders}) ORDER BY id ASC"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(models::trade_from_row).collect()
    }

    /// Every trade not in a terminal state, ascending id for stable lock
    /// ordering.
    pub async fn non_terminal_trades(&self) -> EngineResult<Vec<Trade>> {
        self.trades_with_status(&[
            TradeStatus::Pending,
            TradeStatus::Filled,
            TradeStatus::StopLossPlaced,
            TradeStatus::Exiting,
        ])
        .await
    }

    /// Most recent live position, for CLOSE alerts.
    pub async fn most_recent_open_trade(&self) -> EngineResult<Option<Trade>> {
        let row = sqlx::query(
            "SELECT * FROM trades WHERE status IN (?, ?)
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(TradeStatus::Filled.as_str())
        .bind(TradeStatus::StopLossPlaced.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(models::trade_from_row).transpose()
    }

    pub async fn trades_for_date(&self, date: NaiveDate) -> EngineResult<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE trade_date = ? ORDER BY created_at ASC",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(models::trade_from_row).collect()
    }

    /// Count of non-CANCELLED trades for the session (risk predicate 6).
    pub async fn count_trades_for_date(&self, date: NaiveDate) -> EngineResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM trades WHERE trade_date = ? AND status != ?",
        )
        .bind(date)
        .bind(TradeStatus::Cancelled.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Trailing run of losing CLOSED trades for the session (risk
    /// predicate 7).
    pub async fn consecutive_losses(&self, date: NaiveDate) -> EngineResult<i64> {
        let rows = sqlx::query(
            "SELECT pnl_dollars FROM trades
             WHERE trade_date = ? AND status = ? ORDER BY exit_filled_at DESC",
        )
        .bind(date)
        .bind(TradeStatus::Closed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut run = 0i64;
        for row in rows {
            let pnl: Option<f64> = row.try_get("pnl_dollars")?;
            if pnl.unwrap_or(0.0) < 0.0 {
                run += 1;
            } else {
                break;
            }
        }
        Ok(run)
    }

    /// Sum of CLOSED PnL for the session (risk predicate 8).
    pub async fn daily_pnl(&self, date: NaiveDate) -> EngineResult<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(pnl_dollars), 0.0) AS total FROM trades
             WHERE trade_date = ? AND status = ?",
        )
        .bind(date)
        .bind(TradeStatus::Closed.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn events_for_trade(&self, trade_id: &str) -> EngineResult<Vec<TradeEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_events WHERE trade_id = ? ORDER BY id ASC",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(models::event_from_row).collect()
    }

    // -------------------------------------------------------------------------
    // Daily summary
    // -------------------------------------------------------------------------

    /// Compute and upsert the summary row for `date` from CLOSED trades.
    pub async fn upsert_daily_summary(&self, date: NaiveDate) -> EngineResult<DailySummary> {
        let trades = self.trades_for_date(date).await?;
        let closed: Vec<&Trade> = trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .collect();

        let total_trades = trades
            .iter()
            .filter(|t| t.status != TradeStatus::Cancelled)
            .count() as i64;
        let wins = closed
            .iter()
            .filter(|t| t.pnl_dollars.unwrap_or(0.0) > 0.0)
            .count() as i64;
        let losses = closed
            .iter()
            .filter(|t| t.pnl_dollars.unwrap_or(0.0) < 0.0)
            .count() as i64;
        let total_pnl: f64 = closed.iter().filter_map(|t| t.pnl_dollars).sum();

        let computed_at = now();
        sqlx::query(
            "INSERT INTO daily_summaries
             (session_date, total_trades, wins, losses, total_pnl, computed_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_date) DO UPDATE SET
               total_trades = excluded.total_trades,
               wins = excluded.wins,
               losses = excluded.losses,
               total_pnl = excluded.total_pnl,
               computed_at = excluded.computed_at",
        )
        .bind(date)
        .bind(total_trades)
        .bind(wins)
        .bind(losses)
        .bind(total_pnl)
        .bind(computed_at)
        .execute(&self.pool)
        .await?;

        info!(date = %date, total_trades, total_pnl, "daily summary upserted");
        Ok(DailySummary {
            session_date: date,
            total_trades,
            wins,
            losses,
            total_pnl,
            computed_at,
        })
    }

    pub async fn get_daily_summary(&self, date: NaiveDate) -> EngineResult<Option<DailySummary>> {
        let row = sqlx::query("SELECT * FROM daily_summaries WHERE session_date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(models::summary_from_row).transpose()
    }

    // -------------------------------------------------------------------------
    // Enabled strategies (admin control surface)
    // -------------------------------------------------------------------------

    pub async fn enabled_strategies(&self) -> EngineResult<Vec<EnabledStrategy>> {
        let rows = sqlx::query(
            "SELECT * FROM enabled_strategies ORDER BY ticker, timeframe, signal_type",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(models::strategy_from_row).collect()
    }

    pub async fn enable_strategy(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        signal_type: SignalKind,
        params: &StrategyParams,
    ) -> EngineResult<EnabledStrategy> {
        let enabled_at = now();
        let params_json = serde_json::to_string(params)
            .map_err(|e| EngineError::Validation(format!("unserialisable params: {e}")))?;

        sqlx::query(
            "INSERT INTO enabled_strategies (ticker, timeframe, signal_type, params, enabled_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(ticker, timeframe, signal_type) DO UPDATE SET
               params = excluded.params, enabled_at = excluded.enabled_at",
        )
        .bind(ticker)
        .bind(timeframe.as_str())
        .bind(signal_type.as_str())
        .bind(&params_json)
        .bind(enabled_at)
        .execute(&self.pool)
        .await?;

        Ok(EnabledStrategy {
            ticker: ticker.to_string(),
            timeframe,
            signal_type,
            params: params.clone(),
            enabled_at,
        })
    }

    pub async fn disable_strategy(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        signal_type: SignalKind,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "DELETE FROM enabled_strategies
             WHERE ticker = ? AND timeframe = ? AND signal_type = ?",
        )
        .bind(ticker)
        .bind(timeframe.as_str())
        .bind(signal_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Favorites (admin control surface)
    // -------------------------------------------------------------------------

    pub async fn favorites(&self) -> EngineResult<Vec<Favorite>> {
        let rows = sqlx::query("SELECT * FROM favorites ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(models::favorite_from_row).collect()
    }

    pub async fn create_favorite(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        signal_type: SignalKind,
        params: &StrategyParams,
        label: &str,
    ) -> EngineResult<Favorite> {
        let favorite = Favorite {
            id: Uuid::new_v4().to_string(),
            ticker: ticker.to_string(),
            timeframe,
            signal_type,
            params: params.clone(),
            label: label.to_string(),
            created_at: now(),
        };
        let params_json = serde_json::to_string(params)
            .map_err(|e| EngineError::Validation(format!("unserialisable params: {e}")))?;

        sqlx::query(
            "INSERT INTO favorites (id, ticker, timeframe, signal_type, params, label, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&favorite.id)
        .bind(&favorite.ticker)
        .bind(favorite.timeframe.as_str())
        .bind(favorite.signal_type.as_str())
        .bind(&params_json)
        .bind(&favorite.label)
        .bind(favorite.created_at)
        .execute(&self.pool)
        .await?;

        Ok(favorite)
    }

    pub async fn delete_favorite(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM favorites WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl std::fmt::Debug for TradeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeStore").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> SelectedContract {
        SelectedContract {
            option_symbol: "SPY250616C00694000".to_string(),
            strike: 694.0,
            expiry: chrono::Utc::now().date_naive(),
            delta: 0.48,
            bid: 0.41,
            ask: 0.42,
            spread_percent: 2.41,
        }
    }

    async fn store_with_pending() -> (TradeStore, Trade) {
        let store = TradeStore::in_memory().await.unwrap();
        let alert = store
            .create_alert("{}", "SPY", Some(Direction::Call), Some(694.5), AlertSource::External)
            .await
            .unwrap();
        let trade = store
            .promote_alert_to_trade(
                &alert.id,
                "SPY",
                Direction::Call,
                &contract(),
                1,
                "order-1",
                0.42,
                AlertSource::External,
            )
            .await
            .unwrap();
        (store, trade)
    }

    #[tokio::test]
    async fn alert_lifecycle() {
        let store = TradeStore::in_memory().await.unwrap();
        let alert = store
            .create_alert("{}", "SPY", Some(Direction::Call), None, AlertSource::External)
            .await
            .unwrap();
        assert_eq!(alert.status, AlertStatus::Received);

        store.reject_alert(&alert.id, "vix_circuit_breaker").await.unwrap();
        let stored = store.get_alert(&alert.id).await.unwrap();
        assert_eq!(stored.status, AlertStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("vix_circuit_breaker"));

        // Terminal alerts are append-only: a second transition is an error.
        let err = store.reject_alert(&alert.id, "again").await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn promote_links_alert_and_writes_event() {
        let (store, trade) = store_with_pending().await;
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.entry_order_id.as_deref(), Some("order-1"));

        let events = store.events_for_trade(&trade.id).await.unwrap();
        let types: Vec<TradeEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                TradeEventType::AlertReceived,
                TradeEventType::ContractSelected,
                TradeEventType::EntryOrderPlaced,
            ]
        );

        let alerts = store.recent_alerts(10).await.unwrap();
        assert_eq!(alerts[0].status, AlertStatus::Processed);
        assert_eq!(alerts[0].linked_trade_id.as_deref(), Some(trade.id.as_str()));
    }

    #[tokio::test]
    async fn full_happy_path_transitions() {
        let (store, trade) = store_with_pending().await;

        let trade = store
            .record_entry_fill(&trade.id, 0.42, now())
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert_eq!(trade.highest_price_seen, Some(0.42));

        let trade = store
            .record_stop_placement(&trade.id, "stop-1", 0.22)
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::StopLossPlaced);
        assert!(trade.stop_active);
        assert_eq!(trade.stop_loss_price, Some(0.22));

        let trade = store
            .record_exit_trigger(&trade.id, ExitReason::TrailingStop, "exit-1")
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Exiting);
        assert!(!trade.stop_active);

        let trade = store.record_exit_fill(&trade.id, 0.51, now()).await.unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert!((trade.pnl_dollars.unwrap() - 9.0).abs() < 0.01);
        assert!((trade.pnl_percent.unwrap() - (0.09 / 0.42 * 100.0)).abs() < 0.01);

        // Event walk through the state machine, in insertion order.
        let events = store.events_for_trade(&trade.id).await.unwrap();
        let types: Vec<TradeEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                TradeEventType::AlertReceived,
                TradeEventType::ContractSelected,
                TradeEventType::EntryOrderPlaced,
                TradeEventType::EntryFilled,
                TradeEventType::StopLossPlaced,
                TradeEventType::ExitTriggered,
                TradeEventType::ExitOrderPlaced,
                TradeEventType::ExitFilled,
            ]
        );
    }

    #[tokio::test]
    async fn stop_hit_short_circuits_to_closed() {
        let (store, trade) = store_with_pending().await;
        store.record_entry_fill(&trade.id, 0.42, now()).await.unwrap();
        store.record_stop_placement(&trade.id, "stop-1", 0.22).await.unwrap();

        let trade = store.record_stop_hit(&trade.id, 0.22, now()).await.unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_reason, Some(ExitReason::StopLossHit));
        assert!((trade.pnl_dollars.unwrap() + 20.0).abs() < 0.01);

        let events = store.events_for_trade(&trade.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == TradeEventType::StopLossHit));
    }

    #[tokio::test]
    async fn cancel_pending_with_reason() {
        let (store, trade) = store_with_pending().await;
        let trade = store
            .cancel_pending(&trade.id, ExitReason::LimitTimeout)
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Cancelled);
        assert_eq!(trade.exit_reason, Some(ExitReason::LimitTimeout));
    }

    #[tokio::test]
    async fn illegal_transition_is_invariant_violation() {
        let (store, trade) = store_with_pending().await;

        // Cannot place a stop before the entry fill.
        let err = store
            .record_stop_placement(&trade.id, "stop-1", 0.22)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));

        // Cannot exit-fill a PENDING trade.
        let err = store.record_exit_fill(&trade.id, 0.5, now()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));

        // The trade is untouched by the failed attempts.
        let stored = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(stored.status, TradeStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_entry_order_id_rejected() {
        let (store, _trade) = store_with_pending().await;
        let alert = store
            .create_alert("{}", "SPY", Some(Direction::Call), None, AlertSource::External)
            .await
            .unwrap();
        // Same entry_order_id as the first trade: the unique index refuses.
        let result = store
            .promote_alert_to_trade(
                &alert.id,
                "SPY",
                Direction::Call,
                &contract(),
                1,
                "order-1",
                0.42,
                AlertSource::External,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn snapshot_rate_limiting() {
        let (store, trade) = store_with_pending().await;

        assert!(store.maybe_snapshot(&trade.id, 0.45, 0.45, 15).await.unwrap());
        // Immediately again: suppressed by the rate limit.
        assert!(!store.maybe_snapshot(&trade.id, 0.46, 0.46, 15).await.unwrap());
        // Zero interval: always writes.
        assert!(store.maybe_snapshot(&trade.id, 0.47, 0.47, 0).await.unwrap());

        let snaps = store.snapshots_for_trade(&trade.id).await.unwrap();
        assert_eq!(snaps.len(), 2);
    }

    #[tokio::test]
    async fn daily_counters() {
        let (store, trade) = store_with_pending().await;
        let date = trade.trade_date;

        assert_eq!(store.count_trades_for_date(date).await.unwrap(), 1);

        store.record_entry_fill(&trade.id, 0.42, now()).await.unwrap();
        store.record_stop_placement(&trade.id, "s", 0.22).await.unwrap();
        store.record_stop_hit(&trade.id, 0.22, now()).await.unwrap();

        assert_eq!(store.consecutive_losses(date).await.unwrap(), 1);
        assert!((store.daily_pnl(date).await.unwrap() + 20.0).abs() < 0.01);

        // Cancelled trades do not count toward the daily cap.
        let alert = store
            .create_alert("{}", "SPY", Some(Direction::Call), None, AlertSource::External)
            .await
            .unwrap();
        let mut c = contract();
        c.option_symbol = "SPY250616C00695000".into();
        let t2 = store
            .promote_alert_to_trade(
                &alert.id, "SPY", Direction::Call, &c, 1, "order-2", 0.30,
                AlertSource::External,
            )
            .await
            .unwrap();
        store.cancel_pending(&t2.id, ExitReason::LimitTimeout).await.unwrap();
        assert_eq!(store.count_trades_for_date(date).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn daily_summary_matches_closed_pnl() {
        let (store, trade) = store_with_pending().await;
        let date = trade.trade_date;
        store.record_entry_fill(&trade.id, 0.42, now()).await.unwrap();
        store.record_stop_placement(&trade.id, "s", 0.22).await.unwrap();
        store.record_stop_hit(&trade.id, 0.22, now()).await.unwrap();

        let summary = store.upsert_daily_summary(date).await.unwrap();
        assert_eq!(summary.total_trades, 1);
        assert_eq!(summary.losses, 1);
        assert_eq!(summary.wins, 0);
        assert!((summary.total_pnl - store.daily_pnl(date).await.unwrap()).abs() < 1e-9);

        // Upsert is idempotent.
        let again = store.upsert_daily_summary(date).await.unwrap();
        assert_eq!(again.total_trades, 1);
        assert!(store.get_daily_summary(date).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enabled_strategy_roundtrip() {
        let store = TradeStore::in_memory().await.unwrap();
        let params = StrategyParams::default();

        store
            .enable_strategy("SPY", Timeframe::M5, SignalKind::EmaCross, &params)
            .await
            .unwrap();
        store
            .enable_strategy("QQQ", Timeframe::M1, SignalKind::Confluence, &params)
            .await
            .unwrap();

        let list = store.enabled_strategies().await.unwrap();
        assert_eq!(list.len(), 2);

        // Enable again with new params: upsert, not duplicate.
        let tweaked = StrategyParams {
            ema_fast: 5,
            ..StrategyParams::default()
        };
        store
            .enable_strategy("SPY", Timeframe::M5, SignalKind::EmaCross, &tweaked)
            .await
            .unwrap();
        let list = store.enabled_strategies().await.unwrap();
        assert_eq!(list.len(), 2);
        let spy = list.iter().find(|s| s.ticker == "SPY").unwrap();
        assert_eq!(spy.params.ema_fast, 5);

        assert!(store
            .disable_strategy("SPY", Timeframe::M5, SignalKind::EmaCross)
            .await
            .unwrap());
        assert!(!store
            .disable_strategy("SPY", Timeframe::M5, SignalKind::EmaCross)
            .await
            .unwrap());
        assert_eq!(store.enabled_strategies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn favorites_crud() {
        let store = TradeStore::in_memory().await.unwrap();
        let favorite = store
            .create_favorite(
                "SPY",
                Timeframe::M5,
                SignalKind::Orb,
                &StrategyParams::default(),
                "morning breakout",
            )
            .await
            .unwrap();

        let list = store.favorites().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].label, "morning breakout");

        assert!(store.delete_favorite(&favorite.id).await.unwrap());
        assert!(store.favorites().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn most_recent_open_trade_prefers_latest() {
        let (store, trade) = store_with_pending().await;
        assert!(store.most_recent_open_trade().await.unwrap().is_none());

        store.record_entry_fill(&trade.id, 0.42, now()).await.unwrap();
        let open = store.most_recent_open_trade().await.unwrap().unwrap();
        assert_eq!(open.id, trade.id);
    }

    #[tokio::test]
    async fn price_extremes_update() {
        let (store, trade) = store_with_pending().await;
        store.record_entry_fill(&trade.id, 0.42, now()).await.unwrap();
        store.record_stop_placement(&trade.id, "s", 0.22).await.unwrap();

        store.update_price_extremes(&trade.id, 0.60, 0.51).await.unwrap();
        let stored = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(stored.highest_price_seen, Some(0.60));
        assert_eq!(stored.trailing_stop_price, Some(0.51));
    }

    #[tokio::test]
    async fn clear_stop_active_flag() {
        let (store, trade) = store_with_pending().await;
        store.record_entry_fill(&trade.id, 0.42, now()).await.unwrap();
        store.record_stop_placement(&trade.id, "s", 0.22).await.unwrap();

        store.clear_stop_active(&trade.id).await.unwrap();
        let stored = store.get_trade(&trade.id).await.unwrap();
        assert!(!stored.stop_active);
        // The state itself is unchanged.
        assert_eq!(stored.status, TradeStatus::StopLossPlaced);
    }
}
