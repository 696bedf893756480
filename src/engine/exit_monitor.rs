// =============================================================================
// Exit Engine — prioritized exit evaluation for protected positions
// =============================================================================
//
// Runs every 10 seconds over trades in STOP_LOSS_PLACED. Each tick:
//   1. Read the option price from the quote cache (chain mid fallback).
//   2. Ratchet highest_price_seen and the trailing stop (never down).
//   3. Evaluate the five exit conditions in strict priority order:
//        TIME_BASED > MAX_HOLD_TIME > STOP_LOSS > PROFIT_TARGET >
//        TRAILING_STOP
//      The STOP_LOSS condition only applies when no broker stop is believed
//      working (`stop_active` is false) — otherwise the resting stop owns it.
//   4. On trigger: cancel the broker stop (best effort), place a market
//      SELL_TO_CLOSE, and record the exit trigger.
//
// Price snapshots are persisted at most once per snapshot interval per trade
// for post-trade chart reconstruction.
// =============================================================================

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::engine::{with_broker_backoff, Engine};
use crate::error::{EngineError, EngineResult};
use crate::market_data::CacheRead;
use crate::session;
use crate::store::Trade;
use crate::types::{ExitReason, TradeStatus};

/// One exit-engine pass at market-local `now`.
pub async fn tick(engine: &Engine, now: DateTime<Tz>, rotation: &mut usize) -> EngineResult<()> {
    let trades = engine
        .store
        .trades_with_status(&[TradeStatus::StopLossPlaced])
        .await?;
    if trades.is_empty() {
        return Ok(());
    }

    let cap = engine.config.max_trades_per_tick;
    let len = trades.len();
    let take = cap.min(len);
    let start = *rotation % len;
    *rotation = (start + take) % len;

    for i in 0..take {
        let trade = &trades[(start + i) % len];

        match evaluate_trade(engine, trade, now).await {
            Ok(()) => {}
            Err(e @ EngineError::InvariantViolation(_)) => return Err(e),
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "exit engine: trade left for next tick");
            }
        }
    }

    Ok(())
}

async fn evaluate_trade(engine: &Engine, trade: &Trade, now: DateTime<Tz>) -> EngineResult<()> {
    // Price discovery may hit the broker — do it without the lock.
    let Some(price) = current_option_price(engine, trade).await else {
        debug!(trade_id = %trade.id, "no usable option price — skipping evaluation");
        return Ok(());
    };

    // Ratchet, snapshot, and decide under the lock (store ops only).
    let lock = engine.locks.lock_for(&trade.id);
    let reason = {
        let _guard = lock.lock().await;
        let trade = engine.store.get_trade(&trade.id).await?;
        if trade.status != TradeStatus::StopLossPlaced {
            return Ok(());
        }

        let entry_price = trade.entry_price.ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "protected trade {} has no entry price",
                trade.id
            ))
        })?;

        // ── Ratchet the extremes ─────────────────────────────────────
        let prior_high = trade.highest_price_seen.unwrap_or(entry_price);
        let mut highest = prior_high;
        let mut trailing = trade.trailing_stop_price;

        if price > prior_high {
            highest = price;
            let new_trailing = highest * (1.0 - engine.config.trailing_stop_percent / 100.0);
            trailing = Some(new_trailing);
            engine
                .store
                .update_price_extremes(&trade.id, highest, new_trailing)
                .await?;
            debug!(trade_id = %trade.id, highest, trailing = new_trailing, "trailing stop ratcheted");
        }

        engine
            .store
            .maybe_snapshot(&trade.id, price, highest, engine.config.snapshot_interval_secs)
            .await?;

        // ── Prioritized exit conditions ──────────────────────────────
        exit_reason(engine, &trade, price, entry_price, trailing, now)
    };

    let Some(reason) = reason else {
        return Ok(());
    };

    info!(
        trade_id = %trade.id,
        price,
        reason = %reason,
        "exit condition triggered"
    );
    trigger_exit(engine, trade, reason).await
}

/// The five conditions in strict priority order; first hit wins.
fn exit_reason(
    engine: &Engine,
    trade: &Trade,
    price: f64,
    entry_price: f64,
    trailing: Option<f64>,
    now: DateTime<Tz>,
) -> Option<ExitReason> {
    // 1. Hard end-of-session flat.
    if session::at_or_past(now, &engine.config.force_exit_time) {
        return Some(ExitReason::TimeBased);
    }

    // 2. Maximum hold time.
    if let Some(filled_at) = trade.entry_filled_at {
        let held_minutes = (now.with_timezone(&Utc).naive_utc() - filled_at).num_minutes();
        if held_minutes >= engine.config.max_hold_minutes {
            return Some(ExitReason::MaxHoldTime);
        }
    }

    // 3. App-managed stop, only when the broker stop is no longer working.
    if !trade.stop_active {
        if let Some(stop_price) = trade.stop_loss_price {
            if price <= stop_price {
                return Some(ExitReason::StopLoss);
            }
        }
    }

    // 4. Profit target.
    if price >= entry_price * (1.0 + engine.config.profit_target_percent / 100.0) {
        return Some(ExitReason::ProfitTarget);
    }

    // 5. Trailing stop.
    if let Some(trailing) = trailing {
        if price <= trailing {
            return Some(ExitReason::TrailingStop);
        }
    }

    None
}

/// Cancel the resting stop, place the market close, record the trigger.
/// Broker work happens outside the lock; the trigger is recorded only after
/// re-validating the trade is still protected.
async fn trigger_exit(engine: &Engine, trade: &Trade, reason: ExitReason) -> EngineResult<()> {
    if trade.stop_active {
        if let Some(stop_order_id) = trade.stop_order_id.as_deref() {
            match engine.broker.cancel(stop_order_id).await {
                Ok(()) => engine.store.record_stop_cancelled(&trade.id).await?,
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "stop cancel failed — proceeding with exit");
                }
            }
        }
    }

    let exit_order_id = with_broker_backoff(|| {
        engine
            .broker
            .place_market_exit(&trade.option_symbol, trade.quantity)
    })
    .await?;

    let lock = engine.locks.lock_for(&trade.id);
    let recorded = {
        let _guard = lock.lock().await;
        let current = engine.store.get_trade(&trade.id).await?;
        if current.status == TradeStatus::StopLossPlaced {
            engine
                .store
                .record_exit_trigger(&current.id, reason, &exit_order_id)
                .await?;
            true
        } else {
            false
        }
    };
    if !recorded {
        // Another task closed the trade while our exit was in flight.
        warn!(trade_id = %trade.id, "orphaned exit order — cancelling");
        let _ = engine.broker.cancel(&exit_order_id).await;
    }
    Ok(())
}

/// Streamed quote first; on stale or miss, fall back to the chain mid-quote.
async fn current_option_price(engine: &Engine, trade: &Trade) -> Option<f64> {
    match engine.quotes.get(&trade.option_symbol) {
        CacheRead::Fresh(quote) => {
            let price = if quote.last > 0.0 { quote.last } else { quote.mid() };
            (price > 0.0).then_some(price)
        }
        CacheRead::Stale(_) | CacheRead::Miss => {
            let chain = engine
                .broker
                .option_chain(
                    &trade.ticker,
                    trade.direction,
                    engine.config.strike_count,
                    true,
                )
                .await
                .ok()?;
            chain
                .iter()
                .find(|entry| entry.symbol == trade.option_symbol)
                .map(|entry| (entry.bid + entry.ask) / 2.0)
                .filter(|mid| *mid > 0.0)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::broker::SimBroker;
    use crate::engine::admission::{admit, AdmissionOutcome};
    use crate::engine::testutil::{buy_request, engine_with_config, permissive_config};
    use crate::engine::{order_monitor, Engine};
    use crate::session::MARKET_TZ;
    use crate::store::Trade;
    use std::sync::Arc;

    fn mid_session() -> DateTime<Tz> {
        MARKET_TZ.with_ymd_and_hms(2025, 6, 16, 10, 30, 0).single().unwrap()
    }

    fn at_force_exit() -> DateTime<Tz> {
        MARKET_TZ.with_ymd_and_hms(2025, 6, 16, 15, 0, 0).single().unwrap()
    }

    /// Admit and drive a trade to STOP_LOSS_PLACED; profit target lifted so
    /// trailing-stop scenarios are not shadowed.
    async fn protected_trade(profit_target: f64) -> (Arc<Engine>, Arc<SimBroker>, Trade) {
        let mut cfg = permissive_config();
        cfg.profit_target_percent = profit_target;
        let (engine, sim) = engine_with_config(cfg).await;

        let outcome = admit(&engine, buy_request()).await.unwrap();
        let AdmissionOutcome::Accepted { trade_id, .. } = outcome else {
            panic!("expected acceptance");
        };
        let mut rotation = 0;
        order_monitor::tick(&engine, Utc::now().naive_utc(), &mut rotation)
            .await
            .unwrap();

        let trade = engine.store.get_trade(&trade_id).await.unwrap();
        assert_eq!(trade.status, TradeStatus::StopLossPlaced);
        (engine, sim, trade)
    }

    fn feed_price(engine: &Engine, symbol: &str, price: f64) {
        engine
            .quotes
            .ingest(symbol, price, price - 0.01, price + 0.01, Utc::now());
    }

    #[tokio::test]
    async fn trailing_stop_ratchets_and_triggers() {
        // Seed scenario 1: entry 0.42, rise to 0.60, fall to 0.51.
        let (engine, sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        feed_price(&engine, &trade.option_symbol, 0.60);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.status, TradeStatus::StopLossPlaced);
        assert_eq!(t.highest_price_seen, Some(0.60));
        assert!((t.trailing_stop_price.unwrap() - 0.51).abs() < 1e-9);

        feed_price(&engine, &trade.option_symbol, 0.51);
        sim.set_mark(&trade.option_symbol, 0.51);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.status, TradeStatus::Exiting);
        assert_eq!(t.exit_reason, Some(ExitReason::TrailingStop));

        // The order monitor books the fill: (0.51 − 0.42) × 2 × 100 = 18.
        order_monitor::tick(&engine, Utc::now().naive_utc(), &mut rotation)
            .await
            .unwrap();
        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.status, TradeStatus::Closed);
        assert!((t.pnl_dollars.unwrap() - 18.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn trailing_stop_never_decreases() {
        let (engine, _sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        feed_price(&engine, &trade.option_symbol, 0.60);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();
        let first = engine.store.get_trade(&trade.id).await.unwrap();

        // A pullback that stays above the trailing stop must not move it.
        feed_price(&engine, &trade.option_symbol, 0.55);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();
        let second = engine.store.get_trade(&trade.id).await.unwrap();

        assert_eq!(first.trailing_stop_price, second.trailing_stop_price);
        assert_eq!(second.highest_price_seen, Some(0.60));
    }

    #[tokio::test]
    async fn force_exit_beats_everything() {
        // Seed scenario 2: at the force-exit time the TIME_BASED exit fires
        // even though max-hold is not reached.
        let (engine, sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        feed_price(&engine, &trade.option_symbol, 0.45);
        sim.set_mark(&trade.option_symbol, 0.45);
        tick(&engine, at_force_exit(), &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.status, TradeStatus::Exiting);
        assert_eq!(t.exit_reason, Some(ExitReason::TimeBased));
    }

    #[tokio::test]
    async fn max_hold_fires_before_price_exits() {
        let (engine, sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        // Backdate the fill far past the hold limit.
        let held_now = mid_session();
        let long_ago = held_now.with_timezone(&Utc).naive_utc()
            - Duration::minutes(engine.config.max_hold_minutes + 5);
        sqlx_backdate(&engine, &trade.id, long_ago).await;

        feed_price(&engine, &trade.option_symbol, 0.43);
        sim.set_mark(&trade.option_symbol, 0.43);
        tick(&engine, held_now, &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.exit_reason, Some(ExitReason::MaxHoldTime));
    }

    /// Exit priority (P6): with TIME_BASED and MAX_HOLD_TIME both true, the
    /// higher-priority TIME_BASED is recorded.
    #[tokio::test]
    async fn time_based_outranks_max_hold() {
        let (engine, sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        let now = at_force_exit();
        let long_ago = now.with_timezone(&Utc).naive_utc()
            - Duration::minutes(engine.config.max_hold_minutes + 5);
        sqlx_backdate(&engine, &trade.id, long_ago).await;

        feed_price(&engine, &trade.option_symbol, 0.43);
        sim.set_mark(&trade.option_symbol, 0.43);
        tick(&engine, now, &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.exit_reason, Some(ExitReason::TimeBased));
    }

    #[tokio::test]
    async fn profit_target_triggers() {
        let (engine, sim, trade) = protected_trade(25.0).await;
        let mut rotation = 0;

        // entry 0.42 × 1.25 = 0.525
        feed_price(&engine, &trade.option_symbol, 0.53);
        sim.set_mark(&trade.option_symbol, 0.53);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.exit_reason, Some(ExitReason::ProfitTarget));
    }

    #[tokio::test]
    async fn app_stop_only_when_broker_stop_inactive() {
        let (engine, sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        // Price at the stop, but the broker stop is believed working: the
        // exit engine must defer to it.
        feed_price(&engine, &trade.option_symbol, 0.20);
        sim.set_mark(&trade.option_symbol, 0.20);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();
        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.status, TradeStatus::StopLossPlaced);

        // Once the belief is cleared, condition 3 takes over.
        engine.store.clear_stop_active(&trade.id).await.unwrap();
        tick(&engine, mid_session(), &mut rotation).await.unwrap();
        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.status, TradeStatus::Exiting);
        assert_eq!(t.exit_reason, Some(ExitReason::StopLoss));
    }

    #[tokio::test]
    async fn exit_cancels_broker_stop_first() {
        let (engine, sim, trade) = protected_trade(25.0).await;
        let mut rotation = 0;

        feed_price(&engine, &trade.option_symbol, 0.60);
        sim.set_mark(&trade.option_symbol, 0.60);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();

        let stop_id = trade.stop_order_id.unwrap();
        assert!(sim.cancelled_orders().contains(&stop_id));
        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert!(!t.stop_active);
    }

    #[tokio::test]
    async fn snapshots_are_rate_limited() {
        let (engine, _sim, trade) = protected_trade(100.0).await;
        let mut rotation = 0;

        feed_price(&engine, &trade.option_symbol, 0.45);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();
        feed_price(&engine, &trade.option_symbol, 0.46);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();

        let snaps = engine.store.snapshots_for_trade(&trade.id).await.unwrap();
        assert_eq!(snaps.len(), 1, "second snapshot suppressed inside the interval");
    }

    #[tokio::test]
    async fn chain_mid_fallback_when_quote_missing() {
        let (engine, sim, trade) = protected_trade(25.0).await;
        let mut rotation = 0;

        // No streamed quote at all: the chain's 0.41/0.42 mid (0.415) is
        // used. Re-seed the chain with a profitable mark instead.
        sim.set_chain(
            "SPY",
            crate::types::Direction::Call,
            vec![crate::broker::ChainEntry {
                symbol: trade.option_symbol.clone(),
                strike: 694.0,
                bid: 0.54,
                ask: 0.56,
                delta: 0.60,
            }],
        );
        sim.set_mark(&trade.option_symbol, 0.55);
        tick(&engine, mid_session(), &mut rotation).await.unwrap();

        let t = engine.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(t.exit_reason, Some(ExitReason::ProfitTarget));
    }

    /// Backdate entry_filled_at directly; the store has no public mutator
    /// for test-only clock control.
    async fn sqlx_backdate(engine: &Engine, trade_id: &str, filled_at: chrono::NaiveDateTime) {
        let trade = engine.store.get_trade(trade_id).await.unwrap();
        assert!(trade.entry_filled_at.is_some());
        engine
            .store
            .backdate_entry_fill(trade_id, filled_at)
            .await
            .unwrap();
    }
}
