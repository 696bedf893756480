// =============================================================================
// Order Manager — fill polling and stop placement
// =============================================================================
//
// Runs every 5 seconds. For each non-terminal trade (ascending id, rotated,
// capped per tick):
//
//   PENDING            poll the entry order; fill -> record + place stop;
//                      broker reject -> cancel; WORKING past the limit
//                      timeout -> cancel at the broker, no re-submission.
//   FILLED             stop not yet resting (first attempt failed or crashed
//                      mid-way) -> compute and place it.
//   STOP_LOSS_PLACED   poll the stop; fill -> stop hit, trade closed;
//                      observed non-WORKING -> clear the stop_active belief.
//   EXITING            poll the exit order; fill -> close and book PnL.
//
// Transient broker errors retry with backoff and otherwise leave the trade
// for the next tick; they never cause a state transition.
// =============================================================================

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::bus::{trade_payload, EventName};
use crate::engine::{with_broker_backoff, Engine};
use crate::error::{EngineError, EngineResult};
use crate::indicators::atr;
use crate::market_data::BarKey;
use crate::store::Trade;
use crate::types::{ExitReason, OrderState, Timeframe, TradeStatus};

/// Bars and period used for the ATR-at-entry stop rule.
const ATR_TIMEFRAME: Timeframe = Timeframe::M5;
const ATR_PERIOD: usize = 14;
/// Stops never drop below a nickel.
const MIN_STOP_PRICE: f64 = 0.05;

/// One monitor pass over the non-terminal trades.
///
/// Broker calls run outside the per-trade lock; every mutation re-acquires
/// it, re-reads the row, and re-validates the source state. A trade whose
/// state moved underneath a poll is simply skipped until the next tick.
pub async fn tick(engine: &Engine, now: NaiveDateTime, rotation: &mut usize) -> EngineResult<()> {
    let trades = engine.store.non_terminal_trades().await?;
    if trades.is_empty() {
        return Ok(());
    }

    for trade in rotate(&trades, rotation, engine.config.max_trades_per_tick) {
        let result = match trade.status {
            TradeStatus::Pending => poll_entry(engine, &trade, now).await,
            TradeStatus::Filled => ensure_stop(engine, &trade).await,
            TradeStatus::StopLossPlaced => poll_stop(engine, &trade).await,
            TradeStatus::Exiting => poll_exit(engine, &trade).await,
            _ => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(e @ EngineError::InvariantViolation(_)) => return Err(e),
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "order monitor: trade left for next tick");
            }
        }
    }

    Ok(())
}

/// Lock the trade, re-read it, and return it only if still in `expected`
/// state. `None` means another task advanced the trade meanwhile.
async fn revalidate(
    engine: &Engine,
    trade_id: &str,
    expected: TradeStatus,
) -> EngineResult<Option<Trade>> {
    let current = engine.store.get_trade(trade_id).await?;
    if current.status == expected {
        Ok(Some(current))
    } else {
        debug!(
            trade_id,
            status = %current.status,
            expected = %expected,
            "state moved on — skipping mutation"
        );
        Ok(None)
    }
}

/// Rotate the iteration start so overflow beyond the per-tick cap never
/// starves the same trades.
fn rotate(trades: &[Trade], rotation: &mut usize, cap: usize) -> Vec<Trade> {
    let len = trades.len();
    if len == 0 {
        return Vec::new();
    }
    let take = cap.min(len);
    let start = *rotation % len;
    *rotation = (start + take) % len;

    (0..take)
        .map(|i| trades[(start + i) % len].clone())
        .collect()
}

async fn poll_entry(engine: &Engine, trade: &Trade, now: NaiveDateTime) -> EngineResult<()> {
    let Some(entry_order_id) = trade.entry_order_id.as_deref() else {
        return Err(EngineError::InvariantViolation(format!(
            "PENDING trade {} has no entry order id",
            trade.id
        )));
    };

    // Broker poll runs without the lock.
    let report = with_broker_backoff(|| engine.broker.order_status(entry_order_id)).await?;

    match report.state {
        OrderState::Filled => {
            let Some(price) = report.filled_price else {
                // Fill without a price yet; the broker will report it soon.
                debug!(trade_id = %trade.id, "entry filled without price — waiting");
                return Ok(());
            };
            let filled_at = report.filled_at.unwrap_or(now);

            let lock = engine.locks.lock_for(&trade.id);
            let filled = {
                let _guard = lock.lock().await;
                let Some(current) = revalidate(engine, &trade.id, TradeStatus::Pending).await?
                else {
                    return Ok(());
                };
                engine
                    .store
                    .record_entry_fill(&current.id, price, filled_at)
                    .await?
            };
            engine
                .bus
                .publish(EventName::TradeFilled, trade_payload(&filled));
            ensure_stop(engine, &filled).await
        }

        OrderState::Cancelled | OrderState::Rejected | OrderState::Expired => {
            cancel_entry(engine, &trade.id, ExitReason::BrokerRejected).await
        }

        OrderState::Working => {
            let age_secs = (now - trade.created_at).num_seconds();
            if age_secs < engine.config.entry_limit_timeout_secs as i64 {
                return Ok(());
            }

            // Limit timed out: cancel at the broker and give up. There is no
            // price-chasing re-submission.
            if let Err(e) = engine.broker.cancel(entry_order_id).await {
                warn!(trade_id = %trade.id, error = %e, "broker cancel failed — cancelling locally");
            }
            cancel_entry(engine, &trade.id, ExitReason::LimitTimeout).await
        }
    }
}

/// PENDING -> CANCELLED under the lock, with re-validation.
async fn cancel_entry(engine: &Engine, trade_id: &str, reason: ExitReason) -> EngineResult<()> {
    let lock = engine.locks.lock_for(trade_id);
    let cancelled = {
        let _guard = lock.lock().await;
        let Some(current) = revalidate(engine, trade_id, TradeStatus::Pending).await? else {
            return Ok(());
        };
        engine.store.cancel_pending(&current.id, reason).await?
    };
    engine
        .bus
        .publish(EventName::TradeCancelled, trade_payload(&cancelled));
    release(engine, &cancelled);
    Ok(())
}

/// Place the protective stop for a filled trade.
async fn ensure_stop(engine: &Engine, trade: &Trade) -> EngineResult<()> {
    let Some(entry_price) = trade.entry_price else {
        return Err(EngineError::InvariantViolation(format!(
            "FILLED trade {} has no entry price",
            trade.id
        )));
    };

    let stop_price = stop_price_for(engine, trade, entry_price);

    // Placement runs without the lock; re-validate before recording.
    let placed = with_broker_backoff(|| {
        engine
            .broker
            .place_stop_exit(&trade.option_symbol, trade.quantity, stop_price)
    })
    .await;

    match placed {
        Ok(stop_order_id) => {
            let recorded = {
                let lock = engine.locks.lock_for(&trade.id);
                let _guard = lock.lock().await;
                match revalidate(engine, &trade.id, TradeStatus::Filled).await? {
                    Some(current) => {
                        engine
                            .store
                            .record_stop_placement(&current.id, &stop_order_id, stop_price)
                            .await?;
                        true
                    }
                    None => false,
                }
            };
            if !recorded {
                // The trade moved on while the stop was in flight.
                warn!(trade_id = %trade.id, "orphaned stop order — cancelling");
                let _ = engine.broker.cancel(&stop_order_id).await;
            }
            Ok(())
        }
        Err(e) if e.is_transient() => {
            // Stay FILLED; the next tick re-attempts placement.
            warn!(trade_id = %trade.id, error = %e, "stop placement deferred");
            Ok(())
        }
        Err(e) => {
            warn!(trade_id = %trade.id, error = %e, "stop placement rejected — trade marked ERROR");
            let lock = engine.locks.lock_for(&trade.id);
            let _guard = lock.lock().await;
            if revalidate(engine, &trade.id, TradeStatus::Filled).await?.is_some() {
                engine
                    .store
                    .mark_trade_error(&trade.id, &format!("stop placement failed: {e}"))
                    .await?;
            }
            Ok(())
        }
    }
}

/// ATR-primary stop with percent fallback, clamped at a floor.
fn stop_price_for(engine: &Engine, trade: &Trade, entry_price: f64) -> f64 {
    let key = BarKey {
        symbol: trade.ticker.clone(),
        timeframe: ATR_TIMEFRAME,
    };
    let bars = engine.bars.last_bars(&key, ATR_PERIOD * 3 + 1);

    let stop = match atr::atr(&bars, ATR_PERIOD) {
        Some(atr_value) => {
            let stop = entry_price - engine.config.atr_stop_multiplier * atr_value;
            debug!(
                trade_id = %trade.id,
                atr = atr_value,
                stop,
                "stop from ATR rule"
            );
            stop
        }
        None => {
            let stop = entry_price * (1.0 - engine.config.stop_loss_percent / 100.0);
            debug!(trade_id = %trade.id, stop, "stop from percent fallback (ATR unavailable)");
            stop
        }
    };

    stop.max(MIN_STOP_PRICE)
}

async fn poll_stop(engine: &Engine, trade: &Trade) -> EngineResult<()> {
    let Some(stop_order_id) = trade.stop_order_id.as_deref() else {
        return Err(EngineError::InvariantViolation(format!(
            "STOP_LOSS_PLACED trade {} has no stop order id",
            trade.id
        )));
    };

    let report = with_broker_backoff(|| engine.broker.order_status(stop_order_id)).await?;

    match report.state {
        OrderState::Filled => {
            let price = report.filled_price.unwrap_or(trade.stop_loss_price.unwrap_or(0.0));
            let filled_at = report
                .filled_at
                .unwrap_or_else(|| chrono::Utc::now().naive_utc());

            let lock = engine.locks.lock_for(&trade.id);
            let closed = {
                let _guard = lock.lock().await;
                let Some(current) =
                    revalidate(engine, &trade.id, TradeStatus::StopLossPlaced).await?
                else {
                    return Ok(());
                };
                engine.store.record_stop_hit(&current.id, price, filled_at).await?
            };
            engine
                .bus
                .publish(EventName::TradeClosed, trade_payload(&closed));
            release(engine, &closed);
            Ok(())
        }
        OrderState::Cancelled | OrderState::Rejected | OrderState::Expired => {
            // The resting stop is gone; the exit engine takes over condition 3.
            if trade.stop_active {
                warn!(trade_id = %trade.id, state = %report.state, "stop no longer working");
                let lock = engine.locks.lock_for(&trade.id);
                let _guard = lock.lock().await;
                if revalidate(engine, &trade.id, TradeStatus::StopLossPlaced)
                    .await?
                    .is_some()
                {
                    engine.store.clear_stop_active(&trade.id).await?;
                }
            }
            Ok(())
        }
        OrderState::Working => Ok(()),
    }
}

async fn poll_exit(engine: &Engine, trade: &Trade) -> EngineResult<()> {
    let Some(exit_order_id) = trade.exit_order_id.as_deref() else {
        return Err(EngineError::InvariantViolation(format!(
            "EXITING trade {} has no exit order id",
            trade.id
        )));
    };

    let report = with_broker_backoff(|| engine.broker.order_status(exit_order_id)).await?;

    match report.state {
        OrderState::Filled => {
            let Some(price) = report.filled_price else {
                return Ok(());
            };
            let filled_at = report
                .filled_at
                .unwrap_or_else(|| chrono::Utc::now().naive_utc());

            let lock = engine.locks.lock_for(&trade.id);
            let closed = {
                let _guard = lock.lock().await;
                let Some(current) = revalidate(engine, &trade.id, TradeStatus::Exiting).await?
                else {
                    return Ok(());
                };
                engine.store.record_exit_fill(&current.id, price, filled_at).await?
            };
            engine
                .bus
                .publish(EventName::TradeClosed, trade_payload(&closed));
            release(engine, &closed);
            Ok(())
        }
        OrderState::Cancelled | OrderState::Rejected | OrderState::Expired => {
            warn!(trade_id = %trade.id, state = %report.state, "exit order failed — trade marked ERROR");
            let lock = engine.locks.lock_for(&trade.id);
            let _guard = lock.lock().await;
            if revalidate(engine, &trade.id, TradeStatus::Exiting).await?.is_some() {
                engine
                    .store
                    .mark_trade_error(&trade.id, &format!("exit order {}", report.state))
                    .await?;
            }
            Ok(())
        }
        OrderState::Working => Ok(()),
    }
}

/// Terminal-state housekeeping: drop quote subscriptions and the lock entry.
fn release(engine: &Engine, trade: &Trade) {
    engine.quotes.unsubscribe(&trade.option_symbol);
    engine.quotes.unsubscribe(&trade.ticker);
    engine.locks.release(&trade.id);
}
