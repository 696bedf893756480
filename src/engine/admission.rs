// =============================================================================
// Admission Pipeline — alert to entry order, or a recorded rejection
// =============================================================================
//
// Normalized flow for every inbound alert, external or internal:
//   persist RECEIVED -> risk gate -> contract selection -> confidence sizing
//   -> limit entry at the ask -> promote to Trade(PENDING) -> broadcast.
//
// The outcome is a tagged value, never an exception: Accepted(trade_id),
// Rejected(reason), or Errored(detail). CLOSE alerts route to the most recent
// open trade instead.
// =============================================================================

use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{trade_payload, EventName};
use crate::contracts::{self, SelectorConfig};
use crate::engine::{with_broker_backoff, Engine};
use crate::error::{EngineError, EngineResult};
use crate::market_data::CacheRead;
use crate::risk::GateDecision;
use crate::session;
use crate::types::{AlertAction, AlertSource, ExitReason, TradeEventType, TradeStatus};

/// A normalized alert entering the pipeline.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub ticker: String,
    pub action: AlertAction,
    pub price: Option<f64>,
    pub source: AlertSource,
    pub raw_payload: String,
    pub secret: Option<String>,
    /// Set when the transport already verified the secret.
    pub secret_verified: bool,
    pub confluence_score: Option<u32>,
    pub confluence_max: Option<u32>,
    pub relative_volume: Option<f64>,
}

/// Tagged admission outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Accepted { alert_id: String, trade_id: String },
    Rejected { alert_id: String, reason: String },
    Errored { alert_id: String, detail: String },
}

/// Run one alert through the pipeline.
pub async fn admit(engine: &Engine, request: AlertRequest) -> EngineResult<AdmissionOutcome> {
    // 1. Persist as RECEIVED and announce.
    let alert = engine
        .store
        .create_alert(
            &request.raw_payload,
            &request.ticker,
            request.action.direction(),
            request.price,
            request.source,
        )
        .await?;
    engine.bus.publish(
        EventName::AlertReceived,
        serde_json::json!({
            "alert_id": alert.id,
            "ticker": request.ticker,
            "action": request.action,
            "source": request.source,
        }),
    );

    // 2. Risk gate.
    let decision = engine
        .gate
        .evaluate(
            crate::risk::GateInput {
                action: request.action,
                ticker: &request.ticker,
                source: request.source,
                provided_secret: request.secret.as_deref(),
                skip_secret: request.secret_verified,
            },
            &engine.store,
            &engine.quotes,
            &engine.broker,
            engine.overrides(),
            session::market_now(),
        )
        .await?;

    if let GateDecision::Rejected(reason) = decision {
        engine.store.reject_alert(&alert.id, reason).await?;
        info!(alert_id = %alert.id, reason, "alert rejected by gate");
        return Ok(AdmissionOutcome::Rejected {
            alert_id: alert.id,
            reason: reason.to_string(),
        });
    }

    // CLOSE alerts route to the most recent open trade; directional alerts
    // continue through selection and entry.
    let direction = match request.action.direction() {
        None => return close_most_recent(engine, &alert.id).await,
        Some(direction) => direction,
    };

    // 3. Resolve the underlying price: alert price, streamed quote, REST.
    let underlying_price = match request.price {
        Some(p) if p > 0.0 => p,
        _ => match engine.quotes.get(&request.ticker) {
            CacheRead::Fresh(q) => q.last,
            _ => match engine.broker.equity_quote(&request.ticker).await {
                Ok(q) => q.last,
                Err(e) => {
                    let detail = format!("underlying price unavailable: {e}");
                    engine.store.mark_alert_error(&alert.id, &detail).await?;
                    return Ok(AdmissionOutcome::Errored {
                        alert_id: alert.id,
                        detail,
                    });
                }
            },
        },
    };

    // 4. Contract selection.
    let selector = SelectorConfig {
        delta_target: engine.config.delta_target,
        max_spread_percent: engine.config.max_spread_percent,
        strike_count: engine.config.strike_count,
    };
    let contract = match contracts::select_contract(
        &engine.broker,
        selector,
        &request.ticker,
        direction,
        underlying_price,
    )
    .await
    {
        Ok(contract) => contract,
        Err(e @ EngineError::NoLiquidContract { .. }) => {
            let detail = e.to_string();
            engine.store.mark_alert_error(&alert.id, &detail).await?;
            return Ok(AdmissionOutcome::Errored {
                alert_id: alert.id,
                detail,
            });
        }
        Err(e) => return Err(e),
    };

    // 5. Confidence-based sizing.
    let quantity = sized_quantity(
        engine.config.default_quantity,
        request.confluence_score,
        request.relative_volume,
        engine.config.double_min_score,
        engine.config.double_min_rel_vol,
        engine.config.half_max_score,
    );

    // 6. Limit entry at the ask.
    let limit_price = contract.ask;
    let entry_order_id = match engine
        .broker
        .place_limit_entry(&contract.option_symbol, quantity, limit_price)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            let detail = format!("entry order failed: {e}");
            warn!(alert_id = %alert.id, error = %e, "entry placement failed");
            engine.store.mark_alert_error(&alert.id, &detail).await?;
            return Ok(AdmissionOutcome::Errored {
                alert_id: alert.id,
                detail,
            });
        }
    };

    // 7. Persist the trade, link the alert, broadcast.
    let trade = engine
        .store
        .promote_alert_to_trade(
            &alert.id,
            &request.ticker,
            direction,
            &contract,
            quantity,
            &entry_order_id,
            limit_price,
            request.source,
        )
        .await?;

    engine.quotes.subscribe(&trade.ticker);
    engine.quotes.subscribe(&trade.option_symbol);

    engine
        .bus
        .publish(EventName::TradeCreated, trade_payload(&trade));

    info!(
        alert_id = %alert.id,
        trade_id = %trade.id,
        symbol = %trade.option_symbol,
        quantity,
        "alert admitted"
    );

    Ok(AdmissionOutcome::Accepted {
        alert_id: alert.id,
        trade_id: trade.id,
    })
}

/// CLOSE action: cancel the stop on the most recent open trade and send a
/// market close.
async fn close_most_recent(engine: &Engine, alert_id: &str) -> EngineResult<AdmissionOutcome> {
    let Some(candidate) = engine.store.most_recent_open_trade().await? else {
        // The gate saw an open trade but it closed underneath us.
        engine
            .store
            .reject_alert(alert_id, crate::risk::REASON_NO_OPEN_TRADE)
            .await?;
        return Ok(AdmissionOutcome::Rejected {
            alert_id: alert_id.to_string(),
            reason: crate::risk::REASON_NO_OPEN_TRADE.to_string(),
        });
    };

    // Validate under the lock, then release it for the broker calls.
    let lock = engine.locks.lock_for(&candidate.id);
    let trade = {
        let _guard = lock.lock().await;
        let trade = engine.store.get_trade(&candidate.id).await?;
        if !matches!(
            trade.status,
            TradeStatus::Filled | TradeStatus::StopLossPlaced
        ) {
            engine
                .store
                .reject_alert(alert_id, crate::risk::REASON_NO_OPEN_TRADE)
                .await?;
            return Ok(AdmissionOutcome::Rejected {
                alert_id: alert_id.to_string(),
                reason: crate::risk::REASON_NO_OPEN_TRADE.to_string(),
            });
        }
        trade
    };

    // Cancel the resting stop first (best effort).
    if trade.stop_active {
        if let Some(stop_order_id) = trade.stop_order_id.as_deref() {
            match engine.broker.cancel(stop_order_id).await {
                Ok(()) => engine.store.record_stop_cancelled(&trade.id).await?,
                Err(e) => warn!(trade_id = %trade.id, error = %e, "stop cancel failed — continuing"),
            }
        }
    }

    let exit_order_id = with_broker_backoff(|| {
        engine
            .broker
            .place_market_exit(&trade.option_symbol, trade.quantity)
    })
    .await?;

    // Re-acquire, re-validate, record.
    let recorded = {
        let _guard = lock.lock().await;
        let current = engine.store.get_trade(&trade.id).await?;
        if matches!(
            current.status,
            TradeStatus::Filled | TradeStatus::StopLossPlaced
        ) {
            engine
                .store
                .record_exit_trigger(&current.id, ExitReason::Signal, &exit_order_id)
                .await?;
            true
        } else {
            false
        }
    };
    if !recorded {
        warn!(trade_id = %trade.id, "trade closed while CLOSE was in flight — cancelling exit order");
        let _ = engine.broker.cancel(&exit_order_id).await;
        engine
            .store
            .reject_alert(alert_id, crate::risk::REASON_NO_OPEN_TRADE)
            .await?;
        return Ok(AdmissionOutcome::Rejected {
            alert_id: alert_id.to_string(),
            reason: crate::risk::REASON_NO_OPEN_TRADE.to_string(),
        });
    }

    engine
        .store
        .add_event(
            &trade.id,
            TradeEventType::CloseSignal,
            "close signal received",
            serde_json::json!({ "alert_id": alert_id }),
        )
        .await?;
    engine.store.link_alert_processed(alert_id, &trade.id).await?;

    info!(alert_id, trade_id = %trade.id, "close signal routed to open trade");
    Ok(AdmissionOutcome::Accepted {
        alert_id: alert_id.to_string(),
        trade_id: trade.id,
    })
}

/// Base quantity adjusted by confluence confidence.
fn sized_quantity(
    base: i64,
    confluence_score: Option<u32>,
    relative_volume: Option<f64>,
    double_min_score: u32,
    double_min_rel_vol: f64,
    half_max_score: u32,
) -> i64 {
    let Some(score) = confluence_score else {
        return base.max(1);
    };

    if score >= double_min_score && relative_volume.unwrap_or(0.0) >= double_min_rel_vol {
        return (base * 2).max(1);
    }
    if score <= half_max_score {
        return (base / 2).max(1);
    }
    base.max(1)
}
