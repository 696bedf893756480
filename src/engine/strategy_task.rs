// =============================================================================
// Strategy Signal Task — supervisor and per-strategy workers
// =============================================================================
//
// The supervisor owns one worker per enabled (ticker, timeframe, signal type)
// tuple. The enabled set lives in the store; on every sync the supervisor
// diffs it against the running workers and creates/destroys accordingly.
//
// Each worker owns its bar-close callback registration: the callback pushes a
// notification into the worker's channel, and the worker evaluates the
// strategy against the completed bar set and routes any signal through the
// admission pipeline as an internal alert. Destroying a worker removes the
// callback, which closes the channel and ends the task.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::admission::{self, AlertRequest};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::market_data::BarKey;
use crate::signals::{Signal, SignalEvaluator};
use crate::store::EnabledStrategy;
use crate::types::{AlertAction, AlertSource, Direction, SignalKind, Timeframe};

/// Identity of one strategy worker.
pub type StrategyKey = (String, Timeframe, SignalKind);

/// Bars handed to the evaluator on each close.
const EVAL_WINDOW: usize = 120;

struct WorkerHandle {
    handler_id: u64,
    join: JoinHandle<()>,
}

pub struct StrategySupervisor {
    engine: Arc<Engine>,
    workers: HashMap<StrategyKey, WorkerHandle>,
}

impl StrategySupervisor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            workers: HashMap::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Rebuild the worker set against the store's enabled strategies.
    pub async fn sync(&mut self) -> EngineResult<()> {
        let enabled = self.engine.store.enabled_strategies().await?;
        let wanted: HashMap<StrategyKey, EnabledStrategy> = enabled
            .into_iter()
            .map(|s| ((s.ticker.clone(), s.timeframe, s.signal_type), s))
            .collect();

        // Destroy workers no longer enabled.
        let stale: Vec<StrategyKey> = self
            .workers
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            self.destroy(&key);
        }

        // Create missing workers.
        for (key, strategy) in wanted {
            if !self.workers.contains_key(&key) {
                self.create(key, strategy);
            }
        }

        Ok(())
    }

    /// Drive bar completion for all tracked series at `now`.
    pub fn drive_bars(&self, now: chrono::DateTime<chrono::Utc>) {
        self.engine.bars.close_due_bars(now);
    }

    fn create(&mut self, key: StrategyKey, strategy: EnabledStrategy) {
        let (ticker, timeframe, kind) = key.clone();
        let bar_key = BarKey {
            symbol: ticker.clone(),
            timeframe,
        };

        self.engine.bars.track(bar_key.clone());
        self.engine.quotes.subscribe(&ticker);

        // The callback owns the sender; removing the callback closes the
        // channel and the worker loop ends.
        let (bar_tx, mut bar_rx) = mpsc::channel::<()>(16);
        let handler_id = self.engine.bars.on_bar_close(
            bar_key.clone(),
            Arc::new(move |_key, _bar| {
                // A full channel means evaluations are pending anyway.
                let _ = bar_tx.try_send(());
            }),
        );

        let engine = self.engine.clone();
        let join = tokio::spawn(async move {
            let mut evaluator = SignalEvaluator::new(kind, strategy.params.clone());
            info!(ticker = %bar_key.symbol, timeframe = %bar_key.timeframe, kind = %kind, "strategy worker started");

            while bar_rx.recv().await.is_some() {
                if let Err(e) = evaluate_once(&engine, &bar_key, &mut evaluator).await {
                    warn!(
                        ticker = %bar_key.symbol,
                        kind = %kind,
                        error = %e,
                        "strategy evaluation failed"
                    );
                }
            }

            debug!(ticker = %bar_key.symbol, kind = %kind, "strategy worker stopped");
        });

        self.workers.insert(key, WorkerHandle { handler_id, join });
    }

    fn destroy(&mut self, key: &StrategyKey) {
        if let Some(handle) = self.workers.remove(key) {
            self.engine.bars.remove_handler(handle.handler_id);
            self.engine.quotes.unsubscribe(&key.0);
            handle.join.abort();
            info!(ticker = %key.0, timeframe = %key.1, kind = %key.2, "strategy worker destroyed");
        }
    }

    /// Destroy every worker (engine shutdown).
    pub fn shutdown(&mut self) {
        let keys: Vec<StrategyKey> = self.workers.keys().cloned().collect();
        for key in keys {
            self.destroy(&key);
        }
    }
}

impl Drop for StrategySupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Evaluate one strategy against the completed bar set and admit any signal.
pub async fn evaluate_once(
    engine: &Engine,
    bar_key: &BarKey,
    evaluator: &mut SignalEvaluator,
) -> EngineResult<()> {
    let bars = engine.bars.last_bars(bar_key, EVAL_WINDOW);
    let Some(signal) = evaluator.on_bar_close(&bars) else {
        return Ok(());
    };

    info!(
        ticker = %bar_key.symbol,
        kind = %evaluator.kind(),
        direction = %signal.direction,
        price = signal.underlying_price,
        "internal signal — entering admission"
    );

    let outcome = admission::admit(engine, internal_alert(&bar_key.symbol, &signal)).await?;
    if let admission::AdmissionOutcome::Rejected { ref reason, .. } = outcome {
        debug!(
            ticker = %bar_key.symbol,
            error = %crate::error::EngineError::GateRejection(reason.clone()),
            "internal signal rejected"
        );
    }
    debug!(ticker = %bar_key.symbol, outcome = ?outcome, "internal signal admission outcome");
    Ok(())
}

/// Synthesize the internal alert for an emitted signal, carrying the
/// confluence fields verbatim for confidence-based sizing.
fn internal_alert(ticker: &str, signal: &Signal) -> AlertRequest {
    let action = match signal.direction {
        Direction::Call => AlertAction::BuyCall,
        Direction::Put => AlertAction::BuyPut,
    };
    AlertRequest {
        ticker: ticker.to_string(),
        action,
        price: Some(signal.underlying_price),
        source: AlertSource::InternalStrategy,
        raw_payload: serde_json::json!({
            "signal": signal,
            "ticker": ticker,
        })
        .to_string(),
        secret: None,
        secret_verified: true,
        confluence_score: signal.confluence_score,
        confluence_max: signal.confluence_max,
        relative_volume: signal.relative_volume,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::engine::testutil::engine_with_sim;
    use crate::market_data::tests::market_utc;
    use crate::signals::StrategyParams;
    use crate::types::TradeStatus;

    fn bar_key() -> BarKey {
        BarKey {
            symbol: "SPY".to_string(),
            timeframe: Timeframe::M1,
        }
    }

    fn push_bar(engine: &Engine, offset: i64, close: f64) {
        let t = market_utc(9, 30) + Duration::minutes(offset);
        engine.bars.ingest_minute_bar(
            "SPY",
            &crate::market_data::Bar {
                open_time: t,
                close_time: t + Duration::minutes(1),
                open: close - 0.1,
                high: close + 0.2,
                low: close - 0.2,
                close,
                volume: 100.0,
            },
        );
    }

    #[tokio::test]
    async fn sync_mirrors_enabled_set() {
        let (engine, _sim) = engine_with_sim().await;
        let mut supervisor = StrategySupervisor::new(engine.clone());

        engine
            .store
            .enable_strategy("SPY", Timeframe::M1, SignalKind::EmaCross, &StrategyParams::default())
            .await
            .unwrap();
        engine
            .store
            .enable_strategy("SPY", Timeframe::M5, SignalKind::Confluence, &StrategyParams::default())
            .await
            .unwrap();

        supervisor.sync().await.unwrap();
        assert_eq!(supervisor.worker_count(), 2);
        assert!(engine.quotes.is_subscribed("SPY"));

        engine
            .store
            .disable_strategy("SPY", Timeframe::M5, SignalKind::Confluence)
            .await
            .unwrap();
        supervisor.sync().await.unwrap();
        assert_eq!(supervisor.worker_count(), 1);

        supervisor.shutdown();
        assert_eq!(supervisor.worker_count(), 0);
        assert!(!engine.quotes.is_subscribed("SPY"));
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (engine, _sim) = engine_with_sim().await;
        let mut supervisor = StrategySupervisor::new(engine.clone());
        engine
            .store
            .enable_strategy("SPY", Timeframe::M1, SignalKind::EmaCross, &StrategyParams::default())
            .await
            .unwrap();

        supervisor.sync().await.unwrap();
        supervisor.sync().await.unwrap();
        assert_eq!(supervisor.worker_count(), 1);
    }

    #[tokio::test]
    async fn signal_flows_through_admission() {
        let (engine, _sim) = engine_with_sim().await;
        engine.bars.track(bar_key());

        // Evaluate after every completed bar, as the live worker would.
        let mut evaluator =
            SignalEvaluator::new(SignalKind::EmaCross, StrategyParams::default());
        for i in 0..45 {
            let close = if i < 30 {
                694.0 - i as f64 * 0.05
            } else {
                692.5 + (i - 30) as f64 * 0.8
            };
            push_bar(&engine, i, close);
            engine
                .bars
                .close_due_bars(market_utc(9, 30) + Duration::minutes(i + 1));
            evaluate_once(&engine, &bar_key(), &mut evaluator).await.unwrap();
        }

        let trades = engine.store.non_terminal_trades().await.unwrap();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.source, crate::types::AlertSource::InternalStrategy);
        assert_eq!(trade.direction, Direction::Call);
    }

    #[tokio::test]
    async fn no_signal_no_admission() {
        let (engine, _sim) = engine_with_sim().await;
        engine.bars.track(bar_key());
        // Flat bars: no strategy fires.
        for i in 0..40 {
            push_bar(&engine, i, 694.0);
        }
        engine.bars.close_due_bars(market_utc(12, 0));

        let mut evaluator =
            SignalEvaluator::new(SignalKind::EmaCross, StrategyParams::default());
        evaluate_once(&engine, &bar_key(), &mut evaluator).await.unwrap();

        assert!(engine.store.non_terminal_trades().await.unwrap().is_empty());
        assert!(engine.store.recent_alerts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_alert_carries_confluence() {
        let signal = Signal {
            timestamp: chrono::Utc::now(),
            direction: Direction::Call,
            underlying_price: 694.5,
            reason: "confluence 6/6".to_string(),
            confluence_score: Some(6),
            confluence_max: Some(6),
            relative_volume: Some(2.5),
        };
        let request = internal_alert("SPY", &signal);
        assert_eq!(request.action, AlertAction::BuyCall);
        assert_eq!(request.confluence_score, Some(6));
        assert_eq!(request.relative_volume, Some(2.5));
        assert!(request.secret_verified);
        assert_eq!(request.source, AlertSource::InternalStrategy);
    }

    #[tokio::test]
    async fn bar_close_wakes_worker() {
        let (engine, _sim) = engine_with_sim().await;
        let mut supervisor = StrategySupervisor::new(engine.clone());
        engine
            .store
            .enable_strategy("SPY", Timeframe::M1, SignalKind::EmaCross, &StrategyParams::default())
            .await
            .unwrap();
        supervisor.sync().await.unwrap();

        // Feed the cross series through the live aggregator at a paced
        // cadence; the worker's callback fires on every completed bar.
        for i in 0..45 {
            let close = if i < 30 {
                694.0 - i as f64 * 0.05
            } else {
                692.5 + (i - 30) as f64 * 0.8
            };
            push_bar(&engine, i, close);
            supervisor.drive_bars(market_utc(9, 30) + Duration::minutes(i + 1));
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // Let the worker drain the tail of its queue.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let trades = engine.store.non_terminal_trades().await.unwrap();
        assert_eq!(trades.len(), 1, "exactly one cross admitted");
    }
}
