// =============================================================================
// Engine Context — shared subsystems and per-trade mutual exclusion
// =============================================================================
//
// The single source of truth tying the subsystems together. Every mutation of
// a Trade row (order monitor, exit engine, admission CLOSE path) happens
// under the lock keyed by trade id. Callers touching multiple trades acquire
// locks in ascending id order; after any broker call that could block, the
// holder re-reads the trade and re-validates its source state.

pub mod admission;
pub mod exit_monitor;
pub mod order_monitor;
pub mod scheduler;
pub mod strategy_task;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use crate::broker::BrokerClient;
use crate::error::EngineResult;
use crate::bus::EventBus;
use crate::config::{AppConfig, Overrides};
use crate::market_data::{BarAggregator, QuoteCache};
use crate::risk::RiskGate;
use crate::store::TradeStore;

/// Registry of per-trade async locks.
#[derive(Default)]
pub struct TradeLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TradeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one trade, created on first use.
    pub fn lock_for(&self, trade_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock();
        map.entry(trade_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for a trade that reached a terminal state.
    pub fn release(&self, trade_id: &str) {
        self.inner.lock().remove(trade_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Shared engine context, wrapped in `Arc` at startup.
pub struct Engine {
    pub config: Arc<AppConfig>,
    pub overrides: RwLock<Overrides>,
    pub store: Arc<TradeStore>,
    pub broker: Arc<dyn BrokerClient>,
    pub quotes: Arc<QuoteCache>,
    pub bars: Arc<BarAggregator>,
    pub bus: Arc<EventBus>,
    pub gate: RiskGate,
    pub locks: TradeLocks,
    /// Operator alert raised when a loop halts on repeated invariant
    /// violations. Read by the health endpoint.
    pub operator_alert: RwLock<Option<String>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<TradeStore>,
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<QuoteCache>,
        bars: Arc<BarAggregator>,
        bus: Arc<EventBus>,
        gate: RiskGate,
    ) -> Self {
        Self {
            config,
            overrides: RwLock::new(Overrides::default()),
            store,
            broker,
            quotes,
            bars,
            bus,
            gate,
            locks: TradeLocks::new(),
            operator_alert: RwLock::new(None),
        }
    }

    pub fn overrides(&self) -> Overrides {
        *self.overrides.read()
    }

    pub fn set_overrides(&self, overrides: Overrides) {
        *self.overrides.write() = overrides;
    }

    /// Record an operator alert. The engine keeps running; the affected loop
    /// is halted by the scheduler.
    pub fn raise_operator_alert(&self, message: String) {
        error!(alert = %message, "OPERATOR ALERT");
        *self.operator_alert.write() = Some(message);
    }

    pub fn current_operator_alert(&self) -> Option<String> {
        self.operator_alert.read().clone()
    }
}

/// Retry a broker call on transient failures with exponential backoff
/// (0.5 s, 1 s, 2 s, 4 s — four attempts total). Permanent errors and
/// exhausted retries surface to the caller.
pub(crate) async fn with_broker_backoff<T, Fut, F>(mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 4;
    let mut delay = Duration::from_millis(500);

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %e, "transient broker failure — backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("locks", &self.locks.len())
            .field("overrides", &self.overrides())
            .finish()
    }
}


// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_registry_reuses_instances() {
        let locks = TradeLocks::new();
        let a1 = locks.lock_for("trade-a");
        let a2 = locks.lock_for("trade-a");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(locks.len(), 1);

        let _b = locks.lock_for("trade-b");
        assert_eq!(locks.len(), 2);

        locks.release("trade-a");
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn lock_serialises_critical_sections() {
        let locks = Arc::new(TradeLocks::new());
        let counter = Arc::new(parking_lot::Mutex::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.lock_for("t");
                let _guard = lock.lock().await;
                let prev = *counter.lock();
                tokio::task::yield_now().await;
                *counter.lock() = prev + 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock(), 8);
    }
}
