// =============================================================================
// Simulated Broker — deterministic fills for tests and paper trading
// =============================================================================
//
// Contract (mirrors the REST client):
//   - Limit entries and market exits fill immediately and deterministically:
//     limit orders at the limit price, market orders at the configured mark.
//   - Stop orders stay WORKING indefinitely unless a test triggers them.
//   - Chains and equity quotes are whatever the harness seeded.
//
// Test hooks (`fill_stop`, `hold_next_entry`, `reject_next_order`,
// `fail_transient_once`) drive the lifecycle scenarios without a network.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::broker::{BrokerClient, ChainEntry, EquityQuote, OrderStatusReport};
use crate::error::{EngineError, EngineResult};
use crate::types::{Direction, OrderState};

#[derive(Debug, Clone)]
struct SimOrder {
    symbol: String,
    report: OrderStatusReport,
}

#[derive(Default)]
struct SimState {
    orders: HashMap<String, SimOrder>,
    chains: HashMap<(String, Direction), Vec<ChainEntry>>,
    quotes: HashMap<String, EquityQuote>,
    marks: HashMap<String, f64>,
    hold_next_entry: bool,
    reject_next_order: bool,
    fail_transient_once: bool,
    cancelled: Vec<String>,
}

/// In-memory broker with deterministic behaviour.
#[derive(Default)]
pub struct SimBroker {
    state: Mutex<SimState>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Harness seeding
    // -------------------------------------------------------------------------

    /// Seed the chain returned for `(underlying, direction)`.
    pub fn set_chain(&self, underlying: &str, direction: Direction, entries: Vec<ChainEntry>) {
        self.state
            .lock()
            .chains
            .insert((underlying.to_string(), direction), entries);
    }

    /// Seed the REST snapshot quote for a symbol.
    pub fn set_quote(&self, symbol: &str, quote: EquityQuote) {
        self.state.lock().quotes.insert(symbol.to_string(), quote);
    }

    /// Set the mark at which market exits for `symbol` fill.
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// The next limit entry stays WORKING instead of filling.
    pub fn hold_next_entry(&self) {
        self.state.lock().hold_next_entry = true;
    }

    /// The next order placement is REJECTED by the "broker".
    pub fn reject_next_order(&self) {
        self.state.lock().reject_next_order = true;
    }

    /// The next call fails with a transient error, then behaviour resumes.
    pub fn fail_transient_once(&self) {
        self.state.lock().fail_transient_once = true;
    }

    /// Flip a resting stop order to FILLED at `price`, as if the broker
    /// triggered it.
    pub fn fill_stop(&self, order_id: &str, price: f64) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.report = OrderStatusReport {
                state: OrderState::Filled,
                filled_price: Some(price),
                filled_at: Some(Utc::now().naive_utc()),
            };
        }
    }

    /// Order ids that have been cancelled, in call order.
    pub fn cancelled_orders(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    /// Number of orders this broker has accepted.
    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn take_transient_failure(state: &mut SimState) -> Option<EngineError> {
        if state.fail_transient_once {
            state.fail_transient_once = false;
            return Some(EngineError::TransientBroker(
                "simulated network failure".to_string(),
            ));
        }
        None
    }

    fn insert_order(state: &mut SimState, symbol: &str, report: OrderStatusReport) -> String {
        let order_id = Uuid::new_v4().to_string();
        state.orders.insert(
            order_id.clone(),
            SimOrder {
                symbol: symbol.to_string(),
                report,
            },
        );
        order_id
    }

    fn filled_report(price: f64) -> OrderStatusReport {
        OrderStatusReport {
            state: OrderState::Filled,
            filled_price: Some(price),
            filled_at: Some(Utc::now().naive_utc()),
        }
    }

    fn working_report() -> OrderStatusReport {
        OrderStatusReport {
            state: OrderState::Working,
            filled_price: None,
            filled_at: None,
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for SimBroker {
    async fn place_limit_entry(
        &self,
        symbol: &str,
        _qty: i64,
        price: f64,
    ) -> EngineResult<String> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }

        let report = if state.reject_next_order {
            state.reject_next_order = false;
            OrderStatusReport {
                state: OrderState::Rejected,
                filled_price: None,
                filled_at: None,
            }
        } else if state.hold_next_entry {
            state.hold_next_entry = false;
            Self::working_report()
        } else {
            Self::filled_report(price)
        };

        Ok(Self::insert_order(&mut state, symbol, report))
    }

    async fn place_stop_exit(
        &self,
        symbol: &str,
        _qty: i64,
        _stop_price: f64,
    ) -> EngineResult<String> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }
        // Stops rest WORKING until the harness triggers them.
        Ok(Self::insert_order(&mut state, symbol, Self::working_report()))
    }

    async fn place_market_exit(&self, symbol: &str, _qty: i64) -> EngineResult<String> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }
        if state.reject_next_order {
            state.reject_next_order = false;
            return Ok(Self::insert_order(
                &mut state,
                symbol,
                OrderStatusReport {
                    state: OrderState::Rejected,
                    filled_price: None,
                    filled_at: None,
                },
            ));
        }
        let mark = state.marks.get(symbol).copied().unwrap_or(0.0);
        Ok(Self::insert_order(&mut state, symbol, Self::filled_report(mark)))
    }

    async fn cancel(&self, order_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }
        match state.orders.get_mut(order_id) {
            Some(order) => {
                if order.report.state == OrderState::Working {
                    order.report.state = OrderState::Cancelled;
                }
                state.cancelled.push(order_id.to_string());
                Ok(())
            }
            None => Err(EngineError::PermanentBroker(format!(
                "unknown order {order_id}"
            ))),
        }
    }

    async fn order_status(&self, order_id: &str) -> EngineResult<OrderStatusReport> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }
        state
            .orders
            .get(order_id)
            .map(|o| o.report.clone())
            .ok_or_else(|| EngineError::PermanentBroker(format!("unknown order {order_id}")))
    }

    async fn option_chain(
        &self,
        underlying: &str,
        direction: Direction,
        _strike_count: u32,
        _only_today: bool,
    ) -> EngineResult<Vec<ChainEntry>> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }
        Ok(state
            .chains
            .get(&(underlying.to_string(), direction))
            .cloned()
            .unwrap_or_default())
    }

    async fn equity_quote(&self, symbol: &str) -> EngineResult<EquityQuote> {
        let mut state = self.state.lock();
        if let Some(e) = Self::take_transient_failure(&mut state) {
            return Err(e);
        }
        state
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::TransientBroker(format!("no quote for {symbol}")))
    }
}

impl std::fmt::Debug for SimBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimBroker")
            .field("orders", &state.orders.len())
            .field("cancelled", &state.cancelled.len())
            .finish()
    }
}
