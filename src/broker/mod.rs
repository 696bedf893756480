// =============================================================================
// Broker Client Module
// =============================================================================
//
// Typed operations against the external broker, pluggable between the REST
// implementation and the deterministic simulator. Every order carries the
// semantic parameters the broker requires: side (BUY_TO_OPEN /
// SELL_TO_CLOSE), instrument type OPTION, quantity, order type
// (LIMIT / STOP / MARKET), duration DAY, session NORMAL.

pub mod rest;
pub mod sim;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::types::{Direction, OrderState};

pub use rest::RestBroker;
pub use sim::SimBroker;

/// Status snapshot for a single order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusReport {
    pub state: OrderState,
    pub filled_price: Option<f64>,
    pub filled_at: Option<NaiveDateTime>,
}

/// One entry of an option chain query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub symbol: String,
    pub strike: f64,
    pub bid: f64,
    pub ask: f64,
    pub delta: f64,
}

/// Snapshot equity quote from the broker's REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityQuote {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub change: f64,
    pub change_percent: f64,
}

/// Broker operations used by the engine. All network calls carry a deadline
/// and surface transient failures (`EngineError::TransientBroker`) distinctly
/// from protocol rejections (`EngineError::PermanentBroker`).
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// BUY_TO_OPEN limit order. Returns the broker order id.
    async fn place_limit_entry(&self, symbol: &str, qty: i64, price: f64)
        -> EngineResult<String>;

    /// SELL_TO_CLOSE resting stop order.
    async fn place_stop_exit(&self, symbol: &str, qty: i64, stop_price: f64)
        -> EngineResult<String>;

    /// SELL_TO_CLOSE market order.
    async fn place_market_exit(&self, symbol: &str, qty: i64) -> EngineResult<String>;

    /// Cancel a working order.
    async fn cancel(&self, order_id: &str) -> EngineResult<()>;

    /// Current state of an order.
    async fn order_status(&self, order_id: &str) -> EngineResult<OrderStatusReport>;

    /// Chain entries for `underlying`, filtered to the requested type, with
    /// `strike_count` strikes around at-the-money. With `only_today` the
    /// expiration is restricted to the current session date (0-DTE).
    async fn option_chain(
        &self,
        underlying: &str,
        direction: Direction,
        strike_count: u32,
        only_today: bool,
    ) -> EngineResult<Vec<ChainEntry>>;

    /// REST snapshot quote for an equity or index symbol.
    async fn equity_quote(&self, symbol: &str) -> EngineResult<EquityQuote>;
}
