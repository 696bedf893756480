// =============================================================================
// Event Bus — in-process fan-out of trade/alert lifecycle events
// =============================================================================
//
// Publish is non-blocking. Every subscriber owns a bounded buffer (default
// 256); when a slow subscriber overflows, its oldest messages are dropped and
// a counter is incremented. Subscribers are independent: one lagging
// dashboard never blocks the engine.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::Trade;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER: usize = 256;

/// Lifecycle event names carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    TradeCreated,
    TradeFilled,
    TradeClosed,
    TradeCancelled,
    AlertReceived,
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TradeCreated => "trade_created",
            Self::TradeFilled => "trade_filled",
            Self::TradeClosed => "trade_closed",
            Self::TradeCancelled => "trade_cancelled",
            Self::AlertReceived => "alert_received",
        };
        f.write_str(s)
    }
}

/// One published message.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event_name: EventName,
    pub payload: serde_json::Value,
}

/// Payload carrying enough to reconstruct the trade row without a round-trip.
pub fn trade_payload(trade: &Trade) -> serde_json::Value {
    serde_json::json!({
        "trade_id": trade.id,
        "direction": trade.direction,
        "symbol": trade.option_symbol,
        "ticker": trade.ticker,
        "strike": trade.strike,
        "status": trade.status,
        "quantity": trade.quantity,
        "exit_reason": trade.exit_reason,
        "pnl_dollars": trade.pnl_dollars,
    })
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish without blocking. With no subscribers the event is discarded.
    pub fn publish(&self, event_name: EventName, payload: serde_json::Value) {
        let event = BusEvent {
            event_name,
            payload,
        };
        debug!(event = %event_name, "bus publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    /// Total messages dropped across all subscribers since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

pub struct BusSubscriber {
    rx: broadcast::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl BusSubscriber {
    /// Receive the next event. Buffer overflow drops the oldest messages,
    /// counts them, and keeps receiving. Returns `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for polling consumers.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EventName::TradeCreated, serde_json::json!({"trade_id": "t1"}));

        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.event_name, EventName::TradeCreated);
        assert_eq!(eb.payload["trade_id"], "t1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EventName::AlertReceived, serde_json::Value::Null);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();

        for i in 0..10 {
            bus.publish(EventName::TradeFilled, serde_json::json!({ "i": i }));
        }

        // The first received message is no longer 0 — oldest were dropped.
        let first = sub.recv().await.unwrap();
        assert!(first.payload["i"].as_i64().unwrap() > 0);
        assert!(bus.dropped_count() > 0);
    }

    #[tokio::test]
    async fn try_recv_empty_returns_none() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
        bus.publish(EventName::TradeClosed, serde_json::Value::Null);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }
}
