// =============================================================================
// Quote Streaming Cache
// =============================================================================
//
// Holds the freshest bid/ask/last per subscribed symbol. A symbol is
// subscribed iff it appears in an open trade or an enabled strategy; quotes
// for unsubscribed symbols are dropped at the door. Reads distinguish fresh,
// stale (older than the staleness window), and missing entries so callers can
// fall back to a REST snapshot.
//
// Single writer per symbol (the stream task), any number of readers.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

/// Most recent quote for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub received_at: DateTime<Utc>,
}

impl Quote {
    /// Midpoint of bid/ask, falling back to last when the book is one-sided.
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.last
        }
    }
}

/// Result of a cache read.
#[derive(Debug, Clone)]
pub enum CacheRead {
    Fresh(Quote),
    Stale(Quote),
    Miss,
}

impl CacheRead {
    /// The quote regardless of freshness, if any.
    pub fn any(self) -> Option<Quote> {
        match self {
            Self::Fresh(q) | Self::Stale(q) => Some(q),
            Self::Miss => None,
        }
    }

    /// Only a fresh quote.
    pub fn fresh(self) -> Option<Quote> {
        match self {
            Self::Fresh(q) => Some(q),
            _ => None,
        }
    }
}

struct Inner {
    quotes: HashMap<String, Quote>,
    subscriptions: HashMap<String, u32>,
}

/// Thread-safe quote cache with reference-counted subscriptions.
pub struct QuoteCache {
    inner: RwLock<Inner>,
    stale_after: Duration,
}

impl QuoteCache {
    pub fn new(stale_secs: i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                quotes: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            stale_after: Duration::seconds(stale_secs),
        }
    }

    /// Add a subscription reference for `symbol`.
    pub fn subscribe(&self, symbol: &str) {
        let mut inner = self.inner.write();
        let count = inner.subscriptions.entry(symbol.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(symbol, "quote subscription opened");
        }
    }

    /// Drop one subscription reference; the entry is evicted when the last
    /// reference goes away.
    pub fn unsubscribe(&self, symbol: &str) {
        let mut inner = self.inner.write();
        let remove = match inner.subscriptions.get_mut(symbol) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            inner.subscriptions.remove(symbol);
            inner.quotes.remove(symbol);
            debug!(symbol, "quote subscription closed");
        }
    }

    /// Symbols currently carrying at least one subscription.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.inner.read().subscriptions.keys().cloned().collect()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.inner.read().subscriptions.contains_key(symbol)
    }

    /// Store a quote for a subscribed symbol. Quotes for unsubscribed symbols
    /// are dropped.
    pub fn ingest(&self, symbol: &str, last: f64, bid: f64, ask: f64, at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        if !inner.subscriptions.contains_key(symbol) {
            return;
        }
        inner.quotes.insert(
            symbol.to_string(),
            Quote {
                last,
                bid,
                ask,
                received_at: at,
            },
        );
    }

    /// Read the cached quote for `symbol`, classified by freshness at `now`.
    pub fn get_at(&self, symbol: &str, now: DateTime<Utc>) -> CacheRead {
        let inner = self.inner.read();
        match inner.quotes.get(symbol) {
            Some(quote) => {
                if now - quote.received_at > self.stale_after {
                    CacheRead::Stale(quote.clone())
                } else {
                    CacheRead::Fresh(quote.clone())
                }
            }
            None => CacheRead::Miss,
        }
    }

    /// Read the cached quote classified against the current clock.
    pub fn get(&self, symbol: &str) -> CacheRead {
        self.get_at(symbol, Utc::now())
    }
}
