// =============================================================================
// Bar Aggregator — aligned N-minute OHLCV bars per symbol
// =============================================================================
//
// Consumes ticks (or already-built minute bars) and maintains, per
// (symbol, timeframe), one in-progress bar plus a ring of the most recent
// completed bars. A bar completes when the wall clock in the market's local
// zone crosses its boundary — completion is clock-driven, not tick-driven, so
// quiet symbols still close their bars on time via `close_due_bars`.
//
// Bar-close handlers run exactly once per completed bar, after the ring has
// been updated, and are invoked outside the internal lock.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session;
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar. Timestamps are UTC; `open_time` is the aligned bar
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Composite key identifying a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Callback invoked with the completed bar for its key.
pub type BarCloseHandler = Arc<dyn Fn(&BarKey, &Bar) + Send + Sync>;

struct Series {
    completed: VecDeque<Bar>,
    partial: Option<Bar>,
}

impl Series {
    fn new() -> Self {
        Self {
            completed: VecDeque::new(),
            partial: None,
        }
    }
}

struct Inner {
    series: HashMap<BarKey, Series>,
    handlers: HashMap<BarKey, Vec<(u64, BarCloseHandler)>>,
    next_handler_id: u64,
}

// ---------------------------------------------------------------------------
// BarAggregator
// ---------------------------------------------------------------------------

/// Thread-safe aggregator holding at most `max_bars` completed bars per key.
pub struct BarAggregator {
    inner: RwLock<Inner>,
    max_bars: usize,
}

impl BarAggregator {
    pub fn new(max_bars: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                series: HashMap::new(),
                handlers: HashMap::new(),
                next_handler_id: 1,
            }),
            max_bars,
        }
    }

    /// Start maintaining a bar series for `key` (idempotent).
    pub fn track(&self, key: BarKey) {
        self.inner.write().series.entry(key).or_insert_with(Series::new);
    }

    /// Stop maintaining a series and drop its handlers.
    pub fn untrack(&self, key: &BarKey) {
        let mut inner = self.inner.write();
        inner.series.remove(key);
        inner.handlers.remove(key);
    }

    /// Register a bar-close handler for `key`. Returns an id for removal.
    pub fn on_bar_close(&self, key: BarKey, handler: BarCloseHandler) -> u64 {
        let mut inner = self.inner.write();
        let id = inner.next_handler_id;
        inner.next_handler_id += 1;
        inner.handlers.entry(key).or_default().push((id, handler));
        id
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, id: u64) {
        let mut inner = self.inner.write();
        for handlers in inner.handlers.values_mut() {
            handlers.retain(|(hid, _)| *hid != id);
        }
    }

    /// Fold a tick into every tracked series for `symbol`. A tick landing past
    /// the current partial's window first completes that bar.
    pub fn ingest_tick(&self, symbol: &str, price: f64, size: f64, at: DateTime<Utc>) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }

        let mut fired: Vec<(BarKey, Bar)> = Vec::new();
        {
            let mut inner = self.inner.write();
            let keys: Vec<BarKey> = inner
                .series
                .keys()
                .filter(|k| k.symbol == symbol)
                .cloned()
                .collect();

            for key in keys {
                let boundary = aligned_open(at, key.timeframe);
                let series = inner.series.get_mut(&key).expect("key just listed");

                match series.partial.as_mut() {
                    Some(partial) if partial.open_time == boundary => {
                        partial.high = partial.high.max(price);
                        partial.low = partial.low.min(price);
                        partial.close = price;
                        partial.volume += size;
                    }
                    _ => {
                        if let Some(done) = series.partial.take() {
                            push_completed(series, done.clone(), self.max_bars);
                            fired.push((key.clone(), done));
                        }
                        series.partial = Some(Bar {
                            open_time: boundary,
                            close_time: boundary
                                + Duration::minutes(i64::from(key.timeframe.minutes())),
                            open: price,
                            high: price,
                            low: price,
                            close: price,
                            volume: size,
                        });
                    }
                }
            }
        }

        self.fire(&fired);
    }

    /// Fold an externally built minute bar into every tracked series for its
    /// symbol. Used when the provider delivers bars instead of raw ticks.
    pub fn ingest_minute_bar(&self, symbol: &str, minute: &Bar) {
        let mut fired: Vec<(BarKey, Bar)> = Vec::new();
        {
            let mut inner = self.inner.write();
            let keys: Vec<BarKey> = inner
                .series
                .keys()
                .filter(|k| k.symbol == symbol)
                .cloned()
                .collect();

            for key in keys {
                let boundary = aligned_open(minute.open_time, key.timeframe);
                let series = inner.series.get_mut(&key).expect("key just listed");

                match series.partial.as_mut() {
                    Some(partial) if partial.open_time == boundary => {
                        partial.high = partial.high.max(minute.high);
                        partial.low = partial.low.min(minute.low);
                        partial.close = minute.close;
                        partial.volume += minute.volume;
                    }
                    _ => {
                        if let Some(done) = series.partial.take() {
                            push_completed(series, done.clone(), self.max_bars);
                            fired.push((key.clone(), done));
                        }
                        series.partial = Some(Bar {
                            open_time: boundary,
                            close_time: boundary
                                + Duration::minutes(i64::from(key.timeframe.minutes())),
                            open: minute.open,
                            high: minute.high,
                            low: minute.low,
                            close: minute.close,
                            volume: minute.volume,
                        });
                    }
                }
            }
        }

        self.fire(&fired);
    }

    /// Complete every partial bar whose window has ended as of `now`. Returns
    /// the completed (key, bar) pairs after firing their handlers.
    pub fn close_due_bars(&self, now: DateTime<Utc>) -> Vec<(BarKey, Bar)> {
        let mut fired: Vec<(BarKey, Bar)> = Vec::new();
        {
            let mut inner = self.inner.write();
            let due: Vec<BarKey> = inner
                .series
                .iter()
                .filter_map(|(key, series)| {
                    series
                        .partial
                        .as_ref()
                        .filter(|p| now >= p.close_time)
                        .map(|_| key.clone())
                })
                .collect();

            for key in due {
                let series = inner.series.get_mut(&key).expect("key just listed");
                if let Some(done) = series.partial.take() {
                    push_completed(series, done.clone(), self.max_bars);
                    fired.push((key, done));
                }
            }
        }

        self.fire(&fired);
        fired
    }

    /// The most recent `n` completed bars for `key`, oldest first.
    pub fn last_bars(&self, key: &BarKey, n: usize) -> Vec<Bar> {
        let inner = self.inner.read();
        match inner.series.get(key) {
            Some(series) => {
                let start = series.completed.len().saturating_sub(n);
                series.completed.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent completed bar, if any.
    pub fn last_close(&self, key: &BarKey) -> Option<f64> {
        let inner = self.inner.read();
        inner
            .series
            .get(key)
            .and_then(|s| s.completed.back().map(|b| b.close))
    }

    /// Number of completed bars held for `key`.
    pub fn completed_count(&self, key: &BarKey) -> usize {
        let inner = self.inner.read();
        inner.series.get(key).map_or(0, |s| s.completed.len())
    }

    /// Invoke registered handlers for completed bars, outside the lock.
    fn fire(&self, completed: &[(BarKey, Bar)]) {
        if completed.is_empty() {
            return;
        }
        for (key, bar) in completed {
            debug!(key = %key, close = bar.close, "bar completed");
            let handlers: Vec<BarCloseHandler> = {
                let inner = self.inner.read();
                inner
                    .handlers
                    .get(key)
                    .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default()
            };
            for handler in handlers {
                handler(key, bar);
            }
        }
    }
}

fn push_completed(series: &mut Series, bar: Bar, max_bars: usize) {
    series.completed.push_back(bar);
    while series.completed.len() > max_bars {
        series.completed.pop_front();
    }
}

/// Aligned bar-open boundary for an instant, computed in market local time.
fn aligned_open(at: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let local = at.with_timezone(&session::MARKET_TZ);
    session::bar_open(local, timeframe).with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
