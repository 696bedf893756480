// =============================================================================
// Market Data Module
// =============================================================================
//
// Streaming quote cache, aligned bar aggregation, and the provider WebSocket
// feed. Bars carry UTC timestamps; session-anchored consumers convert to the
// market zone at the point of decision.

pub mod bar_builder;
pub mod quote_cache;
pub mod stream;

pub use bar_builder::{Bar, BarAggregator, BarKey};
pub use quote_cache::{CacheRead, Quote, QuoteCache};

// =============================================================================
// Shared test constructors
// =============================================================================
#[cfg(test)]
pub mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::Bar;
    use crate::session::MARKET_TZ;

    /// Fixed reference session used across indicator and engine tests:
    /// Monday 2025-06-16, a regular trading day.
    pub fn market_utc(hour: u32, minute: u32) -> DateTime<Utc> {
        MARKET_TZ
            .with_ymd_and_hms(2025, 6, 16, hour, minute, 0)
            .single()
            .expect("unambiguous test time")
            .with_timezone(&Utc)
    }

    /// Bar with explicit OHLC at a fixed mid-session time, volume 100.
    pub fn bar_ohlc(open: f64, high: f64, low: f64, close: f64) -> Bar {
        let t = market_utc(10, 0);
        Bar {
            open_time: t,
            close_time: t + Duration::minutes(1),
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    /// Bar at market time `h:m` with the given high/low; open/close at mid.
    pub fn bar_hl(h: u32, m: u32, high: f64, low: f64) -> Bar {
        let t = market_utc(h, m);
        let mid = (high + low) / 2.0;
        Bar {
            open_time: t,
            close_time: t + Duration::minutes(1),
            open: mid,
            high,
            low,
            close: mid,
            volume: 100.0,
        }
    }

    /// Flat bar at market time `h:m` closing at `close`, volume 100.
    pub fn session_bar(h: u32, m: u32, close: f64) -> Bar {
        session_bar_with_volume(h, m, close, close, close, close, 100.0)
    }

    /// Fully specified bar at market time `h:m`.
    pub fn session_bar_with_volume(
        h: u32,
        m: u32,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Bar {
        let t = market_utc(h, m);
        Bar {
            open_time: t,
            close_time: t + Duration::minutes(1),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Flat mid-session bar carrying only a volume of interest.
    pub fn bar_with_volume(volume: f64) -> Bar {
        session_bar_with_volume(10, 0, 100.0, 100.0, 100.0, 100.0, volume)
    }

    /// Fully specified bar `offset_min` minutes after the 09:30 session open.
    pub fn offset_bar(
        offset_min: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Bar {
        let t = market_utc(9, 30) + Duration::minutes(offset_min);
        Bar {
            open_time: t,
            close_time: t + Duration::minutes(1),
            open,
            high,
            low,
            close,
            volume,
        }
    }
}
