// =============================================================================
// Provider quote stream — WebSocket feed into the cache and bar aggregator
// =============================================================================
//
// Connects to the data provider's streaming endpoint, subscribes to the
// currently cached symbol set, and folds each tick into the quote cache and
// the bar aggregator. Runs until the stream disconnects or errors, then
// returns so the caller (main.rs) can handle reconnection with a delay.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::market_data::{BarAggregator, QuoteCache};

/// A parsed tick from the provider stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub size: f64,
    pub at: DateTime<Utc>,
}

/// Parse a provider quote message.
///
/// Expected shape:
/// ```json
/// { "type": "quote", "symbol": "SPY", "last": 694.5, "bid": 694.49,
///   "ask": 694.51, "size": 100, "ts": 1718546400000 }
/// ```
/// Non-quote frames (heartbeats, acks) return `Ok(None)`.
pub fn parse_tick(text: &str) -> Result<Option<Tick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse quote JSON")?;

    match root.get("type").and_then(|v| v.as_str()) {
        Some("quote") => {}
        _ => return Ok(None),
    }

    let symbol = root["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_uppercase();
    let last = root["last"].as_f64().context("missing field last")?;
    let bid = root["bid"].as_f64().unwrap_or(0.0);
    let ask = root["ask"].as_f64().unwrap_or(0.0);
    let size = root["size"].as_f64().unwrap_or(0.0);

    let at = match root["ts"].as_i64() {
        Some(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .context("out-of-range tick timestamp")?,
        None => Utc::now(),
    };

    Ok(Some(Tick {
        symbol,
        last,
        bid,
        ask,
        size,
        at,
    }))
}

/// Build the subscription frame for the given symbols.
pub fn subscribe_frame(symbols: &[String]) -> String {
    serde_json::json!({
        "action": "subscribe",
        "symbols": symbols,
    })
    .to_string()
}

/// Connect to the provider stream and feed ticks until disconnect.
pub async fn run_quote_stream(
    url: &str,
    cache: &Arc<QuoteCache>,
    bars: &Arc<BarAggregator>,
) -> Result<()> {
    info!(url, "connecting to quote WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to quote WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let symbols = cache.subscribed_symbols();
    if !symbols.is_empty() {
        write
            .send(Message::Text(subscribe_frame(&symbols)))
            .await
            .context("failed to send subscribe frame")?;
        info!(count = symbols.len(), "quote subscriptions sent");
    }

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_tick(&text) {
                Ok(Some(tick)) => {
                    debug!(symbol = %tick.symbol, last = tick.last, "tick");
                    cache.ingest(&tick.symbol, tick.last, tick.bid, tick.ask, tick.at);
                    bars.ingest_tick(&tick.symbol, tick.last, tick.size, tick.at);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to parse quote message"),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => {
                warn!("quote WebSocket closed by server");
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(e).context("quote WebSocket read error");
            }
            None => {
                warn!("quote WebSocket stream ended");
                return Ok(());
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

    #[test]
    fn parse_quote_message() {
        let json = r#"{
            "type": "quote", "symbol": "spy", "last": 694.5,
            "bid": 694.49, "ask": 694.51, "size": 100, "ts": 1718546400000
        }"#;
        let tick = parse_tick(json).unwrap().expect("quote frame");
        assert_eq!(tick.symbol, "SPY");
        assert!((tick.last - 694.5).abs() < 1e-10);
        assert!((tick.bid - 694.49).abs() < 1e-10);
        assert!((tick.size - 100.0).abs() < 1e-10);
        assert_eq!(tick.at.timestamp_millis(), 1_718_546_400_000);
    }

    #[test]
    fn non_quote_frames_skipped() {
        assert!(parse_tick(r#"{"type":"heartbeat"}"#).unwrap().is_none());
        assert!(parse_tick(r#"{"action":"subscribed"}"#).unwrap().is_none());
    }

    #[test]
    fn malformed_json_errors() {
        assert!(parse_tick("not json").is_err());
        assert!(parse_tick(r#"{"type":"quote","last":1.0}"#).is_err());
    }

    #[test]
    fn subscribe_frame_lists_symbols() {
        let frame = subscribe_frame(&["SPY".to_string(), "QQQ".to_string()]);
        assert!(frame.contains("subscribe"));
        assert!(frame.contains("SPY"));
        assert!(frame.contains("QQQ"));
    }
}
