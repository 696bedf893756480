// =============================================================================
// Broker REST API Client — bearer-token authenticated order routing
// =============================================================================
//
// SECURITY: the access token is never logged or serialized. Every request
// carries a deadline; timeouts, connection failures, 429s and 5xx responses
// map to TransientBroker (retryable), other non-success statuses map to
// PermanentBroker.
// =============================================================================

use std::time::Duration;

use chrono::NaiveDateTime;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::broker::{BrokerClient, ChainEntry, EquityQuote, OrderStatusReport};
use crate::error::{EngineError, EngineResult};
use crate::types::{Direction, OrderState};

/// REST broker client.
#[derive(Clone)]
pub struct RestBroker {
    base_url: String,
    account_id: String,
    client: reqwest::Client,
}

impl RestBroker {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `RestBroker`.
    ///
    /// # Arguments
    /// * `base_url`   — broker API root, no trailing slash.
    /// * `account_id` — trading account identifier.
    /// * `token`      — bearer access token, sent as a default header.
    /// * `deadline`   — per-request timeout applied to every call.
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        token: &str,
        deadline: Duration,
    ) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {token}")) {
            default_headers.insert(reqwest::header::AUTHORIZATION, val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(deadline)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            account_id: account_id.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Map a reqwest failure to the engine's transient error kind. Timeouts,
    /// DNS and connection errors are all retryable.
    fn transport_error(context: &str, e: reqwest::Error) -> EngineError {
        EngineError::TransientBroker(format!("{context}: {e}"))
    }

    /// Classify a non-success HTTP status.
    fn status_error(context: &str, status: reqwest::StatusCode, body: &str) -> EngineError {
        if status.is_server_error() || status.as_u16() == 429 {
            EngineError::TransientBroker(format!("{context}: {status}: {body}"))
        } else {
            EngineError::PermanentBroker(format!("{context}: {status}: {body}"))
        }
    }

    async fn post_order(&self, body: serde_json::Value) -> EngineResult<String> {
        let url = format!("{}/v1/accounts/{}/orders", self.base_url, self.account_id);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error("order placement", e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Self::transport_error("order response body", e))?;

        if !status.is_success() {
            return Err(Self::status_error("order placement", status, &text));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::PermanentBroker(format!("unparseable order response: {e}")))?;

        parsed["order_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                EngineError::PermanentBroker("order response missing order_id".to_string())
            })
    }

    async fn get_json(&self, url: &str, context: &str) -> EngineResult<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::transport_error(context, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Self::transport_error(context, e))?;

        if !status.is_success() {
            return Err(Self::status_error(context, status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| EngineError::PermanentBroker(format!("{context}: unparseable body: {e}")))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_f64(val: &serde_json::Value) -> Option<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().ok()
        } else {
            val.as_f64()
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for RestBroker {
    #[instrument(skip(self, price), name = "broker::place_limit_entry")]
    async fn place_limit_entry(
        &self,
        symbol: &str,
        qty: i64,
        price: f64,
    ) -> EngineResult<String> {
        debug!(symbol, qty, price, "placing limit entry");
        self.post_order(json!({
            "orderType": "LIMIT",
            "session": "NORMAL",
            "duration": "DAY",
            "price": format!("{price:.2}"),
            "orderLegCollection": [{
                "instruction": "BUY_TO_OPEN",
                "quantity": qty,
                "instrument": { "symbol": symbol, "assetType": "OPTION" },
            }],
        }))
        .await
    }

    #[instrument(skip(self, stop_price), name = "broker::place_stop_exit")]
    async fn place_stop_exit(
        &self,
        symbol: &str,
        qty: i64,
        stop_price: f64,
    ) -> EngineResult<String> {
        debug!(symbol, qty, stop_price, "placing stop exit");
        self.post_order(json!({
            "orderType": "STOP",
            "session": "NORMAL",
            "duration": "DAY",
            "stopPrice": format!("{stop_price:.2}"),
            "orderLegCollection": [{
                "instruction": "SELL_TO_CLOSE",
                "quantity": qty,
                "instrument": { "symbol": symbol, "assetType": "OPTION" },
            }],
        }))
        .await
    }

    #[instrument(skip(self), name = "broker::place_market_exit")]
    async fn place_market_exit(&self, symbol: &str, qty: i64) -> EngineResult<String> {
        debug!(symbol, qty, "placing market exit");
        self.post_order(json!({
            "orderType": "MARKET",
            "session": "NORMAL",
            "duration": "DAY",
            "orderLegCollection": [{
                "instruction": "SELL_TO_CLOSE",
                "quantity": qty,
                "instrument": { "symbol": symbol, "assetType": "OPTION" },
            }],
        }))
        .await
    }

    #[instrument(skip(self), name = "broker::cancel")]
    async fn cancel(&self, order_id: &str) -> EngineResult<()> {
        let url = format!(
            "{}/v1/accounts/{}/orders/{}",
            self.base_url, self.account_id, order_id
        );

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("order cancel", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::status_error("order cancel", status, &text));
        }

        debug!(order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::order_status")]
    async fn order_status(&self, order_id: &str) -> EngineResult<OrderStatusReport> {
        let url = format!(
            "{}/v1/accounts/{}/orders/{}",
            self.base_url, self.account_id, order_id
        );
        let body = self.get_json(&url, "order status").await?;

        let state = match body["status"].as_str().unwrap_or_default() {
            "WORKING" | "QUEUED" | "ACCEPTED" | "PENDING_ACTIVATION" => OrderState::Working,
            "FILLED" => OrderState::Filled,
            "CANCELED" | "CANCELLED" => OrderState::Cancelled,
            "REJECTED" => OrderState::Rejected,
            "EXPIRED" => OrderState::Expired,
            other => {
                warn!(order_id, status = other, "unrecognised order status — treated as WORKING");
                OrderState::Working
            }
        };

        let filled_price = Self::parse_f64(&body["filled_price"]);
        let filled_at = body["filled_at"]
            .as_str()
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok());

        Ok(OrderStatusReport {
            state,
            filled_price,
            filled_at,
        })
    }

    #[instrument(skip(self), name = "broker::option_chain")]
    async fn option_chain(
        &self,
        underlying: &str,
        direction: Direction,
        strike_count: u32,
        only_today: bool,
    ) -> EngineResult<Vec<ChainEntry>> {
        let contract_type = match direction {
            Direction::Call => "CALL",
            Direction::Put => "PUT",
        };
        let mut url = format!(
            "{}/v1/markets/chains?symbol={}&contractType={}&strikeCount={}",
            self.base_url, underlying, contract_type, strike_count
        );
        if only_today {
            let today = chrono::Utc::now().date_naive();
            url.push_str(&format!("&fromDate={today}&toDate={today}"));
        }

        let body = self.get_json(&url, "option chain").await?;
        let raw = body["contracts"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(raw.len());
        for item in &raw {
            let Some(symbol) = item["symbol"].as_str() else {
                warn!("skipping chain entry without symbol");
                continue;
            };
            entries.push(ChainEntry {
                symbol: symbol.to_string(),
                strike: Self::parse_f64(&item["strike"]).unwrap_or(0.0),
                bid: Self::parse_f64(&item["bid"]).unwrap_or(0.0),
                ask: Self::parse_f64(&item["ask"]).unwrap_or(0.0),
                delta: Self::parse_f64(&item["delta"]).unwrap_or(0.0),
            });
        }

        debug!(underlying, count = entries.len(), "option chain fetched");
        Ok(entries)
    }

    #[instrument(skip(self), name = "broker::equity_quote")]
    async fn equity_quote(&self, symbol: &str) -> EngineResult<EquityQuote> {
        let url = format!("{}/v1/markets/quotes/{}", self.base_url, symbol);
        let body = self.get_json(&url, "equity quote").await?;

        Ok(EquityQuote {
            last: Self::parse_f64(&body["last"]).unwrap_or(0.0),
            bid: Self::parse_f64(&body["bid"]).unwrap_or(0.0),
            ask: Self::parse_f64(&body["ask"]).unwrap_or(0.0),
            change: Self::parse_f64(&body["change"]).unwrap_or(0.0),
            change_percent: Self::parse_f64(&body["change_percent"]).unwrap_or(0.0),
        })
    }
}

impl std::fmt::Debug for RestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBroker")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .finish()
    }
}
