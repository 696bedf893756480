// =============================================================================
// Risk Gate — ordered pre-trade admission predicates
// =============================================================================
//
// Predicates run in a fixed order; the first failure rejects the alert with a
// stable reason code. Secret and ticker checks apply to every action;
// window/VIX/calendar/cap checks gate new entries only, and the open-position
// check applies to CLOSE alerts.
//
// The gate returns a decision variant instead of throwing: only store
// failures propagate as errors.
// =============================================================================

use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::api::auth::constant_time_eq;
use crate::broker::BrokerClient;
use crate::config::{AppConfig, Overrides};
use crate::error::EngineResult;
use crate::market_data::QuoteCache;
use crate::session::{self, EventCalendar};
use crate::store::TradeStore;
use crate::types::{AlertAction, AlertSource};

// Stable reason codes (spec'd wire values — keep in sync with the dashboard).
pub const REASON_INVALID_SECRET: &str = "invalid_secret";
pub const REASON_TICKER_NOT_ALLOWED: &str = "ticker_not_allowed";
pub const REASON_OUTSIDE_SESSION_WINDOW: &str = "outside_session_window";
pub const REASON_VIX_CIRCUIT_BREAKER: &str = "vix_circuit_breaker";
pub const REASON_EVENT_DAY_BLOCK: &str = "event_day_block";
pub const REASON_DAILY_TRADE_LIMIT: &str = "daily_trade_limit";
pub const REASON_CONSECUTIVE_LOSS_LIMIT: &str = "consecutive_loss_limit";
pub const REASON_DAILY_LOSS_LIMIT: &str = "daily_loss_limit";
pub const REASON_NO_OPEN_TRADE: &str = "no_open_trade";

/// Outcome of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Rejected(&'static str),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Everything the gate needs to know about one alert.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub action: AlertAction,
    pub ticker: &'a str,
    pub source: AlertSource,
    pub provided_secret: Option<&'a str>,
    /// Skip the secret check (already verified at the HTTP layer, or the
    /// alert was synthesized internally).
    pub skip_secret: bool,
}

pub struct RiskGate {
    config: Arc<AppConfig>,
    calendar: EventCalendar,
}

impl RiskGate {
    pub fn new(config: Arc<AppConfig>, calendar: EventCalendar) -> Self {
        Self { config, calendar }
    }

    /// Run the ordered predicates for one alert at `now` (market local).
    pub async fn evaluate(
        &self,
        input: GateInput<'_>,
        store: &TradeStore,
        quotes: &QuoteCache,
        broker: &Arc<dyn BrokerClient>,
        overrides: Overrides,
        now: DateTime<Tz>,
    ) -> EngineResult<GateDecision> {
        // 1. Secret (external alerts only).
        if input.source == AlertSource::External && !input.skip_secret {
            let provided = input.provided_secret.unwrap_or("");
            if !constant_time_eq(provided.as_bytes(), self.config.webhook_secret.as_bytes()) {
                return Ok(GateDecision::Rejected(REASON_INVALID_SECRET));
            }
        }

        // 2. Ticker allow-list.
        if !self
            .config
            .allowed_tickers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(input.ticker))
        {
            return Ok(GateDecision::Rejected(REASON_TICKER_NOT_ALLOWED));
        }

        let today = session::session_date(now);

        if input.action == AlertAction::Close {
            // 9. A CLOSE needs something to close.
            return Ok(match store.most_recent_open_trade().await? {
                Some(_) => GateDecision::Allowed,
                None => GateDecision::Rejected(REASON_NO_OPEN_TRADE),
            });
        }

        // 3. Session window (operator override bypasses).
        if !overrides.ignore_session_windows
            && !session::in_session_windows(&self.config.session_windows, now.time())
        {
            return Ok(GateDecision::Rejected(REASON_OUTSIDE_SESSION_WINDOW));
        }

        // 4. VIX circuit breaker. Stream first, REST fallback; unreadable VIX
        // permits (fail open).
        if let Some(vix) = self.read_vix(quotes, broker).await {
            if vix >= self.config.vix_threshold {
                warn!(vix, threshold = self.config.vix_threshold, "VIX circuit breaker tripped");
                return Ok(GateDecision::Rejected(REASON_VIX_CIRCUIT_BREAKER));
            }
        }

        // 5. Blocked event-calendar afternoon.
        if self.calendar.is_blocked(today)
            && session::at_or_past(now, &self.config.afternoon_cutoff)
        {
            return Ok(GateDecision::Rejected(REASON_EVENT_DAY_BLOCK));
        }

        // 6. Daily trade cap (cancelled trades do not count).
        let trades_today = store.count_trades_for_date(today).await?;
        if trades_today >= i64::from(self.config.daily_trade_cap) {
            return Ok(GateDecision::Rejected(REASON_DAILY_TRADE_LIMIT));
        }

        // 7. Consecutive-loss cap.
        let losses = store.consecutive_losses(today).await?;
        if losses >= i64::from(self.config.consecutive_loss_cap) {
            return Ok(GateDecision::Rejected(REASON_CONSECUTIVE_LOSS_LIMIT));
        }

        // 8. Daily loss cap.
        let pnl = store.daily_pnl(today).await?;
        if pnl <= -self.config.daily_loss_cap_dollars {
            return Ok(GateDecision::Rejected(REASON_DAILY_LOSS_LIMIT));
        }

        debug!(ticker = input.ticker, action = %input.action, "gate passed");
        Ok(GateDecision::Allowed)
    }

    async fn read_vix(&self, quotes: &QuoteCache, broker: &Arc<dyn BrokerClient>) -> Option<f64> {
        if let Some(quote) = quotes.get("VIX").fresh() {
            return Some(quote.last);
        }
        match broker.equity_quote("VIX").await {
            Ok(quote) => Some(quote.last),
            Err(e) => {
                warn!(error = %e, "VIX unreadable — circuit breaker fails open");
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::broker::{EquityQuote, SimBroker};
    use crate::session::MARKET_TZ;
    use crate::types::Direction;

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.webhook_secret = "hunter2".to_string();
        cfg.daily_trade_cap = 2;
        cfg.consecutive_loss_cap = 1;
        cfg.daily_loss_cap_dollars = 50.0;
        cfg
    }

    fn mid_session() -> DateTime<Tz> {
        MARKET_TZ.with_ymd_and_hms(2025, 6, 16, 10, 30, 0).single().unwrap()
    }

    fn buy_input(secret: Option<&'static str>) -> GateInput<'static> {
        GateInput {
            action: AlertAction::BuyCall,
            ticker: "SPY",
            source: AlertSource::External,
            provided_secret: secret,
            skip_secret: false,
        }
    }

    struct Harness {
        gate: RiskGate,
        store: TradeStore,
        quotes: QuoteCache,
        broker: Arc<dyn BrokerClient>,
        sim: Arc<SimBroker>,
    }

    async fn harness(cfg: AppConfig) -> Harness {
        let sim = Arc::new(SimBroker::new());
        sim.set_quote(
            "VIX",
            EquityQuote {
                last: 15.0,
                bid: 0.0,
                ask: 0.0,
                change: 0.0,
                change_percent: 0.0,
            },
        );
        let broker: Arc<dyn BrokerClient> = sim.clone();
        Harness {
            gate: RiskGate::new(Arc::new(cfg), EventCalendar::default()),
            store: TradeStore::in_memory().await.unwrap(),
            quotes: QuoteCache::new(5),
            broker,
            sim,
        }
    }

    async fn decide(h: &Harness, input: GateInput<'_>, now: DateTime<Tz>) -> GateDecision {
        decide_with(h, input, now, Overrides::default()).await
    }

    async fn decide_with(
        h: &Harness,
        input: GateInput<'_>,
        now: DateTime<Tz>,
        overrides: Overrides,
    ) -> GateDecision {
        h.gate
            .evaluate(input, &h.store, &h.quotes, &h.broker, overrides, now)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_allows() {
        let h = harness(config()).await;
        assert!(decide(&h, buy_input(Some("hunter2")), mid_session()).await.is_allowed());
    }

    #[tokio::test]
    async fn wrong_secret_rejected_first() {
        let h = harness(config()).await;
        assert_eq!(
            decide(&h, buy_input(Some("wrong")), mid_session()).await,
            GateDecision::Rejected(REASON_INVALID_SECRET)
        );
        assert_eq!(
            decide(&h, buy_input(None), mid_session()).await,
            GateDecision::Rejected(REASON_INVALID_SECRET)
        );
    }

    #[tokio::test]
    async fn internal_alerts_skip_secret() {
        let h = harness(config()).await;
        let input = GateInput {
            source: AlertSource::InternalStrategy,
            provided_secret: None,
            ..buy_input(None)
        };
        assert!(decide(&h, input, mid_session()).await.is_allowed());
    }

    #[tokio::test]
    async fn unknown_ticker_rejected() {
        let h = harness(config()).await;
        let input = GateInput {
            ticker: "TSLA",
            ..buy_input(Some("hunter2"))
        };
        assert_eq!(
            decide(&h, input, mid_session()).await,
            GateDecision::Rejected(REASON_TICKER_NOT_ALLOWED)
        );
    }

    #[tokio::test]
    async fn outside_window_rejected_unless_overridden() {
        let h = harness(config()).await;
        let premarket = MARKET_TZ.with_ymd_and_hms(2025, 6, 16, 8, 0, 0).single().unwrap();
        assert_eq!(
            decide(&h, buy_input(Some("hunter2")), premarket).await,
            GateDecision::Rejected(REASON_OUTSIDE_SESSION_WINDOW)
        );

        let overrides = Overrides {
            ignore_session_windows: true,
            market_exits: false,
        };
        assert!(decide_with(&h, buy_input(Some("hunter2")), premarket, overrides)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn vix_breaker_from_cached_quote() {
        let h = harness(config()).await;
        h.quotes.subscribe("VIX");
        h.quotes.ingest("VIX", 32.1, 0.0, 0.0, chrono::Utc::now());

        assert_eq!(
            decide(&h, buy_input(Some("hunter2")), mid_session()).await,
            GateDecision::Rejected(REASON_VIX_CIRCUIT_BREAKER)
        );
    }

    #[tokio::test]
    async fn vix_read_failure_fails_open() {
        let h = harness(config()).await;
        // No cached VIX, and the broker call errors.
        h.sim.fail_transient_once();
        assert!(decide(&h, buy_input(Some("hunter2")), mid_session()).await.is_allowed());
    }

    #[tokio::test]
    async fn blocked_afternoon_rejected_after_cutoff() {
        let mut h = harness(config()).await;
        let today = chrono::NaiveDate::from_ymd_opt(2025, 6, 16).unwrap();
        h.gate = RiskGate::new(Arc::new(config()), EventCalendar::from_dates([today]));

        let morning = MARKET_TZ.with_ymd_and_hms(2025, 6, 16, 10, 0, 0).single().unwrap();
        let afternoon = MARKET_TZ.with_ymd_and_hms(2025, 6, 16, 13, 0, 0).single().unwrap();

        assert!(decide(&h, buy_input(Some("hunter2")), morning).await.is_allowed());
        assert_eq!(
            decide(&h, buy_input(Some("hunter2")), afternoon).await,
            GateDecision::Rejected(REASON_EVENT_DAY_BLOCK)
        );
    }

    #[tokio::test]
    async fn close_without_open_trade_rejected() {
        let h = harness(config()).await;
        let input = GateInput {
            action: AlertAction::Close,
            ..buy_input(Some("hunter2"))
        };
        assert_eq!(
            decide(&h, input, mid_session()).await,
            GateDecision::Rejected(REASON_NO_OPEN_TRADE)
        );
    }

    #[tokio::test]
    async fn rejection_is_idempotent() {
        // Re-submitting the same rejected alert yields the same reason.
        let h = harness(config()).await;
        let first = decide(&h, buy_input(Some("wrong")), mid_session()).await;
        let second = decide(&h, buy_input(Some("wrong")), mid_session()).await;
        assert_eq!(first, second);
        assert_eq!(first, GateDecision::Rejected(REASON_INVALID_SECRET));
    }
}
