// =============================================================================
// Vega — intraday 0-DTE options trading engine, main entry point
// =============================================================================
//
// The engine starts against the simulated broker unless VEGA_BROKER_MODE=rest
// is set explicitly. Live order routing must be an operator decision.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod bus;
mod config;
mod contracts;
mod engine;
mod error;
mod indicators;
mod market_data;
mod risk;
mod session;
mod signals;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BrokerClient, RestBroker, SimBroker};
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::engine::scheduler::Scheduler;
use crate::engine::Engine;
use crate::market_data::{stream, BarAggregator, QuoteCache};
use crate::risk::RiskGate;
use crate::session::EventCalendar;
use crate::store::TradeStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Vega trading engine starting up");

    let config_path =
        std::env::var("VEGA_CONFIG").unwrap_or_else(|_| "vega_config.json".to_string());
    let config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config — using defaults");
        let mut cfg = AppConfig::default();
        cfg.apply_env();
        cfg
    });
    let config = Arc::new(config);

    info!(
        tickers = ?config.allowed_tickers,
        daily_trade_cap = config.daily_trade_cap,
        "configuration loaded"
    );

    // ── 2. Persistent store ──────────────────────────────────────────────
    let store = Arc::new(TradeStore::connect(&config.database_url).await?);

    // ── 3. Broker client ─────────────────────────────────────────────────
    let broker_mode = std::env::var("VEGA_BROKER_MODE").unwrap_or_else(|_| "sim".to_string());
    let broker: Arc<dyn BrokerClient> = match broker_mode.as_str() {
        "rest" => {
            let base_url = std::env::var("VEGA_BROKER_BASE_URL")
                .map_err(|_| anyhow::anyhow!("VEGA_BROKER_BASE_URL required in rest mode"))?;
            let account_id = std::env::var("VEGA_BROKER_ACCOUNT_ID")
                .map_err(|_| anyhow::anyhow!("VEGA_BROKER_ACCOUNT_ID required in rest mode"))?;
            let token = std::env::var("VEGA_BROKER_TOKEN")
                .map_err(|_| anyhow::anyhow!("VEGA_BROKER_TOKEN required in rest mode"))?;
            warn!("LIVE broker routing enabled (rest mode)");
            Arc::new(RestBroker::new(
                base_url,
                account_id,
                &token,
                Duration::from_secs(config.broker_deadline_secs),
            ))
        }
        _ => {
            info!("simulated broker in use (set VEGA_BROKER_MODE=rest for live routing)");
            Arc::new(SimBroker::new())
        }
    };

    // ── 4. Market data & shared state ────────────────────────────────────
    let quotes = Arc::new(QuoteCache::new(config.quote_stale_secs));
    let bars = Arc::new(BarAggregator::new(500));
    let bus = Arc::new(EventBus::default());
    let calendar = EventCalendar::load(&config.event_calendar_path);
    let gate = RiskGate::new(config.clone(), calendar);

    let engine = Arc::new(Engine::new(
        config.clone(),
        store,
        broker,
        quotes.clone(),
        bars.clone(),
        bus,
        gate,
    ));

    // Resubscribe symbols for positions that survived a restart.
    for trade in engine.store.non_terminal_trades().await? {
        engine.quotes.subscribe(&trade.ticker);
        engine.quotes.subscribe(&trade.option_symbol);
    }

    // ── 5. Quote stream ──────────────────────────────────────────────────
    if let Ok(ws_url) = std::env::var("VEGA_QUOTE_WS_URL") {
        let stream_quotes = quotes.clone();
        let stream_bars = bars.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    stream::run_quote_stream(&ws_url, &stream_quotes, &stream_bars).await
                {
                    error!(error = %e, "quote stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        info!("quote stream launched");
    } else {
        warn!("VEGA_QUOTE_WS_URL not set — running on REST snapshots only");
    }

    // ── 6. API server ────────────────────────────────────────────────────
    let api_engine = engine.clone();
    let bind_addr = std::env::var("VEGA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_log = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_engine);
        let listener = tokio::net::TcpListener::bind(&bind_addr_log)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_log, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 7. Periodic tasks ────────────────────────────────────────────────
    let scheduler = Scheduler::start(engine.clone());

    info!("all subsystems running — Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    scheduler.stop().await;

    info!("Vega shut down complete");
    Ok(())
}
