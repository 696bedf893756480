// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// Public surface:
//   POST /webhook            — inbound alert (JSON or text/plain JSON body)
//   GET  /api/v1/health      — liveness + operator alert
//
// Admin surface (Bearer token):
//   trades / alerts / events / snapshots reads, enabled-strategy
//   enable/disable, override flags, favorites CRUD, daily summary.
//
// Webhook status mapping: 400 malformed body, 422 schema violation, 401
// secret mismatch, 200 with {status, message, trade_id?} otherwise, 500
// with a structured body on internal errors.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::engine::admission::{self, AdmissionOutcome, AlertRequest};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::risk::REASON_INVALID_SECRET;
use crate::signals::StrategyParams;
use crate::types::{AlertAction, AlertSource, SignalKind, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/webhook", post(webhook))
        .route("/api/v1/health", get(health))
        // ── Authenticated reads ─────────────────────────────────────
        .route("/api/v1/trades", get(list_trades))
        .route("/api/v1/trades/:id", get(get_trade))
        .route("/api/v1/trades/:id/events", get(trade_events))
        .route("/api/v1/trades/:id/snapshots", get(trade_snapshots))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/summary/:date", get(daily_summary))
        // ── Authenticated control surface ───────────────────────────
        .route("/api/v1/strategies", get(list_strategies).post(enable_strategy))
        .route("/api/v1/strategies/disable", post(disable_strategy))
        .route("/api/v1/overrides", get(get_overrides).post(set_overrides))
        .route("/api/v1/favorites", get(list_favorites).post(create_favorite))
        .route("/api/v1/favorites/:id", axum::routing::delete(delete_favorite))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(engine)
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "status": "error", "message": e.to_string() })),
    )
}

// =============================================================================
// Webhook
// =============================================================================

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    secret: Option<String>,
    ticker: Option<String>,
    action: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    #[allow(dead_code)]
    comment: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// Inbound alert endpoint. The body may arrive as `application/json` or
/// `text/plain`; both carry the same JSON document.
async fn webhook(
    State(engine): State<Arc<Engine>>,
    body: String,
) -> (StatusCode, Json<serde_json::Value>) {
    // 400: not JSON at all.
    let payload: WebhookPayload = match serde_json::from_str(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %EngineError::Validation(e.to_string()), "webhook body unparseable");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "status": "rejected", "message": "malformed body" })),
            );
        }
    };

    // 422: structurally JSON but missing/invalid required fields.
    let Some(ticker) = payload.ticker.filter(|t| !t.is_empty()) else {
        return schema_violation("missing field: ticker");
    };
    let Some(action_raw) = payload.action.as_deref() else {
        return schema_violation("missing field: action");
    };
    let Some(action) = AlertAction::parse(action_raw) else {
        return schema_violation("unknown action");
    };

    let source = payload
        .source
        .as_deref()
        .and_then(AlertSource::parse)
        .unwrap_or(AlertSource::External);

    let request = AlertRequest {
        ticker: ticker.to_uppercase(),
        action,
        price: payload.price,
        source,
        raw_payload: body,
        secret: payload.secret,
        secret_verified: false,
        confluence_score: None,
        confluence_max: None,
        relative_volume: None,
    };

    match admission::admit(&engine, request).await {
        Ok(AdmissionOutcome::Accepted { trade_id, .. }) => {
            info!(trade_id = %trade_id, "webhook alert processed");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "processed",
                    "message": "trade created",
                    "trade_id": trade_id,
                })),
            )
        }
        Ok(AdmissionOutcome::Rejected { reason, .. }) if reason == REASON_INVALID_SECRET => {
            warn!(error = %EngineError::Auth, "webhook secret mismatch");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "status": "rejected", "message": reason })),
            )
        }
        Ok(AdmissionOutcome::Rejected { reason, .. }) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "rejected", "message": reason })),
        ),
        Ok(AdmissionOutcome::Errored { detail, .. }) => internal_error(detail),
        Err(e) => internal_error(e),
    }
}

fn schema_violation(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "status": "rejected", "message": message })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if engine.current_operator_alert().is_some() { "degraded" } else { "ok" },
        "operator_alert": engine.current_operator_alert(),
        "dropped_bus_events": engine.bus.dropped_count(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Trades & alerts (authenticated reads)
// =============================================================================

#[derive(Deserialize)]
struct TradesQuery {
    date: Option<chrono::NaiveDate>,
}

async fn list_trades(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    let date =
        query.date.unwrap_or_else(|| crate::session::session_date(crate::session::market_now()));
    match engine.store.trades_for_date(date).await {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_trade(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.store.get_trade(&id).await {
        Ok(trade) => Json(trade).into_response(),
        Err(EngineError::InvariantViolation(_)) => {
            (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "trade not found" })))
                .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn trade_events(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.store.events_for_trade(&id).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn trade_snapshots(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.store.snapshots_for_trade(&id).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn list_alerts(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    match engine.store.recent_alerts(200).await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn daily_summary(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Path(date): Path<chrono::NaiveDate>,
) -> impl IntoResponse {
    match engine.store.get_daily_summary(date).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => {
            (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "no summary for date" })))
                .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Enabled strategies (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct StrategyBody {
    ticker: String,
    timeframe: String,
    signal_type: String,
    #[serde(default)]
    params: Option<StrategyParams>,
}

fn parse_strategy_key(body: &StrategyBody) -> Result<(Timeframe, SignalKind), &'static str> {
    let timeframe = Timeframe::parse(&body.timeframe).ok_or("unknown timeframe")?;
    let kind = SignalKind::parse(&body.signal_type).ok_or("unknown signal_type")?;
    Ok((timeframe, kind))
}

async fn list_strategies(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    match engine.store.enabled_strategies().await {
        Ok(strategies) => Json(strategies).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn enable_strategy(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(body): Json<StrategyBody>,
) -> impl IntoResponse {
    let (timeframe, kind) = match parse_strategy_key(&body) {
        Ok(parsed) => parsed,
        Err(message) => return schema_violation(message).into_response(),
    };
    let params = body.params.unwrap_or_default();

    match engine
        .store
        .enable_strategy(&body.ticker.to_uppercase(), timeframe, kind, &params)
        .await
    {
        Ok(strategy) => {
            info!(ticker = %strategy.ticker, kind = %strategy.signal_type, "strategy enabled");
            Json(strategy).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn disable_strategy(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(body): Json<StrategyBody>,
) -> impl IntoResponse {
    let (timeframe, kind) = match parse_strategy_key(&body) {
        Ok(parsed) => parsed,
        Err(message) => return schema_violation(message).into_response(),
    };

    match engine
        .store
        .disable_strategy(&body.ticker.to_uppercase(), timeframe, kind)
        .await
    {
        Ok(removed) => {
            info!(ticker = %body.ticker, removed, "strategy disable requested");
            Json(serde_json::json!({ "removed": removed })).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Overrides (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct OverridesBody {
    #[serde(default)]
    ignore_session_windows: Option<bool>,
    #[serde(default)]
    market_exits: Option<bool>,
}

async fn get_overrides(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    Json(engine.overrides())
}

async fn set_overrides(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(body): Json<OverridesBody>,
) -> impl IntoResponse {
    let mut overrides = engine.overrides();
    if let Some(value) = body.ignore_session_windows {
        overrides.ignore_session_windows = value;
    }
    if let Some(value) = body.market_exits {
        overrides.market_exits = value;
    }
    engine.set_overrides(overrides);
    info!(?overrides, "overrides updated");

    // Announce the change so subscribers see the new posture.
    engine.bus.publish(
        crate::bus::EventName::AlertReceived,
        serde_json::json!({ "overrides": overrides }),
    );

    Json(overrides)
}

// =============================================================================
// Favorites (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct FavoriteBody {
    ticker: String,
    timeframe: String,
    signal_type: String,
    #[serde(default)]
    params: Option<StrategyParams>,
    #[serde(default)]
    label: Option<String>,
}

async fn list_favorites(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    match engine.store.favorites().await {
        Ok(favorites) => Json(favorites).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn create_favorite(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(body): Json<FavoriteBody>,
) -> impl IntoResponse {
    let Some(timeframe) = Timeframe::parse(&body.timeframe) else {
        return schema_violation("unknown timeframe").into_response();
    };
    let Some(kind) = SignalKind::parse(&body.signal_type) else {
        return schema_violation("unknown signal_type").into_response();
    };

    match engine
        .store
        .create_favorite(
            &body.ticker.to_uppercase(),
            timeframe,
            kind,
            &body.params.unwrap_or_default(),
            body.label.as_deref().unwrap_or(""),
        )
        .await
    {
        Ok(favorite) => Json(favorite).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_favorite(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.store.delete_favorite(&id).await {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::engine_with_sim;

    #[tokio::test]
    async fn webhook_malformed_body_is_400() {
        let (engine, _sim) = engine_with_sim().await;
        let (status, body) = webhook(State(engine), "not json at all".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["status"], "rejected");
    }

    #[tokio::test]
    async fn webhook_missing_fields_is_422() {
        let (engine, _sim) = engine_with_sim().await;
        let (status, _) =
            webhook(State(engine.clone()), r#"{"secret":"hunter2"}"#.to_string()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = webhook(
            State(engine),
            r#"{"secret":"hunter2","ticker":"SPY","action":"SELL_EVERYTHING"}"#.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.0["message"], "unknown action");
    }

    #[tokio::test]
    async fn webhook_bad_secret_is_401() {
        let (engine, _sim) = engine_with_sim().await;
        let (status, body) = webhook(
            State(engine),
            r#"{"secret":"wrong","ticker":"SPY","action":"BUY_CALL","price":694.5}"#.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.0["message"], REASON_INVALID_SECRET);
    }

    #[tokio::test]
    async fn webhook_accepted_returns_trade_id() {
        let (engine, _sim) = engine_with_sim().await;
        let (status, body) = webhook(
            State(engine.clone()),
            r#"{"secret":"hunter2","ticker":"SPY","action":"BUY_CALL","price":694.5}"#.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["status"], "processed");

        let trade_id = body.0["trade_id"].as_str().unwrap();
        assert!(engine.store.get_trade(trade_id).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_gate_rejection_is_200() {
        let (engine, _sim) = engine_with_sim().await;
        let (status, body) = webhook(
            State(engine),
            r#"{"secret":"hunter2","ticker":"TSLA","action":"BUY_CALL"}"#.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["status"], "rejected");
        assert_eq!(body.0["message"], crate::risk::REASON_TICKER_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn webhook_lowercase_ticker_normalised() {
        let (engine, _sim) = engine_with_sim().await;
        let (status, body) = webhook(
            State(engine.clone()),
            r#"{"secret":"hunter2","ticker":"spy","action":"BUY_PUT","price":694.5}"#.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{:?}", body.0);
        let trade_id = body.0["trade_id"].as_str().unwrap();
        let trade = engine.store.get_trade(trade_id).await.unwrap();
        assert_eq!(trade.ticker, "SPY");
        assert_eq!(trade.direction, crate::types::Direction::Put);
    }

    #[test]
    fn strategy_key_parsing() {
        let body = StrategyBody {
            ticker: "SPY".into(),
            timeframe: "5m".into(),
            signal_type: "ema_cross".into(),
            params: None,
        };
        let (timeframe, kind) = parse_strategy_key(&body).unwrap();
        assert_eq!(timeframe, Timeframe::M5);
        assert_eq!(kind, SignalKind::EmaCross);

        let bad = StrategyBody {
            timeframe: "2h".into(),
            ..body
        };
        assert!(parse_strategy_key(&bad).is_err());
    }
}
