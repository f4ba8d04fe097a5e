use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::SettlementError;
use crate::feeds::StreamManager;
use crate::normalizer::QualityCounters;
use crate::props::{LineMovementLedger, PropositionStore};
use crate::providers::RateLimiter;
use crate::settlement::SettlementEngine;

#[derive(Clone)]
pub struct AppState {
    pub streams: StreamManager,
    pub store: Arc<PropositionStore>,
    pub ledger: LineMovementLedger,
    pub settlement: SettlementEngine,
    pub limiter: Arc<RateLimiter>,
    pub quality: Arc<QualityCounters>,
}

type ApiError = (StatusCode, String);

/// Build the Axum router for the admin API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/streams", post(start_stream_handler).get(list_streams_handler))
        .route("/api/streams/:id", delete(stop_stream_handler))
        .route("/api/settlement/:sport", post(settle_sport_handler))
        .route("/api/rate-limits", get(rate_limits_handler))
        .route("/api/propositions", get(propositions_handler))
        .route("/api/propositions/:id/movements", get(proposition_movements_handler))
        .route("/api/movements/recent", get(recent_movements_handler))
        .route("/api/movements/steam", get(steam_handler))
        .route("/api/quality", get(quality_handler))
        .route("/api/users", post(create_user_handler))
        .route("/api/users/:id", get(user_handler))
        .route("/api/wagers", post(place_wager_handler))
        .route("/api/wagers/:id/settle", post(settle_wager_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Settlement outcomes the caller can act on are 4xx; storage trouble is 500.
fn settlement_error(e: SettlementError) -> ApiError {
    let status = match &e {
        SettlementError::AlreadySettled(_) => StatusCode::CONFLICT,
        SettlementError::WagerNotFound(_)
        | SettlementError::UserNotFound(_)
        | SettlementError::PropositionNotFound(_) => StatusCode::NOT_FOUND,
        SettlementError::PropositionInactive(_) | SettlementError::InsufficientBankroll { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SettlementError::InvalidAmount(_) | SettlementError::InvalidOdds(_) | SettlementError::OutOfRange(_) => {
            StatusCode::BAD_REQUEST
        }
        SettlementError::Storage(_) | SettlementError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// ── Streams ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartStreamRequest {
    pub sport: String,
    pub providers: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

/// POST /api/streams
async fn start_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartStreamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .streams
        .start_stream(&req.sport, &req.providers, req.filters)
        .map(|id| Json(json!({ "session_id": id })))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

/// GET /api/streams
async fn list_streams_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.streams.snapshot())
}

/// DELETE /api/streams/:id
async fn stop_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let stopped = state.streams.stop_stream(id);
    let status = if stopped { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(json!({ "stopped": stopped })))
}

// ── Settlement & rate limits ───────────────────────────────────────────────────

/// POST /api/settlement/:sport
async fn settle_sport_handler(
    State(state): State<Arc<AppState>>,
    Path(sport): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.settlement.settle_sport(&sport).map(Json).map_err(internal)
}

/// GET /api/rate-limits
async fn rate_limits_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.limiter.snapshot().map(Json).map_err(internal)
}

// ── Propositions & movements ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PropositionQuery {
    pub sport: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/propositions?sport=nba&limit=200
async fn propositions_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PropositionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sport = q.sport.map(|s| s.to_lowercase());
    state
        .store
        .list_active(sport.as_deref(), q.limit.unwrap_or(200).clamp(1, 1000))
        .map(Json)
        .map_err(internal)
}

/// GET /api/propositions/:id/movements
async fn proposition_movements_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(proposition) = state.store.get(id).map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("proposition {} not found", id)));
    };
    let movements = state.ledger.history(id).map_err(internal)?;
    Ok(Json(json!({ "proposition": proposition, "movements": movements })))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub minutes: Option<i64>,
}

/// GET /api/movements/recent?minutes=60
async fn recent_movements_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .ledger
        .recent(q.minutes.unwrap_or(60))
        .map(Json)
        .map_err(internal)
}

/// GET /api/movements/steam
async fn steam_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.ledger.steam_moves(Utc::now()).map(Json).map_err(internal)
}

/// GET /api/quality
async fn quality_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.quality.snapshot())
}

// ── Users & wagers ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub bankroll: Decimal,
}

/// POST /api/users
async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .settlement
        .create_user(req.bankroll)
        .map(|u| (StatusCode::CREATED, Json(u)))
        .map_err(settlement_error)
}

/// GET /api/users/:id
async fn user_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.settlement.get_user(id).map_err(settlement_error)?;
    let wagers = state.settlement.list_wagers(id).map_err(settlement_error)?;
    Ok(Json(json!({ "user": user, "wagers": wagers })))
}

#[derive(Debug, Deserialize)]
pub struct PlaceWagerRequest {
    pub user_id: i64,
    pub proposition_id: i64,
    pub amount: Decimal,
    pub odds: Decimal,
}

/// POST /api/wagers
async fn place_wager_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceWagerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .settlement
        .place(req.user_id, req.proposition_id, req.amount, req.odds)
        .map(|w| (StatusCode::CREATED, Json(w)))
        .map_err(settlement_error)
}

#[derive(Debug, Deserialize)]
pub struct SettleWagerRequest {
    pub actual: Decimal,
    /// Defaults to the proposition's current line
    pub closing_line: Option<Decimal>,
}

/// POST /api/wagers/:id/settle
async fn settle_wager_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SettleWagerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let closing = match req.closing_line {
        Some(line) => line,
        None => state.settlement.current_line(id).map_err(settlement_error)?,
    };
    state
        .settlement
        .settle(id, req.actual, closing)
        .map(Json)
        .map_err(settlement_error)
}
