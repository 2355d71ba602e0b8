// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, ErrorRecord};
use crate::exit::{ClosedExit, ExitError};
use crate::ledger::{ExitReason, LedgerError, Page, Trade, TradeStatus};
use crate::orchestrator::CycleReport;
use crate::types::{AccountMode, MarketPhase, Side};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(serde_json::json!({
            "error": message.into(),
        })),
    )
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/trades", get(list_trades))
        .route("/api/v1/trades/open", get(open_trades))
        .route("/api/v1/trades/:id", get(get_trade))
        .route("/api/v1/trades/:id/close", post(close_trade))
        .route("/api/v1/summaries", get(summaries))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Views
// =============================================================================

/// A trade as served to clients, with the percentage return precomputed.
#[derive(Debug, Serialize)]
struct TradeView {
    id: String,
    broker_order_id: String,
    symbol: String,
    side: Side,
    quantity: u32,
    entry_price: f64,
    take_profit_price: f64,
    stop_loss_price: f64,
    entry_time: String,
    status: TradeStatus,
    exit_price: Option<f64>,
    exit_time: Option<String>,
    exit_reason: Option<ExitReason>,
    pnl: Option<f64>,
    pnl_pct: Option<f64>,
}

impl From<Trade> for TradeView {
    fn from(trade: Trade) -> Self {
        let status = trade.status();
        let pnl_pct = trade.pnl_pct();
        let exit = trade.exit.as_ref();
        Self {
            status,
            pnl_pct,
            exit_price: exit.map(|e| e.price),
            exit_time: exit.map(|e| e.time.to_rfc3339()),
            exit_reason: exit.map(|e| e.reason),
            pnl: exit.map(|e| e.pnl),
            entry_time: trade.entry_time.to_rfc3339(),
            id: trade.id,
            broker_order_id: trade.broker_order_id,
            symbol: trade.symbol,
            side: trade.side,
            quantity: trade.quantity,
            entry_price: trade.entry_price,
            take_profit_price: trade.take_profit_price,
            stop_loss_price: trade.stop_loss_price,
        }
    }
}

fn ledger_error(e: LedgerError) -> ApiError {
    match e {
        LedgerError::NotFound(id) => api_error(StatusCode::NOT_FOUND, format!("trade {id} not found")),
        LedgerError::InvalidState(id) => api_error(StatusCode::CONFLICT, format!("trade {id} is not open")),
        LedgerError::InvalidTrade(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        other => {
            warn!(error = %other, "ledger query failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

/// HTTP status for a failed manual close.
fn exit_status(e: &ExitError) -> StatusCode {
    match e {
        ExitError::Ledger(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
        ExitError::Ledger(LedgerError::InvalidState(_)) | ExitError::InFlight(_) => StatusCode::CONFLICT,
        ExitError::Order { .. } | ExitError::Prices(_) | ExitError::NoPrice(_) => StatusCode::BAD_GATEWAY,
        ExitError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Engine status (authenticated)
// =============================================================================

#[derive(Serialize)]
struct StatusResponse {
    phase: MarketPhase,
    account_mode: AccountMode,
    exchange: String,
    uptime_secs: u64,
    cycle_running: bool,
    unrecorded_exits: usize,
    exchange_date: chrono::NaiveDate,
    last_cycle: Option<CycleReport>,
    last_entry_error: Option<ErrorRecord>,
    recent_errors: Vec<ErrorRecord>,
}

async fn status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(StatusResponse {
        phase: state.orchestrator.phase(),
        account_mode: state.config.account_mode,
        exchange: state.config.market.exchange.clone(),
        uptime_secs: state.uptime_secs(),
        cycle_running: state.orchestrator.cycle_running(),
        unrecorded_exits: state.monitor.unrecorded_count(),
        exchange_date: state.orchestrator.clock().local_date(chrono::Utc::now()),
        last_cycle: state.orchestrator.last_report(),
        last_entry_error: state.errors.latest_for("entry"),
        recent_errors: state.errors.recent(),
    })
}

// =============================================================================
// Trades (authenticated)
// =============================================================================

async fn open_trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let trades = state.ledger.list_open().await.map_err(ledger_error)?;
    let views: Vec<TradeView> = trades.into_iter().map(TradeView::from).collect();
    Ok(Json(views))
}

#[derive(Serialize)]
struct TradePage {
    trades: Vec<TradeView>,
    total: u64,
    limit: u32,
    offset: u32,
}

async fn list_trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, ApiError> {
    let (trades, total) = state.ledger.list_all(page).await.map_err(ledger_error)?;
    Ok(Json(TradePage {
        trades: trades.into_iter().map(TradeView::from).collect(),
        total,
        limit: page.limit.min(Page::MAX_LIMIT),
        offset: page.offset,
    }))
}

async fn get_trade(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let trade = state.ledger.get(&id).await.map_err(ledger_error)?;
    Ok(Json(TradeView::from(trade)))
}

async fn close_trade(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ClosedExit>, ApiError> {
    match state.monitor.close_manually(&id).await {
        Ok(closed) => {
            info!(trade_id = %id, price = closed.exit_price, pnl = closed.pnl, "Trade closed via API");
            Ok(Json(closed))
        }
        Err(e) => {
            warn!(trade_id = %id, error = %e, "manual close failed");
            state
                .errors
                .record("manual_close", Some(e.kind()), format!("{id}: {e}"));
            Err(api_error(exit_status(&e), e.to_string()))
        }
    }
}

// =============================================================================
// Daily summaries (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SummaryQuery {
    #[serde(default = "default_summary_days")]
    days: u32,
}

fn default_summary_days() -> u32 {
    30
}

async fn summaries(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<SummaryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.ledger.daily_summaries(q.days).await.map_err(ledger_error)?;
    Ok(Json(rows))
}
