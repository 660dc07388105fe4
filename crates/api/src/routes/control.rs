use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use common::{Error, ManagedPosition, PositionSide};
use engine::ManagerCommand;

use crate::{auth::require_api_key, AppState};

pub fn control_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/positions", get(get_positions))
        .route("/positions/:symbol", get(get_position))
        .route("/sync", post(post_sync))
        .route("/close/:symbol", post(post_close))
        .route_layer(middleware::from_fn_with_state(state, require_api_key))
}

// ─── Status ───────────────────────────────────────────────────────────────────

async fn get_status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.stats.read().await;
    let last_sync = *state.last_sync.read().await;
    let margin = state.last_margin.read().await.clone();

    Json(json!({
        "active_positions": state.store.len().await,
        "performance": stats,
        "win_rate": stats.win_rate(),
        "last_sync": last_sync,
        "margin": margin,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

// ─── Positions ────────────────────────────────────────────────────────────────

async fn get_positions(State(state): State<AppState>) -> Json<Vec<ManagedPosition>> {
    Json(state.store.snapshot().await)
}

/// One position with its risk summary: implied loss at the full stop and
/// how far price has traveled toward it.
async fn get_position(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    match state.store.get(&symbol).await {
        Some(position) => Json(risk_summary(&position)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no managed position for {symbol}")})),
        )
            .into_response(),
    }
}

fn risk_summary(position: &ManagedPosition) -> Value {
    let (risk_percent, progress_to_stop) = match position.stops {
        Some(stops) => {
            let (distance, traveled) = match position.side {
                PositionSide::Long => (
                    position.entry_price - stops.full_stop,
                    position.entry_price - position.current_price,
                ),
                PositionSide::Short => (
                    stops.full_stop - position.entry_price,
                    position.current_price - position.entry_price,
                ),
            };
            let risk = if position.entry_price > 0.0 {
                distance / position.entry_price * 100.0
            } else {
                0.0
            };
            let progress = if distance > 0.0 {
                traveled / distance * 100.0
            } else {
                0.0
            };
            (risk, progress)
        }
        None => (0.0, 0.0),
    };

    json!({
        "position": position,
        "unrealized_pnl": position.unrealized_pnl(),
        "pnl_percent": position.pnl_percent(),
        "risk_percent": risk_percent,
        "progress_to_stop": progress_to_stop,
    })
}

// ─── Control actions ──────────────────────────────────────────────────────────

async fn post_sync(State(state): State<AppState>) -> Response {
    match state.commands.send(ManagerCommand::ForceSync).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "sync scheduled"}))).into_response(),
        Err(_) => scheduler_gone(),
    }
}

async fn post_close(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    let (reply, result) = oneshot::channel();
    let command = ManagerCommand::ForceClose {
        symbol: symbol.clone(),
        reply,
    };
    if state.commands.send(command).await.is_err() {
        return scheduler_gone();
    }

    match result.await {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(json!({"status": "closed", "symbol": symbol})),
        )
            .into_response(),
        Ok(Err(Error::Validation(message))) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
        }
        Ok(Err(e)) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(_) => scheduler_gone(),
    }
}

fn scheduler_gone() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "scheduler unavailable"})),
    )
        .into_response()
}
