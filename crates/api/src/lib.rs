mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use common::AccountMargin;
use engine::{ManagerCommand, PositionStore, SharedStats};

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub store: PositionStore,
    pub stats: SharedStats,
    /// Requests routed into the scheduler (force sync, force close).
    pub commands: mpsc::Sender<ManagerCommand>,
    /// Accepted `X-API-KEY` values. An empty list locks every
    /// authenticated route.
    pub api_keys: Arc<Vec<String>>,
    pub last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
    pub last_margin: Arc<RwLock<Option<AccountMargin>>>,
    pub started_at: DateTime<Utc>,
}

/// Build the full router: open health probe plus the authenticated control
/// surface.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .merge(routes::health_router())
        .merge(routes::control_router(state.clone()))
        .with_state(state)
        .layer(cors)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(state: AppState, host: String, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, host, port, "invalid control API bind address");
            return;
        }
    };

    let app = router(state);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind control API");
            return;
        }
    };

    info!(%addr, "control API listening");
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
}
