use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, Exchange, NotifierEvent};
use engine::{BinanceFuturesClient, Intervals, ManagerCommand, PositionStore, SharedStats, TradeManager};
use risk::{RiskConfig, RiskEngine};

/// How long in-flight ticks may run after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")))
        .init();

    // ── Config ───────────────────────────────────────────────────────────────
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };
    info!(symbols = ?cfg.symbols, testnet = cfg.exchange_testnet, "sentinel starting");
    if cfg.api_keys.is_empty() {
        warn!("API_KEYS is empty — every authenticated control route will return 401");
    }

    // ── Exchange adapter ─────────────────────────────────────────────────────
    let exchange: Arc<dyn Exchange> = Arc::new(BinanceFuturesClient::new(
        &cfg.exchange_api_key,
        &cfg.exchange_api_secret,
        cfg.exchange_testnet,
    ));

    // The first exchange call doubles as the startup connectivity probe.
    if let Err(e) = exchange.account_margin().await {
        error!(error = %e, "exchange unreachable at startup");
        std::process::exit(1);
    }

    // ── Notifier ─────────────────────────────────────────────────────────────
    let (event_tx, notifier_worker) = notifier::spawn(cfg.notifier_token.clone(), cfg.notifier_chat_id);

    // ── Scheduler ────────────────────────────────────────────────────────────
    let store = PositionStore::new();
    let stats = SharedStats::new();
    let manager = Arc::new(TradeManager::new(
        exchange,
        store.clone(),
        stats.clone(),
        RiskEngine::new(RiskConfig::from_env()),
        cfg.symbols.clone(),
        Intervals {
            detect: cfg.detect_interval,
            level_check: cfg.level_check_interval,
            margin_check: cfg.margin_check_interval,
            report: cfg.report_interval,
        },
        event_tx.clone(),
    ));

    // Initial sync before the loops start, so the startup message carries
    // the adopted count.
    manager.detect_tick().await;
    let active = store.len().await;
    info!(active, "initial sync complete");
    let _ = event_tx.try_send(NotifierEvent::Started { active_positions: active });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::channel::<ManagerCommand>(32);
    let mut tasks = manager.clone().spawn(command_rx, shutdown_rx.clone());

    // ── Control API ──────────────────────────────────────────────────────────
    let api_state = api::AppState {
        store: store.clone(),
        stats: stats.clone(),
        commands: command_tx.clone(),
        api_keys: Arc::new(cfg.api_keys.clone()),
        last_sync: manager.last_sync_handle(),
        last_margin: manager.last_margin_handle(),
        started_at: chrono::Utc::now(),
    };
    let api_host = cfg.api_host.clone();
    let api_port = cfg.api_port;
    let api_shutdown = shutdown_rx.clone();
    tasks.spawn(api::serve(api_state, api_host, api_port, api_shutdown));

    info!("all subsystems started");

    // ── Shutdown ─────────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.expect("install ctrl-c handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // No new exchange calls are issued after the signal; in-flight ticks
    // get a bounded grace period.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("grace period elapsed, aborting remaining tasks");
        tasks.abort_all();
    }

    drop(command_tx);
    drop(event_tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), notifier_worker).await;
    info!("sentinel stopped");
}
