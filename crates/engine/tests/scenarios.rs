//! End-to-end scenarios against the scripted exchange. Ticks are driven
//! directly so each test is deterministic and runs without timers.

use std::sync::Arc;

use tokio::sync::mpsc;

use common::{AccountMargin, NotifierEvent, PositionSide, SymbolFilters};
use engine::{Intervals, PositionStore, SharedStats, TradeManager};
use risk::{RiskConfig, RiskEngine};
use sim::{flat_candles, snapshot, SimExchange};

fn make_manager(
    exchange: Arc<SimExchange>,
) -> (
    Arc<TradeManager>,
    PositionStore,
    SharedStats,
    mpsc::Receiver<NotifierEvent>,
) {
    let store = PositionStore::new();
    let stats = SharedStats::new();
    let (event_tx, event_rx) = mpsc::channel(256);
    let manager = TradeManager::new(
        exchange,
        store.clone(),
        stats.clone(),
        RiskEngine::new(RiskConfig::default()),
        vec!["BNBUSDT".into(), "ETHUSDT".into()],
        Intervals::default(),
        event_tx,
    );
    (Arc::new(manager), store, stats, event_rx)
}

/// 21 candles whose last 14 true ranges are all 3.0 while one older candle
/// inside the 20-candle lookback pins support at 294 and resistance at 310.
fn reference_candles() -> Vec<common::Candle> {
    let mut candles = flat_candles(300.0, 3.0, 21);
    candles[1].high = 310.0;
    candles[1].low = 294.0;
    candles
}

#[tokio::test]
async fn scenario_long_stop_ladder() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.10, 300.0));
    exchange.set_candles("BNBUSDT", reference_candles());
    exchange.set_prices("BNBUSDT", &[300.5, 298.1, 296.0, 295.4]);

    let (manager, store, stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;
    assert_eq!(store.len().await, 1);

    // Tick 1: technicals computed, stops anchored at the entry price.
    manager.level_check_tick().await;
    let p = store.get("BNBUSDT").await.unwrap();
    let stops = p.stops.unwrap();
    assert!((stops.full_stop - 295.5).abs() < 1e-9, "full {}", stops.full_stop);
    assert!((stops.partial_stop - 298.2).abs() < 1e-9, "partial {}", stops.partial_stop);
    assert!(exchange.closes().is_empty());

    // Tick 2: 298.1 breaches the partial stop.
    manager.level_check_tick().await;
    let closes = exchange.closes();
    assert_eq!(closes.len(), 1);
    assert!((closes[0].quantity - 0.03).abs() < 1e-9);
    let p = store.get("BNBUSDT").await.unwrap();
    assert!(p.partial_stop_hit);
    assert!((p.quantity - 0.07).abs() < 1e-9);

    // Tick 3: 296.0 sits between the stops, nothing fires.
    manager.level_check_tick().await;
    assert_eq!(exchange.closes().len(), 1);

    // Tick 4: 295.4 breaches the full stop, remainder closed.
    manager.level_check_tick().await;
    let closes = exchange.closes();
    assert_eq!(closes.len(), 2);
    assert!((closes[1].quantity - 0.07).abs() < 1e-9);
    assert!(store.get("BNBUSDT").await.is_none());

    let total: f64 = closes.iter().map(|c| c.quantity).sum();
    assert!(total <= 0.10 + 1e-9);

    let s = stats.read().await;
    assert_eq!(s.losing_trades, 1);
    assert_eq!(s.winning_trades, 0);
    assert_eq!(s.total_partial_stops, 1);
    assert_eq!(s.total_stop_losses, 1);
}

#[tokio::test]
async fn scenario_short_take_profit_sweep() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("ETHUSDT", PositionSide::Short, 1.0, 2000.0));
    exchange.set_candles("ETHUSDT", flat_candles(2000.0, 2.0, 30));
    exchange.set_prices("ETHUSDT", &[2001.0, 1995.0, 1994.0, 1993.0]);

    let (manager, store, stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;

    manager.level_check_tick().await;
    assert!(exchange.closes().is_empty());

    manager.level_check_tick().await; // 1995 → TP1
    manager.level_check_tick().await; // 1994 → TP2
    manager.level_check_tick().await; // 1993 → TP3, position done

    let closes = exchange.closes();
    assert_eq!(closes.len(), 3);
    assert!((closes[0].quantity - 0.5).abs() < 1e-9);
    assert!((closes[1].quantity - 0.3).abs() < 1e-9);
    assert!((closes[2].quantity - 0.2).abs() < 1e-9);
    assert!(store.get("ETHUSDT").await.is_none());

    let s = stats.read().await;
    assert_eq!(s.winning_trades, 1);
    assert_eq!(s.total_take_profits, 3);
    assert_eq!(s.losing_trades, 0);
}

#[tokio::test]
async fn scenario_margin_overload_halves_positions() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 1.0, 300.0));
    exchange.seed_position(snapshot("ETHUSDT", PositionSide::Short, 1.0, 2000.0));
    exchange.set_margin(AccountMargin {
        wallet_balance: 1000.0,
        margin_balance: 1000.0,
        available_balance: 120.0,
        unrealized_pnl: -50.0,
        margin_ratio: 0.88,
    });

    let (manager, store, _stats, mut events) = make_manager(exchange.clone());
    manager.detect_tick().await;

    // Mark the BNB partial stop as already hit; deleveraging must not
    // touch hit-flags.
    store
        .update_with("BNBUSDT", |p| p.partial_stop_hit = true)
        .await
        .unwrap();

    manager.margin_check_tick().await;

    let closes = exchange.closes();
    assert_eq!(closes.len(), 2);
    assert!(closes.iter().all(|c| (c.quantity - 0.5).abs() < 1e-9));

    let bnb = store.get("BNBUSDT").await.unwrap();
    let eth = store.get("ETHUSDT").await.unwrap();
    assert!((bnb.quantity - 0.5).abs() < 1e-9);
    assert!((eth.quantity - 0.5).abs() < 1e-9);
    assert!(bnb.partial_stop_hit);
    assert!(!eth.partial_stop_hit);

    let mut warnings = 0;
    let mut flattens = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            NotifierEvent::MarginWarning { .. } => warnings += 1,
            NotifierEvent::MarginFlatten { .. } => flattens += 1,
            _ => {}
        }
    }
    assert_eq!(warnings, 1);
    assert_eq!(flattens, 1);
}

#[tokio::test]
async fn scenario_external_close_needs_two_misses() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.10, 300.0));

    let (manager, store, _stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;
    assert_eq!(store.len().await, 1);

    exchange.drop_position("BNBUSDT");

    manager.detect_tick().await;
    assert_eq!(store.len().await, 1, "one miss must not drop the symbol");

    manager.detect_tick().await;
    assert!(store.get("BNBUSDT").await.is_none());
    assert!(exchange.closes().is_empty(), "no close order for an external close");
}

#[tokio::test]
async fn scenario_restart_recovery_fires_tp1_from_fresh_state() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.05, 300.0));
    exchange.set_candles("BNBUSDT", flat_candles(300.0, 0.5, 30));
    exchange.set_prices("BNBUSDT", &[300.76]);

    let (manager, store, _stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;

    let p = store.get("BNBUSDT").await.unwrap();
    assert_eq!(p.quantity_at_detection, 0.05);
    assert!(!p.partial_stop_hit);
    assert!(p.tp_levels.iter().all(|l| !l.hit));

    manager.level_check_tick().await;
    let closes = exchange.closes();
    assert_eq!(closes.len(), 1);
    assert!((closes[0].quantity - 0.025).abs() < 1e-9);
    let p = store.get("BNBUSDT").await.unwrap();
    assert!(p.tp_levels[0].hit);
}

#[tokio::test]
async fn scenario_force_close_full_quantity() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.10, 300.0));

    let (manager, store, _stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;

    manager.force_close("BNBUSDT").await.unwrap();
    let closes = exchange.closes();
    assert_eq!(closes.len(), 1);
    assert!((closes[0].quantity - 0.10).abs() < 1e-9);
    assert_eq!(closes[0].reason, "manual close");
    assert!(store.get("BNBUSDT").await.is_none());

    let err = manager.force_close("ETHUSDT").await.unwrap_err();
    assert!(matches!(err, common::Error::Validation(_)));
}

#[tokio::test]
async fn detection_is_idempotent() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.10, 300.0));

    let (manager, store, stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;
    manager.detect_tick().await;

    assert_eq!(store.len().await, 1);
    assert_eq!(stats.read().await.total_managed, 1);
}

#[tokio::test]
async fn allow_list_filters_unsupported_symbols() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("DOGEUSDT", PositionSide::Long, 100.0, 0.1));

    let (manager, store, _stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn close_below_min_qty_is_skipped_without_flags() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.10, 300.0));
    exchange.set_candles("BNBUSDT", reference_candles());
    exchange.set_prices("BNBUSDT", &[300.0, 298.1]);
    exchange.set_filters(
        "BNBUSDT",
        SymbolFilters {
            min_qty: 0.05,
            step_size: 0.001,
            min_notional: 0.0,
        },
    );

    let (manager, store, _stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;
    manager.level_check_tick().await;
    manager.level_check_tick().await; // partial stop triggerable, qty 0.03 < min_qty

    assert!(exchange.closes().is_empty());
    let p = store.get("BNBUSDT").await.unwrap();
    assert!(!p.partial_stop_hit, "a skipped action must not set the hit-flag");
}

#[tokio::test]
async fn failed_candle_fetch_falls_back_to_default_stop() {
    let exchange = Arc::new(SimExchange::new());
    exchange.seed_position(snapshot("BNBUSDT", PositionSide::Long, 0.10, 300.0));
    exchange.fail_klines(true);
    exchange.set_prices("BNBUSDT", &[300.0]);

    let (manager, store, _stats, _events) = make_manager(exchange.clone());
    manager.detect_tick().await;
    manager.level_check_tick().await;

    let p = store.get("BNBUSDT").await.unwrap();
    assert!(p.technical.is_none());
    let stops = p.stops.expect("default stop must be in place");
    // Minimum-loss fallback: 1.5% below entry.
    assert!((stops.full_stop - 295.5).abs() < 1e-9);
}
