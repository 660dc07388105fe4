use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use common::{
    AccountMargin, Action, ActionKind, Error, Exchange, ManagedPosition, NotifierEvent,
    PositionSide, PositionSnapshot, Result, SymbolFilters, TechnicalLevels, TradeOutcome,
};
use risk::RiskEngine;

use crate::store::{PositionStore, SharedStats};

/// Candle feed used for the technical snapshot.
const KLINE_INTERVAL: &str = "15m";
const KLINE_LIMIT: u32 = 50;

/// Detect ticks a managed symbol may go unreported before it is dropped.
const MAX_MISSED_DETECTIONS: u32 = 2;

/// Consecutive permanent exchange errors before a symbol is abandoned.
const MAX_PERMANENT_ERRORS: u32 = 2;

/// A fill covering at least this share of the request counts as the
/// requested close for hit-flag purposes.
const FILL_TOLERANCE: f64 = 0.95;

/// Control-plane requests routed into the scheduler.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Run a detection tick now.
    ForceSync,
    /// Close the full remaining quantity of a managed symbol.
    ForceClose {
        symbol: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Scheduler periods. The four loops tick independently.
#[derive(Debug, Clone)]
pub struct Intervals {
    pub detect: Duration,
    pub level_check: Duration,
    pub margin_check: Duration,
    pub report: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            detect: Duration::from_secs(30),
            level_check: Duration::from_secs(10),
            margin_check: Duration::from_secs(60),
            report: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// The scheduler: owns detection, level checking, margin monitoring and
/// reporting, and is the only writer of the position store.
///
/// Each tick reads a consistent copy of the state, does its exchange I/O
/// without any lock held, and folds results back in through short critical
/// sections. Within one symbol, closes are issued strictly in priority
/// order — the next one only after the previous returned.
pub struct TradeManager {
    exchange: Arc<dyn Exchange>,
    store: PositionStore,
    stats: SharedStats,
    risk: RiskEngine,
    /// Symbol allow-list; positions outside it are never adopted.
    symbols: Vec<String>,
    intervals: Intervals,
    events: mpsc::Sender<NotifierEvent>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_margin: Arc<RwLock<Option<AccountMargin>>>,
    /// Consecutive detect ticks a managed symbol went unreported.
    missing: RwLock<HashMap<String, u32>>,
    /// Consecutive permanent errors per symbol during level checks.
    errors: RwLock<HashMap<String, u32>>,
    /// Per-symbol exchange filters, fetched once and cached.
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl TradeManager {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: PositionStore,
        stats: SharedStats,
        risk: RiskEngine,
        symbols: Vec<String>,
        intervals: Intervals,
        events: mpsc::Sender<NotifierEvent>,
    ) -> Self {
        Self {
            exchange,
            store,
            stats,
            risk,
            symbols,
            intervals,
            events,
            last_sync: Arc::new(RwLock::new(None)),
            last_margin: Arc::new(RwLock::new(None)),
            missing: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
        }
    }

    pub fn last_sync_handle(&self) -> Arc<RwLock<Option<DateTime<Utc>>>> {
        self.last_sync.clone()
    }

    pub fn last_margin_handle(&self) -> Arc<RwLock<Option<AccountMargin>>> {
        self.last_margin.clone()
    }

    /// Spawn the periodic loops and the command loop. Every task stops
    /// issuing new exchange calls once `shutdown` flips; a tick already in
    /// flight runs to completion before its loop exits.
    pub fn spawn(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<ManagerCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        macro_rules! periodic {
            ($name:literal, $period:expr, $tick:ident) => {{
                let mgr = self.clone();
                let mut shutdown = shutdown.clone();
                let period = $period;
                tasks.spawn(async move {
                    let mut tick = tokio::time::interval(period);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(task = $name, period_secs = period.as_secs(), "periodic loop started");
                    loop {
                        tokio::select! {
                            _ = tick.tick() => mgr.$tick().await,
                            _ = shutdown.changed() => break,
                        }
                    }
                    debug!(task = $name, "periodic loop stopped");
                });
            }};
        }

        periodic!("detect", self.intervals.detect, detect_tick);
        periodic!("level-check", self.intervals.level_check, level_check_tick);
        periodic!("margin-check", self.intervals.margin_check, margin_check_tick);
        periodic!("report", self.intervals.report, report_tick);

        let mgr = self.clone();
        let mut shutdown_cmd = shutdown.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    cmd = commands.recv() => match cmd {
                        Some(ManagerCommand::ForceSync) => {
                            info!("forced sync requested");
                            mgr.detect_tick().await;
                        }
                        Some(ManagerCommand::ForceClose { symbol, reply }) => {
                            let _ = reply.send(mgr.force_close(&symbol).await);
                        }
                        None => break,
                    },
                    _ = shutdown_cmd.changed() => break,
                }
            }
        });

        tasks
    }

    // ─── Detection ────────────────────────────────────────────────────────────

    /// One detection pass: reconcile the managed set with what the exchange
    /// reports. Transient failures skip the whole tick.
    pub async fn detect_tick(&self) {
        let snapshots = match self.exchange.open_positions().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "detection tick skipped");
                return;
            }
        };

        *self.last_sync.write().await = Some(Utc::now());

        let supported: HashMap<String, PositionSnapshot> = snapshots
            .into_iter()
            .filter(|s| self.symbols.contains(&s.symbol))
            .map(|s| (s.symbol.clone(), s))
            .collect();

        for snapshot in supported.values() {
            self.adopt_or_refresh(snapshot).await;
        }

        // Symbols the exchange stopped reporting are dropped only after the
        // second consecutive miss, so a close in flight during this tick can
        // finish and record its result first.
        let managed: HashSet<String> = self.store.symbols().await.into_iter().collect();
        let mut missing = self.missing.write().await;
        missing.retain(|symbol, _| managed.contains(symbol));

        for symbol in managed {
            if supported.contains_key(&symbol) {
                missing.remove(&symbol);
                continue;
            }
            let count = missing.entry(symbol.clone()).or_insert(0);
            *count += 1;
            if *count >= MAX_MISSED_DETECTIONS {
                missing.remove(&symbol);
                if self.store.remove(&symbol).await.is_some() {
                    info!(symbol = %symbol, "position closed externally, dropped from management");
                    self.emit(NotifierEvent::ExternallyClosed { symbol });
                }
            } else {
                debug!(symbol = %symbol, misses = *count, "symbol missing from exchange report");
            }
        }
    }

    async fn adopt_or_refresh(&self, snapshot: &PositionSnapshot) {
        let now = Utc::now();
        let tp_levels = self.risk.tp_ladder(snapshot.entry_price, snapshot.side, None);
        let position = ManagedPosition::adopt(snapshot, tp_levels, now);

        if self.store.upsert(position.clone()).await {
            self.stats.update(|s| s.total_managed += 1).await;
            info!(
                symbol = %snapshot.symbol,
                side = %snapshot.side,
                qty = snapshot.quantity,
                entry = snapshot.entry_price,
                "position adopted"
            );
            self.emit(NotifierEvent::PositionAdopted { position });
        }
    }

    // ─── Level checking ───────────────────────────────────────────────────────

    /// One level-check pass over every managed symbol, sequentially. The
    /// adapter's pacing dominates the cadence of the exchange calls.
    pub async fn level_check_tick(&self) {
        for symbol in self.store.symbols().await {
            match self.check_symbol(&symbol).await {
                Ok(()) => {
                    self.errors.write().await.remove(&symbol);
                }
                Err(e) if e.is_transient() => {
                    debug!(symbol = %symbol, error = %e, "level check deferred to next tick");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "level check failed");
                    self.record_permanent_error(&symbol, &e).await;
                }
            }
        }
    }

    /// A permanent exchange error persisting over consecutive ticks
    /// abandons the symbol.
    async fn record_permanent_error(&self, symbol: &str, error: &Error) {
        let dropped = {
            let mut errors = self.errors.write().await;
            let count = errors.entry(symbol.to_string()).or_insert(0);
            *count += 1;
            if *count >= MAX_PERMANENT_ERRORS {
                errors.remove(symbol);
                true
            } else {
                false
            }
        };
        if dropped && self.store.remove(symbol).await.is_some() {
            warn!(symbol = %symbol, "symbol dropped after persistent exchange errors");
            self.emit(NotifierEvent::SymbolDropped {
                symbol: symbol.to_string(),
                error: error.to_string(),
            });
        }
    }

    async fn check_symbol(&self, symbol: &str) -> Result<()> {
        let Some(position) = self.store.get(symbol).await else {
            return Ok(());
        };

        let price = self.exchange.current_price(symbol).await?;
        let refreshed = self.refreshed_technicals(&position, price).await;

        let Some(position) = self
            .store
            .update_with(symbol, |p| {
                if let Some(levels) = refreshed {
                    // Stops re-anchor only when the technical snapshot
                    // changes, using the last price observed before this
                    // tick.
                    p.stops =
                        Some(self.risk.stop_levels(p.entry_price, p.side, p.current_price, &levels));
                    p.technical = Some(levels);
                } else if p.stops.is_none() {
                    p.stops = Some(self.risk.default_stop_levels(p.entry_price, p.side));
                }
                p.current_price = price;
                p.last_update = Utc::now();
            })
            .await
        else {
            return Ok(());
        };

        for action in self.risk.evaluate(&position) {
            // Priority order: the next close is not issued until the
            // previous one returned.
            if self.execute_action(&position, &action).await? {
                return Ok(());
            }
        }

        // Ladder exhausted with residual quantity: flush the remainder with
        // a completion close.
        if let Some(p) = self.store.get(symbol).await {
            if p.all_tp_hit() && p.quantity > 0.0 {
                let completion = Action {
                    kind: ActionKind::TakeProfit,
                    quantity: p.quantity,
                    reason: "take-profit ladder complete, closing remainder".into(),
                    tp_index: None,
                };
                self.execute_action(&p, &completion).await?;
            }
        }
        Ok(())
    }

    /// Fresh technical levels when the cache is stale, `None` to keep the
    /// cached snapshot. A failed candle fetch also returns `None`: the last
    /// snapshot (or the min-loss default stop) stays in effect.
    async fn refreshed_technicals(
        &self,
        position: &ManagedPosition,
        price: f64,
    ) -> Option<TechnicalLevels> {
        let max_age = chrono::Duration::from_std(self.risk.config().technical_refresh)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let fresh = position
            .technical
            .map(|t| Utc::now() - t.computed_at < max_age)
            .unwrap_or(false);
        if fresh {
            return None;
        }

        match self
            .exchange
            .klines(&position.symbol, KLINE_INTERVAL, KLINE_LIMIT)
            .await
        {
            Ok(candles) => {
                let atr = technical::atr(&candles, technical::ATR_PERIOD);
                let (support, resistance) =
                    technical::support_resistance(&candles, technical::SR_LOOKBACK, price);
                Some(TechnicalLevels {
                    atr,
                    support,
                    resistance,
                    computed_at: Utc::now(),
                })
            }
            Err(e) => {
                debug!(symbol = %position.symbol, error = %e, "candle fetch failed, reusing cached levels");
                None
            }
        }
    }

    /// Round, validate, submit and record one close action. Returns true
    /// when the action ended the position's management.
    async fn execute_action(&self, position: &ManagedPosition, action: &Action) -> Result<bool> {
        let symbol = &position.symbol;
        let filters = self.symbol_filters(symbol).await;
        let quantity = round_to_step(action.quantity.min(position.quantity), filters.step_size);

        if quantity <= 0.0
            || quantity < filters.min_qty
            || quantity * position.current_price < filters.min_notional
        {
            // Below the exchange minimum: skip without touching hit-flags;
            // the level stays armed for a tick where it is executable.
            warn!(
                symbol = %symbol,
                kind = %action.kind,
                requested = action.quantity,
                rounded = quantity,
                "close quantity below exchange minimum, action skipped"
            );
            return Ok(false);
        }

        let receipt = self
            .exchange
            .close_position(symbol, quantity, position.side, &action.reason)
            .await?;
        let filled = if receipt.executed_qty > 0.0 {
            receipt.executed_qty
        } else {
            quantity
        };
        let fill_complete = filled >= quantity * FILL_TOLERANCE;
        let realized = realized_pnl(position.side, position.entry_price, position.current_price, filled);

        let updated = self
            .store
            .update_with(symbol, |p| {
                p.quantity = (p.quantity - filled).max(0.0);
                if fill_complete {
                    match action.kind {
                        ActionKind::PartialStopLoss => p.partial_stop_hit = true,
                        ActionKind::TakeProfit => {
                            if let Some(idx) = action.tp_index {
                                if let Some(level) =
                                    p.tp_levels.iter_mut().find(|l| l.index == idx)
                                {
                                    level.hit = true;
                                }
                            }
                        }
                        ActionKind::FullStopLoss => {}
                    }
                }
            })
            .await;

        self.stats
            .update(|s| {
                match action.kind {
                    ActionKind::PartialStopLoss => s.total_partial_stops += 1,
                    ActionKind::FullStopLoss => s.total_stop_losses += 1,
                    ActionKind::TakeProfit => {
                        if action.tp_index.is_some() {
                            s.total_take_profits += 1;
                        }
                    }
                }
                s.total_pnl += realized;
            })
            .await;

        info!(
            symbol = %symbol,
            kind = %action.kind,
            qty = filled,
            price = position.current_price,
            order_id = %receipt.order_id,
            pnl = realized,
            "close executed"
        );
        self.emit(NotifierEvent::ActionExecuted {
            position: position.clone(),
            action: action.clone(),
            fill_price: position.current_price,
            realized_pnl: realized,
        });

        let Some(updated) = updated else {
            return Ok(true);
        };

        let dust = updated.quantity_at_detection * self.risk.config().dust_fraction;
        let exhausted = updated.quantity <= dust;
        if action.kind != ActionKind::FullStopLoss && !exhausted {
            return Ok(false);
        }

        if exhausted && updated.quantity > 0.0 && action.kind != ActionKind::FullStopLoss {
            // Residual left by step rounding: flush it so the exchange side
            // is flat before the record is dropped.
            if let Err(e) = self
                .exchange
                .close_position(symbol, updated.quantity, updated.side, "closing residual quantity")
                .await
            {
                warn!(symbol = %symbol, error = %e, "residual close failed, dropping record anyway");
            }
        }

        let outcome = if action.kind == ActionKind::FullStopLoss {
            TradeOutcome::Losing
        } else {
            TradeOutcome::Winning
        };
        self.store.remove(symbol).await;
        self.stats
            .update(|s| match outcome {
                TradeOutcome::Winning => s.winning_trades += 1,
                TradeOutcome::Losing => s.losing_trades += 1,
            })
            .await;
        info!(symbol = %symbol, outcome = ?outcome, "position fully closed, management ended");
        self.emit(NotifierEvent::PositionClosed {
            symbol: symbol.clone(),
            outcome,
            realized_pnl: realized,
        });
        Ok(true)
    }

    // ─── Margin monitoring ────────────────────────────────────────────────────

    /// One margin pass: warn above the risk threshold, forcibly halve every
    /// open position above the flatten threshold. Hit-flags are untouched.
    pub async fn margin_check_tick(&self) {
        let margin = match self.exchange.account_margin().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "margin check skipped");
                return;
            }
        };
        *self.last_margin.write().await = Some(margin.clone());

        let warn_ratio = self.risk.config().margin_warn_ratio;
        let flatten_ratio = self.risk.config().margin_flatten_ratio;
        if margin.margin_ratio <= warn_ratio {
            return;
        }

        warn!(
            ratio = margin.margin_ratio,
            threshold = warn_ratio,
            "margin ratio above risk threshold"
        );
        self.emit(NotifierEvent::MarginWarning {
            margin: margin.clone(),
            threshold: warn_ratio,
        });

        if margin.margin_ratio <= flatten_ratio {
            return;
        }

        let positions = self.store.snapshot().await;
        let count = positions.len();
        for p in &positions {
            let filters = self.symbol_filters(&p.symbol).await;
            let quantity = round_to_step(p.quantity * 0.5, filters.step_size);
            if quantity <= 0.0 {
                continue;
            }
            match self
                .exchange
                .close_position(&p.symbol, quantity, p.side, "margin deleveraging")
                .await
            {
                Ok(receipt) => {
                    let filled = if receipt.executed_qty > 0.0 {
                        receipt.executed_qty
                    } else {
                        quantity
                    };
                    self.store
                        .update_with(&p.symbol, |pos| {
                            pos.quantity = (pos.quantity - filled).max(0.0);
                        })
                        .await;
                    info!(symbol = %p.symbol, qty = filled, "position halved for margin relief");
                }
                Err(e) => warn!(symbol = %p.symbol, error = %e, "margin deleveraging close failed"),
            }
        }
        self.emit(NotifierEvent::MarginFlatten {
            margin,
            positions: count,
        });
    }

    // ─── Reporting ────────────────────────────────────────────────────────────

    pub async fn report_tick(&self) {
        let stats = self.stats.read().await;
        let active = self.store.len().await;
        debug!(active, settled = stats.winning_trades + stats.losing_trades, "report emitted");
        self.emit(NotifierEvent::Report {
            stats,
            active_positions: active,
            generated_at: Utc::now(),
        });
    }

    // ─── Control plane ────────────────────────────────────────────────────────

    /// Close the full remaining quantity of a symbol on operator request and
    /// drop it from management.
    pub async fn force_close(&self, symbol: &str) -> Result<()> {
        let Some(position) = self.store.get(symbol).await else {
            return Err(Error::Validation(format!(
                "no managed position for {symbol}"
            )));
        };

        let receipt = self
            .exchange
            .close_position(symbol, position.quantity, position.side, "manual close")
            .await?;
        let filled = if receipt.executed_qty > 0.0 {
            receipt.executed_qty
        } else {
            position.quantity
        };
        let realized = realized_pnl(
            position.side,
            position.entry_price,
            position.current_price,
            filled,
        );

        self.store.remove(symbol).await;
        self.stats.update(|s| s.total_pnl += realized).await;
        info!(symbol = %symbol, qty = filled, "manual close executed");
        self.emit(NotifierEvent::ManualClose {
            symbol: symbol.to_string(),
            quantity: filled,
        });
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    /// Exchange filters, fetched once per symbol and cached. Unavailable
    /// filters degrade to no rounding rather than blocking a close.
    async fn symbol_filters(&self, symbol: &str) -> SymbolFilters {
        if let Some(f) = self.filters.read().await.get(symbol) {
            return f.clone();
        }
        match self.exchange.symbol_filters(symbol).await {
            Ok(f) => {
                self.filters
                    .write()
                    .await
                    .insert(symbol.to_string(), f.clone());
                f
            }
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "filters unavailable, closing with raw quantity");
                SymbolFilters::default()
            }
        }
    }

    fn emit(&self, event: NotifierEvent) {
        if self.events.try_send(event).is_err() {
            debug!("notifier queue full or closed, event dropped");
        }
    }
}

/// Round a quantity down to the exchange lot step. A zero step leaves the
/// quantity untouched.
fn round_to_step(quantity: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return quantity;
    }
    (quantity / step).floor() * step
}

fn realized_pnl(side: PositionSide, entry: f64, exit: f64, quantity: f64) -> f64 {
    match side {
        PositionSide::Long => (exit - entry) * quantity,
        PositionSide::Short => (entry - exit) * quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_floors_to_the_step() {
        assert_eq!(round_to_step(0.0349, 0.001), 0.034);
        assert_eq!(round_to_step(1.0, 0.1), 1.0);
        assert_eq!(round_to_step(0.05, 0.0), 0.05);
        assert_eq!(round_to_step(0.0009, 0.001), 0.0);
    }

    #[test]
    fn realized_pnl_signs_follow_the_side() {
        assert_eq!(realized_pnl(PositionSide::Long, 100.0, 110.0, 2.0), 20.0);
        assert_eq!(realized_pnl(PositionSide::Long, 100.0, 95.0, 2.0), -10.0);
        assert_eq!(realized_pnl(PositionSide::Short, 100.0, 95.0, 2.0), 10.0);
        assert_eq!(realized_pnl(PositionSide::Short, 100.0, 110.0, 2.0), -20.0);
    }
}
