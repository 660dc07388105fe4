use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side of an open futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side of a reduce-only market order that shrinks this position.
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            PositionSide::Long => "SELL",
            PositionSide::Short => "BUY",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// One open position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute open quantity, always > 0.
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
}

/// One OHLC candle. Every series in this workspace is ordered newest-last.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Market microstructure snapshot, refreshed at most hourly per position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TechnicalLevels {
    pub atr: f64,
    pub support: f64,
    pub resistance: f64,
    pub computed_at: DateTime<Utc>,
}

/// Two-tier stop envelope derived from the technical snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StopLevels {
    /// Terminal stop: closes the remaining quantity.
    pub full_stop: f64,
    /// Intermediate stop: closes a fraction, leaves the rest exposed.
    pub partial_stop: f64,
}

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TpLevel {
    /// 1-based ladder index. Rung N never fires before rung N-1.
    pub index: usize,
    pub target_price: f64,
    /// Fraction of the quantity at detection closed when this rung fires.
    pub close_fraction: f64,
    pub hit: bool,
}

/// A position under management, the unit the scheduler operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedPosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Current open quantity; shrinks as partial closes fill.
    pub quantity: f64,
    /// Open quantity when the position was first detected. Close fractions
    /// are computed against this, never against the shrinking remainder.
    pub quantity_at_detection: f64,
    /// Weighted entry reported by the exchange at first detection; never
    /// re-read afterwards.
    pub entry_price: f64,
    pub leverage: u32,
    pub managed_since: DateTime<Utc>,
    pub current_price: f64,
    /// `None` until the first successful technical refresh.
    pub technical: Option<TechnicalLevels>,
    pub stops: Option<StopLevels>,
    pub tp_levels: Vec<TpLevel>,
    pub partial_stop_hit: bool,
    pub last_update: DateTime<Utc>,
}

impl ManagedPosition {
    /// Build a fresh management record from an exchange snapshot. The stop
    /// envelope stays empty until the first technical refresh; the TP
    /// ladder is fixed here and never re-anchored.
    pub fn adopt(snapshot: &PositionSnapshot, tp_levels: Vec<TpLevel>, now: DateTime<Utc>) -> Self {
        Self {
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            quantity: snapshot.quantity,
            quantity_at_detection: snapshot.quantity,
            entry_price: snapshot.entry_price,
            leverage: snapshot.leverage,
            managed_since: now,
            current_price: snapshot.entry_price,
            technical: None,
            stops: None,
            tp_levels,
            partial_stop_hit: false,
            last_update: now,
        }
    }

    pub fn all_tp_hit(&self) -> bool {
        !self.tp_levels.is_empty() && self.tp_levels.iter().all(|l| l.hit)
    }

    /// Unrealized PnL at the last observed price.
    pub fn unrealized_pnl(&self) -> f64 {
        match self.side {
            PositionSide::Long => (self.current_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - self.current_price) * self.quantity,
        }
    }

    pub fn pnl_percent(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            PositionSide::Long => (self.current_price / self.entry_price - 1.0) * 100.0,
            PositionSide::Short => (1.0 - self.current_price / self.entry_price) * 100.0,
        }
    }
}

/// What the risk engine decided to do about a position at the current price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    PartialStopLoss,
    FullStopLoss,
    TakeProfit,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::PartialStopLoss => write!(f, "PARTIAL_STOP_LOSS"),
            ActionKind::FullStopLoss => write!(f, "FULL_STOP_LOSS"),
            ActionKind::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

/// A close decision emitted by the risk engine.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Absolute close quantity.
    pub quantity: f64,
    pub reason: String,
    /// 1-based ladder index, present for take-profit rungs.
    pub tp_index: Option<usize>,
}

/// Account-wide margin health.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMargin {
    pub wallet_balance: f64,
    pub margin_balance: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    /// Fraction of the margin balance in use, 0.0..=1.0.
    pub margin_ratio: f64,
}

/// Lifetime counters, written only by the scheduler's level-check path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_managed: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_take_profits: u64,
    pub total_stop_losses: u64,
    pub total_partial_stops: u64,
    pub total_pnl: f64,
}

impl PerformanceStats {
    /// Percentage of settled positions that ended winning.
    pub fn win_rate(&self) -> f64 {
        let settled = self.winning_trades + self.losing_trades;
        if settled == 0 {
            0.0
        } else {
            self.winning_trades as f64 / settled as f64 * 100.0
        }
    }
}

/// Exchange trading filters used to round close quantities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub min_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

/// Confirmation of a submitted close order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReceipt {
    pub order_id: String,
    /// Filled quantity as confirmed by the exchange; authoritative for the
    /// remaining position size.
    pub executed_qty: f64,
}
