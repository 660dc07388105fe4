use chrono::{DateTime, Utc};

use crate::{AccountMargin, Action, ManagedPosition, PerformanceStats};

/// How a settled position ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Winning,
    Losing,
}

/// Outbound notification events. Producers enqueue with `try_send` and move
/// on; delivery is fire-and-forget and may drop an event after retries.
#[derive(Debug, Clone)]
pub enum NotifierEvent {
    Started {
        active_positions: usize,
    },
    PositionAdopted {
        position: ManagedPosition,
    },
    ActionExecuted {
        position: ManagedPosition,
        action: Action,
        fill_price: f64,
        realized_pnl: f64,
    },
    PositionClosed {
        symbol: String,
        outcome: TradeOutcome,
        realized_pnl: f64,
    },
    ExternallyClosed {
        symbol: String,
    },
    ManualClose {
        symbol: String,
        quantity: f64,
    },
    SymbolDropped {
        symbol: String,
        error: String,
    },
    MarginWarning {
        margin: AccountMargin,
        threshold: f64,
    },
    MarginFlatten {
        margin: AccountMargin,
        positions: usize,
    },
    Report {
        stats: PerformanceStats,
        active_positions: usize,
        generated_at: DateTime<Utc>,
    },
}
