use async_trait::async_trait;

use crate::{
    AccountMargin, Candle, CloseReceipt, PositionSide, PositionSnapshot, Result, SymbolFilters,
};

/// Abstraction over the perpetual-futures exchange.
///
/// `BinanceFuturesClient` in `crates/engine` implements this for live
/// accounts; `SimExchange` in `crates/sim` implements it for the
/// integration scenarios.
///
/// The adapter owns request pacing and error classification. It never
/// retries internally: callers surface failures without crashing their
/// loop and try again on the next tick.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Positions with nonzero quantity.
    async fn open_positions(&self) -> Result<Vec<PositionSnapshot>>;

    /// Last trade price for a symbol.
    async fn current_price(&self, symbol: &str) -> Result<f64>;

    /// OHLC candles, newest last.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Submit a reduce-only market order on the side opposing `side`.
    /// The quantity is clamped to what is currently open on the exchange.
    async fn close_position(
        &self,
        symbol: &str,
        quantity: f64,
        side: PositionSide,
        reason: &str,
    ) -> Result<CloseReceipt>;

    /// Account-wide balance and margin usage.
    async fn account_margin(&self) -> Result<AccountMargin>;

    /// Lot-size and notional filters for a symbol.
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;
}
