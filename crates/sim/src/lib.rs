//! Scripted exchange double for the integration scenarios.
//!
//! Tests seed positions, price sequences and candle histories, then drive
//! scheduler ticks directly and inspect the recorded close orders. Closes
//! shrink the scripted position, mirroring the real exchange.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use common::{
    AccountMargin, Candle, CloseReceipt, Error, Exchange, PositionSide, PositionSnapshot, Result,
    SymbolFilters,
};

/// One recorded close order.
#[derive(Debug, Clone)]
pub struct RecordedClose {
    pub symbol: String,
    pub quantity: f64,
    pub side: PositionSide,
    pub reason: String,
}

#[derive(Default)]
struct Inner {
    positions: HashMap<String, PositionSnapshot>,
    /// Per-symbol price script, consumed front-to-back; the last price
    /// repeats once the script runs out.
    prices: HashMap<String, Vec<f64>>,
    candles: HashMap<String, Vec<Candle>>,
    margin: AccountMargin,
    filters: HashMap<String, SymbolFilters>,
    closes: Vec<RecordedClose>,
    fail_klines: bool,
}

#[derive(Default)]
pub struct SimExchange {
    inner: Mutex<Inner>,
}

impl SimExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_position(&self, snapshot: PositionSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.positions.insert(snapshot.symbol.clone(), snapshot);
    }

    /// Simulate an external close: the exchange simply stops reporting it.
    pub fn drop_position(&self, symbol: &str) {
        self.inner.lock().unwrap().positions.remove(symbol);
    }

    pub fn set_prices(&self, symbol: &str, prices: &[f64]) {
        self.inner
            .lock()
            .unwrap()
            .prices
            .insert(symbol.to_string(), prices.to_vec());
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.inner
            .lock()
            .unwrap()
            .candles
            .insert(symbol.to_string(), candles);
    }

    pub fn set_margin(&self, margin: AccountMargin) {
        self.inner.lock().unwrap().margin = margin;
    }

    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.inner
            .lock()
            .unwrap()
            .filters
            .insert(symbol.to_string(), filters);
    }

    pub fn fail_klines(&self, fail: bool) {
        self.inner.lock().unwrap().fail_klines = fail;
    }

    pub fn closes(&self) -> Vec<RecordedClose> {
        self.inner.lock().unwrap().closes.clone()
    }

    pub fn position_quantity(&self, symbol: &str) -> Option<f64> {
        self.inner
            .lock()
            .unwrap()
            .positions
            .get(symbol)
            .map(|p| p.quantity)
    }
}

/// Snapshot builder for tests.
pub fn snapshot(symbol: &str, side: PositionSide, quantity: f64, entry: f64) -> PositionSnapshot {
    PositionSnapshot {
        symbol: symbol.into(),
        side,
        quantity,
        entry_price: entry,
        leverage: 10,
        unrealized_pnl: 0.0,
        liquidation_price: 0.0,
    }
}

/// Candle history with a fixed spread around `close`: ATR equals the
/// spread, support and resistance hug the band.
pub fn flat_candles(close: f64, spread: f64, count: usize) -> Vec<Candle> {
    let start = Utc::now() - Duration::minutes(15 * count as i64);
    (0..count)
        .map(|i| Candle {
            open_time: start + Duration::minutes(15 * i as i64),
            open: close,
            high: close + spread / 2.0,
            low: close - spread / 2.0,
            close,
            volume: 100.0,
        })
        .collect()
}

#[async_trait]
impl Exchange for SimExchange {
    async fn open_positions(&self) -> Result<Vec<PositionSnapshot>> {
        let inner = self.inner.lock().unwrap();
        let mut positions: Vec<PositionSnapshot> = inner
            .positions
            .values()
            .filter(|p| p.quantity > 0.0)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        let mut inner = self.inner.lock().unwrap();
        let script = inner
            .prices
            .get_mut(symbol)
            .ok_or_else(|| Error::TransientExchange(format!("no price script for {symbol}")))?;
        if script.is_empty() {
            return Err(Error::TransientExchange(format!(
                "price script for {symbol} is empty"
            )));
        }
        Ok(if script.len() > 1 {
            script.remove(0)
        } else {
            script[0]
        })
    }

    async fn klines(&self, symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Candle>> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_klines {
            return Err(Error::TransientExchange("scripted kline failure".into()));
        }
        Ok(inner.candles.get(symbol).cloned().unwrap_or_default())
    }

    async fn close_position(
        &self,
        symbol: &str,
        quantity: f64,
        side: PositionSide,
        reason: &str,
    ) -> Result<CloseReceipt> {
        let mut inner = self.inner.lock().unwrap();
        let Some(position) = inner.positions.get_mut(symbol) else {
            return Err(Error::Validation(format!(
                "no open position for {symbol} on the exchange"
            )));
        };

        let filled = quantity.min(position.quantity);
        position.quantity -= filled;
        if position.quantity <= 0.0 {
            inner.positions.remove(symbol);
        }

        inner.closes.push(RecordedClose {
            symbol: symbol.to_string(),
            quantity: filled,
            side,
            reason: reason.to_string(),
        });
        let order_id = format!("sim-{}", inner.closes.len());
        Ok(CloseReceipt {
            order_id,
            executed_qty: filled,
        })
    }

    async fn account_margin(&self) -> Result<AccountMargin> {
        Ok(self.inner.lock().unwrap().margin.clone())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .filters
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }
}
