use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use common::{ManagedPosition, PerformanceStats};

/// In-memory map of managed positions — the sole authority for the managed
/// set.
///
/// Single-writer discipline: only the scheduler mutates. Every accessor
/// copies out under the lock and releases it before doing anything slow;
/// the lock is never held across exchange I/O.
#[derive(Clone, Default)]
pub struct PositionStore {
    inner: Arc<RwLock<HashMap<String, ManagedPosition>>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly adopted position, or refresh the exchange-reported
    /// fields of one already under management. Hit-flags, the detection
    /// quantity, the entry price and the technical cache all survive a
    /// refresh. Returns true when the symbol was new.
    pub async fn upsert(&self, position: ManagedPosition) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(&position.symbol) {
            Some(existing) => {
                existing.quantity = position.quantity;
                existing.leverage = position.leverage;
                existing.last_update = position.last_update;
                false
            }
            None => {
                map.insert(position.symbol.clone(), position);
                true
            }
        }
    }

    pub async fn get(&self, symbol: &str) -> Option<ManagedPosition> {
        self.inner.read().await.get(symbol).cloned()
    }

    pub async fn remove(&self, symbol: &str) -> Option<ManagedPosition> {
        self.inner.write().await.remove(symbol)
    }

    /// Consistent copy of every managed position, sorted by symbol.
    pub async fn snapshot(&self) -> Vec<ManagedPosition> {
        let mut positions: Vec<ManagedPosition> =
            self.inner.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.inner.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Apply a mutation to one position under the write lock. Returns the
    /// updated copy, or `None` if the symbol is no longer managed.
    pub async fn update_with<F>(&self, symbol: &str, f: F) -> Option<ManagedPosition>
    where
        F: FnOnce(&mut ManagedPosition),
    {
        let mut map = self.inner.write().await;
        let position = map.get_mut(symbol)?;
        f(position);
        Some(position.clone())
    }
}

/// Shared performance counters. Written only from the scheduler; readers
/// copy out under the same lock.
#[derive(Clone, Default)]
pub struct SharedStats {
    inner: Arc<RwLock<PerformanceStats>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> PerformanceStats {
        self.inner.read().await.clone()
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PerformanceStats),
    {
        f(&mut *self.inner.write().await)
    }
}
