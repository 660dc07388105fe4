use tracing::debug;

use common::{
    Action, ActionKind, ManagedPosition, PositionSide, StopLevels, TechnicalLevels, TpLevel,
};

use crate::RiskConfig;

/// The decision core: maps a position plus market microstructure onto stop
/// levels, a take-profit ladder, and the ordered close actions for the
/// current price.
///
/// Holds no per-position state. Which levels already fired lives on the
/// position record; this engine only reads those flags.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Two-tier dynamic stop for a position.
    ///
    /// The base full stop is the tighter of a support/resistance margin and
    /// an ATR envelope around the current price, then hard-clamped so the
    /// implied loss always stays within `[min_stop_loss, max_stop_loss]` of
    /// entry. A degenerate base (sparse candles, zero ATR) lands on the
    /// minimum-loss bound, the side closer to entry. The partial stop sits
    /// at `partial_trigger` of the entry-to-full-stop distance.
    pub fn stop_levels(
        &self,
        entry: f64,
        side: PositionSide,
        current: f64,
        levels: &TechnicalLevels,
    ) -> StopLevels {
        let vol = levels.atr * self.config.volatility_multiplier;

        let base = match side {
            PositionSide::Long => (levels.support * (1.0 - 0.001)).max(current - vol),
            PositionSide::Short => (levels.resistance * (1.0 + 0.001)).min(current + vol),
        };

        let full_stop = self.clamp_full_stop(entry, base, side);
        StopLevels {
            full_stop,
            partial_stop: self.partial_stop(entry, full_stop, side),
        }
    }

    /// Fallback stop when no technical snapshot was ever computed: the
    /// minimum-loss clamp bound.
    pub fn default_stop_levels(&self, entry: f64, side: PositionSide) -> StopLevels {
        let full_stop = match side {
            PositionSide::Long => entry * (1.0 - self.config.min_stop_loss),
            PositionSide::Short => entry * (1.0 + self.config.min_stop_loss),
        };
        StopLevels {
            full_stop,
            partial_stop: self.partial_stop(entry, full_stop, side),
        }
    }

    fn clamp_full_stop(&self, entry: f64, base: f64, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => {
                let widest = entry * (1.0 - self.config.max_stop_loss);
                let tightest = entry * (1.0 - self.config.min_stop_loss);
                base.max(widest).min(tightest)
            }
            PositionSide::Short => {
                let widest = entry * (1.0 + self.config.max_stop_loss);
                let tightest = entry * (1.0 + self.config.min_stop_loss);
                base.min(widest).max(tightest)
            }
        }
    }

    fn partial_stop(&self, entry: f64, full_stop: f64, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => entry - (entry - full_stop) * self.config.partial_trigger,
            PositionSide::Short => entry + (full_stop - entry) * self.config.partial_trigger,
        }
    }

    /// Take-profit ladder anchored at the entry price.
    ///
    /// `volatility` is `(atr, reference_close)`; when volatility scaling is
    /// enabled the targets stretch by the relative ATR. Scaling happens
    /// here, at creation, and never again.
    pub fn tp_ladder(
        &self,
        entry: f64,
        side: PositionSide,
        volatility: Option<(f64, f64)>,
    ) -> Vec<TpLevel> {
        let scale = match volatility {
            Some((atr, close)) if self.config.scale_tp_with_volatility && close > 0.0 => {
                1.0 + (atr / close) * self.config.volatility_multiplier
            }
            _ => 1.0,
        };

        self.config
            .take_profit_levels
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let profit = spec.profit * scale;
                let target_price = match side {
                    PositionSide::Long => entry * (1.0 + profit),
                    PositionSide::Short => entry * (1.0 - profit),
                };
                TpLevel {
                    index: i + 1,
                    target_price,
                    close_fraction: spec.close_fraction,
                    hit: false,
                }
            })
            .collect()
    }

    /// Ordered actions for the current price.
    ///
    /// Priority: a breached full stop is terminal and closes everything
    /// left; the partial stop fires once per position lifetime; TP rungs
    /// fire in ascending index order, several in one tick when price gapped
    /// past them. Quantities are clamped to the open remainder: the
    /// cumulative closes requested for a position never exceed its current
    /// quantity, including after a restart rebuilt the record from the
    /// exchange.
    pub fn evaluate(&self, position: &ManagedPosition) -> Vec<Action> {
        let Some(stops) = position.stops else {
            return Vec::new();
        };
        let price = position.current_price;
        let side = position.side;

        if stop_breached(price, stops.full_stop, side) {
            return vec![Action {
                kind: ActionKind::FullStopLoss,
                quantity: position.quantity,
                reason: format!("full stop at {:.4} reached", stops.full_stop),
                tp_index: None,
            }];
        }

        let mut actions = Vec::new();
        let mut remaining = position.quantity;

        if !position.partial_stop_hit && stop_breached(price, stops.partial_stop, side) {
            let qty = (position.quantity_at_detection * self.config.partial_stop_fraction)
                .min(remaining);
            if qty > 0.0 {
                remaining -= qty;
                actions.push(Action {
                    kind: ActionKind::PartialStopLoss,
                    quantity: qty,
                    reason: format!("partial stop at {:.4} reached", stops.partial_stop),
                    tp_index: None,
                });
            }
        }

        for level in &position.tp_levels {
            if level.hit {
                continue;
            }
            if !target_reached(price, level.target_price, side) {
                // Rungs are price-ordered; the first unreached one ends the
                // sweep and keeps the ladder firing strictly in order.
                break;
            }
            let qty = (position.quantity_at_detection * level.close_fraction).min(remaining);
            if qty <= 0.0 {
                continue;
            }
            remaining -= qty;
            actions.push(Action {
                kind: ActionKind::TakeProfit,
                quantity: qty,
                reason: format!(
                    "take-profit level {} at {:.4} reached",
                    level.index, level.target_price
                ),
                tp_index: Some(level.index),
            });
        }

        if !actions.is_empty() {
            debug!(symbol = %position.symbol, count = actions.len(), "actions derived");
        }
        actions
    }
}

/// Adverse trigger: at or past the stop on the losing side.
fn stop_breached(price: f64, stop: f64, side: PositionSide) -> bool {
    match side {
        PositionSide::Long => price <= stop,
        PositionSide::Short => price >= stop,
    }
}

/// Favorable trigger: a target equal to the current price counts as reached.
fn target_reached(price: f64, target: f64, side: PositionSide) -> bool {
    match side {
        PositionSide::Long => price >= target,
        PositionSide::Short => price <= target,
    }
}
