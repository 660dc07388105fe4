use chrono::Utc;
use proptest::prelude::*;

use common::{ManagedPosition, PositionSide, PositionSnapshot, StopLevels, TechnicalLevels};
use risk::{RiskConfig, RiskEngine};

fn side_of(long: bool) -> PositionSide {
    if long {
        PositionSide::Long
    } else {
        PositionSide::Short
    }
}

fn make_position(
    side: PositionSide,
    entry: f64,
    quantity: f64,
    price: f64,
    partial_hit: bool,
) -> ManagedPosition {
    let engine = RiskEngine::new(RiskConfig::default());
    let snapshot = PositionSnapshot {
        symbol: "TESTUSDT".into(),
        side,
        quantity,
        entry_price: entry,
        leverage: 5,
        unrealized_pnl: 0.0,
        liquidation_price: 0.0,
    };
    let mut p = ManagedPosition::adopt(&snapshot, engine.tp_ladder(entry, side, None), Utc::now());
    p.current_price = price;
    p.partial_stop_hit = partial_hit;
    p.stops = Some(engine.default_stop_levels(entry, side));
    p
}

proptest! {
    /// The clamped full stop always implies a loss between min_stop_loss
    /// and max_stop_loss of entry, and the partial stop always sits on the
    /// entry-to-full-stop segment.
    #[test]
    fn full_stop_stays_within_hard_bounds(
        entry in 1.0f64..100_000.0,
        current_off in -0.2f64..0.2,
        atr_frac in 0.0f64..0.1,
        band in 0.0f64..0.1,
        long in any::<bool>(),
    ) {
        let engine = RiskEngine::new(RiskConfig::default());
        let side = side_of(long);
        let current = entry * (1.0 + current_off);
        let levels = TechnicalLevels {
            atr: entry * atr_frac,
            support: entry * (1.0 - band),
            resistance: entry * (1.0 + band),
            computed_at: Utc::now(),
        };

        let stops = engine.stop_levels(entry, side, current, &levels);
        match side {
            PositionSide::Long => {
                prop_assert!(stops.full_stop >= entry * 0.95 - 1e-6);
                prop_assert!(stops.full_stop <= entry * 0.985 + 1e-6);
                prop_assert!(stops.partial_stop <= entry + 1e-6);
                prop_assert!(stops.partial_stop >= stops.full_stop - 1e-6);
            }
            PositionSide::Short => {
                prop_assert!(stops.full_stop <= entry * 1.05 + 1e-6);
                prop_assert!(stops.full_stop >= entry * 1.015 - 1e-6);
                prop_assert!(stops.partial_stop >= entry - 1e-6);
                prop_assert!(stops.partial_stop <= stops.full_stop + 1e-6);
            }
        }
    }

    /// The same inputs always produce bit-identical stop levels.
    #[test]
    fn stop_levels_are_deterministic(
        entry in 1.0f64..100_000.0,
        current_off in -0.2f64..0.2,
        atr_frac in 0.0f64..0.1,
        long in any::<bool>(),
    ) {
        let engine = RiskEngine::new(RiskConfig::default());
        let side = side_of(long);
        let current = entry * (1.0 + current_off);
        let levels = TechnicalLevels {
            atr: entry * atr_frac,
            support: entry * 0.97,
            resistance: entry * 1.03,
            computed_at: Utc::now(),
        };
        let a = engine.stop_levels(entry, side, current, &levels);
        let b = engine.stop_levels(entry, side, current, &levels);
        prop_assert_eq!(a.full_stop.to_bits(), b.full_stop.to_bits());
        prop_assert_eq!(a.partial_stop.to_bits(), b.partial_stop.to_bits());
    }

    /// Action derivation never panics on extreme prices and never requests
    /// more than the open quantity in one tick.
    #[test]
    fn evaluate_never_overcloses(
        entry in 0.0001f64..1_000_000.0,
        price in 0.0001f64..1_000_000.0,
        quantity in 0.0001f64..1000.0,
        partial_hit in any::<bool>(),
        long in any::<bool>(),
    ) {
        let engine = RiskEngine::new(RiskConfig::default());
        let position = make_position(side_of(long), entry, quantity, price, partial_hit);

        let actions = engine.evaluate(&position);
        let total: f64 = actions.iter().map(|a| a.quantity).sum();
        prop_assert!(total <= position.quantity + 1e-9);
        prop_assert!(actions.iter().all(|a| a.quantity > 0.0));
    }

    /// A breached full stop is terminal: it is the only action of the tick
    /// and covers everything that is left.
    #[test]
    fn full_stop_is_always_alone(
        entry in 1.0f64..100_000.0,
        quantity in 0.0001f64..1000.0,
        long in any::<bool>(),
    ) {
        let engine = RiskEngine::new(RiskConfig::default());
        let side = side_of(long);
        let price = match side {
            PositionSide::Long => entry * 0.90,
            PositionSide::Short => entry * 1.10,
        };
        let mut position = make_position(side, entry, quantity, price, false);
        position.stops = Some(StopLevels {
            full_stop: match side {
                PositionSide::Long => entry * 0.95,
                PositionSide::Short => entry * 1.05,
            },
            partial_stop: match side {
                PositionSide::Long => entry * 0.98,
                PositionSide::Short => entry * 1.02,
            },
        });

        let actions = engine.evaluate(&position);
        prop_assert_eq!(actions.len(), 1);
        prop_assert_eq!(actions[0].kind, common::ActionKind::FullStopLoss);
        prop_assert!((actions[0].quantity - position.quantity).abs() < 1e-12);
    }
}
