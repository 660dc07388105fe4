use common::Candle;

/// Default support/resistance lookback.
pub const SR_LOOKBACK: usize = 20;

/// Rolling support and resistance: the minimum low and maximum high over
/// the last `lookback` candles.
///
/// When the current price has already broken out of the band, the breached
/// side is pushed 0.5% past the price so stops derived from it stay on the
/// correct side. With fewer than `lookback` candles, returns a ±1% band
/// around the last close.
pub fn support_resistance(candles: &[Candle], lookback: usize, current_price: f64) -> (f64, f64) {
    if lookback == 0 || candles.len() < lookback {
        let anchor = candles.last().map(|c| c.close).unwrap_or(current_price);
        return (anchor * 0.99, anchor * 1.01);
    }

    let recent = &candles[candles.len() - lookback..];
    let mut support = f64::MAX;
    let mut resistance = f64::MIN;
    for c in recent {
        support = support.min(c.low);
        resistance = resistance.max(c.high);
    }

    if current_price > resistance {
        resistance = current_price * 1.005;
    }
    if current_price < support {
        support = current_price * 0.995;
    }

    (support, resistance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn min_low_and_max_high_over_window() {
        let mut candles: Vec<Candle> = (0..20).map(|_| candle(301.5, 298.5, 300.0)).collect();
        candles[5] = candle(310.0, 294.0, 300.0);
        let (support, resistance) = support_resistance(&candles, 20, 300.0);
        assert_eq!(support, 294.0);
        assert_eq!(resistance, 310.0);
    }

    #[test]
    fn older_extremes_fall_out_of_the_window() {
        let mut candles: Vec<Candle> = (0..30).map(|_| candle(101.0, 99.0, 100.0)).collect();
        candles[3] = candle(150.0, 50.0, 100.0); // outside the last 20
        let (support, resistance) = support_resistance(&candles, 20, 100.0);
        assert_eq!(support, 99.0);
        assert_eq!(resistance, 101.0);
    }

    #[test]
    fn breakout_widens_the_breached_side() {
        let candles: Vec<Candle> = (0..20).map(|_| candle(101.0, 99.0, 100.0)).collect();

        let (_, resistance) = support_resistance(&candles, 20, 105.0);
        assert!((resistance - 105.0 * 1.005).abs() < 1e-9);

        let (support, _) = support_resistance(&candles, 20, 95.0);
        assert!((support - 95.0 * 0.995).abs() < 1e-9);
    }

    #[test]
    fn sparse_series_returns_band_around_last_close() {
        let candles = vec![candle(101.0, 99.0, 100.0)];
        let (support, resistance) = support_resistance(&candles, 20, 100.0);
        assert!((support - 99.0).abs() < 1e-9);
        assert!((resistance - 101.0).abs() < 1e-9);
    }
}
