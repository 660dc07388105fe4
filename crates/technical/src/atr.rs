use common::Candle;

/// Default ATR period.
pub const ATR_PERIOD: usize = 14;

/// Average True Range over the last `period` candles.
///
/// True range at index i (i >= 1):
/// `max(high - low, |high - prev_close|, |low - prev_close|)`.
/// The result is the plain arithmetic mean of the last `period` true
/// ranges. With fewer than `period + 1` candles there is no full window;
/// returns 1% of the last close as a volatility floor.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return candles.last().map(|c| c.close * 0.01).unwrap_or(0.0);
    }

    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let prev_close = pair[0].close;
        let c = &pair[1];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        true_ranges.push(tr);
    }

    let tail = &true_ranges[true_ranges.len() - period..];
    tail.iter().sum::<f64>() / period as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn falls_back_with_exactly_period_candles() {
        // 14 candles is one short of a full window; no division happens.
        let candles: Vec<Candle> = (0..14).map(|_| candle(100.0, 101.0, 99.0, 100.0)).collect();
        let value = atr(&candles, 14);
        assert!((value - 1.0).abs() < 1e-9, "expected 1% of close, got {value}");
    }

    #[test]
    fn constant_spread_gives_spread() {
        let candles: Vec<Candle> = (0..20).map(|_| candle(100.0, 101.5, 98.5, 100.0)).collect();
        let value = atr(&candles, 14);
        assert!((value - 3.0).abs() < 1e-9, "expected 3.0, got {value}");
    }

    #[test]
    fn all_red_window_stays_positive() {
        // Strictly falling closes: gaps make the true range |low - prev_close|
        // positive even when each candle's own spread is small.
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let close = 100.0 - i as f64;
                candle(close + 0.1, close + 0.1, close - 0.1, close)
            })
            .collect();
        let value = atr(&candles, 14);
        assert!(value > 0.0, "ATR must stay positive, got {value}");
    }

    #[test]
    fn empty_series_gives_zero() {
        assert_eq!(atr(&[], 14), 0.0);
    }
}
