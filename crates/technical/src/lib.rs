//! Pure indicator math over OHLC series. No I/O; every function takes a
//! candle slice ordered newest-last.

pub mod atr;
pub mod levels;

pub use atr::{atr, ATR_PERIOD};
pub use levels::{support_resistance, SR_LOOKBACK};
