pub mod binance;
pub mod manager;
pub mod store;

pub use binance::BinanceFuturesClient;
pub use manager::{Intervals, ManagerCommand, TradeManager};
pub use store::{PositionStore, SharedStats};
