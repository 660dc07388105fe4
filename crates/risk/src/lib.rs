pub mod config;
pub mod engine;

pub use config::{RiskConfig, TpSpec};
pub use engine::RiskEngine;
