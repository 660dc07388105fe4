use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::config::{optional_parsed, parse_truthy};

/// One rung of the configured take-profit ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TpSpec {
    /// Profit as a fraction of the entry price.
    pub profit: f64,
    /// Fraction of the quantity at detection to close.
    pub close_fraction: f64,
}

/// User-tunable risk parameters.
///
/// Defaults match the production values; every knob can be overridden from
/// the environment via `from_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Smallest allowed full-stop loss, fraction of entry (clamp floor).
    pub min_stop_loss: f64,
    /// Largest allowed full-stop loss, fraction of entry (clamp ceiling).
    pub max_stop_loss: f64,
    /// ATR multiplier in the volatility leg of the base stop.
    pub volatility_multiplier: f64,
    /// Where the partial stop sits on the entry-to-full-stop segment.
    pub partial_trigger: f64,
    /// Fraction of the quantity at detection closed by a partial stop.
    pub partial_stop_fraction: f64,
    pub take_profit_levels: Vec<TpSpec>,
    /// Stretch TP targets by `1 + (atr/close) * volatility_multiplier` at
    /// ladder creation. Never rescaled afterwards.
    pub scale_tp_with_volatility: bool,
    /// Margin ratio that triggers a warning notification.
    pub margin_warn_ratio: f64,
    /// Margin ratio that triggers forced 50% deleveraging.
    pub margin_flatten_ratio: f64,
    /// Maximum age of a cached technical snapshot.
    pub technical_refresh: Duration,
    /// Remaining quantity at or below this fraction of the detection
    /// quantity counts as closed.
    pub dust_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_stop_loss: 0.015,
            max_stop_loss: 0.05,
            volatility_multiplier: 1.5,
            partial_trigger: 0.4,
            partial_stop_fraction: 0.3,
            take_profit_levels: vec![
                TpSpec { profit: 0.0025, close_fraction: 0.5 },
                TpSpec { profit: 0.0030, close_fraction: 0.3 },
                TpSpec { profit: 0.0035, close_fraction: 0.2 },
            ],
            scale_tp_with_volatility: false,
            margin_warn_ratio: 0.70,
            margin_flatten_ratio: 0.85,
            technical_refresh: Duration::from_secs(60 * 60),
            dust_fraction: 0.05,
        }
    }
}

impl RiskConfig {
    /// Defaults overlaid with any numeric environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = optional_parsed("MIN_STOP_LOSS") {
            cfg.min_stop_loss = v;
        }
        if let Some(v) = optional_parsed("MAX_STOP_LOSS") {
            cfg.max_stop_loss = v;
        }
        if let Some(v) = optional_parsed("VOLATILITY_MULTIPLIER") {
            cfg.volatility_multiplier = v;
        }
        if let Some(v) = optional_parsed("PARTIAL_TRIGGER") {
            cfg.partial_trigger = v;
        }
        if let Some(v) = optional_parsed("PARTIAL_STOP_FRACTION") {
            cfg.partial_stop_fraction = v;
        }
        if let Some(v) = optional_parsed::<String>("SCALE_TP_WITH_VOLATILITY") {
            cfg.scale_tp_with_volatility = parse_truthy(&v);
        }
        if let Some(v) = optional_parsed("MARGIN_RISK_THRESHOLD") {
            cfg.margin_warn_ratio = v;
        }
        if let Some(v) = optional_parsed("MARGIN_FLATTEN_THRESHOLD") {
            cfg.margin_flatten_ratio = v;
        }
        if let Some(v) = optional_parsed("TECHNICAL_REFRESH_SECS") {
            cfg.technical_refresh = Duration::from_secs(v);
        }
        if let Some(v) = optional_parsed("DUST_FRACTION") {
            cfg.dust_fraction = v;
        }
        cfg
    }
}
