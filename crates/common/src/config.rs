use std::time::Duration;

use crate::{Error, Result};

/// All runtime configuration, read from environment variables at startup.
///
/// A missing required variable is a fatal `Error::Config`; the binary maps
/// it to exit code 1.
#[derive(Debug, Clone)]
pub struct Config {
    // Exchange credentials
    pub exchange_api_key: String,
    pub exchange_api_secret: String,
    pub exchange_testnet: bool,

    // Telegram notifier
    pub notifier_token: String,
    pub notifier_chat_id: i64,

    // Control API
    pub api_keys: Vec<String>,
    pub api_host: String,
    pub api_port: u16,

    // Symbols eligible for management
    pub symbols: Vec<String>,

    // Scheduler periods
    pub detect_interval: Duration,
    pub level_check_interval: Duration,
    pub margin_check_interval: Duration,
    pub report_interval: Duration,
}

impl Config {
    /// Load all configuration from the environment, reading `.env` first if
    /// one is present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let symbols = parse_list(&required("SYMBOLS")?);
        if symbols.is_empty() {
            return Err(Error::Config("SYMBOLS must name at least one symbol".into()));
        }

        let notifier_chat_id = required("NOTIFIER_CHAT_ID")?
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::Config("NOTIFIER_CHAT_ID must be a numeric chat id".into()))?;

        Ok(Config {
            exchange_api_key: required("EXCHANGE_API_KEY")?,
            exchange_api_secret: required("EXCHANGE_API_SECRET")?,
            exchange_testnet: optional("EXCHANGE_TESTNET")
                .map(|v| parse_truthy(&v))
                .unwrap_or(false),
            notifier_token: required("NOTIFIER_TOKEN")?,
            notifier_chat_id,
            api_keys: optional("API_KEYS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            api_host: optional("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: optional_parsed("API_PORT").unwrap_or(8080),
            symbols,
            detect_interval: interval_from_env("DETECT_INTERVAL_SECS", 30),
            level_check_interval: interval_from_env("LEVEL_CHECK_INTERVAL_SECS", 10),
            margin_check_interval: interval_from_env("MARGIN_CHECK_INTERVAL_SECS", 60),
            report_interval: interval_from_env("REPORT_INTERVAL_SECS", 6 * 60 * 60),
        })
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| Error::Config(format!("required environment variable '{key}' is not set")))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Optional environment variable parsed into `T`, silently falling back on
/// parse failure. Shared with the risk-constant overrides.
pub fn optional_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    optional(key).and_then(|v| v.trim().parse().ok())
}

fn interval_from_env(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(optional_parsed(key).unwrap_or(default_secs))
}

/// Accepts the usual truthy spellings for boolean switches.
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Comma-separated list, trimmed, empty entries dropped.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_spellings() {
        assert!(parse_truthy("1"));
        assert!(parse_truthy("TRUE"));
        assert!(parse_truthy(" yes "));
        assert!(!parse_truthy("0"));
        assert!(!parse_truthy("false"));
        assert!(!parse_truthy(""));
    }

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_list("BNBUSDT, ETHUSDT ,,BTCUSDT"),
            vec!["BNBUSDT", "ETHUSDT", "BTCUSDT"]
        );
        assert!(parse_list("  ").is_empty());
    }
}
