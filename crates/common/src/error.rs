use thiserror::Error;

/// Error taxonomy for the position manager.
///
/// Every exchange failure is classified at the adapter boundary: transient
/// errors (timeouts, 5xx, rate limits) abort the current tick for the
/// affected symbol and are retried on the next one; permanent errors
/// (other 4xx) eventually drop the symbol from the managed set.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transient exchange error: {0}")]
    TransientExchange(String),

    #[error("permanent exchange error: {0}")]
    PermanentExchange(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("notifier error: {0}")]
    Notifier(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl Error {
    /// True for failures worth retrying on the next scheduler tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientExchange(_) | Error::Http(_) | Error::Notifier(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
