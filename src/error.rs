use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum MartiError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Raised only at live start, before any order is placed
    #[error("Insufficient funds: required {required} {asset}, available {available}")]
    InsufficientFunds {
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    // Recoverable exchange failures
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    // Broken ledger arithmetic is a programming error, not a runtime condition
    #[error("Invariant violation: {0}")]
    Invariant(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MartiError
pub type Result<T> = std::result::Result<T, MartiError>;

/// Failures of a single exchange call
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed payload: {0}")]
    Payload(String),
}

impl MartiError {
    /// Gateway failures are skipped-and-retried; everything else ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MartiError::Gateway(_))
    }
}
