//! Error taxonomy for the trading bot

use thiserror::Error;

/// Errors surfaced by the bot core and its broker collaborator
#[derive(Debug, Error)]
pub enum BotError {
    /// Broker session could not be established (fatal at startup)
    #[error("connection failed: {0}")]
    Connection(String),

    /// Historical data request failed; prior metrics are retained
    #[error("data fetch failed for {symbol}: {message}")]
    DataFetch { symbol: String, message: String },

    /// Strategy initialization exceeded its time budget
    #[error("initialization of {symbol} timed out after {secs}s")]
    InitializationTimeout { symbol: String, secs: u64 },

    /// Entry or stop order could not be placed; never retried
    #[error("order placement failed for {symbol}: {message}")]
    OrderPlacement { symbol: String, message: String },

    /// Configuration file is missing or malformed
    #[error("config error in {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl BotError {
    pub fn data_fetch(symbol: &str, message: impl std::fmt::Display) -> Self {
        Self::DataFetch {
            symbol: symbol.to_string(),
            message: message.to_string(),
        }
    }

    pub fn order_placement(symbol: &str, message: impl std::fmt::Display) -> Self {
        Self::OrderPlacement {
            symbol: symbol.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
