//! Per-symbol trade state
//!
//! One [`TradeState`] exists per configured symbol. It is owned by that
//! symbol's strategy and mutated only through it.

use chrono::Utc;
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

use crate::broker::Bar;

/// Lifecycle status of a symbol's strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    /// Registered, reference range not yet established
    WaitingForOrb,
    /// Reference range known, watching for a breakout
    Monitoring,
    /// Entry submitted; terminal for the session
    InTrade,
    /// Watch-only symbol, never trades
    Observing,
    /// Entry decision made but the broker rejected the orders
    OrderFailed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitingForOrb => write!(f, "WAITING_FOR_ORB"),
            Self::Monitoring => write!(f, "MONITORING"),
            Self::InTrade => write!(f, "IN_TRADE"),
            Self::Observing => write!(f, "OBSERVING"),
            Self::OrderFailed => write!(f, "ORDER_FAILED"),
        }
    }
}

/// Reference candle used for breakout comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Levels {
    pub high: f64,
    pub low: f64,
    pub open: f64,
    pub close: f64,
    /// ISO-8601 start time of the candle
    pub candle_time: String,
}

impl Levels {
    pub fn from_bar(bar: &Bar) -> Self {
        Self {
            high: bar.high,
            low: bar.low,
            open: bar.open,
            close: bar.close,
            candle_time: bar.timestamp.to_rfc3339(),
        }
    }
}

/// Mutable record for a single symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeState {
    pub symbol: String,
    pub levels: Option<Levels>,
    pub position: i64,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: TradeStatus,
    pub atr: f64,
    pub last_price: f64,
    pub logs: Vec<String>,
}

impl TradeState {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            levels: None,
            position: 0,
            entry_price: None,
            stop_loss: None,
            status: TradeStatus::WaitingForOrb,
            atr: 0.0,
            last_price: 0.0,
            logs: Vec::new(),
        }
    }

    /// Append a message stamped with New York wall-clock time
    pub fn add_log(&mut self, message: impl AsRef<str>) {
        let now = Utc::now().with_timezone(&New_York);
        self.logs
            .push(format!("[{}] {}", now.format("%H:%M:%S"), message.as_ref()));
    }

    /// Set the session's reference range. Ignored once levels exist.
    pub fn set_levels(&mut self, levels: Levels) -> bool {
        if self.levels.is_some() {
            return false;
        }
        self.levels = Some(levels);
        true
    }

    /// Record an entry. Entry price and stop are always set together.
    pub fn enter(&mut self, entry_price: f64, stop_loss: f64, quantity: i64) {
        self.entry_price = Some(entry_price);
        self.stop_loss = Some(stop_loss);
        self.position = quantity;
        self.status = TradeStatus::InTrade;
    }

    /// Mark a rejected entry: flat, entry/stop kept for inspection
    pub fn mark_order_failed(&mut self) {
        self.position = 0;
        self.status = TradeStatus::OrderFailed;
    }

    pub fn set_atr(&mut self, atr: f64) {
        self.atr = atr.max(0.0);
    }

    /// Most recent `window` log lines
    pub fn recent_logs(&self, window: usize) -> &[String] {
        let start = self.logs.len().saturating_sub(window);
        &self.logs[start..]
    }
}
