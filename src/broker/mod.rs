//! Broker capability
//!
//! The bot only needs four things from a broker session: historical bars,
//! a tick stream, a rolling bar stream and linked order placement. Anything
//! that provides them implements [`Broker`].

mod bars;
pub mod dry_run;
pub mod ib;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::orders::{BracketOrder, OrderSide};

pub use bars::BarAggregator;
pub use dry_run::DryRunBroker;
pub use ib::{IbBroker, IbConfig};

/// Broker-assigned id of the parent order
pub type OrderId = i32;

/// OHLCV bar with the bar's volume-weighted average price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Average traded price within the bar
    pub average: f64,
}

/// Last-trade quote
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub last_price: f64,
}

/// Update from a rolling bar subscription: the whole day's bars so far
#[derive(Debug, Clone)]
pub struct BarUpdate {
    pub bars: Vec<Bar>,
    pub has_new_bar: bool,
}

/// Bar sizes the bot requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarSize {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Day1,
}

impl BarSize {
    /// Parse IB-style bar size strings such as `"1 min"` or `"5 mins"`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1 min" | "1min" | "1m" => Some(Self::Min1),
            "5 mins" | "5 min" | "5min" | "5m" => Some(Self::Min5),
            "15 mins" | "15 min" | "15m" => Some(Self::Min15),
            "30 mins" | "30 min" | "30m" => Some(Self::Min30),
            "1 hour" | "1h" => Some(Self::Hour1),
            "1 day" | "1d" => Some(Self::Day1),
            _ => None,
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Self::Min1 => 60,
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Min30 => 1800,
            Self::Hour1 => 3600,
            Self::Day1 => 86_400,
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Self::Day1)
    }
}

impl std::fmt::Display for BarSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min1 => write!(f, "1 min"),
            Self::Min5 => write!(f, "5 mins"),
            Self::Min15 => write!(f, "15 mins"),
            Self::Min30 => write!(f, "30 mins"),
            Self::Hour1 => write!(f, "1 hour"),
            Self::Day1 => write!(f, "1 day"),
        }
    }
}

/// How far back a historical request reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    Seconds(i32),
    Days(i32),
}

impl std::fmt::Display for HistoryWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seconds(n) => write!(f, "{} S", n),
            Self::Days(n) => write!(f, "{} D", n),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the session
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Broker server clock, `None` when not connected
    async fn server_time(&self) -> Option<DateTime<Utc>>;

    /// Regular-trading-hours trade bars, oldest first
    async fn fetch_historical_bars(
        &self,
        symbol: &str,
        window: HistoryWindow,
        bar_size: BarSize,
    ) -> Result<Vec<Bar>>;

    async fn subscribe_ticks(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>>;

    async fn subscribe_bars(&self, symbol: &str, bar_size: BarSize) -> Result<mpsc::Receiver<BarUpdate>>;

    /// Submit a parent market order with its attached protective stop
    async fn place_linked_orders(&self, symbol: &str, bracket: &BracketOrder) -> Result<OrderId>;

    async fn place_market_order(&self, symbol: &str, side: OrderSide, quantity: i64) -> Result<OrderId>;
}

/// Most recent bar of a symbol with its start and end time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastCandle {
    pub high: f64,
    pub low: f64,
    pub open: f64,
    pub close: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Fetch the last completed or forming bar for `symbol`
pub async fn last_candle(broker: &dyn Broker, symbol: &str, bar_size: BarSize) -> Result<Option<LastCandle>> {
    let window = if bar_size.is_intraday() {
        HistoryWindow::Seconds(1800)
    } else {
        HistoryWindow::Days(1)
    };

    let bars = broker.fetch_historical_bars(symbol, window, bar_size).await?;
    Ok(bars.last().map(|bar| LastCandle {
        high: bar.high,
        low: bar.low,
        open: bar.open,
        close: bar.close,
        start_time: bar.timestamp,
        end_time: bar.timestamp + chrono::Duration::seconds(bar_size.seconds()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_size_parse() {
        assert_eq!(BarSize::parse("1 min"), Some(BarSize::Min1));
        assert_eq!(BarSize::parse(" 5 mins "), Some(BarSize::Min5));
        assert_eq!(BarSize::parse("1 DAY"), Some(BarSize::Day1));
        assert_eq!(BarSize::parse("3 weeks"), None);
        assert_eq!(BarSize::Min5.to_string(), "5 mins");
    }

    #[tokio::test]
    async fn test_last_candle_end_time() {
        let broker = mock::MockBroker::new();
        let bars = mock::bars_from_closes(&[10.0, 11.0, 12.0]);
        broker.set_history(BarSize::Min5, bars.clone());

        let candle = last_candle(&broker, "AAPL", BarSize::Min5).await.unwrap().unwrap();
        assert_eq!(candle.close, 12.0);
        assert_eq!(candle.start_time, bars[2].timestamp);
        assert_eq!((candle.end_time - candle.start_time).num_seconds(), 300);
    }
}
