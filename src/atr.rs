//! Average True Range from daily bars
//!
//! ATR(14) is the mean of the last 14 true ranges. It needs at least 15
//! daily bars; with fewer the estimate is reported as 0.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{Bar, BarSize, Broker, HistoryWindow};
use crate::error::BotError;
use crate::state::TradeState;

/// Number of true ranges averaged
pub const ATR_PERIOD: usize = 14;

/// Calendar window requested to cover ATR_PERIOD + 1 trading days
const ATR_HISTORY_DAYS: i32 = 30;

/// Default interval between recomputations
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(1800);

pub fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// ATR over the last [`ATR_PERIOD`] bars, `None` with fewer than 15 bars
pub fn compute_atr(bars: &[Bar]) -> Option<f64> {
    if bars.len() < ATR_PERIOD + 1 {
        return None;
    }

    let ranges: Vec<f64> = bars
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect();

    let recent = &ranges[ranges.len() - ATR_PERIOD..];
    Some(recent.iter().sum::<f64>() / ATR_PERIOD as f64)
}

/// Result of one ATR fetch, applied to state afterwards
#[derive(Debug)]
pub enum AtrOutcome {
    Computed { atr: f64, last_close: f64 },
    Insufficient { bars: usize },
    Failed(BotError),
}

/// Fetch daily bars and compute ATR. No state is touched here.
pub async fn fetch_atr(broker: &dyn Broker, symbol: &str) -> AtrOutcome {
    let bars = match broker
        .fetch_historical_bars(symbol, HistoryWindow::Days(ATR_HISTORY_DAYS), BarSize::Day1)
        .await
    {
        Ok(bars) => bars,
        Err(e) => return AtrOutcome::Failed(e),
    };

    match (compute_atr(&bars), bars.last()) {
        (Some(atr), Some(last)) => AtrOutcome::Computed {
            atr,
            last_close: last.close,
        },
        _ => AtrOutcome::Insufficient { bars: bars.len() },
    }
}

impl AtrOutcome {
    /// Write the outcome into the symbol's state
    pub fn apply(self, state: &mut TradeState) {
        match self {
            Self::Computed { atr, last_close } => {
                state.set_atr(atr);
                if state.last_price == 0.0 {
                    state.last_price = last_close;
                }
                debug!("{}: ATR(14) = {:.4}", state.symbol, atr);
                state.add_log(format!("ATR(14) calculated: {:.2}", atr));
            }
            Self::Insufficient { bars } => {
                state.set_atr(0.0);
                warn!("{}: only {} daily bars, ATR set to 0", state.symbol, bars);
                state.add_log(format!("Not enough daily bars for ATR ({} < {})", bars, ATR_PERIOD + 1));
            }
            Self::Failed(e) => {
                warn!("{}: ATR refresh failed: {}", state.symbol, e);
                state.add_log(format!("Error calculating ATR: {}", e));
            }
        }
    }
}

/// Tracks when ATR was last computed
#[derive(Debug, Clone)]
pub struct AtrSchedule {
    interval: Duration,
    last_update: Option<Instant>,
}

impl AtrSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_update: None,
        }
    }

    /// True when ATR was never computed or is older than the interval
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_update {
            None => true,
            Some(last) => now.duration_since(last) > self.interval,
        }
    }

    /// Record an attempt, successful or not
    pub fn mark(&mut self, now: Instant) {
        self.last_update = Some(now);
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

impl Default for AtrSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH)
    }
}
