//! VWAP breakout on 1-minute bars
//!
//! VWAP is re-derived from the full day's bars on every update rather than
//! accumulated, so revised bars correct it. The first bar that closes above
//! VWAP while monitoring arms the signal candle; a tick above its high enters
//! with the stop at its low.

use tracing::info;

use super::Trigger;
use crate::broker::Bar;
use crate::state::{TradeState, TradeStatus};

/// High/low of the bar that armed the breakout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalCandle {
    pub high: f64,
    pub low: f64,
}

#[derive(Debug, Default)]
pub struct VwapBreakout {
    vwap: f64,
    signal: Option<SignalCandle>,
}

/// Σ(average × volume) / Σ(volume); `None` without volume
pub fn session_vwap(bars: &[Bar]) -> Option<f64> {
    let (pv, volume) = bars
        .iter()
        .fold((0.0, 0.0), |(pv, vol), bar| (pv + bar.average * bar.volume, vol + bar.volume));

    (volume > 0.0).then(|| pv / volume)
}

impl VwapBreakout {
    pub fn vwap(&self) -> f64 {
        self.vwap
    }

    pub fn signal(&self) -> Option<SignalCandle> {
        self.signal
    }

    /// Seed VWAP from the bars already printed today. Runs before the state
    /// is monitoring, so no signal candle can arm during the backfill.
    pub(crate) fn initialize(&mut self, state: &mut TradeState, bars: &[Bar]) -> bool {
        if !bars.is_empty() {
            self.on_bar(state, bars, false);
            state.add_log(format!(
                "Initialized VWAP: {:.2} using {} previous bars.",
                self.vwap,
                bars.len()
            ));
        }

        if state.status == TradeStatus::WaitingForOrb {
            state.status = TradeStatus::Monitoring;
        }
        true
    }

    pub(crate) fn on_tick(&self, state: &TradeState, last_price: f64) -> Option<Trigger> {
        if state.status != TradeStatus::Monitoring {
            return None;
        }
        let signal = self.signal?;

        (last_price > signal.high).then_some(Trigger {
            raw_stop: signal.low,
            label: "VWAP Breakout Entry",
        })
    }

    pub(crate) fn on_bar(&mut self, state: &mut TradeState, bars: &[Bar], _has_new_bar: bool) {
        let Some(last) = bars.last() else {
            return;
        };

        if let Some(vwap) = session_vwap(bars) {
            self.vwap = vwap;
        }

        if state.status == TradeStatus::Monitoring && self.signal.is_none() && last.close > self.vwap {
            self.signal = Some(SignalCandle {
                high: last.high,
                low: last.low,
            });
            info!("{}: signal candle armed at {:.2}", state.symbol, last.high);
            state.add_log(format!(
                "Signal Candle Found! Close ({:.2}) > VWAP ({:.2}). Monitoring high: {}",
                last.close, self.vwap, last.high
            ));
        }
    }
}
