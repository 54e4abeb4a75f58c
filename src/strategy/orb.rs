//! Opening range breakout on the session's first 5-minute bar

use tracing::info;

use super::Trigger;
use crate::broker::Bar;
use crate::state::{Levels, TradeState, TradeStatus};

#[derive(Debug, Default)]
pub struct OpeningRangeBreakout {
    /// Set once the "range pending" line has been logged
    pending_logged: bool,
}

impl OpeningRangeBreakout {
    /// Take the first regular-hours 5-minute bar as the opening range
    pub(crate) fn initialize(&mut self, state: &mut TradeState, bars: &[Bar]) -> bool {
        if state.levels.is_some() {
            return true;
        }

        let Some(first) = bars.first() else {
            if !self.pending_logged {
                state.add_log("No 5-minute bars yet, opening range pending");
                self.pending_logged = true;
            }
            return false;
        };

        state.set_levels(Levels::from_bar(first));
        state.status = TradeStatus::Monitoring;
        info!("{}: opening range {:.2} - {:.2}", state.symbol, first.low, first.high);
        state.add_log(format!("ORB Levels set: High={}, Low={}", first.high, first.low));
        true
    }

    pub(crate) fn on_tick(&self, state: &TradeState, last_price: f64) -> Option<Trigger> {
        if state.status != TradeStatus::Monitoring {
            return None;
        }
        let levels = state.levels.as_ref()?;

        (last_price > levels.high).then_some(Trigger {
            raw_stop: levels.low,
            label: "Entry BUY",
        })
    }

    /// The opening range is fixed for the session; bars carry nothing new
    pub(crate) fn on_bar(&mut self, _state: &mut TradeState, _bars: &[Bar], _has_new_bar: bool) {}
}
