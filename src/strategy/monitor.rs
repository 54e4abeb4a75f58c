//! Watch-only strategy: tracks price for display, never places orders

use crate::broker::Bar;
use crate::state::{TradeState, TradeStatus};

#[derive(Debug, Default)]
pub struct MonitorOnly;

impl MonitorOnly {
    pub(crate) fn initialize(&mut self, state: &mut TradeState) -> bool {
        state.status = TradeStatus::Observing;
        state.add_log(format!("Started monitoring {} (No execution)", state.symbol));
        true
    }

    pub(crate) fn on_bar(&mut self, state: &mut TradeState, bars: &[Bar]) {
        if let Some(last) = bars.last() {
            state.last_price = last.close;
        }
    }
}
