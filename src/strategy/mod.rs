//! Per-symbol strategy state machine
//!
//! Three variants share one base:
//! - `OpeningRangeBreakout` - long above the session's first 5-minute high
//! - `VwapBreakout` - long above the first bar that closes over VWAP
//! - `MonitorOnly` - watch without orders
//!
//! Breakout variants move `WAITING_FOR_ORB -> MONITORING -> IN_TRADE`;
//! `IN_TRADE` is terminal for the session. The base owns the [`TradeState`],
//! the risk parameters and the ATR schedule; variants only decide when to
//! trigger and where the raw stop sits. Sizing and stop capping are shared.

mod monitor;
mod orb;
mod vwap;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::atr::{fetch_atr, AtrOutcome, AtrSchedule};
use crate::broker::{Bar, BarSize, BarUpdate, Broker, HistoryWindow};
use crate::error::Result;
use crate::orders::{EntrySignal, OrderSide};
use crate::risk::{capped_stop, quantity_for, RiskConfig};
use crate::state::TradeState;

pub use monitor::MonitorOnly;
pub use orb::OpeningRangeBreakout;
pub use vwap::{SignalCandle, VwapBreakout};

/// Strategy selected for a symbol by configuration name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    OpeningRangeBreakout,
    VwapBreakout,
    MonitorOnly,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::OpeningRangeBreakout,
        StrategyKind::VwapBreakout,
        StrategyKind::MonitorOnly,
    ];

    /// Exact lookup by configuration name
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name.trim())
    }

    /// Factory lookup; unknown names fall back to the opening-range breakout
    pub fn from_name(name: &str) -> Self {
        Self::lookup(name).unwrap_or_else(|| {
            warn!("Unknown strategy '{}', using {}", name, Self::OpeningRangeBreakout.name());
            Self::OpeningRangeBreakout
        })
    }

    /// Configuration name, also written to the snapshot
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpeningRangeBreakout => "ORB_5min",
            Self::VwapBreakout => "VWAP_1min",
            Self::MonitorOnly => "Monitor_Only",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Breakout decided by a variant, before sizing
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Trigger {
    pub raw_stop: f64,
    pub label: &'static str,
}

#[derive(Debug)]
enum Variant {
    Orb(OpeningRangeBreakout),
    Vwap(VwapBreakout),
    Monitor(MonitorOnly),
}

/// Strategy instance for one symbol; owns that symbol's [`TradeState`]
#[derive(Debug)]
pub struct Strategy {
    state: TradeState,
    risk: RiskConfig,
    atr_schedule: AtrSchedule,
    variant: Variant,
}

impl Strategy {
    pub fn new(kind: StrategyKind, symbol: &str, risk: RiskConfig) -> Self {
        let variant = match kind {
            StrategyKind::OpeningRangeBreakout => Variant::Orb(OpeningRangeBreakout::default()),
            StrategyKind::VwapBreakout => Variant::Vwap(VwapBreakout::default()),
            StrategyKind::MonitorOnly => Variant::Monitor(MonitorOnly),
        };

        Self {
            state: TradeState::new(symbol),
            risk,
            atr_schedule: AtrSchedule::default(),
            variant,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self.variant {
            Variant::Orb(_) => StrategyKind::OpeningRangeBreakout,
            Variant::Vwap(_) => StrategyKind::VwapBreakout,
            Variant::Monitor(_) => StrategyKind::MonitorOnly,
        }
    }

    pub fn state(&self) -> &TradeState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut TradeState {
        &mut self.state
    }

    pub fn risk(&self) -> &RiskConfig {
        &self.risk
    }

    pub fn set_risk(&mut self, risk: RiskConfig) {
        self.risk = risk;
    }

    pub fn set_atr_interval(&mut self, interval: Duration) {
        self.atr_schedule.set_interval(interval);
    }

    /// Current VWAP for the VWAP variant
    pub fn vwap(&self) -> Option<f64> {
        match &self.variant {
            Variant::Vwap(v) => Some(v.vwap()),
            _ => None,
        }
    }

    /// Historical request the variant needs at startup
    fn init_request(&self) -> Option<(HistoryWindow, BarSize)> {
        match self.variant {
            Variant::Orb(_) => Some((HistoryWindow::Days(1), BarSize::Min5)),
            Variant::Vwap(_) => Some((HistoryWindow::Days(1), BarSize::Min1)),
            Variant::Monitor(_) => None,
        }
    }

    /// Apply data fetched by initialize. `atr` is `None` when a retry skipped
    /// the ATR fetch because the last value is still fresh. Returns false when
    /// the variant could not establish its reference yet and initialization
    /// should be retried.
    pub fn complete_initialize(&mut self, atr: Option<AtrOutcome>, bars: Vec<Bar>, fetched_at: Instant) -> bool {
        if let Some(atr) = atr {
            atr.apply(&mut self.state);
            self.atr_schedule.mark(fetched_at);
        }

        match &mut self.variant {
            Variant::Orb(orb) => orb.initialize(&mut self.state, &bars),
            Variant::Vwap(vwap) => vwap.initialize(&mut self.state, &bars),
            Variant::Monitor(monitor) => monitor.initialize(&mut self.state),
        }
    }

    /// Hot-path quote handler. Never blocks; returns an entry to place.
    pub fn on_tick(&mut self, last_price: f64) -> Option<EntrySignal> {
        if !last_price.is_finite() || last_price <= 0.0 {
            return None;
        }
        self.state.last_price = last_price;

        let trigger = match &self.variant {
            Variant::Orb(orb) => orb.on_tick(&self.state, last_price),
            Variant::Vwap(vwap) => vwap.on_tick(&self.state, last_price),
            Variant::Monitor(_) => None,
        }?;

        self.enter(last_price, trigger)
    }

    /// Variant bar logic; the ATR refresh is handled by [`StrategyHandle::on_bar`]
    pub fn on_bar(&mut self, bars: &[Bar], has_new_bar: bool) {
        match &mut self.variant {
            Variant::Orb(orb) => orb.on_bar(&mut self.state, bars, has_new_bar),
            Variant::Vwap(vwap) => vwap.on_bar(&mut self.state, bars, has_new_bar),
            Variant::Monitor(monitor) => monitor.on_bar(&mut self.state, bars),
        }
    }

    /// Size and cap a long entry at `price`, moving the state to `IN_TRADE`
    fn enter(&mut self, price: f64, trigger: Trigger) -> Option<EntrySignal> {
        let side = OrderSide::Buy;
        let stop = capped_stop(price, trigger.raw_stop, side, self.state.atr, self.risk.max_stop_atr);
        if (stop - trigger.raw_stop).abs() > 1e-9 {
            self.state.add_log(format!(
                "Stop Capped! Adjusted from {:.2} to {:.2}",
                trigger.raw_stop, stop
            ));
        }

        let distance = (price - stop).abs();
        let quantity = quantity_for(distance, &self.risk);
        if quantity == 0 {
            debug!("{}: zero stop distance at {:.2}, no entry", self.state.symbol, price);
            return None;
        }
        self.state.add_log(format!("Calc Size: StopDist={:.2} -> Qty={}", distance, quantity));

        self.state.enter(price, stop, quantity);
        info!(
            "{}: {} triggered at {:.2}, stop {:.2}, qty {}",
            self.state.symbol, trigger.label, price, stop, quantity
        );

        Some(EntrySignal {
            symbol: self.state.symbol.clone(),
            side,
            price,
            stop_price: stop,
            quantity,
            label: trigger.label,
        })
    }
}

/// Shared handle to a strategy, held by the dispatcher and its bar tasks.
///
/// The lock is only taken for synchronous sections and never held across
/// an await, so tick handling cannot stall behind a bar task's I/O.
#[derive(Clone)]
pub struct StrategyHandle {
    inner: Arc<Mutex<Strategy>>,
    bar_in_flight: Arc<AtomicBool>,
    symbol: Arc<str>,
    kind: StrategyKind,
}

/// Releases the single in-flight bar slot on drop
pub struct BarSlot {
    flag: Arc<AtomicBool>,
}

impl Drop for BarSlot {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl StrategyHandle {
    pub fn new(strategy: Strategy) -> Self {
        let symbol: Arc<str> = Arc::from(strategy.state.symbol.as_str());
        let kind = strategy.kind();
        Self {
            inner: Arc::new(Mutex::new(strategy)),
            bar_in_flight: Arc::new(AtomicBool::new(false)),
            symbol,
            kind,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Strategy> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Strategy) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut TradeState) -> R) -> R {
        f(self.lock().state_mut())
    }

    /// Copy of the current trade state
    pub fn snapshot(&self) -> TradeState {
        self.lock().state().clone()
    }

    /// Fetch everything first, then apply under one lock, so a cancelled
    /// (timed-out) initialize leaves the state untouched.
    pub async fn initialize(&self, broker: &dyn Broker) -> Result<bool> {
        let fetched_at = Instant::now();
        let (request, atr_due) = self.with(|s| (s.init_request(), s.atr_schedule.is_due(fetched_at)));

        let atr = if atr_due {
            Some(fetch_atr(broker, &self.symbol).await)
        } else {
            None
        };
        let bars = match request {
            Some((window, bar_size)) => match broker.fetch_historical_bars(&self.symbol, window, bar_size).await {
                Ok(bars) => bars,
                Err(e) => {
                    self.with_state(|state| state.add_log(format!("Error fetching {} bars: {}", bar_size, e)));
                    return Err(e);
                }
            },
            None => Vec::new(),
        };

        Ok(self.with(|s| s.complete_initialize(atr, bars, fetched_at)))
    }

    pub fn on_tick(&self, last_price: f64) -> Option<EntrySignal> {
        self.lock().on_tick(last_price)
    }

    /// Claim the bar slot; `None` while a previous bar update is still running
    pub fn try_begin_bar(&self) -> Option<BarSlot> {
        self.bar_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BarSlot {
                flag: self.bar_in_flight.clone(),
            })
    }

    /// Bar update: periodic ATR refresh, then variant logic
    pub async fn on_bar(&self, broker: &dyn Broker, update: &BarUpdate) {
        let refresh_due = self.with(|s| {
            let now = Instant::now();
            let due = s.atr_schedule.is_due(now);
            if due {
                s.atr_schedule.mark(now);
            }
            due
        });

        if refresh_due {
            let outcome = fetch_atr(broker, &self.symbol).await;
            self.with_state(|state| outcome.apply(state));
        }

        self.with(|s| s.on_bar(&update.bars, update.has_new_bar));
    }
}
