//! Event dispatcher
//!
//! Owns the broker session, the symbol map and the snapshot writer. One
//! `select!` loop multiplexes market events from every symbol's feeds,
//! finished symbol initializations, the reconciliation interval and
//! shutdown:
//!
//! - ticks go synchronously to the strategy; an entry spawns order placement
//! - bar updates spawn the strategy's bar handler, at most one per symbol
//! - subscription and initialization run as spawned tasks, never inline
//! - every poll: reload config, add/remove symbols, start pending
//!   initializations, persist the snapshot

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{BarSize, BarUpdate, Broker, Tick};
use crate::config::{BotConfig, ConfigSource};
use crate::error::{BotError, Result};
use crate::orders::OrderDispatcher;
use crate::snapshot::{BotInfo, Snapshot, SnapshotWriter, SymbolSnapshot};
use crate::strategy::{Strategy, StrategyHandle};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Event from one symbol's market data feeds, tagged with the generation of
/// the slot that subscribed them
#[derive(Debug)]
pub enum MarketEvent {
    Tick {
        symbol: Arc<str>,
        generation: u64,
        tick: Tick,
    },
    Bars {
        symbol: Arc<str>,
        generation: u64,
        update: BarUpdate,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStatus {
    /// Not yet initialized; counts failed attempts
    Pending { failures: u32 },
    Ready,
    /// Retry budget exhausted, symbol stays registered but inactive
    Abandoned,
}

struct SymbolSlot {
    strategy: StrategyHandle,
    /// Distinguishes this slot from an earlier one under the same symbol
    generation: u64,
    feeds: Vec<JoinHandle<()>>,
    init: InitStatus,
    init_in_flight: bool,
    /// Earliest re-check of a variant that was not ready
    retry_at: Option<Instant>,
}

impl SymbolSlot {
    fn new(strategy: StrategyHandle, generation: u64) -> Self {
        Self {
            strategy,
            generation,
            feeds: Vec::new(),
            init: InitStatus::Pending { failures: 0 },
            init_in_flight: false,
            retry_at: None,
        }
    }

    fn wants_init(&self, now: Instant) -> bool {
        matches!(self.init, InitStatus::Pending { .. })
            && !self.init_in_flight
            && self.retry_at.map_or(true, |at| now >= at)
    }

    fn record_failure(&mut self, retry_attempts: u32) {
        if let InitStatus::Pending { failures } = self.init {
            let failures = failures + 1;
            if failures > retry_attempts {
                warn!(
                    "{}: giving up initialization after {} attempt(s)",
                    self.strategy.symbol(),
                    failures
                );
                self.init = InitStatus::Abandoned;
            } else {
                self.init = InitStatus::Pending { failures };
            }
        }
    }
}

impl Drop for SymbolSlot {
    fn drop(&mut self) {
        // Aborting the forwarders drops the receivers, which ends the subscriptions
        for feed in self.feeds.drain(..) {
            feed.abort();
        }
    }
}

/// Outcome of one spawned subscribe-and-initialize attempt
struct InitReport {
    symbol: String,
    generation: u64,
    /// Feeds subscribed by this attempt, if it had to subscribe
    feeds: Option<Vec<JoinHandle<()>>>,
    outcome: Result<bool>,
}

fn forward<T, F>(mut rx: mpsc::Receiver<T>, events: mpsc::Sender<MarketEvent>, wrap: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> MarketEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if events.send(wrap(item)).await.is_err() {
                break;
            }
        }
    })
}

/// Subscribe both feeds of `symbol` and forward them into the merged channel
async fn start_feeds(
    broker: &dyn Broker,
    symbol: &str,
    generation: u64,
    bar_size: BarSize,
    events: &mpsc::Sender<MarketEvent>,
) -> Result<Vec<JoinHandle<()>>> {
    let ticks = broker.subscribe_ticks(symbol).await?;
    let bars = broker.subscribe_bars(symbol, bar_size).await?;

    let tick_symbol: Arc<str> = Arc::from(symbol);
    let bar_symbol = tick_symbol.clone();
    Ok(vec![
        forward(ticks, events.clone(), move |tick| MarketEvent::Tick {
            symbol: tick_symbol.clone(),
            generation,
            tick,
        }),
        forward(bars, events.clone(), move |update| MarketEvent::Bars {
            symbol: bar_symbol.clone(),
            generation,
            update,
        }),
    ])
}

async fn initialize_with_timeout(strategy: &StrategyHandle, broker: &dyn Broker, timeout: Duration) -> Result<bool> {
    match tokio::time::timeout(timeout, strategy.initialize(broker)).await {
        Ok(result) => result,
        Err(_) => Err(BotError::InitializationTimeout {
            symbol: strategy.symbol().to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

pub struct EventDispatcher {
    broker: Arc<dyn Broker>,
    config: BotConfig,
    config_source: Box<dyn ConfigSource>,
    symbols: HashMap<String, SymbolSlot>,
    next_generation: u64,
    events_tx: mpsc::Sender<MarketEvent>,
    events_rx: mpsc::Receiver<MarketEvent>,
    orders: OrderDispatcher,
    snapshots: SnapshotWriter,
    /// Spawned order placements and bar handlers
    tasks: JoinSet<()>,
    /// Spawned subscribe-and-initialize attempts
    inits: JoinSet<InitReport>,
}

impl EventDispatcher {
    pub fn new(broker: Arc<dyn Broker>, config: BotConfig, config_source: Box<dyn ConfigSource>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let snapshots = SnapshotWriter::new(config.bot.state_file.clone(), config.bot.snapshot_log_window);
        Self {
            orders: OrderDispatcher::new(broker.clone()),
            broker,
            config,
            config_source,
            symbols: HashMap::new(),
            next_generation: 0,
            events_tx,
            events_rx,
            snapshots,
            tasks: JoinSet::new(),
            inits: JoinSet::new(),
        }
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes. Fails only if the broker session
    /// cannot be established.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        let poll_interval = self.config.bot.poll_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(joined) = self.inits.join_next(), if !self.inits.is_empty() => self.finish_init(joined),
                _ = interval.tick() => self.poll_cycle().await,
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.broker.connect().await?;
        self.write_snapshot().await;

        info!(
            "Trading {} symbol(s), default strategy {}",
            self.config.trading.symbol_list().len(),
            self.config.trading.strategy
        );
        self.reconcile_symbols();
        Ok(())
    }

    async fn poll_cycle(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Strategy task panicked: {}", e);
                }
            }
        }

        if let Some(config) = self.config_source.poll() {
            self.apply_config(config);
        }
        self.reconcile_symbols();
        self.write_snapshot().await;
    }

    /// Adopt a reloaded configuration. Connection settings only apply at
    /// startup; strategy variants of live symbols are never reassigned.
    fn apply_config(&mut self, config: BotConfig) {
        if config.ibkr != self.config.ibkr {
            warn!("IBKR connection settings changed; restart to apply");
        }
        if config.trading.timeframe != self.config.trading.timeframe {
            warn!(
                "Timeframe changed to {}; applies to newly added symbols",
                config.trading.timeframe
            );
        }

        let risk = config.trading.risk();
        let atr_refresh = config.bot.atr_refresh();
        for slot in self.symbols.values() {
            slot.strategy.with(|s| {
                s.set_risk(risk);
                s.set_atr_interval(atr_refresh);
            });
        }

        if config.bot.state_file != self.config.bot.state_file {
            info!("Snapshot file is now {}", config.bot.state_file.display());
            self.snapshots = SnapshotWriter::new(config.bot.state_file.clone(), config.bot.snapshot_log_window);
        } else {
            self.snapshots.set_log_window(config.bot.snapshot_log_window);
        }
        self.config = config;
    }

    /// Bring the symbol map in line with configuration
    fn reconcile_symbols(&mut self) {
        let desired = self.config.trading.symbol_list();

        let stale: Vec<String> = self
            .symbols
            .keys()
            .filter(|symbol| !desired.contains(symbol))
            .cloned()
            .collect();
        for symbol in stale {
            self.symbols.remove(&symbol);
            info!("Removed {}", symbol);
        }

        for symbol in desired {
            if self.symbols.contains_key(&symbol) {
                continue;
            }
            let kind = self.config.trading.strategy_for(&symbol);
            let mut strategy = Strategy::new(kind, &symbol, self.config.trading.risk());
            strategy.set_atr_interval(self.config.bot.atr_refresh());
            self.next_generation += 1;
            info!("Added {} ({})", symbol, kind);
            self.symbols.insert(
                symbol,
                SymbolSlot::new(StrategyHandle::new(strategy), self.next_generation),
            );
        }

        self.activate_pending();
    }

    /// Spawn subscribe-and-initialize for every slot that is due
    fn activate_pending(&mut self) {
        let now = Instant::now();
        let bar_size = self.config.trading.bar_size();
        let timeout = self.config.bot.init_timeout();

        for (symbol, slot) in self.symbols.iter_mut() {
            if !slot.wants_init(now) {
                continue;
            }
            slot.init_in_flight = true;

            let symbol = symbol.clone();
            let generation = slot.generation;
            let needs_feeds = slot.feeds.is_empty();
            let strategy = slot.strategy.clone();
            let broker = self.broker.clone();
            let events = self.events_tx.clone();

            self.inits.spawn(async move {
                let mut feeds = None;
                if needs_feeds {
                    let subscribed = tokio::time::timeout(
                        timeout,
                        start_feeds(broker.as_ref(), &symbol, generation, bar_size, &events),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        Err(BotError::InitializationTimeout {
                            symbol: symbol.clone(),
                            secs: timeout.as_secs(),
                        })
                    });

                    match subscribed {
                        Ok(handles) => feeds = Some(handles),
                        Err(e) => {
                            strategy.with_state(|state| state.add_log(format!("Subscription failed: {}", e)));
                            return InitReport {
                                symbol,
                                generation,
                                feeds: None,
                                outcome: Err(e),
                            };
                        }
                    }
                }

                let outcome = initialize_with_timeout(&strategy, broker.as_ref(), timeout).await;
                InitReport {
                    symbol,
                    generation,
                    feeds,
                    outcome,
                }
            });
        }
    }

    /// Apply a finished initialization to its slot, unless the slot is gone
    fn finish_init(&mut self, joined: std::result::Result<InitReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!("Initialization task failed: {}", e);
                return;
            }
        };

        let slot = self
            .symbols
            .get_mut(&report.symbol)
            .filter(|slot| slot.generation == report.generation);
        let Some(slot) = slot else {
            for feed in report.feeds.into_iter().flatten() {
                feed.abort();
            }
            debug!("{}: dropping initialization result of a removed slot", report.symbol);
            return;
        };

        slot.init_in_flight = false;
        if let Some(feeds) = report.feeds {
            slot.feeds = feeds;
        }

        let symbol = &report.symbol;
        let retry_attempts = self.config.bot.init_retry_attempts;
        match report.outcome {
            Ok(true) => {
                slot.init = InitStatus::Ready;
                slot.retry_at = None;
                info!("{}: initialized ({})", symbol, slot.strategy.kind());
            }
            Ok(false) => {
                let wait = self.config.bot.pending_retry();
                slot.retry_at = Some(Instant::now() + wait);
                debug!("{}: not ready, re-checking in {:?}", symbol, wait);
            }
            Err(e @ BotError::InitializationTimeout { .. }) => {
                warn!("{}", e);
                slot.record_failure(retry_attempts);
            }
            Err(e) => {
                error!("{}: initialization failed: {}", symbol, e);
                slot.record_failure(retry_attempts);
            }
        }
    }

    fn handle_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Tick {
                symbol,
                generation,
                tick,
            } => {
                let Some(slot) = self.live_slot(&symbol, generation) else {
                    return;
                };
                if let Some(signal) = slot.strategy.on_tick(tick.last_price) {
                    let orders = self.orders.clone();
                    let strategy = slot.strategy.clone();
                    self.tasks.spawn(async move {
                        if let Err(e) = orders.submit_entry(&strategy, &signal).await {
                            debug!("{}: entry not placed: {}", signal.symbol, e);
                        }
                    });
                }
            }
            MarketEvent::Bars {
                symbol,
                generation,
                update,
            } => {
                let Some(slot) = self.live_slot(&symbol, generation) else {
                    return;
                };
                if slot.init != InitStatus::Ready {
                    return;
                }
                let Some(bar_slot) = slot.strategy.try_begin_bar() else {
                    debug!("{}: bar update dropped, previous one still running", symbol);
                    return;
                };

                let strategy = slot.strategy.clone();
                let broker = self.broker.clone();
                self.tasks.spawn(async move {
                    let _bar_slot = bar_slot;
                    strategy.on_bar(broker.as_ref(), &update).await;
                });
            }
        }
    }

    /// Slot an event belongs to; `None` for feeds of a removed slot
    fn live_slot(&self, symbol: &str, generation: u64) -> Option<&SymbolSlot> {
        self.symbols
            .get(symbol)
            .filter(|slot| slot.generation == generation)
    }

    async fn write_snapshot(&self) {
        let is_connected = self.broker.is_connected();
        let server_time = if is_connected {
            self.broker.server_time().await
        } else {
            None
        };

        let mut snapshot = Snapshot::new(BotInfo {
            last_update: Utc::now(),
            is_connected,
            server_time,
        });
        let window = self.snapshots.log_window();
        for slot in self.symbols.values() {
            snapshot.insert(
                slot.strategy
                    .with(|s| SymbolSnapshot::from_state(s.state(), s.kind().name(), window)),
            );
        }

        let writer = self.snapshots.clone();
        let result = tokio::task::spawn_blocking(move || writer.write(&snapshot)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write snapshot {}: {}", self.snapshots.path().display(), e),
            Err(e) => warn!("Snapshot writer failed: {}", e),
        }
    }

    /// Let in-flight work finish, disconnect, persist the final snapshot
    async fn shutdown(&mut self) {
        self.inits.shutdown().await;

        let grace = self.config.bot.poll_interval();
        let tasks = &mut self.tasks;
        let drain = async move { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Abandoning {} in-flight task(s)", self.tasks.len());
        }

        for slot in self.symbols.values_mut() {
            for feed in slot.feeds.drain(..) {
                feed.abort();
            }
        }

        self.broker.disconnect().await;
        self.write_snapshot().await;
        info!("Final snapshot written to {}", self.snapshots.path().display());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{bar, bars_from_ranges, MockBroker};
    use crate::risk::RiskConfig;
    use crate::snapshot::read_snapshot;
    use crate::state::TradeStatus;
    use crate::strategy::StrategyKind;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedSource(Arc<Mutex<Option<BotConfig>>>);

    impl SharedSource {
        fn publish(&self, config: BotConfig) {
            *self.0.lock().unwrap() = Some(config);
        }
    }

    impl ConfigSource for SharedSource {
        fn poll(&mut self) -> Option<BotConfig> {
            self.0.lock().unwrap().take()
        }
    }

    fn config(dir: &tempfile::TempDir, symbols: &[&str]) -> BotConfig {
        let mut config = BotConfig::default();
        config.trading.symbols = symbols.iter().map(|s| s.to_string()).collect();
        config
            .trading
            .asset_strategies
            .insert("SPY".to_string(), "Monitor_Only".to_string());
        config.bot.state_file = dir.path().join("bot_state.json");
        config
    }

    fn market() -> Arc<MockBroker> {
        let broker = MockBroker::new();
        broker.set_history(BarSize::Day1, bars_from_ranges(&[2.0; 20]));
        broker.set_history(BarSize::Min5, vec![bar(0, 105.0, 100.0, 104.0, 102.5, 5000.0)]);
        Arc::new(broker)
    }

    fn dispatcher(broker: &Arc<MockBroker>, config: BotConfig) -> (EventDispatcher, SharedSource) {
        let source = SharedSource::default();
        let dispatcher = EventDispatcher::new(broker.clone(), config, Box::new(source.clone()));
        (dispatcher, source)
    }

    async fn started(broker: &Arc<MockBroker>, config: BotConfig) -> (EventDispatcher, SharedSource) {
        let (mut dispatcher, source) = dispatcher(broker, config);
        dispatcher.start().await.unwrap();
        settle(&mut dispatcher).await;
        (dispatcher, source)
    }

    /// Wait for every spawned initialization and apply its result
    async fn settle(dispatcher: &mut EventDispatcher) {
        while let Some(joined) = dispatcher.inits.join_next().await {
            dispatcher.finish_init(joined);
        }
    }

    async fn pump_one(dispatcher: &mut EventDispatcher) {
        let event = dispatcher.events_rx.recv().await.unwrap();
        dispatcher.handle_event(event);
    }

    async fn drain_tasks(dispatcher: &mut EventDispatcher) {
        while dispatcher.tasks.join_next().await.is_some() {}
    }

    fn status(dispatcher: &EventDispatcher, symbol: &str) -> TradeStatus {
        dispatcher.symbols[symbol].strategy.snapshot().status
    }

    fn count_calls(broker: &MockBroker, bar_size: BarSize) -> usize {
        broker
            .history_calls()
            .iter()
            .filter(|(_, size)| *size == bar_size)
            .count()
    }

    #[tokio::test]
    async fn test_startup_registers_and_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, _) = dispatcher(&broker, config(&dir, &["AAPL", "SPY"]));

        dispatcher.start().await.unwrap();
        assert!(dispatcher.symbols["AAPL"].init_in_flight);
        settle(&mut dispatcher).await;

        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Ready);
        assert!(!dispatcher.symbols["AAPL"].init_in_flight);
        assert_eq!(dispatcher.symbols["SPY"].strategy.kind(), StrategyKind::MonitorOnly);
        assert_eq!(status(&dispatcher, "AAPL"), TradeStatus::Monitoring);
        assert_eq!(status(&dispatcher, "SPY"), TradeStatus::Observing);
        assert!(broker.has_feed("AAPL"));

        dispatcher.poll_cycle().await;
        let snapshot = read_snapshot(&dir.path().join("bot_state.json")).unwrap();
        assert!(snapshot.bot_info.is_connected);
        assert!(snapshot.bot_info.server_time.is_some());
        assert_eq!(snapshot.symbols["AAPL"].strategy, "ORB_5min");
        assert_eq!(snapshot.symbols["SPY"].strategy, "Monitor_Only");
        assert_eq!(snapshot.symbols["AAPL"].levels.as_ref().unwrap().high, 105.0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        broker.refuse_connect(true);
        let (dispatcher, _) = dispatcher(&broker, config(&dir, &["AAPL"]));

        let err = dispatcher
            .run_until(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Connection(_)));
        assert!(!dir.path().join("bot_state.json").exists());
    }

    #[tokio::test]
    async fn test_symbol_added_on_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, source) = started(&broker, config(&dir, &["AAPL"])).await;

        source.publish(config(&dir, &["AAPL", "MSFT"]));
        dispatcher.poll_cycle().await;
        assert!(dispatcher.symbols["MSFT"].init_in_flight);
        settle(&mut dispatcher).await;

        assert_eq!(dispatcher.symbols["MSFT"].init, InitStatus::Ready);
        assert!(broker.has_feed("MSFT"));

        dispatcher.poll_cycle().await;
        let snapshot = read_snapshot(&dir.path().join("bot_state.json")).unwrap();
        assert_eq!(snapshot.symbols["MSFT"].status, TradeStatus::Monitoring);
    }

    #[tokio::test]
    async fn test_symbol_removed_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, source) = started(&broker, config(&dir, &["AAPL", "MSFT"])).await;
        assert!(broker.has_feed("MSFT"));

        source.publish(config(&dir, &["AAPL"]));
        dispatcher.poll_cycle().await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(!dispatcher.symbols.contains_key("MSFT"));
        assert!(!broker.has_feed("MSFT"));
        let snapshot = read_snapshot(&dir.path().join("bot_state.json")).unwrap();
        assert!(!snapshot.symbols.contains_key("MSFT"));
        assert!(snapshot.symbols.contains_key("AAPL"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_symbol_ignores_late_init() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        broker.set_history_delay(Some(Duration::from_secs(10)));
        let (mut dispatcher, source) = dispatcher(&broker, config(&dir, &["AAPL", "MSFT"]));
        dispatcher.start().await.unwrap();

        source.publish(config(&dir, &["AAPL"]));
        dispatcher.poll_cycle().await;
        settle(&mut dispatcher).await;

        assert!(!dispatcher.symbols.contains_key("MSFT"));
        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Ready);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(!broker.has_feed("MSFT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        broker.set_history_delay(Some(Duration::from_secs(60)));
        let (mut dispatcher, _) = started(&broker, config(&dir, &["AAPL"])).await;

        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Pending { failures: 1 });
        let state = dispatcher.symbols["AAPL"].strategy.snapshot();
        assert_eq!(state.status, TradeStatus::WaitingForOrb);
        assert!(state.levels.is_none());
        assert_eq!(state.atr, 0.0);
        assert!(state.logs.is_empty());
        // Feeds from the first attempt are kept
        assert!(broker.has_feed("AAPL"));

        // Retried on the next cycle
        broker.set_history_delay(None);
        dispatcher.poll_cycle().await;
        settle(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Ready);
    }

    #[tokio::test]
    async fn test_init_abandoned_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        broker.fail_history(true);
        let mut cfg = config(&dir, &["AAPL"]);
        cfg.bot.init_retry_attempts = 1;
        let (mut dispatcher, _) = started(&broker, cfg).await;

        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Pending { failures: 1 });
        dispatcher.poll_cycle().await;
        settle(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Abandoned);

        let calls = broker.history_calls().len();
        dispatcher.poll_cycle().await;
        assert!(dispatcher.inits.is_empty());
        assert_eq!(broker.history_calls().len(), calls);
        assert!(dispatcher.symbols.contains_key("AAPL"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_orb_retry_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        broker.set_history(BarSize::Min5, Vec::new());
        let (mut dispatcher, _) = started(&broker, config(&dir, &["AAPL"])).await;

        // Ten minutes of 5 second cycles before the first range bar closes
        for _ in 0..120 {
            tokio::time::advance(Duration::from_secs(5)).await;
            dispatcher.poll_cycle().await;
            settle(&mut dispatcher).await;
        }

        assert_eq!(count_calls(&broker, BarSize::Day1), 1);
        let range_calls = count_calls(&broker, BarSize::Min5);
        assert!((10..=11).contains(&range_calls), "{} range requests", range_calls);
        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Pending { failures: 0 });

        let state = dispatcher.symbols["AAPL"].strategy.snapshot();
        assert_eq!(state.status, TradeStatus::WaitingForOrb);
        assert_eq!(state.logs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_flow_while_symbol_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, source) = started(&broker, config(&dir, &["AAPL"])).await;

        // Two history requests of 12 seconds each, inside the init timeout
        broker.set_history_delay(Some(Duration::from_secs(12)));
        source.publish(config(&dir, &["AAPL", "MSFT"]));
        dispatcher.poll_cycle().await;
        assert!(dispatcher.symbols["MSFT"].init_in_flight);

        broker.push_tick("AAPL", 106.0).await;
        pump_one(&mut dispatcher).await;
        drain_tasks(&mut dispatcher).await;

        assert_eq!(broker.placed_brackets().len(), 1);
        assert_eq!(status(&dispatcher, "AAPL"), TradeStatus::InTrade);
        assert!(dispatcher.symbols["MSFT"].init_in_flight);

        settle(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["MSFT"].init, InitStatus::Ready);
    }

    #[tokio::test]
    async fn test_tick_breakout_places_bracket() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, _) = started(&broker, config(&dir, &["AAPL"])).await;

        broker.push_tick("AAPL", 106.0).await;
        pump_one(&mut dispatcher).await;
        drain_tasks(&mut dispatcher).await;

        let placed = broker.placed_brackets();
        assert_eq!(placed.len(), 1);
        let (symbol, bracket) = &placed[0];
        assert_eq!(symbol, "AAPL");
        // 500 USD risk over a 6.00 stop distance
        assert_eq!(bracket.quantity(), 83);
        assert_eq!(bracket.stop_price(), 100.0);

        let state = dispatcher.symbols["AAPL"].strategy.snapshot();
        assert_eq!(state.status, TradeStatus::InTrade);
        assert!(state
            .logs
            .iter()
            .any(|l| l.contains("Entry BUY at 106. Stop Loss at 100")));
    }

    #[tokio::test]
    async fn test_stale_events_dropped_after_readd() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, source) = started(&broker, config(&dir, &["AAPL"])).await;

        // Queued in the merged channel before the symbol goes away
        broker.push_tick("AAPL", 106.0).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        source.publish(config(&dir, &[]));
        dispatcher.poll_cycle().await;
        source.publish(config(&dir, &["AAPL"]));
        dispatcher.poll_cycle().await;
        settle(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["AAPL"].init, InitStatus::Ready);

        pump_one(&mut dispatcher).await;
        assert!(dispatcher.tasks.is_empty());
        drain_tasks(&mut dispatcher).await;

        assert!(broker.placed_brackets().is_empty());
        assert_eq!(status(&dispatcher, "AAPL"), TradeStatus::Monitoring);

        // Events from the new subscription still get through
        broker.push_tick("AAPL", 106.0).await;
        pump_one(&mut dispatcher).await;
        drain_tasks(&mut dispatcher).await;
        assert_eq!(broker.placed_brackets().len(), 1);
    }

    #[tokio::test]
    async fn test_order_failure_marks_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        broker.fail_orders(true);
        let (mut dispatcher, _) = started(&broker, config(&dir, &["AAPL"])).await;

        broker.push_tick("AAPL", 106.0).await;
        pump_one(&mut dispatcher).await;
        drain_tasks(&mut dispatcher).await;

        let state = dispatcher.symbols["AAPL"].strategy.snapshot();
        assert_eq!(state.status, TradeStatus::OrderFailed);
        assert_eq!(state.position, 0);
        assert!(broker.placed_brackets().is_empty());
    }

    #[tokio::test]
    async fn test_bar_updates_reach_ready_symbols_only() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, _) = started(&broker, config(&dir, &["SPY"])).await;
        assert_eq!(dispatcher.symbols["SPY"].init, InitStatus::Ready);

        broker.push_bars("SPY", vec![bar(0, 451.0, 449.0, 450.25, 450.0, 100.0)], true).await;
        pump_one(&mut dispatcher).await;
        drain_tasks(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["SPY"].strategy.snapshot().last_price, 450.25);

        dispatcher.symbols.get_mut("SPY").unwrap().init = InitStatus::Abandoned;
        broker.push_bars("SPY", vec![bar(1, 452.0, 450.0, 451.75, 451.0, 100.0)], true).await;
        pump_one(&mut dispatcher).await;
        assert!(dispatcher.tasks.is_empty());
        assert_eq!(dispatcher.symbols["SPY"].strategy.snapshot().last_price, 450.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_bar_update_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, _) = started(&broker, config(&dir, &["SPY"])).await;

        // Every bar update refreshes ATR, and each refresh takes 10 seconds
        dispatcher.symbols["SPY"]
            .strategy
            .with(|s| s.set_atr_interval(Duration::ZERO));
        tokio::time::advance(Duration::from_secs(1)).await;
        broker.set_history_delay(Some(Duration::from_secs(10)));

        broker.push_bars("SPY", vec![bar(0, 451.0, 449.0, 450.25, 450.0, 100.0)], true).await;
        broker.push_bars("SPY", vec![bar(1, 452.0, 450.0, 451.75, 451.0, 100.0)], true).await;

        pump_one(&mut dispatcher).await;
        assert_eq!(dispatcher.tasks.len(), 1);
        pump_one(&mut dispatcher).await;
        assert_eq!(dispatcher.tasks.len(), 1);

        drain_tasks(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["SPY"].strategy.snapshot().last_price, 450.25);

        // Slot is free again once the first handler finished
        broker.push_bars("SPY", vec![bar(2, 453.0, 451.0, 452.5, 452.0, 100.0)], true).await;
        pump_one(&mut dispatcher).await;
        assert_eq!(dispatcher.tasks.len(), 1);
        drain_tasks(&mut dispatcher).await;
        assert_eq!(dispatcher.symbols["SPY"].strategy.snapshot().last_price, 452.5);
    }

    #[tokio::test]
    async fn test_reload_pushes_risk_but_keeps_variant() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, source) = started(&broker, config(&dir, &["AAPL"])).await;

        let mut updated = config(&dir, &["AAPL"]);
        updated.trading.strategy = "VWAP_1min".to_string();
        updated.trading.max_risk_usd = 1200.0;
        source.publish(updated);
        dispatcher.poll_cycle().await;

        let slot = &dispatcher.symbols["AAPL"];
        assert_eq!(slot.strategy.kind(), StrategyKind::OpeningRangeBreakout);
        let risk: RiskConfig = slot.strategy.with(|s| *s.risk());
        assert_eq!(risk.max_risk_usd, 1200.0);
    }

    #[tokio::test]
    async fn test_state_file_change_applies() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (mut dispatcher, source) = started(&broker, config(&dir, &["AAPL"])).await;

        let moved = dir.path().join("other.json");
        let mut updated = config(&dir, &["AAPL"]);
        updated.bot.state_file = moved.clone();
        source.publish(updated);
        dispatcher.poll_cycle().await;

        let snapshot = read_snapshot(&moved).unwrap();
        assert!(snapshot.symbols.contains_key("AAPL"));
        assert_eq!(dispatcher.snapshots.path(), moved.as_path());
    }

    #[tokio::test]
    async fn test_shutdown_writes_disconnected_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let broker = market();
        let (dispatcher, _) = dispatcher(&broker, config(&dir, &["AAPL"]));

        dispatcher.run_until(async {}).await.unwrap();

        assert!(!broker.is_connected());
        let snapshot = read_snapshot(&dir.path().join("bot_state.json")).unwrap();
        assert!(!snapshot.bot_info.is_connected);
        assert!(snapshot.bot_info.server_time.is_none());
        assert!(snapshot.symbols.contains_key("AAPL"));
    }
}
