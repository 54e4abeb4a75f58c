//! Scripted broker for tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Bar, BarSize, BarUpdate, Broker, HistoryWindow, OrderId, Tick};
use crate::error::{BotError, Result};
use crate::orders::{BracketOrder, OrderSide};

#[derive(Default)]
pub(crate) struct MockBroker {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    fail_history: AtomicBool,
    fail_orders: AtomicBool,
    next_id: AtomicI32,
    history: Mutex<HashMap<BarSize, Vec<Bar>>>,
    history_delay: Mutex<Option<Duration>>,
    history_calls: Mutex<Vec<(String, BarSize)>>,
    brackets: Mutex<Vec<(String, BracketOrder)>>,
    tick_feeds: Mutex<HashMap<String, mpsc::Sender<Tick>>>,
    bar_feeds: Mutex<HashMap<String, mpsc::Sender<BarUpdate>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            ..Default::default()
        }
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn set_history(&self, bar_size: BarSize, bars: Vec<Bar>) {
        self.history.lock().unwrap().insert(bar_size, bars);
    }

    /// Delay every historical request, for timeout tests
    pub fn set_history_delay(&self, delay: Option<Duration>) {
        *self.history_delay.lock().unwrap() = delay;
    }

    pub fn history_calls(&self) -> Vec<(String, BarSize)> {
        self.history_calls.lock().unwrap().clone()
    }

    pub fn placed_brackets(&self) -> Vec<(String, BracketOrder)> {
        self.brackets.lock().unwrap().clone()
    }

    pub fn has_feed(&self, symbol: &str) -> bool {
        self.tick_feeds
            .lock()
            .unwrap()
            .get(symbol)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub async fn push_tick(&self, symbol: &str, last_price: f64) {
        let tx = self.tick_feeds.lock().unwrap().get(symbol).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(Tick { last_price }).await;
        }
    }

    pub async fn push_bars(&self, symbol: &str, bars: Vec<Bar>, has_new_bar: bool) {
        let tx = self.bar_feeds.lock().unwrap().get(symbol).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(BarUpdate { bars, has_new_bar }).await;
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<()> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(BotError::Connection("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn server_time(&self) -> Option<DateTime<Utc>> {
        self.is_connected().then(Utc::now)
    }

    async fn fetch_historical_bars(&self, symbol: &str, _window: HistoryWindow, bar_size: BarSize) -> Result<Vec<Bar>> {
        self.history_calls
            .lock()
            .unwrap()
            .push((symbol.to_string(), bar_size));

        let delay = *self.history_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_history.load(Ordering::SeqCst) {
            return Err(BotError::data_fetch(symbol, "historical data farm unavailable"));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&bar_size)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(64);
        self.tick_feeds.lock().unwrap().insert(symbol.to_string(), tx);
        Ok(rx)
    }

    async fn subscribe_bars(&self, symbol: &str, _bar_size: BarSize) -> Result<mpsc::Receiver<BarUpdate>> {
        let (tx, rx) = mpsc::channel(64);
        self.bar_feeds.lock().unwrap().insert(symbol.to_string(), tx);
        Ok(rx)
    }

    async fn place_linked_orders(&self, symbol: &str, bracket: &BracketOrder) -> Result<OrderId> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(BotError::order_placement(symbol, "order rejected"));
        }
        self.brackets
            .lock()
            .unwrap()
            .push((symbol.to_string(), bracket.clone()));
        Ok(self.next_id.fetch_add(2, Ordering::SeqCst))
    }

    async fn place_market_order(&self, symbol: &str, _side: OrderSide, _quantity: i64) -> Result<OrderId> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(BotError::order_placement(symbol, "order rejected"));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

fn session_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 14, 13, 30, 0).unwrap()
}

/// Minute bars with the given closes; average == close, volume 100
pub(crate) fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            timestamp: session_start() + ChronoDuration::minutes(i as i64),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 100.0,
            average: close,
        })
        .collect()
}

/// Daily bars closing at 100 whose true ranges equal `ranges`
pub(crate) fn bars_from_ranges(ranges: &[f64]) -> Vec<Bar> {
    ranges
        .iter()
        .enumerate()
        .map(|(i, &range)| Bar {
            timestamp: session_start() + ChronoDuration::days(i as i64),
            open: 100.0,
            high: 100.0 + range / 2.0,
            low: 100.0 - range / 2.0,
            close: 100.0,
            volume: 1_000_000.0,
            average: 100.0,
        })
        .collect()
}

/// A single bar with explicit fields
pub(crate) fn bar(minute: i64, high: f64, low: f64, close: f64, average: f64, volume: f64) -> Bar {
    Bar {
        timestamp: session_start() + ChronoDuration::minutes(minute),
        open: close,
        high,
        low,
        close,
        volume,
        average,
    }
}
