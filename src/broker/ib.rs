//! Interactive Brokers adapter
//!
//! Wraps the blocking `ibapi` client. One-shot requests run on tokio's
//! blocking pool; subscriptions are pumped on dedicated threads into bounded
//! channels, and a dropped receiver ends the pump and cancels the IB
//! subscription.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use ibapi::contracts::tick_types::TickType;
use ibapi::contracts::{Contract, SecurityType};
use ibapi::market_data::historical::{self, ToDuration};
use ibapi::market_data::realtime::{self, TickTypes};
use ibapi::orders::{order_builder, Action};
use ibapi::Client;

use super::{Bar, BarAggregator, BarSize, BarUpdate, Broker, HistoryWindow, OrderId, Tick};
use crate::error::{BotError, Result};
use crate::orders::{BracketOrder, OrderSide};

const CHANNEL_CAPACITY: usize = 1024;

/// TWS/Gateway connection settings
#[derive(Debug, Clone)]
pub struct IbConfig {
    /// TWS/Gateway host (default: 127.0.0.1)
    pub host: String,
    /// TWS/Gateway port (paper: 7497, live: 7496)
    pub port: u16,
    /// Client ID (must be unique per connection)
    pub client_id: i32,
}

impl Default for IbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
        }
    }
}

impl IbConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SMART-routed USD stock contract
pub fn stock_contract(symbol: &str) -> Contract {
    Contract {
        symbol: symbol.to_string(),
        security_type: SecurityType::Stock,
        exchange: "SMART".to_string(),
        currency: "USD".to_string(),
        ..Default::default()
    }
}

fn to_utc(date: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(date.unix_timestamp(), date.nanosecond()).unwrap_or_else(Utc::now)
}

fn ib_action(side: OrderSide) -> Action {
    match side {
        OrderSide::Buy => Action::Buy,
        OrderSide::Sell => Action::Sell,
    }
}

fn historical_bar_size(bar_size: BarSize) -> historical::BarSize {
    match bar_size {
        BarSize::Min1 => historical::BarSize::Min,
        BarSize::Min5 => historical::BarSize::Min5,
        BarSize::Min15 => historical::BarSize::Min15,
        BarSize::Min30 => historical::BarSize::Min30,
        BarSize::Hour1 => historical::BarSize::Hour,
        BarSize::Day1 => historical::BarSize::Day,
    }
}

fn historical_duration(window: HistoryWindow) -> historical::Duration {
    match window {
        HistoryWindow::Seconds(n) => n.seconds(),
        HistoryWindow::Days(n) => n.days(),
    }
}

fn from_historical(bar: &historical::Bar) -> Bar {
    Bar {
        timestamp: to_utc(bar.date),
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
        average: bar.wap,
    }
}

fn from_realtime(bar: &realtime::Bar) -> Bar {
    Bar {
        timestamp: to_utc(bar.date),
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
        average: bar.wap,
    }
}

fn request_history(client: &Client, symbol: &str, window: HistoryWindow, bar_size: BarSize) -> Result<Vec<Bar>> {
    let data = client
        .historical_data(
            &stock_contract(symbol),
            None,
            historical_duration(window),
            historical_bar_size(bar_size),
            historical::WhatToShow::Trades,
            true,
        )
        .map_err(|e| BotError::data_fetch(symbol, e))?;

    Ok(data.bars.iter().map(from_historical).collect())
}

/// Last-trade price carried by a tick, falling back to the prior close
/// until a last trade has been seen
fn last_price(tick: &TickTypes, seen_last: &mut bool) -> Option<f64> {
    let (tick_type, price) = match tick {
        TickTypes::Price(p) => (&p.tick_type, p.price),
        TickTypes::PriceSize(ps) => (&ps.price_tick_type, ps.price),
        _ => return None,
    };

    let price = match tick_type {
        TickType::Last | TickType::DelayedLast => {
            *seen_last = true;
            Some(price)
        }
        TickType::Close | TickType::DelayedClose if !*seen_last => Some(price),
        _ => None,
    };
    price.filter(|p| p.is_finite() && *p > 0.0)
}

/// Broker session over TWS / IB Gateway
pub struct IbBroker {
    config: IbConfig,
    client: RwLock<Option<Arc<Client>>>,
}

impl IbBroker {
    pub fn new(config: IbConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BotError::Connection("not connected to TWS/Gateway".to_string()))
    }

    /// Run a blocking client call on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T> + Send + 'static,
    {
        let client = self.client()?;
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| BotError::Connection(format!("broker worker failed: {}", e)))?
    }
}

#[async_trait]
impl Broker for IbBroker {
    async fn connect(&self) -> Result<()> {
        let address = self.config.address();
        let client_id = self.config.client_id;
        info!("Connecting to IB at {} (client id {})...", address, client_id);

        let client = tokio::task::spawn_blocking(move || Client::connect(&address, client_id))
            .await
            .map_err(|e| BotError::Connection(e.to_string()))?
            .map_err(|e| {
                BotError::Connection(format!(
                    "{} ({}). Make sure TWS or IB Gateway is running with the API enabled.",
                    e,
                    self.config.address()
                ))
            })?;

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(client));
        info!("Connected to IB");
        Ok(())
    }

    async fn disconnect(&self) {
        let previous = self.client.write().unwrap_or_else(PoisonError::into_inner).take();
        if previous.is_some() {
            info!("Disconnected from IB");
        }
    }

    fn is_connected(&self) -> bool {
        self.client.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    async fn server_time(&self) -> Option<DateTime<Utc>> {
        let result = self
            .call(|client| {
                client
                    .server_time()
                    .map_err(|e| BotError::Connection(e.to_string()))
            })
            .await;

        match result {
            Ok(time) => Some(to_utc(time)),
            Err(e) => {
                debug!("server time unavailable: {}", e);
                None
            }
        }
    }

    async fn fetch_historical_bars(&self, symbol: &str, window: HistoryWindow, bar_size: BarSize) -> Result<Vec<Bar>> {
        let symbol = symbol.to_string();
        debug!("{}: requesting {} of {} bars", symbol, window, bar_size);
        self.call(move |client| request_history(client, &symbol, window, bar_size))
            .await
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>> {
        let client = self.client()?;
        let symbol = symbol.to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("ticks-{}", symbol))
            .spawn(move || {
                let contract = stock_contract(&symbol);
                let subscription = match client.market_data(&contract, &[], false, false) {
                    Ok(subscription) => {
                        let _ = ready_tx.send(Ok(()));
                        subscription
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(BotError::data_fetch(&symbol, e)));
                        return;
                    }
                };

                let mut seen_last = false;
                for tick in subscription {
                    let Some(price) = last_price(&tick, &mut seen_last) else {
                        continue;
                    };
                    if tx.blocking_send(Tick { last_price: price }).is_err() {
                        break;
                    }
                }
                debug!("{}: tick stream closed", symbol);
            })?;

        ready_rx
            .await
            .map_err(|_| BotError::Connection("tick subscription thread exited".to_string()))??;
        Ok(rx)
    }

    async fn subscribe_bars(&self, symbol: &str, bar_size: BarSize) -> Result<mpsc::Receiver<BarUpdate>> {
        let seed = self.fetch_historical_bars(symbol, HistoryWindow::Days(1), bar_size).await?;
        let client = self.client()?;
        let symbol = symbol.to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("bars-{}", symbol))
            .spawn(move || {
                let contract = stock_contract(&symbol);
                let subscription = match client.realtime_bars(
                    &contract,
                    realtime::BarSize::Sec5,
                    realtime::WhatToShow::Trades,
                    true,
                ) {
                    Ok(subscription) => {
                        let _ = ready_tx.send(Ok(()));
                        subscription
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(BotError::data_fetch(&symbol, e)));
                        return;
                    }
                };

                let mut aggregator = BarAggregator::new(bar_size, seed);
                for rt_bar in subscription {
                    let has_new_bar = aggregator.update(&from_realtime(&rt_bar));
                    if tx.blocking_send(aggregator.to_update(has_new_bar)).is_err() {
                        break;
                    }
                }
                debug!("{}: bar stream closed", symbol);
            })?;

        ready_rx
            .await
            .map_err(|_| BotError::Connection("bar subscription thread exited".to_string()))??;
        Ok(rx)
    }

    async fn place_linked_orders(&self, symbol: &str, bracket: &BracketOrder) -> Result<OrderId> {
        let symbol = symbol.to_string();
        let bracket = bracket.clone();

        self.call(move |client| {
            let contract = stock_contract(&symbol);
            let quantity = bracket.quantity() as f64;

            // Parent is held until the stop is attached; the stop transmits both
            let parent_id = client.next_order_id();
            let mut parent = order_builder::market_order(ib_action(bracket.parent.side), quantity);
            parent.order_id = parent_id;
            parent.transmit = bracket.parent.transmit;

            let stop_id = client.next_order_id();
            let mut stop = order_builder::stop(ib_action(bracket.stop.side), quantity, bracket.stop_price());
            stop.order_id = stop_id;
            stop.parent_id = parent_id;
            stop.transmit = bracket.stop.transmit;

            client
                .place_order(parent_id, &contract, &parent)
                .map_err(|e| BotError::order_placement(&symbol, format!("parent order: {}", e)))?;
            if let Err(e) = client.place_order(stop_id, &contract, &stop) {
                // The untransmitted parent would otherwise linger in TWS
                if let Err(cancel_err) = client.cancel_order(parent_id, "") {
                    warn!("{}: could not cancel held parent {}: {}", symbol, parent_id, cancel_err);
                }
                return Err(BotError::order_placement(&symbol, format!("stop order: {}", e)));
            }

            info!(
                "{}: bracket sent: parent {} {} {} @ MKT, stop {} @ {:.2}",
                symbol,
                parent_id,
                bracket.parent.side,
                bracket.quantity(),
                stop_id,
                bracket.stop_price()
            );
            Ok(parent_id)
        })
        .await
    }

    async fn place_market_order(&self, symbol: &str, side: OrderSide, quantity: i64) -> Result<OrderId> {
        let symbol = symbol.to_string();

        self.call(move |client| {
            let order_id = client.next_order_id();
            let mut order = order_builder::market_order(ib_action(side), quantity as f64);
            order.order_id = order_id;
            order.transmit = true;

            client
                .place_order(order_id, &stock_contract(&symbol), &order)
                .map_err(|e| BotError::order_placement(&symbol, e))?;
            Ok(order_id)
        })
        .await
    }
}
