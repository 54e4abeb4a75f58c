//! Dry-run wrapper: live market data, simulated order acknowledgements

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::mpsc;
use tracing::info;

use super::{Bar, BarSize, BarUpdate, Broker, HistoryWindow, OrderId, Tick};
use crate::error::Result;
use crate::orders::{BracketOrder, OrderSide};

/// Local ids start high so they never collide with broker ids in logs
const DRY_RUN_FIRST_ID: OrderId = 900_000;

/// Delegates data calls to `inner`; orders are logged and never sent
pub struct DryRunBroker<B> {
    inner: B,
    next_id: AtomicI32,
}

impl<B: Broker> DryRunBroker<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            next_id: AtomicI32::new(DRY_RUN_FIRST_ID),
        }
    }

    fn next_id(&self) -> OrderId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl<B: Broker> Broker for DryRunBroker<B> {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn server_time(&self) -> Option<DateTime<Utc>> {
        self.inner.server_time().await
    }

    async fn fetch_historical_bars(&self, symbol: &str, window: HistoryWindow, bar_size: BarSize) -> Result<Vec<Bar>> {
        self.inner.fetch_historical_bars(symbol, window, bar_size).await
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>> {
        self.inner.subscribe_ticks(symbol).await
    }

    async fn subscribe_bars(&self, symbol: &str, bar_size: BarSize) -> Result<mpsc::Receiver<BarUpdate>> {
        self.inner.subscribe_bars(symbol, bar_size).await
    }

    async fn place_linked_orders(&self, symbol: &str, bracket: &BracketOrder) -> Result<OrderId> {
        let parent_id = self.next_id();
        let stop_id = self.next_id();
        info!(
            "DRY RUN: bracket {} {} {} @ MKT (id {}) | Stop {} @ {:.2} (id {})",
            bracket.parent.side,
            bracket.quantity(),
            symbol,
            parent_id,
            bracket.stop.side,
            bracket.stop_price(),
            stop_id
        );
        Ok(parent_id)
    }

    async fn place_market_order(&self, symbol: &str, side: OrderSide, quantity: i64) -> Result<OrderId> {
        let id = self.next_id();
        info!("DRY RUN: {} {} {} @ MKT (id {})", side, quantity, symbol, id);
        Ok(id)
    }
}
