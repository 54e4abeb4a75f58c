//! Order types and entry dispatch
//!
//! An entry always goes out as a bracket: a market parent plus a protective
//! stop child. The parent is held (`transmit = false`) until the child is
//! attached, and the child carries `transmit = true` so both release together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::broker::{Broker, OrderId};
use crate::error::{BotError, Result};
use crate::strategy::StrategyHandle;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Stop,
}

/// One leg of a bracket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub stop_price: Option<f64>,
    /// Release this leg (and everything held before it) to the exchange
    pub transmit: bool,
}

/// Market entry with an attached protective stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketOrder {
    pub parent: OrderLeg,
    pub stop: OrderLeg,
}

impl BracketOrder {
    pub fn new(side: OrderSide, quantity: i64, stop_price: f64) -> Self {
        Self {
            parent: OrderLeg {
                side,
                order_type: OrderType::Market,
                quantity,
                stop_price: None,
                transmit: false,
            },
            stop: OrderLeg {
                side: side.opposite(),
                order_type: OrderType::Stop,
                quantity,
                stop_price: Some(stop_price),
                transmit: true,
            },
        }
    }

    pub fn quantity(&self) -> i64 {
        self.parent.quantity
    }

    pub fn stop_price(&self) -> f64 {
        self.stop.stop_price.unwrap_or_default()
    }
}

/// Entry decision produced by a strategy on a tick
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub stop_price: f64,
    pub quantity: i64,
    /// Prefix for the symbol log line, e.g. "Entry BUY"
    pub label: &'static str,
}

impl EntrySignal {
    pub fn bracket(&self) -> BracketOrder {
        BracketOrder::new(self.side, self.quantity, self.stop_price)
    }
}

/// Sends entry brackets for strategies
#[derive(Clone)]
pub struct OrderDispatcher {
    broker: Arc<dyn Broker>,
}

impl OrderDispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Place the bracket for `signal` and record the outcome in the symbol's log.
    ///
    /// A failure marks the symbol `ORDER_FAILED` and is returned to the
    /// caller; it is not retried.
    pub async fn submit_entry(&self, strategy: &StrategyHandle, signal: &EntrySignal) -> Result<OrderId> {
        let bracket = signal.bracket();
        info!(
            "{}: submitting bracket {} {} @ MKT | Stop: {:.2}",
            signal.symbol,
            signal.side,
            bracket.quantity(),
            bracket.stop_price()
        );

        match self.broker.place_linked_orders(&signal.symbol, &bracket).await {
            Ok(order_id) => {
                strategy.with_state(|state| {
                    state.add_log(format!(
                        "{} at {}. Stop Loss at {}",
                        signal.label, signal.price, signal.stop_price
                    ));
                });
                info!("{}: bracket placed, parent order id {}", signal.symbol, order_id);
                Ok(order_id)
            }
            Err(e) => {
                let err = match e {
                    BotError::OrderPlacement { .. } => e,
                    other => BotError::order_placement(&signal.symbol, other),
                };
                error!("{}", err);
                strategy.with_state(|state| {
                    state.mark_order_failed();
                    state.add_log(format!("Order placement failed: {}", err));
                });
                Err(err)
            }
        }
    }
}

/// Kind of manually triggered order
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManualOrderKind {
    Market,
    Bracket { stop_price: f64 },
}

/// Send an operator-requested order and describe what went out
pub async fn place_manual_order(
    broker: &dyn Broker,
    symbol: &str,
    side: OrderSide,
    quantity: i64,
    kind: ManualOrderKind,
) -> Result<String> {
    if quantity <= 0 {
        return Err(BotError::order_placement(symbol, format!("invalid quantity {}", quantity)));
    }

    match kind {
        ManualOrderKind::Market => {
            let id = broker.place_market_order(symbol, side, quantity).await?;
            Ok(format!(
                "MARKET {} order {} sent for {} ({} shares)",
                side, id, symbol, quantity
            ))
        }
        ManualOrderKind::Bracket { stop_price } => {
            if stop_price <= 0.0 {
                return Err(BotError::order_placement(symbol, "bracket requires a positive stop price"));
            }
            let bracket = BracketOrder::new(side, quantity, stop_price);
            let id = broker.place_linked_orders(symbol, &bracket).await?;
            Ok(format!(
                "BRACKET order {} sent for {}: {} market entry + stop at {:.2}",
                id, symbol, side, stop_price
            ))
        }
    }
}
