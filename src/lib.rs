// Library crate - intraday breakout bot core

pub mod atr;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod orders;
pub mod risk;
pub mod snapshot;
pub mod state;
pub mod strategy;

// Re-export commonly used types
pub use broker::{Bar, BarSize, Broker, DryRunBroker, IbBroker, IbConfig};
pub use config::{BotConfig, ConfigSource, FileConfigSource};
pub use dispatcher::EventDispatcher;
pub use error::{BotError, Result};
pub use state::{TradeState, TradeStatus};
pub use strategy::{Strategy, StrategyHandle, StrategyKind};
