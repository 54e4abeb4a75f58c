//! Bot configuration
//!
//! Loaded from a YAML file with three sections: `ibkr` (connection),
//! `trading` (symbols, strategy selection and risk) and `bot` (runtime
//! knobs). Every key has a default so a minimal file only lists symbols.
//! The file is watched by modification time and re-read while running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::broker::{BarSize, IbConfig};
use crate::error::{BotError, Result};
use crate::risk::RiskConfig;
use crate::strategy::StrategyKind;

/// TWS / IB Gateway connection section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IbkrSection {
    pub host: String,
    /// 7497 paper TWS, 7496 live TWS, 4002/4001 for Gateway
    pub port: u16,
    pub client_id: i32,
    /// "paper" or "live", informational
    pub account_type: String,
}

impl Default for IbkrSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
            account_type: "paper".to_string(),
        }
    }
}

/// Symbols, strategy selection and risk parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSection {
    pub symbols: Vec<String>,
    /// Default strategy name for symbols without an override
    pub strategy: String,
    /// Per-symbol strategy override
    pub asset_strategies: HashMap<String, String>,
    pub risk_per_trade_percent: f64,
    pub account_equity: f64,
    pub max_risk_usd: f64,
    /// Stop distance cap in ATR multiples, 0 disables
    pub max_stop_atr: f64,
    /// Bar size of the rolling bar stream, e.g. "1 min"
    pub timeframe: String,
}

impl Default for TradingSection {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            strategy: StrategyKind::OpeningRangeBreakout.name().to_string(),
            asset_strategies: HashMap::new(),
            risk_per_trade_percent: 1.0,
            account_equity: 100_000.0,
            max_risk_usd: 500.0,
            max_stop_atr: 0.0,
            timeframe: "1 min".to_string(),
        }
    }
}

impl TradingSection {
    pub fn risk(&self) -> RiskConfig {
        RiskConfig {
            account_equity: self.account_equity,
            risk_per_trade_percent: self.risk_per_trade_percent,
            max_risk_usd: self.max_risk_usd,
            max_stop_atr: self.max_stop_atr,
        }
    }

    /// Configured symbols, trimmed, without blanks or duplicates, in file order
    pub fn symbol_list(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            let symbol = symbol.trim();
            if !symbol.is_empty() && !out.iter().any(|s| s == symbol) {
                out.push(symbol.to_string());
            }
        }
        out
    }

    pub fn strategy_for(&self, symbol: &str) -> StrategyKind {
        let name = self
            .asset_strategies
            .get(symbol)
            .unwrap_or(&self.strategy);
        StrategyKind::from_name(name)
    }

    pub fn bar_size(&self) -> BarSize {
        BarSize::parse(&self.timeframe).unwrap_or_else(|| {
            warn!("Unsupported timeframe '{}', using 1 min", self.timeframe);
            BarSize::Min1
        })
    }
}

/// Runtime knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSection {
    /// Snapshot file read by external monitoring
    pub state_file: PathBuf,
    pub poll_interval_secs: u64,
    pub init_timeout_secs: u64,
    /// Extra initialize attempts on later poll cycles (0 = one-shot)
    pub init_retry_attempts: u32,
    /// Wait before re-checking a symbol whose reference bar is not out yet
    pub pending_retry_secs: u64,
    pub atr_refresh_secs: u64,
    /// Log lines per symbol kept in the snapshot
    pub snapshot_log_window: usize,
    /// Client id for manual orders, distinct from the bot session
    pub manual_client_id: i32,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("bot_state.json"),
            poll_interval_secs: 5,
            init_timeout_secs: 30,
            init_retry_attempts: 3,
            pending_retry_secs: 60,
            atr_refresh_secs: 1800,
            snapshot_log_window: 50,
            manual_client_id: 99,
        }
    }
}

impl BotSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn pending_retry(&self) -> Duration {
        Duration::from_secs(self.pending_retry_secs)
    }

    pub fn atr_refresh(&self) -> Duration {
        Duration::from_secs(self.atr_refresh_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub ibkr: IbkrSection,
    pub trading: TradingSection,
    pub bot: BotSection,
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BotError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&text).map_err(|e| match e {
            BotError::ConfigParse { message, .. } => BotError::ConfigParse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty file deserializes to unit, not a mapping
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| BotError::ConfigParse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn ib_config(&self) -> IbConfig {
        IbConfig {
            host: self.ibkr.host.clone(),
            port: self.ibkr.port,
            client_id: self.ibkr.client_id,
        }
    }

    /// Connection settings for the manual order session
    pub fn manual_ib_config(&self) -> IbConfig {
        IbConfig {
            client_id: self.bot.manual_client_id,
            ..self.ib_config()
        }
    }
}

/// Source of configuration updates, polled once per reconciliation cycle
pub trait ConfigSource: Send {
    /// A new configuration when the source changed since the last poll
    fn poll(&mut self) -> Option<BotConfig>;
}

/// YAML file watched by modification time
pub struct FileConfigSource {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl FileConfigSource {
    /// Load the file once and start watching it
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, BotConfig)> {
        let path = path.into();
        let modified = modified_time(&path);
        let config = BotConfig::load(&path)?;
        Ok((Self { path, modified }, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ConfigSource for FileConfigSource {
    fn poll(&mut self) -> Option<BotConfig> {
        let modified = modified_time(&self.path)?;
        if self.modified.is_some_and(|previous| modified <= previous) {
            return None;
        }
        // Recorded before parsing so a broken file warns once per edit
        self.modified = Some(modified);

        match BotConfig::load(&self.path) {
            Ok(config) => {
                info!("Configuration reloaded from {}", self.path.display());
                Some(config)
            }
            Err(e) => {
                warn!("{}; keeping previous configuration", e);
                None
            }
        }
    }
}
