//! Persisted state snapshot
//!
//! A JSON object keyed by symbol, plus a reserved `_bot_info` entry with
//! connectivity status. Written with write-temp-then-rename so readers
//! never observe a partial file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::state::{Levels, TradeState, TradeStatus};

pub const BOT_INFO_KEY: &str = "_bot_info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotInfo {
    pub last_update: DateTime<Utc>,
    pub is_connected: bool,
    pub server_time: Option<DateTime<Utc>>,
}

/// One symbol's entry: its trade state plus the strategy name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub levels: Option<Levels>,
    pub position: i64,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: TradeStatus,
    pub atr: f64,
    pub last_price: f64,
    pub logs: Vec<String>,
    pub strategy: String,
}

impl SymbolSnapshot {
    /// Copy `state`, keeping only the last `log_window` log lines
    pub fn from_state(state: &TradeState, strategy: &str, log_window: usize) -> Self {
        Self {
            symbol: state.symbol.clone(),
            levels: state.levels.clone(),
            position: state.position,
            entry_price: state.entry_price,
            stop_loss: state.stop_loss,
            status: state.status,
            atr: state.atr,
            last_price: state.last_price,
            logs: state.recent_logs(log_window).to_vec(),
            strategy: strategy.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "_bot_info")]
    pub bot_info: BotInfo,
    #[serde(flatten)]
    pub symbols: BTreeMap<String, SymbolSnapshot>,
}

impl Snapshot {
    pub fn new(bot_info: BotInfo) -> Self {
        Self {
            bot_info,
            symbols: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: SymbolSnapshot) {
        self.symbols.insert(entry.symbol.clone(), entry);
    }
}

/// Atomic snapshot file writer
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    path: PathBuf,
    log_window: usize,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>, log_window: usize) -> Self {
        Self {
            path: path.into(),
            log_window,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_window(&self) -> usize {
        self.log_window
    }

    pub fn set_log_window(&mut self, log_window: usize) {
        self.log_window = log_window;
    }

    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
