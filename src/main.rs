use anyhow::{bail, Context, Result};
use chrono_tz::America::New_York;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use intraday_breakout::broker::last_candle;
use intraday_breakout::orders::{place_manual_order, ManualOrderKind, OrderSide};
use intraday_breakout::snapshot::read_snapshot;
use intraday_breakout::{
    BarSize, BotConfig, Broker, DryRunBroker, EventDispatcher, FileConfigSource, IbBroker,
};

#[derive(Parser, Debug)]
#[command(name = "intraday-breakout")]
#[command(about = "Intraday equity breakout bot for Interactive Brokers")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the YAML configuration file
    #[arg(short, long, global = true, env = "BOT_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bot (default)
    Run {
        /// Log orders instead of sending them
        #[arg(long)]
        dry_run: bool,
    },

    /// Send a manual order on the manual client id
    Order {
        /// Stock symbol (e.g., AAPL)
        symbol: String,

        /// BUY or SELL
        #[arg(long, default_value = "BUY")]
        side: String,

        /// Shares
        #[arg(short, long)]
        quantity: i64,

        /// Attach a protective stop at this price (BRACKET); MARKET when omitted
        #[arg(long)]
        stop: Option<f64>,

        /// Log the order instead of sending it
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the most recent bar for a symbol
    Candle {
        symbol: String,

        /// Bar size, e.g. "1 min", "5 mins", "1 day"
        #[arg(short, long, default_value = "1 min")]
        bar_size: String,
    },

    /// Print the persisted bot state
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("intraday_breakout={}", level).parse()?),
        )
        .init();

    match args.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => run_bot(&args.config, dry_run).await,
        Commands::Order {
            symbol,
            side,
            quantity,
            stop,
            dry_run,
        } => run_order(&args.config, &symbol, &side, quantity, stop, dry_run).await,
        Commands::Candle { symbol, bar_size } => run_candle(&args.config, &symbol, &bar_size).await,
        Commands::Status => run_status(&args.config),
    }
}

fn load_config(path: &Path) -> Result<BotConfig> {
    BotConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn session_broker(ib: IbBroker, dry_run: bool) -> Arc<dyn Broker> {
    if dry_run {
        info!("DRY RUN: orders will be logged, not sent");
        Arc::new(DryRunBroker::new(ib))
    } else {
        Arc::new(ib)
    }
}

async fn run_bot(config_path: &Path, dry_run: bool) -> Result<()> {
    let (source, config) = FileConfigSource::open(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    info!("Starting intraday breakout bot");
    info!("Config: {}", source.path().display());
    info!("Symbols: {}", config.trading.symbol_list().join(", "));
    info!("Account: {}", config.ibkr.account_type);
    if config.ibkr.account_type.eq_ignore_ascii_case("live") && !dry_run {
        warn!("LIVE account: orders will be sent to a live account");
    }

    let broker = session_broker(IbBroker::new(config.ib_config()), dry_run);
    EventDispatcher::new(broker, config, Box::new(source))
        .run()
        .await
        .context("Bot stopped")?;

    info!("Bot stopped");
    Ok(())
}

async fn run_order(
    config_path: &Path,
    symbol: &str,
    side: &str,
    quantity: i64,
    stop: Option<f64>,
    dry_run: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let Some(side) = OrderSide::parse(side) else {
        bail!("Invalid side '{}', expected BUY or SELL", side);
    };
    let kind = match stop {
        Some(stop_price) => ManualOrderKind::Bracket { stop_price },
        None => ManualOrderKind::Market,
    };

    let broker = session_broker(IbBroker::new(config.manual_ib_config()), dry_run);
    broker.connect().await.context("Failed to connect to IB")?;
    let result = place_manual_order(broker.as_ref(), symbol, side, quantity, kind).await;
    broker.disconnect().await;

    let summary = result?;
    println!("{}", summary);
    Ok(())
}

async fn run_candle(config_path: &Path, symbol: &str, bar_size: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let Some(bar_size) = BarSize::parse(bar_size) else {
        bail!("Unsupported bar size '{}'", bar_size);
    };

    let broker = IbBroker::new(config.manual_ib_config());
    broker.connect().await.context("Failed to connect to IB")?;
    let candle = last_candle(&broker, symbol, bar_size).await;
    broker.disconnect().await;

    match candle? {
        Some(c) => {
            println!("{} {} candle", symbol, bar_size);
            println!("  Open:  {:.2}", c.open);
            println!("  High:  {:.2}", c.high);
            println!("  Low:   {:.2}", c.low);
            println!("  Close: {:.2}", c.close);
            println!(
                "  Time:  {} - {} ET",
                c.start_time.with_timezone(&New_York).format("%Y-%m-%d %H:%M"),
                c.end_time.with_timezone(&New_York).format("%H:%M")
            );
        }
        None => println!("No {} bars available for {}", bar_size, symbol),
    }
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    let state_file = if config_path.exists() {
        load_config(config_path)?.bot.state_file
    } else {
        BotConfig::default().bot.state_file
    };
    let snapshot = read_snapshot(&state_file)
        .with_context(|| format!("Failed to read state file {}", state_file.display()))?;

    let info = &snapshot.bot_info;
    println!(
        "Connected: {} | Last update: {} | Server time: {}",
        if info.is_connected { "yes" } else { "no" },
        info.last_update.with_timezone(&New_York).format("%H:%M:%S"),
        info.server_time
            .map(|t| t.with_timezone(&New_York).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!();
    println!(
        "{:<8} {:<13} {:<16} {:>10} {:>8} {:>6} {:>10} {:>10}",
        "SYMBOL", "STRATEGY", "STATUS", "LAST", "ATR", "POS", "ENTRY", "STOP"
    );
    for entry in snapshot.symbols.values() {
        let fmt_opt = |v: Option<f64>| v.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<13} {:<16} {:>10.2} {:>8.2} {:>6} {:>10} {:>10}",
            entry.symbol,
            entry.strategy,
            entry.status.to_string(),
            entry.last_price,
            entry.atr,
            entry.position,
            fmt_opt(entry.entry_price),
            fmt_opt(entry.stop_loss)
        );
        if let Some(last) = entry.logs.last() {
            println!("         {}", last);
        }
    }
    Ok(())
}
