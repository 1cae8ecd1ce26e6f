use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use rangeflow::backtest::{run_backtest, BacktestConfig};
use rangeflow::execution::BrokerConfig;
use rangeflow::streams::load_trade_csv;
use rangeflow::trading_core::EngineConfig;

/// Replay historical trade prints through the range estimator and cycle engine
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// CSV of trade prints (timestamp,price,size,side)
    csv: PathBuf,

    /// Named preset: default, aggressive, conservative, scalping
    #[arg(short, long, default_value = "default")]
    preset: String,

    /// JSON engine config (overrides --preset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Starting account balance
    #[arg(short, long, default_value = "10000")]
    balance: f64,

    /// Fill slippage in points
    #[arg(short, long, default_value = "5")]
    slippage: f64,

    /// Override max orders per cycle in every period
    #[arg(short, long)]
    max_orders: Option<u32>,

    /// Exchange timezone for day and period boundaries
    #[arg(short, long)]
    timezone: Option<String>,

    /// Directory for outcomes.csv, equity.csv and report.json
    #[arg(short, long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("rangeflow=info".parse()?))
        .init();

    let args = Args::parse();

    let mut engine = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::preset(&args.preset)?,
    };
    if let Some(max_orders) = args.max_orders {
        engine.set_period_max_orders(max_orders);
    }
    if let Some(tz) = &args.timezone {
        engine.limits.timezone = tz.clone();
    }
    engine.validate().context("Invalid engine configuration")?;

    let trades = load_trade_csv(&args.csv)?;
    info!("Loaded {} trades from {:?}", trades.len(), args.csv);

    let config = BacktestConfig {
        broker: BrokerConfig {
            instrument: engine.instrument.clone(),
            slippage_points: args.slippage,
            starting_balance: args.balance,
        },
        engine,
        ..Default::default()
    };

    let report = run_backtest(&trades, config)?;

    println!("\n═══════════════════════════════════════════════════════════");
    println!("              RANGEFLOW REPLAY RESULTS                      ");
    println!("═══════════════════════════════════════════════════════════\n");

    if let (Some(first), Some(last)) = (report.first_tick, report.last_tick) {
        println!("Period:            {} → {}", first.format("%Y-%m-%d %H:%M"), last.format("%Y-%m-%d %H:%M"));
    }
    println!("Seconds Replayed:  {}", report.ticks);
    println!("Engine Events:     {}", report.events.len());
    println!();
    report.summary.print();
    println!("Broker Balance:    ${:.2}", report.broker_balance);
    println!("Broker Max DD:     ${:.2}", report.broker_max_drawdown);
    println!("Leg Win Rate:      {:.1}%", report.leg_win_rate * 100.0);

    println!("\n═══════════════════════════════════════════════════════════\n");

    if let Some(dir) = &args.export {
        report.export(dir)?;
        println!("Results exported to {:?}", dir);
    }

    Ok(())
}
