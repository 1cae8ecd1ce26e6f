//! Historical replay through the live code path
//!
//! Trade prints go through the same aggregator, gateway and engine as live
//! mode. The engine ticks once per second of data at the last print of that
//! second, against a [`SimulatedBroker`].

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use csv::Writer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::execution::{BrokerConfig, SimulatedBroker};
use crate::orderflow::{
    AggregatorConfig, EstimatorConfig, FeatureAggregator, GatewayConfig, PredictionGateway, RangeEstimator,
    TradePrint,
};
use crate::trading_core::{CycleEngine, CycleOutcome, EngineConfig, EngineEvent, TradingSummary};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub engine: EngineConfig,
    pub broker: BrokerConfig,
    pub aggregator: AggregatorConfig,
    pub estimator: EstimatorConfig,
    pub gateway: GatewayConfig,
}

/// Account balance after a cycle closed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub cycle_pnl: f64,
    pub balance: f64,
}

#[derive(Debug, Serialize)]
pub struct BacktestReport {
    pub summary: TradingSummary,
    pub ticks: usize,
    pub events: Vec<EngineEvent>,
    pub outcomes: Vec<CycleOutcome>,
    pub equity_curve: Vec<EquityPoint>,
    /// Legs booked by the simulated broker
    pub legs_closed: usize,
    pub broker_balance: f64,
    /// Peak-to-trough drop of the broker's realized balance
    pub broker_max_drawdown: f64,
    /// Share of closed legs that made money
    pub leg_win_rate: f64,
    pub first_tick: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
}

pub fn run_backtest(trades: &[TradePrint], config: BacktestConfig) -> Result<BacktestReport> {
    if trades.is_empty() {
        bail!("No trades to replay");
    }
    config.estimator.validate().context("Invalid estimator configuration")?;

    let starting_balance = config.broker.starting_balance;
    let aggregator = FeatureAggregator::shared(config.aggregator.clone());
    let mut gateway = PredictionGateway::new(
        aggregator.clone(),
        RangeEstimator::new(config.estimator.clone()),
        &config.gateway,
    );
    let mut engine = CycleEngine::new(config.engine.clone())?;
    let mut broker = SimulatedBroker::new(config.broker.clone());

    let mut events = Vec::new();
    let mut ticks = 0usize;
    let mut first_tick = None;
    let mut last: Option<(DateTime<Utc>, f64)> = None;

    for (i, trade) in trades.iter().enumerate() {
        match aggregator.lock() {
            Ok(mut agg) => agg.update(trade.clone()),
            Err(_) => bail!("Aggregator lock poisoned"),
        }

        // Tick on the last print of each second
        let second_ends = trades
            .get(i + 1)
            .map_or(true, |next| next.timestamp.timestamp() != trade.timestamp.timestamp());
        if !second_ends {
            continue;
        }

        let now = trade.timestamp;
        let estimate = gateway.get_latest_at(now);
        broker.mark(now, trade.price);
        let tick_events = engine.tick(now, trade.price, &estimate, &mut broker)?;
        for event in &tick_events {
            debug!("{} {:?}", now, event);
        }
        events.extend(tick_events);

        ticks += 1;
        first_tick.get_or_insert(now);
        last = Some((now, trade.price));
    }

    if let Some((now, price)) = last {
        let estimate = gateway.get_latest_at(now);
        events.extend(engine.close_all(now, price, &estimate, &mut broker));
    }

    // The engine only keeps recent outcomes, the event stream has all of them
    let outcomes: Vec<CycleOutcome> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::CycleClosed(outcome) => Some(outcome.clone()),
            _ => None,
        })
        .collect();
    let equity_curve = equity_curve(&outcomes, starting_balance);

    info!(
        "Replayed {} trades in {} ticks | {} cycles closed",
        trades.len(),
        ticks,
        outcomes.len()
    );

    Ok(BacktestReport {
        summary: TradingSummary::from_outcomes(&outcomes, starting_balance),
        ticks,
        events,
        outcomes,
        equity_curve,
        legs_closed: broker.book().legs_closed(),
        broker_balance: broker.book().running_balance(),
        broker_max_drawdown: broker.book().max_drawdown(),
        leg_win_rate: broker.book().win_rate(),
        first_tick,
        last_tick: last.map(|(t, _)| t),
    })
}

fn equity_curve(outcomes: &[CycleOutcome], starting_balance: f64) -> Vec<EquityPoint> {
    let mut balance = starting_balance;
    outcomes
        .iter()
        .map(|o| {
            balance += o.realized_pnl;
            EquityPoint {
                time: o.closed_at,
                cycle_pnl: o.realized_pnl,
                balance,
            }
        })
        .collect()
}

impl BacktestReport {
    /// Write `outcomes.csv`, `equity.csv` and `report.json` into `dir`
    pub fn export(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).context(format!("Failed to create export directory: {:?}", dir))?;

        self.export_outcomes_csv(&dir.join("outcomes.csv"))?;
        self.export_equity_csv(&dir.join("equity.csv"))?;

        let json = serde_json::to_string_pretty(self).context("Failed to serialize replay report")?;
        let report_path = dir.join("report.json");
        fs::write(&report_path, json).context(format!("Failed to write {:?}", report_path))?;

        info!("Exported replay results to {:?}", dir);
        Ok(())
    }

    pub fn export_outcomes_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path).context(format!("Failed to create {:?}", path))?;
        for outcome in &self.outcomes {
            wtr.serialize(outcome)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn export_equity_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path).context(format!("Failed to create {:?}", path))?;
        for point in &self.equity_curve {
            wtr.serialize(point)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Direction, Instrument};
    use crate::orderflow::Side;
    use crate::trading_core::{CloseReason, Period, StrategyKind};
    use chrono::{Duration, TimeZone};

    fn synthetic_trades(seconds: i64) -> Vec<TradePrint> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let mut trades = Vec::new();
        for s in 0..seconds {
            let x = s as f64;
            let mid = 2000.0 + 4.0 * (x / 90.0).sin() + 1.0 * (x / 13.0).cos();
            for k in 0..3 {
                let side = if (s + k) % 3 == 0 { Side::Sell } else { Side::Buy };
                let price = mid + 0.05 * k as f64;
                let ts = start + Duration::seconds(s) + Duration::milliseconds(k * 200);
                trades.push(TradePrint::new(price, 1.0 + k as f64, side, ts));
            }
        }
        trades
    }

    fn config() -> BacktestConfig {
        let instrument = Instrument {
            contract_size: 1.0,
            commission_per_lot: 0.0,
            ..Default::default()
        };
        let mut config = BacktestConfig::default();
        config.engine.instrument = instrument.clone();
        config.engine.cycle.lot_size = 1.0;
        config.broker = BrokerConfig {
            instrument,
            slippage_points: 0.0,
            starting_balance: 1_000.0,
        };
        config
    }

    #[test]
    fn test_replay_ticks_once_per_second_and_ends_flat() {
        let trades = synthetic_trades(1_800);
        let report = run_backtest(&trades, config()).unwrap();

        assert_eq!(report.ticks, 1_800);
        assert_eq!(report.first_tick, Some(trades[2].timestamp));

        // Everything opened was closed, and cycle P&L matches the broker's books
        let opened = report
            .events
            .iter()
            .filter(|e| matches!(e, EngineEvent::CycleActivated { .. }))
            .count();
        assert_eq!(report.summary.total_cycles as usize, opened);
        assert!((report.summary.final_balance - report.broker_balance).abs() < 1e-6);
        assert_eq!(report.summary.total_legs, report.legs_closed);

        assert_eq!(report.equity_curve.len(), report.outcomes.len());
        if let Some(last) = report.equity_curve.last() {
            assert!((last.balance - report.broker_balance).abs() < 1e-6);
        }
    }

    fn outcome(pnl: f64, closed_at: DateTime<Utc>) -> CycleOutcome {
        CycleOutcome {
            cycle_id: uuid::Uuid::new_v4(),
            side: Direction::Long,
            strategy: StrategyKind::Zone,
            period: Period::Two,
            legs: 2,
            size: 2.0,
            realized_pnl: pnl,
            reason: CloseReason::TakeProfit,
            opened_at: closed_at - Duration::minutes(5),
            closed_at,
        }
    }

    #[test]
    fn test_export_writes_outcomes_equity_and_json() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let outcomes = vec![outcome(12.5, start), outcome(-4.0, start + Duration::minutes(10))];
        let report = BacktestReport {
            summary: TradingSummary::from_outcomes(&outcomes, 1_000.0),
            ticks: 600,
            events: outcomes.iter().cloned().map(EngineEvent::CycleClosed).collect(),
            equity_curve: equity_curve(&outcomes, 1_000.0),
            outcomes,
            legs_closed: 4,
            broker_balance: 1_008.5,
            broker_max_drawdown: 4.0,
            leg_win_rate: 0.5,
            first_tick: Some(start),
            last_tick: Some(start + Duration::minutes(10)),
        };

        let dir = std::env::temp_dir().join(format!("rangeflow-export-{}", uuid::Uuid::new_v4()));
        report.export(&dir).unwrap();

        let mut outcomes = csv::Reader::from_path(dir.join("outcomes.csv")).unwrap();
        let headers = outcomes.headers().unwrap().clone();
        let pnl_col = headers.iter().position(|h| h == "realized_pnl").unwrap();
        let rows: Vec<csv::StringRecord> = outcomes.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][pnl_col].parse::<f64>().unwrap(), -4.0);

        let mut equity = csv::Reader::from_path(dir.join("equity.csv")).unwrap();
        let headers: Vec<String> = equity.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, vec!["time", "cycle_pnl", "balance"]);
        let balances: Vec<f64> = equity.records().map(|r| r.unwrap()[2].parse().unwrap()).collect();
        assert_eq!(balances, vec![1_012.5, 1_008.5]);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("report.json")).unwrap()).unwrap();
        assert_eq!(json["ticks"], 600);
        assert_eq!(json["outcomes"].as_array().unwrap().len(), 2);
        assert_eq!(json["equity_curve"][1]["balance"], 1_008.5);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(run_backtest(&[], config()).is_err());
    }

    #[test]
    fn test_inverted_estimator_band_is_rejected() {
        let mut config = config();
        config.estimator.intensity_factor.min = 2.0;
        let err = run_backtest(&synthetic_trades(5), config).unwrap_err();
        assert!(format!("{:#}", err).contains("intensity"));
    }
}
