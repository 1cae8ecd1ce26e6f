//! Summary statistics over closed cycles

use serde::Serialize;
use std::collections::BTreeMap;

use super::cycle::{CycleOutcome, StrategyKind};

/// Summary of trading results
#[derive(Debug, Clone, Serialize)]
pub struct TradingSummary {
    pub total_cycles: u32,
    pub wins: u32,
    pub losses: u32,
    pub breakevens: u32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub max_drawdown: f64,
    pub final_balance: f64,
    pub sharpe_ratio: f64,
    pub total_legs: usize,
    pub cycles_by_strategy: BTreeMap<StrategyKind, u32>,
}

impl TradingSummary {
    pub fn from_outcomes(outcomes: &[CycleOutcome], starting_balance: f64) -> Self {
        let total = outcomes.len() as u32;
        let mut wins = 0u32;
        let mut losses = 0u32;
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;
        let mut balance = starting_balance;
        let mut peak = starting_balance;
        let mut max_drawdown: f64 = 0.0;
        let mut cycles_by_strategy = BTreeMap::new();

        for outcome in outcomes {
            let pnl = outcome.realized_pnl;
            if pnl > 0.0 {
                wins += 1;
                gross_profit += pnl;
            } else if pnl < 0.0 {
                losses += 1;
                gross_loss += -pnl;
            }

            balance += pnl;
            peak = peak.max(balance);
            max_drawdown = max_drawdown.max(peak - balance);

            *cycles_by_strategy.entry(outcome.strategy).or_insert(0) += 1;
        }

        let net_pnl = gross_profit - gross_loss;
        let win_rate = if total > 0 { wins as f64 / total as f64 * 100.0 } else { 0.0 };

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if wins > 0 { gross_profit / wins as f64 } else { 0.0 };
        let avg_loss = if losses > 0 { -(gross_loss / losses as f64) } else { 0.0 };

        // Annualized, per-cycle returns
        let sharpe_ratio = if total > 1 {
            let mean = net_pnl / total as f64;
            let variance = outcomes
                .iter()
                .map(|o| (o.realized_pnl - mean).powi(2))
                .sum::<f64>()
                / total as f64;
            let std_dev = variance.sqrt();
            if std_dev > 0.0 {
                mean / std_dev * 252.0_f64.sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };

        Self {
            total_cycles: total,
            wins,
            losses,
            breakevens: total - wins - losses,
            win_rate,
            profit_factor,
            gross_profit,
            gross_loss,
            net_pnl,
            avg_win,
            avg_loss,
            max_drawdown,
            final_balance: balance,
            sharpe_ratio,
            total_legs: outcomes.iter().map(|o| o.legs).sum(),
            cycles_by_strategy,
        }
    }

    pub fn print(&self) {
        println!("Total Cycles:      {}", self.total_cycles);
        println!("Wins:              {} ({:.1}%)", self.wins, self.win_rate);
        println!("Losses:            {}", self.losses);
        println!("Breakevens:        {}", self.breakevens);
        println!("Legs Filled:       {}", self.total_legs);
        println!();
        println!("Profit Factor:     {:.2}", self.profit_factor);
        println!("Sharpe Ratio:      {:.2}", self.sharpe_ratio);
        println!("Avg Win:           ${:.2}", self.avg_win);
        println!("Avg Loss:          ${:.2}", self.avg_loss);
        println!("Net P&L:           ${:+.2}", self.net_pnl);
        println!();
        println!("Final Balance:     ${:.2}", self.final_balance);
        println!("Max Drawdown:      ${:.2}", self.max_drawdown);
        if !self.cycles_by_strategy.is_empty() {
            println!();
            for (kind, count) in &self.cycles_by_strategy {
                println!("  {:<14} {}", kind.to_string(), count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Direction;
    use crate::trading_core::config::Period;
    use crate::trading_core::cycle::CloseReason;
    use chrono::Utc;
    use uuid::Uuid;

    fn outcome(pnl: f64, strategy: StrategyKind) -> CycleOutcome {
        CycleOutcome {
            cycle_id: Uuid::new_v4(),
            side: Direction::Long,
            strategy,
            period: Period::One,
            legs: 2,
            size: 0.02,
            realized_pnl: pnl,
            reason: CloseReason::TakeProfit,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_figures() {
        let outcomes = vec![
            outcome(30.0, StrategyKind::Zone),
            outcome(-10.0, StrategyKind::Accumulation),
            outcome(-20.0, StrategyKind::Accumulation),
            outcome(50.0, StrategyKind::Trend),
            outcome(0.0, StrategyKind::Zone),
        ];
        let s = TradingSummary::from_outcomes(&outcomes, 1_000.0);

        assert_eq!(s.total_cycles, 5);
        assert_eq!((s.wins, s.losses, s.breakevens), (2, 2, 1));
        assert!((s.win_rate - 40.0).abs() < 1e-9);
        assert!((s.profit_factor - 80.0 / 30.0).abs() < 1e-9);
        assert!((s.net_pnl - 50.0).abs() < 1e-9);
        assert!((s.max_drawdown - 30.0).abs() < 1e-9);
        assert!((s.final_balance - 1_050.0).abs() < 1e-9);
        assert_eq!(s.total_legs, 10);
        assert_eq!(s.cycles_by_strategy[&StrategyKind::Accumulation], 2);
        assert_eq!(s.cycles_by_strategy[&StrategyKind::Zone], 2);
    }

    #[test]
    fn test_empty_summary() {
        let s = TradingSummary::from_outcomes(&[], 500.0);
        assert_eq!(s.total_cycles, 0);
        assert_eq!(s.win_rate, 0.0);
        assert_eq!(s.profit_factor, 0.0);
        assert_eq!(s.final_balance, 500.0);
    }
}
