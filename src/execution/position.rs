//! Position book and P&L tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::config::Instrument;
use super::order::{Direction, Fill, LegId, OpenPosition};

/// Completed leg for P&L history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub leg_id: LegId,
    pub side: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net P&L in account currency
    pub pnl: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

/// Open legs, realized history and the running balance
#[derive(Debug)]
pub struct PositionBook {
    instrument: Instrument,
    open: HashMap<LegId, Fill>,
    trade_history: VecDeque<TradeRecord>,
    running_balance: f64,
    peak_balance: f64,
    max_drawdown: f64,
    legs_closed: usize,
    max_history: usize,
}

impl PositionBook {
    pub fn new(instrument: Instrument, starting_balance: f64) -> Self {
        Self {
            instrument,
            open: HashMap::new(),
            trade_history: VecDeque::new(),
            running_balance: starting_balance,
            peak_balance: starting_balance,
            max_drawdown: 0.0,
            legs_closed: 0,
            max_history: 10_000,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.open.is_empty()
    }

    /// Net signed size across all open legs
    pub fn net_position(&self) -> f64 {
        self.open.values().map(|f| f.size * f.side.sign()).sum()
    }

    pub fn open_leg(&mut self, fill: Fill) {
        self.open.insert(fill.leg_id, fill);
    }

    pub fn entry(&self, leg_id: &LegId) -> Option<&Fill> {
        self.open.get(leg_id)
    }

    /// Close a leg at `exit_price` and book the result
    pub fn close_leg(&mut self, leg_id: &LegId, exit_price: f64, at: DateTime<Utc>) -> Option<TradeRecord> {
        let entry = self.open.remove(leg_id)?;
        let pnl = self
            .instrument
            .leg_pnl(entry.side, entry.price, exit_price, entry.size);

        self.running_balance += pnl;
        self.legs_closed += 1;
        if self.running_balance > self.peak_balance {
            self.peak_balance = self.running_balance;
        }
        let dd = self.peak_balance - self.running_balance;
        if dd > self.max_drawdown {
            self.max_drawdown = dd;
        }

        let record = TradeRecord {
            leg_id: entry.leg_id,
            side: entry.side,
            size: entry.size,
            entry_price: entry.price,
            exit_price,
            pnl,
            entry_time: entry.filled_at,
            exit_time: at,
        };

        self.trade_history.push_back(record.clone());
        if self.trade_history.len() > self.max_history {
            self.trade_history.pop_front();
        }

        Some(record)
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.open
            .values()
            .map(|f| OpenPosition {
                leg_id: f.leg_id,
                side: f.side,
                size: f.size,
                entry_price: f.price,
            })
            .collect()
    }

    /// Unrealized P&L for all open legs
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.open
            .values()
            .map(|f| self.instrument.floating_pnl(f.side, f.price, current_price, f.size))
            .sum()
    }

    pub fn running_balance(&self) -> f64 {
        self.running_balance
    }

    /// Largest peak-to-trough drop of the realized balance
    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    /// Legs closed since start, including those dropped from history
    pub fn legs_closed(&self) -> usize {
        self.legs_closed
    }

    /// Win rate over the retained leg history
    pub fn win_rate(&self) -> f64 {
        if self.trade_history.is_empty() {
            0.0
        } else {
            let wins = self.trade_history.iter().filter(|t| t.pnl > 0.0).count();
            wins as f64 / self.trade_history.len() as f64
        }
    }
}
