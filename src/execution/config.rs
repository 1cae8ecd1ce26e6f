//! Instrument and broker configuration

use serde::{Deserialize, Serialize};

use super::order::Direction;

/// Contract specification shared by the engine and the simulated broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Instrument {
    /// Symbol traded (e.g., "XAUUSD")
    pub symbol: String,

    /// Price value of one point; all distances are expressed in points
    pub point_size: f64,

    /// Units per lot (XAUUSD = 100 oz)
    pub contract_size: f64,

    /// Round-trip commission per lot in account currency
    pub commission_per_lot: f64,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            symbol: "XAUUSD".to_string(),
            point_size: 0.01,
            contract_size: 100.0,
            commission_per_lot: 7.0,
        }
    }
}

impl Instrument {
    /// Convert a distance in points into a price offset
    pub fn points(&self, points: f64) -> f64 {
        points * self.point_size
    }

    /// Realized P&L of a leg in account currency, net of commission
    pub fn leg_pnl(&self, side: Direction, entry: f64, exit: f64, size: f64) -> f64 {
        (exit - entry) * side.sign() * size * self.contract_size - self.commission_per_lot * size
    }

    /// Mark-to-market P&L of a leg before commission
    pub fn floating_pnl(&self, side: Direction, entry: f64, price: f64, size: f64) -> f64 {
        (price - entry) * side.sign() * size * self.contract_size
    }
}

/// Configuration for the simulated broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub instrument: Instrument,

    /// Adverse slippage applied to every fill, in points
    pub slippage_points: f64,

    /// Starting account balance
    pub starting_balance: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            instrument: Instrument::default(),
            slippage_points: 0.0,
            starting_balance: 10_000.0,
        }
    }
}
