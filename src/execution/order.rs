//! Order-management seam between the cycle engine and a broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Position direction of a cycle or leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Direction aligned with a signed imbalance (ties go long)
    pub fn from_imbalance(imbalance: f64) -> Self {
        if imbalance >= 0.0 {
            Self::Long
        } else {
            Self::Short
        }
    }

    /// Price move against this direction, positive when adverse
    pub fn adverse_move(&self, from: f64, to: f64) -> f64 {
        (from - to) * self.sign()
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Broker-side identity of one filled leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegId(pub Uuid);

impl LegId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LegId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LegId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to follow a leg through the logs
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Confirmed execution of an open or close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub leg_id: LegId,
    pub side: Direction,
    pub price: f64,
    pub size: f64,
    pub filled_at: DateTime<Utc>,
}

/// A leg the broker still reports as open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub leg_id: LegId,
    pub side: Direction,
    pub size: f64,
    pub entry_price: f64,
}

/// Failures at the order-management boundary. All are retried on a later tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown leg {0}")]
    UnknownLeg(LegId),
}

/// Host order placement and position query.
///
/// Calls are synchronous so a decision tick runs to completion; an adapter
/// for an async broker is expected to bridge on its own side.
pub trait OrderManager {
    /// Open a new leg at (or near) `price`
    fn open(&mut self, side: Direction, price: f64, size: f64) -> Result<Fill, OrderError>;

    /// Flatten a previously opened leg
    fn close(&mut self, leg_id: LegId) -> Result<Fill, OrderError>;

    fn open_positions(&self) -> Result<Vec<OpenPosition>, OrderError>;
}

/// What an order does to a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    Open,
    Close,
}

/// Order lifecycle as seen by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Filled,
    Rejected,
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Audit record of one order sent to a broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub leg_id: Option<LegId>,
    pub intent: OrderIntent,
    pub side: Direction,
    pub quantity: f64,
    pub requested_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn filled(intent: OrderIntent, fill: &Fill, requested_price: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            leg_id: Some(fill.leg_id),
            intent,
            side: fill.side,
            quantity: fill.size,
            requested_price,
            fill_price: Some(fill.price),
            state: OrderState::Filled,
            created_at: fill.filled_at,
        }
    }

    pub fn rejected(
        intent: OrderIntent,
        leg_id: Option<LegId>,
        side: Direction,
        quantity: f64,
        requested_price: Option<f64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            leg_id,
            intent,
            side,
            quantity,
            requested_price,
            fill_price: None,
            state: OrderState::Rejected,
            created_at: at,
        }
    }
}
