//! Execution module: the order-management seam and a simulated broker
//!
//! The cycle engine only talks to [`OrderManager`]. [`SimulatedBroker`] backs
//! replay and paper trading.

mod config;
mod order;
mod position;
mod simulated;

pub use config::{BrokerConfig, Instrument};
pub use order::{
    Direction, Fill, LegId, OpenPosition, Order, OrderError, OrderIntent, OrderManager, OrderState,
};
pub use position::{PositionBook, TradeRecord};
pub use simulated::SimulatedBroker;
