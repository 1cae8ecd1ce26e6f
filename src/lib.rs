// Library crate - order-flow range estimation and the cycle decision engine

pub mod api;
pub mod backtest;
pub mod execution;
pub mod orderflow;
pub mod streams;
pub mod trading_core;
pub mod types;

// Re-export commonly used types
pub use types::*;
