//! Trading Core - the tick-driven cycle decision engine
//!
//! This module contains:
//! - Period table, presets and engine configuration
//! - Daily and period limits
//! - Trading-cycle state machine (scale-in, take-profit, closure)
//! - Strategy selection and market regime
//! - Recovery mode
//! - The engine that drives them tick by tick

pub mod config;
pub mod cycle;
pub mod engine;
pub mod events;
pub mod limiter;
pub mod persist;
pub mod recovery;
pub mod regime;
pub mod selector;
pub mod summary;

// Re-export commonly used types
pub use config::{
    CycleConfig, EngineConfig, LimitsConfig, Period, PeriodSettings, PeriodTable, RecoveryConfig, SelectorConfig,
    TakeProfitMode,
};
pub use cycle::{
    CloseReason, CycleManager, CycleOutcome, CyclePlan, CycleStatus, EntryTrigger, StrategyKind, TickContext,
    TradingCycle,
};
pub use engine::{CycleEngine, EngineError};
pub use events::{EngineEvent, RecoveryExit};
pub use limiter::{DailyLimitState, DailyLimiter, PeriodState};
pub use persist::EngineSnapshot;
pub use recovery::{RecoveryController, RecoveryState};
pub use regime::{Bias, MarketRegime, RegimeTracker};
pub use selector::{StrategyChoice, StrategySelector};
pub use summary::TradingSummary;
