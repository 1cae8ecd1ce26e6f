//! Events emitted by the cycle engine, one list per tick

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::Period;
use super::cycle::{CloseReason, CycleOutcome, EntryTrigger, StrategyKind};
use crate::execution::{Direction, LegId};

/// Why recovery mode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryExit {
    TargetReached,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    DayReset {
        day: NaiveDate,
    },
    PeriodChanged {
        from: Option<Period>,
        to: Period,
    },
    CycleOpened {
        cycle_id: Uuid,
        side: Direction,
        strategy: StrategyKind,
        trigger: EntryTrigger,
    },
    CycleActivated {
        cycle_id: Uuid,
        side: Direction,
        price: f64,
    },
    CycleExpired {
        cycle_id: Uuid,
        side: Direction,
    },
    ScaledIn {
        cycle_id: Uuid,
        side: Direction,
        level: usize,
        price: f64,
    },
    TakeProfitHit {
        cycle_id: Uuid,
        side: Direction,
        price: f64,
        target: f64,
    },
    CycleClosing {
        cycle_id: Uuid,
        side: Direction,
        reason: CloseReason,
    },
    CycleClosed(CycleOutcome),
    LegReconciled {
        cycle_id: Uuid,
        leg_id: LegId,
        price: f64,
    },
    OrderFailed {
        side: Direction,
        error: String,
    },
    DailyTargetHit {
        profit: f64,
    },
    CooldownStarted {
        until: DateTime<Utc>,
    },
    RecoveryEntered {
        loss: f64,
        target: f64,
    },
    RecoveryExited {
        recovered: f64,
        target: f64,
        reason: RecoveryExit,
    },
}
