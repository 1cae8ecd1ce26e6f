//! Recovery Controller
//!
//! A single system-wide mode entered after a large loss. While active the
//! regular selector is suspended and at most one recovery cycle runs, aligned
//! with the order-flow imbalance and sized up by `lot_factor`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::RecoveryConfig;
use super::cycle::{CycleOutcome, CyclePlan, EntryTrigger, StrategyKind};
use super::events::{EngineEvent, RecoveryExit};
use crate::execution::Direction;
use crate::orderflow::RangeEstimate;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub active: bool,
    /// Loss that triggered the mode (positive amount)
    pub entry_loss_reference: f64,
    pub target_recovery_amount: f64,
    pub recovered_amount: f64,
    pub started_at: Option<DateTime<Utc>>,
    /// The day-loss trigger fires once per day; cleared on day rollover
    #[serde(default)]
    pub day_trigger_fired: bool,
}

pub struct RecoveryController {
    config: RecoveryConfig,
    state: RecoveryState,
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: RecoveryState::default(),
        }
    }

    pub fn state(&self) -> &RecoveryState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    pub fn restore(&mut self, state: RecoveryState) {
        if state.active {
            info!(
                "Restored recovery mode: {:.2} of {:.2} recovered",
                state.recovered_amount, state.target_recovery_amount
            );
        }
        self.state = state;
    }

    /// Feed a closed cycle. While active its P&L counts towards the target;
    /// otherwise a large enough loss enters recovery.
    pub fn on_cycle_closed(
        &mut self,
        outcome: &CycleOutcome,
        day_profit: f64,
        now: DateTime<Utc>,
    ) -> Option<EngineEvent> {
        if !self.config.enabled {
            return None;
        }

        if self.state.active {
            self.state.recovered_amount += outcome.realized_pnl;
            info!(
                "RECOVERY progress {:+.2} -> {:.2} / {:.2}",
                outcome.realized_pnl, self.state.recovered_amount, self.state.target_recovery_amount
            );
            return None;
        }

        // Only a losing close can enter recovery
        let cycle_loss = -outcome.realized_pnl;
        if cycle_loss <= 0.0 {
            return None;
        }

        let day_loss = -day_profit;
        let mut day_trigger_fired = self.state.day_trigger_fired;
        let loss = if cycle_loss >= self.config.cycle_loss_trigger {
            cycle_loss
        } else if !day_trigger_fired && day_loss >= self.config.period_loss_trigger {
            day_trigger_fired = true;
            day_loss
        } else {
            return None;
        };

        let target = loss * self.config.target_ratio;
        self.state = RecoveryState {
            active: true,
            entry_loss_reference: loss,
            target_recovery_amount: target,
            recovered_amount: 0.0,
            started_at: Some(now),
            day_trigger_fired,
        };
        info!("RECOVERY ENTERED: loss {:.2} | target {:.2}", loss, target);
        Some(EngineEvent::RecoveryEntered { loss, target })
    }

    /// Leave recovery on target or timeout
    pub fn check_exit(&mut self, now: DateTime<Utc>) -> Option<EngineEvent> {
        if !self.state.active {
            return None;
        }

        let reason = if self.state.recovered_amount >= self.state.target_recovery_amount {
            RecoveryExit::TargetReached
        } else if self
            .state
            .started_at
            .is_some_and(|t| now - t >= Duration::seconds(self.config.timeout_secs))
        {
            RecoveryExit::TimedOut
        } else {
            return None;
        };

        let event = EngineEvent::RecoveryExited {
            recovered: self.state.recovered_amount,
            target: self.state.target_recovery_amount,
            reason,
        };
        info!(
            "RECOVERY EXITED ({:?}): {:.2} / {:.2}",
            reason, self.state.recovered_amount, self.state.target_recovery_amount
        );
        self.state = RecoveryState {
            day_trigger_fired: self.state.day_trigger_fired,
            ..Default::default()
        };
        Some(event)
    }

    /// New trading day: the day-loss trigger is armed again
    pub fn on_day_reset(&mut self) {
        self.state.day_trigger_fired = false;
    }

    /// Recovery initiator: market entry with the imbalance, or nothing when it is weak
    pub fn plan(&self, estimate: &RangeEstimate, lot_size: f64) -> Option<CyclePlan> {
        if !self.state.active || estimate.imbalance.abs() < self.config.min_imbalance {
            return None;
        }
        Some(CyclePlan {
            side: Direction::from_imbalance(estimate.imbalance),
            strategy: StrategyKind::Recovery,
            trigger: EntryTrigger::Market,
            size: lot_size * self.config.lot_factor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderflow::EstimateSource;
    use crate::trading_core::config::Period;
    use crate::trading_core::cycle::CloseReason;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn outcome(pnl: f64) -> CycleOutcome {
        CycleOutcome {
            cycle_id: Uuid::new_v4(),
            side: Direction::Long,
            strategy: StrategyKind::Accumulation,
            period: Period::Two,
            legs: 3,
            size: 0.03,
            realized_pnl: pnl,
            reason: CloseReason::MaxLoss,
            opened_at: ts(0),
            closed_at: ts(60),
        }
    }

    fn estimate(imbalance: f64) -> RangeEstimate {
        RangeEstimate {
            expected_range: 150.0,
            imbalance,
            computed_at: ts(0),
            source: EstimateSource::Live,
        }
    }

    #[test]
    fn test_enter_on_cycle_loss_and_exit_on_target() {
        let mut rc = RecoveryController::new(RecoveryConfig::default());
        assert!(rc.on_cycle_closed(&outcome(-20.0), -20.0, ts(0)).is_none());

        let event = rc.on_cycle_closed(&outcome(-60.0), -80.0, ts(10));
        assert_eq!(event, Some(EngineEvent::RecoveryEntered { loss: 60.0, target: 60.0 }));
        assert!(rc.is_active());

        rc.on_cycle_closed(&outcome(40.0), -40.0, ts(20));
        assert!(rc.check_exit(ts(21)).is_none());
        rc.on_cycle_closed(&outcome(25.0), -15.0, ts(30));

        let event = rc.check_exit(ts(31)).unwrap();
        assert!(matches!(
            event,
            EngineEvent::RecoveryExited {
                reason: RecoveryExit::TargetReached,
                ..
            }
        ));
        assert!(!rc.is_active());
        assert_eq!(rc.state(), &RecoveryState::default());
    }

    #[test]
    fn test_day_loss_trigger_fires_once_per_day() {
        let mut rc = RecoveryController::new(RecoveryConfig {
            timeout_secs: 600,
            ..Default::default()
        });
        assert!(rc.on_cycle_closed(&outcome(-30.0), -120.0, ts(0)).is_some());
        assert!(rc.check_exit(ts(600)).is_some());
        assert!(!rc.is_active());

        // Day is still beyond the trigger, but neither a win nor a small loss re-enters
        assert!(rc.on_cycle_closed(&outcome(5.0), -115.0, ts(700)).is_none());
        assert!(rc.on_cycle_closed(&outcome(-5.0), -120.0, ts(800)).is_none());
        assert!(!rc.is_active());

        // A single large loss still does
        assert!(rc.on_cycle_closed(&outcome(-60.0), -180.0, ts(900)).is_some());
        assert!(rc.check_exit(ts(1_500)).is_some());

        rc.on_day_reset();
        assert!(rc.on_cycle_closed(&outcome(-30.0), -120.0, ts(90_000)).is_some());
    }

    #[test]
    fn test_winning_close_never_enters() {
        let mut rc = RecoveryController::new(RecoveryConfig::default());
        assert!(rc.on_cycle_closed(&outcome(5.0), -500.0, ts(0)).is_none());
        assert!(!rc.is_active());
    }

    #[test]
    fn test_enter_on_day_loss() {
        let mut rc = RecoveryController::new(RecoveryConfig::default());
        let event = rc.on_cycle_closed(&outcome(-30.0), -120.0, ts(0));
        assert_eq!(event, Some(EngineEvent::RecoveryEntered { loss: 120.0, target: 120.0 }));
    }

    #[test]
    fn test_timeout_exit() {
        let mut rc = RecoveryController::new(RecoveryConfig {
            timeout_secs: 600,
            ..Default::default()
        });
        rc.on_cycle_closed(&outcome(-100.0), -100.0, ts(0));
        assert!(rc.check_exit(ts(599)).is_none());
        assert!(matches!(
            rc.check_exit(ts(600)),
            Some(EngineEvent::RecoveryExited {
                reason: RecoveryExit::TimedOut,
                ..
            })
        ));
    }

    #[test]
    fn test_plan_requires_imbalance() {
        let mut rc = RecoveryController::new(RecoveryConfig::default());
        assert!(rc.plan(&estimate(0.9), 0.01).is_none());

        rc.on_cycle_closed(&outcome(-100.0), -100.0, ts(0));
        assert!(rc.plan(&estimate(0.1), 0.01).is_none());

        let plan = rc.plan(&estimate(-0.4), 0.01).unwrap();
        assert_eq!(plan.side, Direction::Short);
        assert_eq!(plan.strategy, StrategyKind::Recovery);
        assert!((plan.size - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_disabled_never_enters() {
        let mut rc = RecoveryController::new(RecoveryConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(rc.on_cycle_closed(&outcome(-1_000.0), -1_000.0, ts(0)).is_none());
    }
}
