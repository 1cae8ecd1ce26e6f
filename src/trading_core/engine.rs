//! Cycle Engine
//!
//! Tick driver for the decision engine. One call to [`CycleEngine::tick`]
//! threads an explicit [`TickContext`] through the limiter, the cycle manager,
//! the recovery controller and the selector, in that order, and returns the
//! events it produced. It never blocks and never awaits.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::{EngineConfig, Period};
use super::cycle::{CloseReason, CycleManager, CycleOutcome, CyclePlan, TickContext};
use super::events::EngineEvent;
use super::limiter::DailyLimiter;
use super::persist::EngineSnapshot;
use super::recovery::RecoveryController;
use super::regime::{Bias, MarketRegime, RegimeTracker};
use super::selector::StrategySelector;
use crate::execution::{Direction, OrderManager};
use crate::orderflow::RangeEstimate;

/// Most recent cycle outcomes kept in memory
const MAX_OUTCOMES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("a cycle is already live on the {0} side")]
    CycleAlreadyActive(Direction),

    #[error("invalid tick: {0}")]
    InvalidTick(String),
}

pub struct CycleEngine {
    config: EngineConfig,
    cycles: CycleManager,
    selector: StrategySelector,
    regime: RegimeTracker,
    recovery: RecoveryController,
    limiter: DailyLimiter,
    outcomes: VecDeque<CycleOutcome>,
    cycles_closed: u64,
}

impl CycleEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let limiter = DailyLimiter::new(config.limits.clone())?;
        let point_size = config.instrument.point_size;

        Ok(Self {
            cycles: CycleManager::new(config.cycle.clone(), config.instrument.clone()),
            selector: StrategySelector::new(config.selector.clone(), config.cycle.lot_size, point_size),
            regime: RegimeTracker::new(
                config.selector.regime_lookback,
                config.selector.regime_dead_band,
                point_size,
            ),
            recovery: RecoveryController::new(config.recovery.clone()),
            limiter,
            outcomes: VecDeque::new(),
            cycles_closed: 0,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cycles(&self) -> &CycleManager {
        &self.cycles
    }

    pub fn limiter(&self) -> &DailyLimiter {
        &self.limiter
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    /// Recently closed cycles, oldest first. Older outcomes are only
    /// available through `EngineEvent::CycleClosed`.
    pub fn outcomes(&self) -> &VecDeque<CycleOutcome> {
        &self.outcomes
    }

    /// Cycles closed since start, including those dropped from `outcomes`
    pub fn cycles_closed(&self) -> u64 {
        self.cycles_closed
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            daily: self.limiter.day().clone(),
            recovery: self.recovery.state().clone(),
            saved_at: now,
        }
    }

    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        self.limiter.restore(snapshot.daily);
        self.recovery.restore(snapshot.recovery);
    }

    /// Process one price update
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        price: f64,
        estimate: &RangeEstimate,
        broker: &mut dyn OrderManager,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidTick(format!("price {}", price)));
        }

        let mut events = Vec::new();
        let bias = self.regime.update(price);

        // 1. Day and period boundaries
        let transitions = self.limiter.observe(now, &self.config.periods, &mut events);
        if transitions.day_changed.is_some() {
            self.recovery.on_day_reset();
        }
        if let Some((Some(_), _)) = transitions.period_changed {
            if self.config.cycle.close_on_period_change {
                self.cycles.request_close_all(CloseReason::PeriodChange, &mut events);
            }
        }

        // 2. End of session
        if self.limiter.session_closed(now) {
            self.cycles.request_close_all(CloseReason::SessionEnd, &mut events);
        }

        let period = self.limiter.period().period.unwrap_or(Period::OutsideHours);
        let ctx = TickContext {
            now,
            price,
            estimate: estimate.clone(),
            period,
            settings: self.config.periods.settings(period).clone(),
        };

        // 3. Broker reconciliation
        if self.config.cycle.reconcile_positions && self.cycles.live_count() > 0 {
            match broker.open_positions() {
                Ok(positions) => self.cycles.reconcile(&positions, price, &mut events),
                Err(e) => warn!("Position query failed, skipping reconcile: {}", e),
            }
        }

        // 4. Manage live cycles; a daily target hit flattens everything
        if self.advance_all(&ctx, broker, &mut events) {
            self.cycles.request_close_all(CloseReason::DailyTarget, &mut events);
            self.advance_all(&ctx, broker, &mut events);
        }

        // 5. Recovery exit
        if let Some(event) = self.recovery.check_exit(now) {
            events.push(event);
        }

        // 6. New cycles
        let any_idle = self.cycles.is_idle(Direction::Long) || self.cycles.is_idle(Direction::Short);
        if any_idle && self.limiter.can_open(now) {
            let plans = self.new_plans(&ctx, bias);
            for plan in plans {
                if !self.cycles.is_idle(plan.side) {
                    continue;
                }
                let side = plan.side;
                let strategy = plan.strategy;
                let trigger = plan.trigger;
                let cycle_id = self.cycles.begin(plan, &ctx)?;
                events.push(EngineEvent::CycleOpened {
                    cycle_id,
                    side,
                    strategy,
                    trigger,
                });
                self.advance_side(side, &ctx, broker, &mut events);
            }
        }

        Ok(events)
    }

    /// Close everything at the current price (shutdown, manual flatten)
    pub fn close_all(
        &mut self,
        now: DateTime<Utc>,
        price: f64,
        estimate: &RangeEstimate,
        broker: &mut dyn OrderManager,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let period = self.limiter.period().period.unwrap_or(Period::OutsideHours);
        let ctx = TickContext {
            now,
            price,
            estimate: estimate.clone(),
            period,
            settings: self.config.periods.settings(period).clone(),
        };
        self.cycles.request_close_all(CloseReason::Shutdown, &mut events);
        self.advance_all(&ctx, broker, &mut events);
        if self.cycles.live_count() > 0 {
            warn!("{} cycle(s) still closing after flatten request", self.cycles.live_count());
        }
        events
    }

    fn new_plans(&self, ctx: &TickContext, bias: Bias) -> Vec<CyclePlan> {
        if self.recovery.is_active() {
            // Recovery blocks both sides: one recovery cycle at a time, nothing else
            if self.cycles.live_count() > 0 {
                return Vec::new();
            }
            return self
                .recovery
                .plan(&ctx.estimate, self.config.cycle.lot_size)
                .into_iter()
                .collect();
        }

        let regime = MarketRegime {
            price: ctx.price,
            bias,
            allow_long: self.config.selector.allow_long,
            allow_short: self.config.selector.allow_short,
        };
        match self.selector.select(&ctx.estimate, &regime, &ctx.settings) {
            Some(choice) => choice.plans,
            None => {
                debug!("No strategy applies at {:.2}", ctx.price);
                Vec::new()
            }
        }
    }

    /// Advance both sides. Returns true if a close reached the daily target.
    fn advance_all(&mut self, ctx: &TickContext, broker: &mut dyn OrderManager, events: &mut Vec<EngineEvent>) -> bool {
        let long = self.advance_side(Direction::Long, ctx, broker, events);
        let short = self.advance_side(Direction::Short, ctx, broker, events);
        long || short
    }

    fn advance_side(
        &mut self,
        side: Direction,
        ctx: &TickContext,
        broker: &mut dyn OrderManager,
        events: &mut Vec<EngineEvent>,
    ) -> bool {
        let outcome = self
            .cycles
            .advance(side, ctx, broker, self.limiter.period_mut(), events);
        match outcome {
            Some(outcome) => self.book_outcome(outcome, ctx.now, events),
            None => false,
        }
    }

    fn book_outcome(&mut self, outcome: CycleOutcome, now: DateTime<Utc>, events: &mut Vec<EngineEvent>) -> bool {
        let target_hit = self.limiter.record_cycle_close(outcome.realized_pnl, now, events);
        let day_profit = self.limiter.day().profit_accumulated;
        if let Some(event) = self.recovery.on_cycle_closed(&outcome, day_profit, now) {
            events.push(event);
        }
        self.cycles_closed += 1;
        info!("Day P&L {:.2} after {} cycle(s)", day_profit, self.cycles_closed);
        if self.outcomes.len() == MAX_OUTCOMES {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
        target_hit
    }
}
