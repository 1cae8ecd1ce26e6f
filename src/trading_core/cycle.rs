//! Cycle Manager
//!
//! Owns at most one trading cycle per side. A cycle moves
//! Idle -> Opening -> Active -> Closing -> Closed and is discarded once every
//! leg is flat. Per tick an Active cycle runs, in order: scale-in, take-profit
//! recomputation, take-profit check, then the global close triggers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{CycleConfig, Period, PeriodSettings, TakeProfitMode};
use super::engine::EngineError;
use super::events::EngineEvent;
use super::limiter::PeriodState;
use crate::execution::{Direction, Fill, Instrument, LegId, OpenPosition, OrderError, OrderManager};
use crate::orderflow::RangeEstimate;

/// Tolerance when comparing price distances
const PRICE_EPSILON: f64 = 1e-9;

/// Strategy variant that created a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyKind {
    SignalOverride,
    Trend,
    Zone,
    Accumulation,
    Recovery,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignalOverride => write!(f, "SIGNAL"),
            Self::Trend => write!(f, "TREND"),
            Self::Zone => write!(f, "ZONE"),
            Self::Accumulation => write!(f, "ACCUMULATION"),
            Self::Recovery => write!(f, "RECOVERY"),
        }
    }
}

/// Price condition that activates an Opening cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EntryTrigger {
    Market,
    AtOrBelow(f64),
    AtOrAbove(f64),
}

impl EntryTrigger {
    pub fn reached(&self, price: f64) -> bool {
        match *self {
            Self::Market => true,
            Self::AtOrBelow(level) => price <= level + PRICE_EPSILON,
            Self::AtOrAbove(level) => price >= level - PRICE_EPSILON,
        }
    }
}

impl std::fmt::Display for EntryTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::AtOrBelow(p) => write!(f, "<= {:.2}", p),
            Self::AtOrAbove(p) => write!(f, ">= {:.2}", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Idle,
    Opening,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    Pending,
    Filled,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    PeriodChange,
    Lifetime,
    MaxLoss,
    DailyTarget,
    SessionEnd,
    Reconciled,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "TP"),
            Self::PeriodChange => write!(f, "PERIOD"),
            Self::Lifetime => write!(f, "LIFETIME"),
            Self::MaxLoss => write!(f, "MAX_LOSS"),
            Self::DailyTarget => write!(f, "DAILY_TARGET"),
            Self::SessionEnd => write!(f, "SESSION_END"),
            Self::Reconciled => write!(f, "RECONCILED"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// One scale-in level (a single broker leg once filled)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleLevel {
    pub index: usize,
    pub status: LevelStatus,
    pub leg_id: Option<LegId>,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub take_profit: Option<f64>,
    pub exit_price: Option<f64>,
    pub pnl: f64,
}

impl ScaleLevel {
    fn pending(index: usize, size: f64) -> Self {
        Self {
            index,
            status: LevelStatus::Pending,
            leg_id: None,
            size,
            entry_price: None,
            take_profit: None,
            exit_price: None,
            pnl: 0.0,
        }
    }

    fn record_fill(&mut self, fill: &Fill) {
        self.status = LevelStatus::Filled;
        self.leg_id = Some(fill.leg_id);
        self.size = fill.size;
        self.entry_price = Some(fill.price);
    }

    fn record_exit(&mut self, side: Direction, price: f64, instrument: &Instrument) {
        let entry = self.entry_price.unwrap_or(price);
        self.pnl = instrument.leg_pnl(side, entry, price, self.size);
        self.exit_price = Some(price);
        self.status = LevelStatus::Closed;
    }

    /// Filled or being closed: a leg the broker still holds
    pub fn is_open(&self) -> bool {
        matches!(self.status, LevelStatus::Filled | LevelStatus::Closing)
    }
}

/// What the selector or recovery controller asks the manager to open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclePlan {
    pub side: Direction,
    pub strategy: StrategyKind,
    pub trigger: EntryTrigger,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingCycle {
    pub id: Uuid,
    pub side: Direction,
    pub strategy: StrategyKind,
    pub status: CycleStatus,
    pub trigger: EntryTrigger,
    /// First fill price; scale-in distances are measured from here
    pub anchor_price: Option<f64>,
    pub levels: Vec<ScaleLevel>,
    /// Size of each new level
    pub size: f64,
    pub period: Period,
    pub lifetime_secs: i64,
    pub opened_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

impl TradingCycle {
    fn new(plan: CyclePlan, ctx: &TickContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            side: plan.side,
            strategy: plan.strategy,
            status: CycleStatus::Opening,
            trigger: plan.trigger,
            anchor_price: None,
            levels: vec![ScaleLevel::pending(0, plan.size)],
            size: plan.size,
            period: ctx.period,
            lifetime_secs: ctx.settings.lifetime_secs,
            opened_at: ctx.now,
            activated_at: None,
            close_reason: None,
        }
    }

    pub fn filled_levels(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| l.status != LevelStatus::Pending)
            .count()
    }

    pub fn open_legs(&self) -> usize {
        self.levels.iter().filter(|l| l.is_open()).count()
    }

    pub fn cumulative_size(&self) -> f64 {
        self.levels.iter().filter(|l| l.is_open()).map(|l| l.size).sum()
    }

    /// Size-weighted average entry of the open legs
    pub fn average_entry(&self) -> Option<f64> {
        let size = self.cumulative_size();
        if size <= 0.0 {
            return None;
        }
        let notional: f64 = self
            .levels
            .iter()
            .filter(|l| l.is_open())
            .filter_map(|l| l.entry_price.map(|p| p * l.size))
            .sum();
        Some(notional / size)
    }

    pub fn floating_pnl(&self, price: f64, instrument: &Instrument) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.is_open())
            .filter_map(|l| l.entry_price.map(|e| instrument.floating_pnl(self.side, e, price, l.size)))
            .sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.status == LevelStatus::Closed)
            .map(|l| l.pnl)
            .sum()
    }

    fn update_take_profits(&mut self, mode: TakeProfitMode, offset: f64) {
        let sign = self.side.sign();
        let basket = self.average_entry();
        for level in self.levels.iter_mut().filter(|l| l.status == LevelStatus::Filled) {
            let reference = match mode {
                TakeProfitMode::Combined => basket,
                TakeProfitMode::PerLeg => level.entry_price,
            };
            level.take_profit = reference.map(|r| r + sign * offset);
        }
    }

    /// First filled level whose target has been reached
    fn take_profit_hit(&self, price: f64) -> Option<f64> {
        self.levels
            .iter()
            .filter(|l| l.status == LevelStatus::Filled)
            .filter_map(|l| l.take_profit)
            .find(|tp| match self.side {
                Direction::Long => price >= tp - PRICE_EPSILON,
                Direction::Short => price <= tp + PRICE_EPSILON,
            })
    }

    fn start_closing(&mut self, reason: CloseReason, events: &mut Vec<EngineEvent>) {
        info!(
            "CYCLE CLOSING {} {} [{}]: {} | legs {}",
            self.side, self.strategy, short_id(&self.id), reason, self.open_legs()
        );
        self.status = CycleStatus::Closing;
        self.close_reason = Some(reason);
        events.push(EngineEvent::CycleClosing {
            cycle_id: self.id,
            side: self.side,
            reason,
        });
    }

    fn outcome(&self, closed_at: DateTime<Utc>) -> CycleOutcome {
        CycleOutcome {
            cycle_id: self.id,
            side: self.side,
            strategy: self.strategy,
            period: self.period,
            legs: self.filled_levels(),
            size: self
                .levels
                .iter()
                .filter(|l| l.status == LevelStatus::Closed && l.entry_price.is_some())
                .map(|l| l.size)
                .sum(),
            realized_pnl: self.realized_pnl(),
            reason: self.close_reason.unwrap_or(CloseReason::Shutdown),
            opened_at: self.opened_at,
            closed_at,
        }
    }
}

/// Result of a fully flattened cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub side: Direction,
    pub strategy: StrategyKind,
    pub period: Period,
    pub legs: usize,
    pub size: f64,
    /// Net of commission, account currency
    pub realized_pnl: f64,
    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl CycleOutcome {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}

/// Everything a component needs to know about the current tick
#[derive(Debug, Clone)]
pub struct TickContext {
    pub now: DateTime<Utc>,
    pub price: f64,
    pub estimate: RangeEstimate,
    pub period: Period,
    pub settings: PeriodSettings,
}

/// Sole writer of cycle state
pub struct CycleManager {
    config: CycleConfig,
    instrument: Instrument,
    long: Option<TradingCycle>,
    short: Option<TradingCycle>,
}

impl CycleManager {
    pub fn new(config: CycleConfig, instrument: Instrument) -> Self {
        Self {
            config,
            instrument,
            long: None,
            short: None,
        }
    }

    fn slot_mut(&mut self, side: Direction) -> &mut Option<TradingCycle> {
        match side {
            Direction::Long => &mut self.long,
            Direction::Short => &mut self.short,
        }
    }

    pub fn cycle(&self, side: Direction) -> Option<&TradingCycle> {
        match side {
            Direction::Long => self.long.as_ref(),
            Direction::Short => self.short.as_ref(),
        }
    }

    pub fn is_idle(&self, side: Direction) -> bool {
        self.cycle(side).is_none()
    }

    pub fn cycles(&self) -> impl Iterator<Item = &TradingCycle> {
        self.long.iter().chain(self.short.iter())
    }

    pub fn live_count(&self) -> usize {
        self.cycles().count()
    }

    pub fn floating_pnl(&self, price: f64) -> f64 {
        self.cycles().map(|c| c.floating_pnl(price, &self.instrument)).sum()
    }

    /// Accept a plan for an idle side. The cycle starts in Opening.
    pub fn begin(&mut self, plan: CyclePlan, ctx: &TickContext) -> Result<Uuid, EngineError> {
        if !self.is_idle(plan.side) {
            return Err(EngineError::CycleAlreadyActive(plan.side));
        }

        let cycle = TradingCycle::new(plan, ctx);
        info!(
            "CYCLE OPEN {} {} [{}] | trigger {} | range {:.1} | imb {:+.2} | {}",
            cycle.side,
            cycle.strategy,
            short_id(&cycle.id),
            cycle.trigger,
            ctx.estimate.expected_range,
            ctx.estimate.imbalance,
            ctx.period
        );
        let (id, side) = (cycle.id, cycle.side);
        *self.slot_mut(side) = Some(cycle);
        Ok(id)
    }

    /// Move a live cycle towards Closed. Opening cycles have no legs and are dropped.
    pub fn request_close(&mut self, side: Direction, reason: CloseReason, events: &mut Vec<EngineEvent>) {
        let slot = self.slot_mut(side);
        match slot.as_ref().map(|c| c.status) {
            Some(CycleStatus::Opening) => {
                if let Some(cycle) = slot.take() {
                    info!("CYCLE CANCELLED {} [{}]: {}", side, short_id(&cycle.id), reason);
                    events.push(EngineEvent::CycleExpired {
                        cycle_id: cycle.id,
                        side,
                    });
                }
            }
            Some(CycleStatus::Active) => {
                if let Some(cycle) = slot.as_mut() {
                    cycle.start_closing(reason, events);
                }
            }
            _ => {}
        }
    }

    pub fn request_close_all(&mut self, reason: CloseReason, events: &mut Vec<EngineEvent>) {
        self.request_close(Direction::Long, reason, events);
        self.request_close(Direction::Short, reason, events);
    }

    /// Book legs the broker no longer reports as closed at `price`
    pub fn reconcile(&mut self, positions: &[OpenPosition], price: f64, events: &mut Vec<EngineEvent>) {
        let live: HashSet<LegId> = positions.iter().map(|p| p.leg_id).collect();
        let instrument = &self.instrument;

        for cycle in [self.long.as_mut(), self.short.as_mut()].into_iter().flatten() {
            let side = cycle.side;
            for level in cycle.levels.iter_mut().filter(|l| l.is_open()) {
                let Some(leg_id) = level.leg_id else { continue };
                if !live.contains(&leg_id) {
                    warn!("RECONCILE {} leg {} gone at broker, booking at {:.2}", side, leg_id, price);
                    level.record_exit(side, price, instrument);
                    events.push(EngineEvent::LegReconciled {
                        cycle_id: cycle.id,
                        leg_id,
                        price,
                    });
                }
            }
            if cycle.status == CycleStatus::Active && cycle.open_legs() == 0 {
                cycle.start_closing(CloseReason::Reconciled, events);
            }
        }
    }

    /// Run one tick for one side. Returns the outcome if the cycle finished.
    pub fn advance(
        &mut self,
        side: Direction,
        ctx: &TickContext,
        broker: &mut dyn OrderManager,
        orders: &mut PeriodState,
        events: &mut Vec<EngineEvent>,
    ) -> Option<CycleOutcome> {
        let mut cycle = self.slot_mut(side).take()?;

        if cycle.status == CycleStatus::Opening && !self.try_activate(&mut cycle, ctx, broker, orders, events) {
            if ctx.now - cycle.opened_at >= Duration::seconds(self.config.opening_timeout_secs) {
                info!(
                    "CYCLE EXPIRED {} {} [{}]: trigger {} not reached",
                    cycle.side, cycle.strategy, short_id(&cycle.id), cycle.trigger
                );
                events.push(EngineEvent::CycleExpired {
                    cycle_id: cycle.id,
                    side,
                });
                return None;
            }
            *self.slot_mut(side) = Some(cycle);
            return None;
        }

        if cycle.status == CycleStatus::Active {
            self.manage_active(&mut cycle, ctx, broker, orders, events);
        }

        if cycle.status == CycleStatus::Closing {
            self.flatten(&mut cycle, ctx, broker, events);
            if cycle.open_legs() == 0 {
                cycle.status = CycleStatus::Closed;
                let outcome = cycle.outcome(ctx.now);
                info!(
                    "EXIT {}: {} {} [{}] | legs {} | P&L {:+.2}",
                    outcome.reason,
                    outcome.side,
                    outcome.strategy,
                    short_id(&outcome.cycle_id),
                    outcome.legs,
                    outcome.realized_pnl
                );
                events.push(EngineEvent::CycleClosed(outcome.clone()));
                return Some(outcome);
            }
        }

        *self.slot_mut(side) = Some(cycle);
        None
    }

    fn try_activate(
        &self,
        cycle: &mut TradingCycle,
        ctx: &TickContext,
        broker: &mut dyn OrderManager,
        orders: &mut PeriodState,
        events: &mut Vec<EngineEvent>,
    ) -> bool {
        if !cycle.trigger.reached(ctx.price) {
            return false;
        }
        if !orders.can_place() {
            debug!("{} trigger reached but period order limit is exhausted", cycle.side);
            return false;
        }

        match broker.open(cycle.side, ctx.price, cycle.size) {
            Ok(fill) => {
                orders.record_order();
                if let Some(level) = cycle.levels.first_mut() {
                    level.record_fill(&fill);
                }
                cycle.anchor_price = Some(fill.price);
                cycle.status = CycleStatus::Active;
                cycle.activated_at = Some(ctx.now);
                info!(
                    "ENTRY: {} {} @ {:.2} [{}] size {}",
                    cycle.side, cycle.strategy, fill.price, short_id(&cycle.id), fill.size
                );
                events.push(EngineEvent::CycleActivated {
                    cycle_id: cycle.id,
                    side: cycle.side,
                    price: fill.price,
                });
                true
            }
            Err(e) => {
                order_failed(cycle.side, "open", &e, events);
                false
            }
        }
    }

    fn manage_active(
        &self,
        cycle: &mut TradingCycle,
        ctx: &TickContext,
        broker: &mut dyn OrderManager,
        orders: &mut PeriodState,
        events: &mut Vec<EngineEvent>,
    ) {
        let range = ctx.estimate.expected_range;

        // 1. Scale-in
        if let Some(anchor) = cycle.anchor_price {
            let filled = cycle.filled_levels();
            let step = self
                .instrument
                .points(ctx.settings.extra_distance + range * self.config.range_step_factor);
            let required = step * filled as f64;
            let adverse = cycle.side.adverse_move(anchor, ctx.price);

            if step > 0.0
                && adverse + PRICE_EPSILON >= required
                && (filled as u32) < self.config.max_orders_per_cycle
                && orders.can_place()
            {
                match broker.open(cycle.side, ctx.price, cycle.size) {
                    Ok(fill) => {
                        orders.record_order();
                        let mut level = ScaleLevel::pending(cycle.levels.len(), cycle.size);
                        level.record_fill(&fill);
                        cycle.levels.push(level);
                        info!(
                            "SCALE-IN {} #{} @ {:.2} [{}] | adverse {:.2} >= {:.2}",
                            cycle.side,
                            filled + 1,
                            fill.price,
                            short_id(&cycle.id),
                            adverse,
                            required
                        );
                        events.push(EngineEvent::ScaledIn {
                            cycle_id: cycle.id,
                            side: cycle.side,
                            level: filled + 1,
                            price: fill.price,
                        });
                    }
                    Err(e) => order_failed(cycle.side, "scale-in", &e, events),
                }
            }
        }

        // 2. Take-profit recomputation with the current range
        let offset = self
            .instrument
            .points(ctx.settings.take_profit + range * self.config.range_tp_factor);
        cycle.update_take_profits(self.config.tp_mode, offset);

        // 3. Take-profit check
        if let Some(target) = cycle.take_profit_hit(ctx.price) {
            info!(
                "TP HIT {} [{}] @ {:.2} (target {:.2})",
                cycle.side, short_id(&cycle.id), ctx.price, target
            );
            events.push(EngineEvent::TakeProfitHit {
                cycle_id: cycle.id,
                side: cycle.side,
                price: ctx.price,
                target,
            });
            cycle.start_closing(CloseReason::TakeProfit, events);
            return;
        }

        // 4. Cycle-local triggers
        if self.config.enable_time_based_closing {
            if let Some(activated_at) = cycle.activated_at {
                if ctx.now - activated_at >= Duration::seconds(cycle.lifetime_secs) {
                    cycle.start_closing(CloseReason::Lifetime, events);
                    return;
                }
            }
        }

        if let Some(max_loss) = self.config.max_cycle_loss {
            let floating = cycle.floating_pnl(ctx.price, &self.instrument);
            if floating <= -max_loss {
                warn!("{} [{}] floating loss {:.2} beyond {:.2}", cycle.side, short_id(&cycle.id), floating, max_loss);
                cycle.start_closing(CloseReason::MaxLoss, events);
            }
        }
    }

    /// Close every open leg; failures stay Closing and are retried next tick
    fn flatten(
        &self,
        cycle: &mut TradingCycle,
        ctx: &TickContext,
        broker: &mut dyn OrderManager,
        events: &mut Vec<EngineEvent>,
    ) {
        let side = cycle.side;
        for level in cycle.levels.iter_mut() {
            match level.status {
                LevelStatus::Pending => level.status = LevelStatus::Closed,
                LevelStatus::Filled | LevelStatus::Closing => {
                    let Some(leg_id) = level.leg_id else {
                        level.status = LevelStatus::Closed;
                        continue;
                    };
                    level.status = LevelStatus::Closing;
                    match broker.close(leg_id) {
                        Ok(fill) => level.record_exit(side, fill.price, &self.instrument),
                        Err(OrderError::UnknownLeg(_)) => {
                            warn!("{} leg {} unknown to broker, booking at {:.2}", side, leg_id, ctx.price);
                            level.record_exit(side, ctx.price, &self.instrument);
                        }
                        Err(e) => order_failed(side, "close", &e, events),
                    }
                }
                LevelStatus::Closed => {}
            }
        }
    }
}

fn order_failed(side: Direction, what: &str, error: &OrderError, events: &mut Vec<EngineEvent>) {
    warn!("{} {} failed: {} - retrying next tick", side, what, error);
    events.push(EngineEvent::OrderFailed {
        side,
        error: error.to_string(),
    });
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
