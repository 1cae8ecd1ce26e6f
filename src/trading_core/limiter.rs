//! Daily / Period Limiter
//!
//! Pure gates over plain state, plus the edge-triggered bookkeeping that
//! resets them. Day and period boundaries are evaluated in the exchange
//! timezone.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::{LimitsConfig, Period, PeriodTable};
use super::events::EngineEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLimitState {
    /// Calendar day (exchange timezone) these figures belong to
    pub day_key: Option<NaiveDate>,
    pub profit_accumulated: f64,
    pub profit_target: f64,
    pub target_enabled: bool,
    pub target_hit: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl DailyLimitState {
    pub fn new(profit_target: f64, target_enabled: bool) -> Self {
        Self {
            day_key: None,
            profit_accumulated: 0.0,
            profit_target,
            target_enabled,
            target_hit: false,
            cooldown_until: None,
        }
    }

    fn reset(&mut self, day: NaiveDate) {
        self.day_key = Some(day);
        self.profit_accumulated = 0.0;
        self.target_hit = false;
        self.cooldown_until = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodState {
    pub period: Option<Period>,
    pub orders_placed: u32,
    pub max_orders: u32,
}

impl PeriodState {
    pub fn new(period: Option<Period>, max_orders: u32) -> Self {
        Self {
            period,
            orders_placed: 0,
            max_orders,
        }
    }

    pub fn can_place(&self) -> bool {
        period_order_count_ok(self)
    }

    pub fn record_order(&mut self) {
        self.orders_placed += 1;
    }
}

/// Daily target reached and still in force for the day
pub fn profit_target_reached(day: &DailyLimitState) -> bool {
    day.target_enabled && (day.target_hit || day.profit_accumulated >= day.profit_target)
}

pub fn cooldown_active(day: &DailyLimitState, now: DateTime<Utc>) -> bool {
    day.cooldown_until.is_some_and(|until| now < until)
}

pub fn period_order_count_ok(period: &PeriodState) -> bool {
    period.orders_placed < period.max_orders
}

/// Boundaries crossed by one observation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Transitions {
    pub day_changed: Option<NaiveDate>,
    pub period_changed: Option<(Option<Period>, Period)>,
}

pub struct DailyLimiter {
    config: LimitsConfig,
    tz: Tz,
    day: DailyLimitState,
    period: PeriodState,
}

impl DailyLimiter {
    pub fn new(config: LimitsConfig) -> Result<Self> {
        let tz = config.tz()?;
        let day = DailyLimitState::new(config.daily_profit_target, config.enable_daily_target);
        Ok(Self {
            config,
            tz,
            day,
            period: PeriodState::new(None, u32::MAX),
        })
    }

    pub fn day(&self) -> &DailyLimitState {
        &self.day
    }

    pub fn period(&self) -> &PeriodState {
        &self.period
    }

    pub fn period_mut(&mut self) -> &mut PeriodState {
        &mut self.period
    }

    pub fn local_hour(&self, now: DateTime<Utc>) -> u32 {
        now.with_timezone(&self.tz).hour()
    }

    /// Restore persisted daily figures. Target settings come from config.
    pub fn restore(&mut self, mut day: DailyLimitState) {
        day.profit_target = self.config.daily_profit_target;
        day.target_enabled = self.config.enable_daily_target;
        info!(
            "Restored daily state for {:?}: profit {:.2}, target hit: {}",
            day.day_key, day.profit_accumulated, day.target_hit
        );
        self.day = day;
    }

    /// Detect day and period boundaries; resets fire once per change
    pub fn observe(&mut self, now: DateTime<Utc>, table: &PeriodTable, events: &mut Vec<EngineEvent>) -> Transitions {
        let local = now.with_timezone(&self.tz);
        let today = local.date_naive();
        let mut transitions = Transitions::default();

        match self.day.day_key {
            None => self.day.day_key = Some(today),
            Some(prev) if prev != today => {
                info!(
                    "DAY RESET: {} -> {} | closing profit {:.2}",
                    prev, today, self.day.profit_accumulated
                );
                self.day.reset(today);
                self.period.orders_placed = 0;
                transitions.day_changed = Some(today);
                events.push(EngineEvent::DayReset { day: today });
            }
            Some(_) => {}
        }

        let current = table.period_at(local.hour());
        if self.period.period != Some(current) {
            let from = self.period.period;
            self.period = PeriodState::new(Some(current), table.settings(current).max_orders);
            if from.is_some() {
                info!("PERIOD: {} -> {}", from.map(|p| p.to_string()).unwrap_or_default(), current);
            }
            transitions.period_changed = Some((from, current));
            events.push(EngineEvent::PeriodChanged { from, to: current });
        }

        transitions
    }

    /// Book a closed cycle. Returns true when this close reached the daily target.
    pub fn record_cycle_close(&mut self, pnl: f64, now: DateTime<Utc>, events: &mut Vec<EngineEvent>) -> bool {
        self.day.profit_accumulated += pnl;

        if pnl < 0.0 && self.config.cooldown_after_loss_secs > 0 {
            let until = now + Duration::seconds(self.config.cooldown_after_loss_secs);
            info!("COOLDOWN until {} after loss {:.2}", until, pnl);
            self.day.cooldown_until = Some(until);
            events.push(EngineEvent::CooldownStarted { until });
        }

        if self.day.target_enabled && !self.day.target_hit && self.day.profit_accumulated >= self.day.profit_target {
            self.day.target_hit = true;
            info!(
                "DAILY TARGET HIT: {:.2} >= {:.2} - no new cycles today",
                self.day.profit_accumulated, self.day.profit_target
            );
            events.push(EngineEvent::DailyTargetHit {
                profit: self.day.profit_accumulated,
            });
            return true;
        }
        false
    }

    pub fn session_closed(&self, now: DateTime<Utc>) -> bool {
        self.config
            .session_close_hour
            .is_some_and(|hour| self.local_hour(now) >= hour)
    }

    /// All gates for starting a new cycle
    pub fn can_open(&self, now: DateTime<Utc>) -> bool {
        !profit_target_reached(&self.day)
            && !cooldown_active(&self.day, now)
            && period_order_count_ok(&self.period)
            && !self.session_closed(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn limiter(config: LimitsConfig) -> DailyLimiter {
        DailyLimiter::new(config).unwrap()
    }

    #[test]
    fn test_daily_target_holds_until_day_change() {
        let mut lim = limiter(LimitsConfig {
            daily_profit_target: 100.0,
            enable_daily_target: true,
            ..Default::default()
        });
        let table = PeriodTable::default();
        let mut events = Vec::new();

        lim.observe(at(2024, 3, 1, 12, 0), &table, &mut events);
        assert!(lim.record_cycle_close(120.0, at(2024, 3, 1, 12, 5), &mut events));
        assert!(profit_target_reached(lim.day()));
        assert!(!lim.can_open(at(2024, 3, 1, 12, 6)));

        // Same day, later: still reached, no reset
        let t = lim.observe(at(2024, 3, 1, 23, 59), &table, &mut events);
        assert_eq!(t.day_changed, None);
        assert!(profit_target_reached(lim.day()));

        let t = lim.observe(at(2024, 3, 2, 0, 0), &table, &mut events);
        assert!(t.day_changed.is_some());
        assert!(!profit_target_reached(lim.day()));
        assert_eq!(lim.day().profit_accumulated, 0.0);

        // Edge-triggered: a second observation of the new day does nothing
        let t = lim.observe(at(2024, 3, 2, 0, 30), &table, &mut events);
        assert_eq!(t.day_changed, None);
        let resets = events.iter().filter(|e| matches!(e, EngineEvent::DayReset { .. })).count();
        assert_eq!(resets, 1);
    }

    #[test]
    fn test_day_boundary_uses_exchange_timezone() {
        let mut lim = limiter(LimitsConfig {
            timezone: "America/New_York".to_string(),
            ..Default::default()
        });
        let table = PeriodTable::default();
        let mut events = Vec::new();

        // 23:00 ET on Mar 1 is 04:00 UTC on Mar 2
        lim.observe(at(2024, 3, 2, 4, 0), &table, &mut events);
        assert_eq!(lim.day().day_key, NaiveDate::from_ymd_opt(2024, 3, 1));

        let t = lim.observe(at(2024, 3, 2, 5, 0), &table, &mut events);
        assert_eq!(t.day_changed, NaiveDate::from_ymd_opt(2024, 3, 2));
    }

    #[test]
    fn test_period_change_resets_order_count() {
        let mut lim = limiter(LimitsConfig::default());
        let mut table = PeriodTable::default();
        table.period2.settings.max_orders = 2;
        let mut events = Vec::new();

        let t = lim.observe(at(2024, 3, 1, 11, 0), &table, &mut events);
        assert_eq!(t.period_changed, Some((None, Period::Two)));
        lim.period_mut().record_order();
        lim.period_mut().record_order();
        assert!(!period_order_count_ok(lim.period()));
        assert!(!lim.can_open(at(2024, 3, 1, 11, 1)));

        let t = lim.observe(at(2024, 3, 1, 17, 0), &table, &mut events);
        assert_eq!(t.period_changed, Some((Some(Period::Two), Period::Three)));
        assert!(period_order_count_ok(lim.period()));
    }

    #[test]
    fn test_cooldown_after_loss() {
        let mut lim = limiter(LimitsConfig {
            cooldown_after_loss_secs: 300,
            ..Default::default()
        });
        let mut events = Vec::new();
        lim.observe(at(2024, 3, 1, 12, 0), &PeriodTable::default(), &mut events);

        lim.record_cycle_close(-10.0, at(2024, 3, 1, 12, 0), &mut events);
        assert!(cooldown_active(lim.day(), at(2024, 3, 1, 12, 4)));
        assert!(!cooldown_active(lim.day(), at(2024, 3, 1, 12, 5)));

        lim.record_cycle_close(10.0, at(2024, 3, 1, 12, 6), &mut events);
        assert!(!cooldown_active(lim.day(), at(2024, 3, 1, 12, 6)));
    }

    #[test]
    fn test_session_close_hour() {
        let lim = limiter(LimitsConfig {
            session_close_hour: Some(21),
            ..Default::default()
        });
        assert!(!lim.session_closed(at(2024, 3, 1, 20, 59)));
        assert!(lim.session_closed(at(2024, 3, 1, 21, 0)));
    }

    #[test]
    fn test_restore_keeps_figures_but_config_target() {
        let mut lim = limiter(LimitsConfig {
            daily_profit_target: 500.0,
            enable_daily_target: true,
            ..Default::default()
        });
        let mut saved = DailyLimitState::new(100.0, false);
        saved.day_key = NaiveDate::from_ymd_opt(2024, 3, 1);
        saved.profit_accumulated = 42.0;

        lim.restore(saved);
        assert_eq!(lim.day().profit_accumulated, 42.0);
        assert_eq!(lim.day().profit_target, 500.0);
        assert!(lim.day().target_enabled);
    }
}
