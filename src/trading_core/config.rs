//! Engine configuration: period table, cycle, selector, recovery and limits
//!
//! Every struct has a `Default` tuned for spot gold quoted in 0.01 points, and
//! `EngineConfig` carries the named presets. All distances are in points.

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::execution::Instrument;

/// Intraday trading period, evaluated in the exchange timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    One,
    Two,
    Three,
    OutsideHours,
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::One => write!(f, "P1"),
            Self::Two => write!(f, "P2"),
            Self::Three => write!(f, "P3"),
            Self::OutsideHours => write!(f, "OUTSIDE"),
        }
    }
}

/// Per-period entry and exit parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodSettings {
    /// Distance of accumulation triggers from the anchor
    pub first_entry_distance: f64,
    /// Base scale-in step between levels
    pub extra_distance: f64,
    /// Orders that may be placed in this period
    pub max_orders: u32,
    /// Base take-profit distance
    pub take_profit: f64,
    /// Cycle lifetime in seconds (only with time-based closing)
    pub lifetime_secs: i64,
}

/// A period's local-hour window `[start_hour, end_hour)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub settings: PeriodSettings,
}

impl PeriodWindow {
    pub fn contains(&self, hour: u32) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodTable {
    pub period1: PeriodWindow,
    pub period2: PeriodWindow,
    pub period3: PeriodWindow,
    pub outside_hours: PeriodSettings,
}

impl Default for PeriodTable {
    fn default() -> Self {
        Self {
            period1: PeriodWindow {
                start_hour: 0,
                end_hour: 3,
                settings: PeriodSettings {
                    first_entry_distance: 300.0,
                    extra_distance: 900.0,
                    max_orders: 99,
                    take_profit: 999.0,
                    lifetime_secs: 3_880,
                },
            },
            period2: PeriodWindow {
                start_hour: 11,
                end_hour: 17,
                settings: PeriodSettings {
                    first_entry_distance: 900.0,
                    extra_distance: 900.0,
                    max_orders: 99,
                    take_profit: 999.0,
                    lifetime_secs: 4_880,
                },
            },
            period3: PeriodWindow {
                start_hour: 17,
                end_hour: 21,
                settings: PeriodSettings {
                    first_entry_distance: 900.0,
                    extra_distance: 600.0,
                    max_orders: 99,
                    take_profit: 999.0,
                    lifetime_secs: 5_880,
                },
            },
            outside_hours: PeriodSettings {
                first_entry_distance: 900.0,
                extra_distance: 100.0,
                max_orders: 99,
                take_profit: 999.0,
                lifetime_secs: 2_880,
            },
        }
    }
}

impl PeriodTable {
    /// Period for a local hour of day
    pub fn period_at(&self, hour: u32) -> Period {
        if self.period1.contains(hour) {
            Period::One
        } else if self.period2.contains(hour) {
            Period::Two
        } else if self.period3.contains(hour) {
            Period::Three
        } else {
            Period::OutsideHours
        }
    }

    pub fn settings(&self, period: Period) -> &PeriodSettings {
        match period {
            Period::One => &self.period1.settings,
            Period::Two => &self.period2.settings,
            Period::Three => &self.period3.settings,
            Period::OutsideHours => &self.outside_hours,
        }
    }

    fn settings_mut(&mut self) -> [&mut PeriodSettings; 4] {
        [
            &mut self.period1.settings,
            &mut self.period2.settings,
            &mut self.period3.settings,
            &mut self.outside_hours,
        ]
    }
}

/// How take-profit targets are shared between the legs of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakeProfitMode {
    /// One basket target around the size-weighted average entry
    Combined,
    /// Each leg has its own target from its entry
    PerLeg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Size of every leg in lots
    pub lot_size: f64,
    /// Maximum filled levels per cycle
    pub max_orders_per_cycle: u32,
    /// Scale-in step grows by `expected_range * range_step_factor`
    pub range_step_factor: f64,
    /// Take-profit grows by `expected_range * range_tp_factor`
    pub range_tp_factor: f64,
    pub tp_mode: TakeProfitMode,
    /// Close live cycles when the trading period changes
    pub close_on_period_change: bool,
    /// Close cycles older than the period lifetime
    pub enable_time_based_closing: bool,
    /// Close a cycle whose floating loss exceeds this amount (account currency)
    pub max_cycle_loss: Option<f64>,
    /// Discard an Opening cycle whose trigger is not reached in time
    pub opening_timeout_secs: i64,
    /// Mark legs closed when the broker stops reporting them
    pub reconcile_positions: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            lot_size: 0.01,
            max_orders_per_cycle: 33,
            range_step_factor: 0.5,
            range_tp_factor: 1.0,
            tp_mode: TakeProfitMode::Combined,
            close_on_period_change: false,
            enable_time_based_closing: false,
            max_cycle_loss: None,
            opening_timeout_secs: 900,
            reconcile_positions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// |imbalance| at or above this forces a signal-override cycle
    pub signal_threshold: f64,
    /// Primary range threshold: trend above, accumulation below
    pub trend_threshold: f64,
    /// Lower edge of the zone band; the upper edge is 1.5 * trend_threshold
    pub zone_low: f64,
    /// Zone boundary offset as a share of the expected range
    pub zone_width_factor: f64,
    pub allow_long: bool,
    pub allow_short: bool,
    /// Ticks in the regime moving average
    pub regime_lookback: usize,
    /// Dead band around the moving average before a bias is declared
    pub regime_dead_band: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            signal_threshold: 0.6,
            trend_threshold: 150.0,
            zone_low: 50.0,
            zone_width_factor: 0.5,
            allow_long: true,
            allow_short: true,
            regime_lookback: 60,
            regime_dead_band: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Single-cycle loss that enters recovery (account currency)
    pub cycle_loss_trigger: f64,
    /// Day's accumulated loss that enters recovery (account currency)
    pub period_loss_trigger: f64,
    /// Recovery target as a share of the triggering loss
    pub target_ratio: f64,
    /// Below this |imbalance| no recovery cycle is started
    pub min_imbalance: f64,
    /// Recovery leg size = lot_size * lot_factor
    pub lot_factor: f64,
    pub timeout_secs: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_loss_trigger: 50.0,
            period_loss_trigger: 100.0,
            target_ratio: 1.0,
            min_imbalance: 0.2,
            lot_factor: 2.0,
            timeout_secs: 4 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub daily_profit_target: f64,
    pub enable_daily_target: bool,
    /// Pause after a losing cycle, in seconds (0 disables)
    pub cooldown_after_loss_secs: i64,
    /// Exchange timezone (IANA name) for day and period boundaries
    pub timezone: String,
    /// Local hour after which cycles are closed and none are opened
    pub session_close_hour: Option<u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_profit_target: 1_800.0,
            enable_daily_target: false,
            cooldown_after_loss_secs: 0,
            timezone: "UTC".to_string(),
            session_close_hour: None,
        }
    }
}

impl LimitsConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

/// Full decision-engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instrument: Instrument,
    pub periods: PeriodTable,
    pub cycle: CycleConfig,
    pub selector: SelectorConfig,
    pub recovery: RecoveryConfig,
    pub limits: LimitsConfig,
}

impl EngineConfig {
    /// More orders per cycle and a higher daily target
    pub fn aggressive() -> Self {
        let mut config = Self::default();
        config.cycle.max_orders_per_cycle = 20;
        config.limits.daily_profit_target = 3_000.0;
        config.periods.period1.settings.max_orders = 20;
        config.periods.period2.settings.max_orders = 15;
        config.periods.period3.settings.max_orders = 20;
        config
    }

    /// Fewer orders, lower target and a per-cycle loss cap
    pub fn conservative() -> Self {
        let mut config = Self::default();
        config.cycle.max_orders_per_cycle = 10;
        config.cycle.max_cycle_loss = Some(200.0);
        config.limits.daily_profit_target = 1_000.0;
        config.periods.period1.settings.max_orders = 10;
        config.periods.period2.settings.max_orders = 6;
        config.periods.period3.settings.max_orders = 10;
        config
    }

    /// Tight take-profits, per-leg targets
    pub fn scalping() -> Self {
        let mut config = Self::default();
        config.cycle.tp_mode = TakeProfitMode::PerLeg;
        config.cycle.range_tp_factor = 0.5;
        config.periods.period1.settings.take_profit = 200.0;
        config.periods.period2.settings.take_profit = 150.0;
        config.periods.period3.settings.take_profit = 300.0;
        config.periods.outside_hours.take_profit = 200.0;
        config
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Self::default()),
            "aggressive" => Ok(Self::aggressive()),
            "conservative" => Ok(Self::conservative()),
            "scalping" => Ok(Self::scalping()),
            other => bail!("Unknown preset '{}' (default, aggressive, conservative, scalping)", other),
        }
    }

    /// Load a JSON config; missing fields fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.tz()?;
        if !(self.instrument.point_size > 0.0) {
            bail!("point_size must be positive");
        }
        if !(self.cycle.lot_size > 0.0) {
            bail!("lot_size must be positive");
        }
        if self.cycle.max_orders_per_cycle == 0 {
            bail!("max_orders_per_cycle must be at least 1");
        }
        if self.selector.zone_low > self.selector.trend_threshold * 1.5 {
            bail!(
                "zone_low {} is above the zone ceiling {}",
                self.selector.zone_low,
                self.selector.trend_threshold * 1.5
            );
        }
        if let Some(hour) = self.limits.session_close_hour {
            if hour > 23 {
                bail!("session_close_hour must be 0-23");
            }
        }
        Ok(())
    }

    /// Scale every period's order limit (used by the CLI override)
    pub fn set_period_max_orders(&mut self, max_orders: u32) {
        for settings in self.periods.settings_mut() {
            settings.max_orders = max_orders;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_lookup() {
        let table = PeriodTable::default();
        assert_eq!(table.period_at(0), Period::One);
        assert_eq!(table.period_at(2), Period::One);
        assert_eq!(table.period_at(3), Period::OutsideHours);
        assert_eq!(table.period_at(11), Period::Two);
        assert_eq!(table.period_at(17), Period::Three);
        assert_eq!(table.period_at(21), Period::OutsideHours);
        assert_eq!(table.settings(Period::Three).extra_distance, 600.0);
    }

    #[test]
    fn test_presets_validate() {
        for name in ["default", "aggressive", "conservative", "scalping"] {
            EngineConfig::preset(name).unwrap().validate().unwrap();
        }
        assert!(EngineConfig::preset("yolo").is_err());
        assert_eq!(EngineConfig::conservative().periods.period2.settings.max_orders, 6);
        assert_eq!(EngineConfig::scalping().cycle.tp_mode, TakeProfitMode::PerLeg);
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let mut config = EngineConfig::default();
        config.limits.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
        config.limits.timezone = "Europe/Athens".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"selector": {"trend_threshold": 200.0}, "cycle": {"tp_mode": "PerLeg"}}"#)
                .unwrap();
        assert_eq!(config.selector.trend_threshold, 200.0);
        assert_eq!(config.selector.signal_threshold, 0.6);
        assert_eq!(config.cycle.tp_mode, TakeProfitMode::PerLeg);
        assert_eq!(config.cycle.lot_size, 0.01);
    }

    #[test]
    fn test_set_period_max_orders() {
        let mut config = EngineConfig::default();
        config.set_period_max_orders(4);
        assert_eq!(config.periods.settings(Period::OutsideHours).max_orders, 4);
        assert_eq!(config.periods.settings(Period::Two).max_orders, 4);
    }
}
