//! Strategy Selector
//!
//! The priority chain is data: an ordered list of (kind, precondition,
//! initiator) rules. The first rule whose precondition holds produces the
//! cycle plans; later rules are not consulted.

use serde::Serialize;
use tracing::debug;

use super::config::{PeriodSettings, SelectorConfig};
use super::cycle::{CyclePlan, EntryTrigger, StrategyKind};
use super::regime::{Bias, MarketRegime};
use crate::execution::Direction;
use crate::orderflow::RangeEstimate;

/// Inputs every rule sees
pub struct SelectionInput<'a> {
    pub config: &'a SelectorConfig,
    pub estimate: &'a RangeEstimate,
    pub regime: &'a MarketRegime,
    pub settings: &'a PeriodSettings,
    pub lot_size: f64,
    pub point_size: f64,
}

impl SelectionInput<'_> {
    fn plan(&self, side: Direction, strategy: StrategyKind, trigger: EntryTrigger) -> CyclePlan {
        CyclePlan {
            side,
            strategy,
            trigger,
            size: self.lot_size,
        }
    }

    fn zone_ceiling(&self) -> f64 {
        self.config.trend_threshold * 1.5
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyChoice {
    pub kind: StrategyKind,
    pub plans: Vec<CyclePlan>,
}

pub struct StrategyRule {
    pub kind: StrategyKind,
    pub precondition: fn(&SelectionInput) -> bool,
    pub initiator: fn(&SelectionInput) -> Vec<CyclePlan>,
}

// Preconditions

fn strong_signal(input: &SelectionInput) -> bool {
    let imbalance = input.estimate.imbalance;
    imbalance.abs() >= input.config.signal_threshold
        && input.regime.allows(Direction::from_imbalance(imbalance))
}

fn trending(input: &SelectionInput) -> bool {
    input.estimate.expected_range > input.config.trend_threshold
        && input
            .regime
            .bias
            .direction()
            .is_some_and(|side| input.regime.allows(side))
}

fn in_zone(input: &SelectionInput) -> bool {
    let range = input.estimate.expected_range;
    range >= input.config.zone_low
        && range <= input.zone_ceiling()
        && input.regime.allows(zone_side(input))
}

fn quiet(input: &SelectionInput) -> bool {
    input.estimate.expected_range < input.config.trend_threshold
        && (input.regime.allow_long || input.regime.allow_short)
}

// Initiators

fn signal_override(input: &SelectionInput) -> Vec<CyclePlan> {
    let side = Direction::from_imbalance(input.estimate.imbalance);
    vec![input.plan(side, StrategyKind::SignalOverride, EntryTrigger::Market)]
}

fn trend(input: &SelectionInput) -> Vec<CyclePlan> {
    match input.regime.bias {
        Bias::Bullish => vec![input.plan(Direction::Long, StrategyKind::Trend, EntryTrigger::Market)],
        Bias::Bearish => vec![input.plan(Direction::Short, StrategyKind::Trend, EntryTrigger::Market)],
        Bias::Neutral => Vec::new(),
    }
}

fn zone_side(input: &SelectionInput) -> Direction {
    Direction::from_imbalance(input.estimate.imbalance)
}

fn zone(input: &SelectionInput) -> Vec<CyclePlan> {
    let offset = input.estimate.expected_range * input.config.zone_width_factor * input.point_size;
    let price = input.regime.price;
    let (side, trigger) = match zone_side(input) {
        Direction::Long => (Direction::Long, EntryTrigger::AtOrBelow(price - offset)),
        Direction::Short => (Direction::Short, EntryTrigger::AtOrAbove(price + offset)),
    };
    vec![input.plan(side, StrategyKind::Zone, trigger)]
}

fn accumulation(input: &SelectionInput) -> Vec<CyclePlan> {
    let distance = input.settings.first_entry_distance * input.point_size;
    let price = input.regime.price;
    let mut plans = Vec::with_capacity(2);
    if input.regime.allow_long {
        plans.push(input.plan(
            Direction::Long,
            StrategyKind::Accumulation,
            EntryTrigger::AtOrBelow(price - distance),
        ));
    }
    if input.regime.allow_short {
        plans.push(input.plan(
            Direction::Short,
            StrategyKind::Accumulation,
            EntryTrigger::AtOrAbove(price + distance),
        ));
    }
    plans
}

pub fn default_rules() -> Vec<StrategyRule> {
    vec![
        StrategyRule {
            kind: StrategyKind::SignalOverride,
            precondition: strong_signal,
            initiator: signal_override,
        },
        StrategyRule {
            kind: StrategyKind::Trend,
            precondition: trending,
            initiator: trend,
        },
        StrategyRule {
            kind: StrategyKind::Zone,
            precondition: in_zone,
            initiator: zone,
        },
        StrategyRule {
            kind: StrategyKind::Accumulation,
            precondition: quiet,
            initiator: accumulation,
        },
    ]
}

pub struct StrategySelector {
    config: SelectorConfig,
    rules: Vec<StrategyRule>,
    lot_size: f64,
    point_size: f64,
}

impl StrategySelector {
    pub fn new(config: SelectorConfig, lot_size: f64, point_size: f64) -> Self {
        Self {
            config,
            rules: default_rules(),
            lot_size,
            point_size,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn rules(&self) -> impl Iterator<Item = StrategyKind> + '_ {
        self.rules.iter().map(|r| r.kind)
    }

    /// First matching rule; `None` when nothing applies
    pub fn select(
        &self,
        estimate: &RangeEstimate,
        regime: &MarketRegime,
        settings: &PeriodSettings,
    ) -> Option<StrategyChoice> {
        let input = SelectionInput {
            config: &self.config,
            estimate,
            regime,
            settings,
            lot_size: self.lot_size,
            point_size: self.point_size,
        };

        let rule = self.rules.iter().find(|rule| (rule.precondition)(&input))?;
        let plans = (rule.initiator)(&input);
        if plans.is_empty() {
            return None;
        }
        debug!(
            "Selected {} | range {:.1} | imb {:+.2} | bias {}",
            rule.kind, estimate.expected_range, estimate.imbalance, regime.bias
        );
        Some(StrategyChoice { kind: rule.kind, plans })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderflow::EstimateSource;
    use chrono::Utc;

    fn estimate(range: f64, imbalance: f64) -> RangeEstimate {
        RangeEstimate {
            expected_range: range,
            imbalance,
            computed_at: Utc::now(),
            source: EstimateSource::Live,
        }
    }

    fn regime(bias: Bias) -> MarketRegime {
        MarketRegime {
            price: 2000.0,
            bias,
            allow_long: true,
            allow_short: true,
        }
    }

    fn settings() -> PeriodSettings {
        PeriodSettings {
            first_entry_distance: 300.0,
            extra_distance: 900.0,
            max_orders: 99,
            take_profit: 999.0,
            lifetime_secs: 3_880,
        }
    }

    fn selector() -> StrategySelector {
        StrategySelector::new(SelectorConfig::default(), 0.01, 0.01)
    }

    #[test]
    fn test_rule_order() {
        let kinds: Vec<_> = selector().rules().collect();
        assert_eq!(
            kinds,
            vec![
                StrategyKind::SignalOverride,
                StrategyKind::Trend,
                StrategyKind::Zone,
                StrategyKind::Accumulation
            ]
        );
    }

    #[test]
    fn test_strong_signal_beats_trend() {
        // Trend conditions hold (range 400 > 150, bearish) but the signal wins
        let choice = selector()
            .select(&estimate(400.0, 0.8), &regime(Bias::Bearish), &settings())
            .unwrap();
        assert_eq!(choice.kind, StrategyKind::SignalOverride);
        assert_eq!(choice.plans.len(), 1);
        assert_eq!(choice.plans[0].side, Direction::Long);
        assert_eq!(choice.plans[0].trigger, EntryTrigger::Market);

        let choice = selector()
            .select(&estimate(400.0, -0.6), &regime(Bias::Bullish), &settings())
            .unwrap();
        assert_eq!(choice.plans[0].side, Direction::Short);
    }

    #[test]
    fn test_trend_follows_bias() {
        let choice = selector()
            .select(&estimate(400.0, 0.1), &regime(Bias::Bearish), &settings())
            .unwrap();
        assert_eq!(choice.kind, StrategyKind::Trend);
        assert_eq!(choice.plans[0].side, Direction::Short);
    }

    #[test]
    fn test_zone_boundary_entries() {
        // Above the trend threshold but neutral bias falls through to zone
        let choice = selector()
            .select(&estimate(200.0, 0.2), &regime(Bias::Neutral), &settings())
            .unwrap();
        assert_eq!(choice.kind, StrategyKind::Zone);
        assert_eq!(choice.plans[0].side, Direction::Long);
        // 200 * 0.5 * 0.01 = 1.0 below
        assert_eq!(choice.plans[0].trigger, EntryTrigger::AtOrBelow(1999.0));

        let choice = selector()
            .select(&estimate(100.0, -0.2), &regime(Bias::Neutral), &settings())
            .unwrap();
        assert_eq!(choice.plans[0].side, Direction::Short);
        assert_eq!(choice.plans[0].trigger, EntryTrigger::AtOrAbove(2000.5));
    }

    #[test]
    fn test_accumulation_two_sided_and_single_sided() {
        let choice = selector()
            .select(&estimate(20.0, 0.0), &regime(Bias::Neutral), &settings())
            .unwrap();
        assert_eq!(choice.kind, StrategyKind::Accumulation);
        assert_eq!(choice.plans.len(), 2);
        assert_eq!(choice.plans[0].trigger, EntryTrigger::AtOrBelow(1997.0));
        assert_eq!(choice.plans[1].trigger, EntryTrigger::AtOrAbove(2003.0));

        let mut only_short = regime(Bias::Neutral);
        only_short.allow_long = false;
        let choice = selector().select(&estimate(20.0, 0.0), &only_short, &settings()).unwrap();
        assert_eq!(choice.plans.len(), 1);
        assert_eq!(choice.plans[0].side, Direction::Short);
    }

    #[test]
    fn test_disabled_direction_skips_rule() {
        let mut no_long = regime(Bias::Neutral);
        no_long.allow_long = false;
        // Strong long signal, long disabled; range 20 is below the zone so accumulation short
        let choice = selector().select(&estimate(20.0, 0.9), &no_long, &settings()).unwrap();
        assert_eq!(choice.kind, StrategyKind::Accumulation);
        assert_eq!(choice.plans[0].side, Direction::Short);
    }

    #[test]
    fn test_nothing_applies() {
        // Range above the zone ceiling with no bias and a weak signal
        assert!(selector()
            .select(&estimate(500.0, 0.1), &regime(Bias::Neutral), &settings())
            .is_none());

        let mut closed = regime(Bias::Neutral);
        closed.allow_long = false;
        closed.allow_short = false;
        assert!(selector().select(&estimate(20.0, 0.9), &closed, &settings()).is_none());
    }
}
