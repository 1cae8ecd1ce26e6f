//! Range Estimator
//!
//! Maps a [`FeatureVector`] to an expected range and a directional imbalance.
//! The realized range fraction drives the estimate; five bounded amplification
//! factors scale it. The result is a pure function of the vector: no random
//! perturbation and no time-of-day adjustment.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::aggregator::FeatureVector;

/// Where a served estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateSource {
    /// Freshly computed from live order flow
    Live,
    /// Last known-good value served again
    Cached,
    /// Static configured default
    Fallback,
}

impl std::fmt::Display for EstimateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Cached => write!(f, "cached"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Coarse volatility bucket relative to the primary range threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityClass {
    Low,
    Medium,
    High,
}

/// The estimator's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeEstimate {
    /// Expected near-term range in range units (never negative)
    pub expected_range: f64,
    /// Signed buy/sell pressure in [-1, 1]
    pub imbalance: f64,
    pub computed_at: DateTime<Utc>,
    pub source: EstimateSource,
}

impl RangeEstimate {
    /// Default estimate used when nothing better is available
    pub fn fallback(default_range: f64, computed_at: DateTime<Utc>) -> Self {
        Self {
            expected_range: default_range.max(0.0),
            imbalance: 0.0,
            computed_at,
            source: EstimateSource::Fallback,
        }
    }

    /// Same value, relabelled as served from cache
    pub fn as_cached(&self) -> Self {
        Self {
            source: EstimateSource::Cached,
            ..self.clone()
        }
    }

    /// A malformed estimate must never reach the decision engine
    pub fn is_well_formed(&self) -> bool {
        self.expected_range.is_finite()
            && self.expected_range >= 0.0
            && self.imbalance.is_finite()
            && (-1.0..=1.0).contains(&self.imbalance)
    }

    pub fn volatility_class(&self, threshold: f64) -> VolatilityClass {
        if self.expected_range < threshold * 0.7 {
            VolatilityClass::Low
        } else if self.expected_range < threshold * 1.3 {
            VolatilityClass::Medium
        } else {
            VolatilityClass::High
        }
    }
}

/// Monotone amplification factor: `clamp(1 + gain * x, min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorBand {
    pub gain: f64,
    pub min: f64,
    pub max: f64,
}

impl FactorBand {
    pub const fn new(gain: f64, min: f64, max: f64) -> Self {
        Self { gain, min, max }
    }

    /// A band that always yields 1.0
    pub const fn neutral() -> Self {
        Self::new(0.0, 1.0, 1.0)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !(self.gain.is_finite() && self.min.is_finite() && self.max.is_finite()) {
            bail!("{} band must be finite", name);
        }
        if self.min > self.max {
            bail!("{} band min {} is above max {}", name, self.min, self.max);
        }
        Ok(())
    }

    pub fn apply(&self, x: f64) -> f64 {
        let raw = 1.0 + self.gain.max(0.0) * x;
        if raw.is_finite() {
            // max/min rather than clamp: an unvalidated band must not panic
            raw.max(self.min).min(self.max)
        } else if raw > 0.0 {
            self.max
        } else {
            self.min
        }
    }
}

/// Estimator configuration. The bands and multiplier are tuning knobs, not contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Range units per unit of range fraction (0.0005 * 300000 = 150)
    pub range_multiplier: f64,
    /// Served when no trades are observed or an estimate is rejected
    pub default_range: f64,
    pub min_range: f64,
    pub max_range: f64,
    /// Total volume considered "normal" for the volume factor
    pub volume_reference: f64,
    /// Trades per second considered "normal" for the intensity factor
    pub intensity_reference: f64,
    pub volume_factor: FactorBand,
    pub imbalance_factor: FactorBand,
    pub large_trade_factor: FactorBand,
    pub intensity_factor: FactorBand,
    pub book_factor: FactorBand,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            range_multiplier: 300_000.0,
            default_range: 150.0,
            min_range: 10.0,
            max_range: 3_000.0,
            volume_reference: 50.0,
            intensity_reference: 1.0,
            volume_factor: FactorBand::new(0.15, 0.8, 1.5),
            imbalance_factor: FactorBand::new(0.5, 1.0, 1.5),
            large_trade_factor: FactorBand::new(1.0, 1.0, 1.5),
            intensity_factor: FactorBand::new(0.1, 0.8, 1.5),
            book_factor: FactorBand::new(0.3, 1.0, 1.3),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.range_multiplier.is_finite() && self.range_multiplier > 0.0) {
            bail!("range_multiplier must be positive");
        }
        if !(self.min_range >= 0.0 && self.min_range <= self.max_range) {
            bail!("range bounds {}..{} are invalid", self.min_range, self.max_range);
        }
        if !(self.default_range >= self.min_range && self.default_range <= self.max_range) {
            bail!(
                "default_range {} is outside {}..{}",
                self.default_range,
                self.min_range,
                self.max_range
            );
        }
        for (name, band) in [
            ("volume", &self.volume_factor),
            ("imbalance", &self.imbalance_factor),
            ("large_trade", &self.large_trade_factor),
            ("intensity", &self.intensity_factor),
            ("book", &self.book_factor),
        ] {
            band.validate(name)?;
        }
        Ok(())
    }

    /// Every factor pinned to 1.0 and no floor/cap in the way
    pub fn neutral() -> Self {
        Self {
            min_range: 0.0,
            max_range: f64::MAX,
            volume_factor: FactorBand::neutral(),
            imbalance_factor: FactorBand::neutral(),
            large_trade_factor: FactorBand::neutral(),
            intensity_factor: FactorBand::neutral(),
            book_factor: FactorBand::neutral(),
            ..Default::default()
        }
    }
}

/// Individual factor values, exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeFactors {
    pub volume: f64,
    pub imbalance: f64,
    pub large_trades: f64,
    pub intensity: f64,
    pub book: f64,
}

impl RangeFactors {
    pub fn product(&self) -> f64 {
        self.volume * self.imbalance * self.large_trades * self.intensity * self.book
    }
}

/// Deterministic range estimator
#[derive(Debug, Clone)]
pub struct RangeEstimator {
    config: EstimatorConfig,
}

impl RangeEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn fallback(&self, at: DateTime<Utc>) -> RangeEstimate {
        RangeEstimate::fallback(self.config.default_range, at)
    }

    /// Base range before amplification
    pub fn base_range(&self, features: &FeatureVector) -> f64 {
        features.price_range_fraction * self.config.range_multiplier
    }

    pub fn factors(&self, features: &FeatureVector) -> RangeFactors {
        let c = &self.config;
        RangeFactors {
            volume: c.volume_factor.apply(log_ratio(features.total_volume(), c.volume_reference)),
            imbalance: c.imbalance_factor.apply(features.volume_imbalance.abs()),
            large_trades: c.large_trade_factor.apply(features.large_trade_ratio),
            intensity: c.intensity_factor.apply(log_ratio(features.trade_intensity, c.intensity_reference)),
            book: c.book_factor.apply(features.book_imbalance.abs()),
        }
    }

    /// Estimate the expected range. Never fails; degenerate input yields the fallback.
    pub fn estimate(&self, features: FeatureVector) -> RangeEstimate {
        if !features.has_trades() {
            return self.fallback(features.computed_at);
        }

        let raw = self.base_range(&features) * self.factors(&features).product();
        let expected_range = raw.max(self.config.min_range).min(self.config.max_range);
        let imbalance = if features.volume_imbalance.is_finite() {
            features.volume_imbalance.clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let estimate = RangeEstimate {
            expected_range,
            imbalance,
            computed_at: features.computed_at,
            source: EstimateSource::Live,
        };

        if !raw.is_finite() || raw < 0.0 || !estimate.is_well_formed() {
            warn!(
                "Rejected malformed range estimate (raw {:?}), serving default {:.1}",
                raw, self.config.default_range
            );
            return self.fallback(features.computed_at);
        }

        estimate
    }
}

/// ln(value / reference), 0.0 when either side is not positive
fn log_ratio(value: f64, reference: f64) -> f64 {
    if value > 0.0 && reference > 0.0 {
        (value / reference).ln()
    } else {
        0.0
    }
}
