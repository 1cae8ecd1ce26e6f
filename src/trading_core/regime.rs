//! Directional bias from price against its moving average

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::execution::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::Bullish => Some(Direction::Long),
            Self::Bearish => Some(Direction::Short),
            Self::Neutral => None,
        }
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// What the selector knows about the market besides the range estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketRegime {
    pub price: f64,
    pub bias: Bias,
    pub allow_long: bool,
    pub allow_short: bool,
}

impl MarketRegime {
    pub fn allows(&self, side: Direction) -> bool {
        match side {
            Direction::Long => self.allow_long,
            Direction::Short => self.allow_short,
        }
    }
}

pub struct RegimeTracker {
    lookback: usize,
    /// Dead band in points
    dead_band: f64,
    point_size: f64,
    prices: VecDeque<f64>,
    bias: Bias,
}

impl RegimeTracker {
    pub fn new(lookback: usize, dead_band: f64, point_size: f64) -> Self {
        let lookback = lookback.max(2);
        Self {
            lookback,
            dead_band,
            point_size,
            prices: VecDeque::with_capacity(lookback),
            bias: Bias::Neutral,
        }
    }

    pub fn bias(&self) -> Bias {
        self.bias
    }

    pub fn moving_average(&self) -> Option<f64> {
        if self.prices.is_empty() {
            return None;
        }
        Some(self.prices.iter().sum::<f64>() / self.prices.len() as f64)
    }

    pub fn update(&mut self, price: f64) -> Bias {
        if !price.is_finite() {
            return self.bias;
        }
        if self.prices.len() == self.lookback {
            self.prices.pop_front();
        }
        self.prices.push_back(price);

        self.bias = match self.moving_average() {
            Some(ma) if self.prices.len() >= 2 => {
                let band = self.dead_band * self.point_size;
                if price > ma + band {
                    Bias::Bullish
                } else if price < ma - band {
                    Bias::Bearish
                } else {
                    Bias::Neutral
                }
            }
            _ => Bias::Neutral,
        };
        self.bias
    }
}
