//! Feature Aggregator
//!
//! Keeps a bounded FIFO of trade prints plus the latest book snapshot and turns
//! them into a fixed [`FeatureVector`] on demand. Every metric is computed over
//! the rolling window that ends at the newest trade, so a snapshot depends only
//! on buffer contents and never on the wall clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::trades::{BookSnapshot, MarketEvent, Side, TradePrint};

/// Aggregator shared between the ingestion task and the prediction gateway.
/// Locks are only ever held for in-memory work.
pub type SharedAggregator = Arc<Mutex<FeatureAggregator>>;

/// Configuration for feature aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Maximum number of trade prints retained (oldest evicted first)
    pub capacity: usize,
    /// Rolling window in seconds, measured back from the newest trade
    pub window_secs: f64,
    /// A trade is "large" when its size exceeds this multiple of the mean size
    pub large_trade_multiple: f64,
    /// Decay constant for time-weighting trades in the imbalance (milliseconds)
    pub imbalance_decay_ms: f64,
    /// Exponent applied to trade size when weighting the imbalance
    pub size_exponent: f64,
    /// Share of the imbalance taken from trades (the rest comes from the book)
    pub trade_imbalance_weight: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            window_secs: 60.0,
            large_trade_multiple: 3.0,
            imbalance_decay_ms: 30_000.0,
            size_exponent: 1.1,
            trade_imbalance_weight: 0.7,
        }
    }
}

/// Fixed feature vector produced once per aggregation tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Signed buy/sell pressure in [-1, 1]
    pub volume_imbalance: f64,
    pub large_trade_ratio: f64,
    pub aggressive_buy_ratio: f64,
    pub aggressive_sell_ratio: f64,
    /// Relative spread (ask - bid) / bid
    pub spread: f64,
    pub book_imbalance: f64,
    pub volume_weighted_price: f64,
    /// Trades per second over the window
    pub trade_intensity: f64,
    /// High - low over the window
    pub price_range: f64,
    /// (high - low) / low over the window
    pub price_range_fraction: f64,
    /// Population standard deviation of window prices
    pub price_dispersion: f64,
    pub trade_count: usize,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

impl FeatureVector {
    /// Vector for an empty buffer: volume fields zeroed, book fields kept
    pub fn empty(computed_at: DateTime<Utc>, spread: f64, book_imbalance: f64) -> Self {
        Self {
            buy_volume: 0.0,
            sell_volume: 0.0,
            volume_imbalance: 0.0,
            large_trade_ratio: 0.0,
            aggressive_buy_ratio: 0.0,
            aggressive_sell_ratio: 0.0,
            spread,
            book_imbalance,
            volume_weighted_price: 0.0,
            trade_intensity: 0.0,
            price_range: 0.0,
            price_range_fraction: 0.0,
            price_dispersion: 0.0,
            trade_count: 0,
            last_trade_at: None,
            computed_at,
        }
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }

    /// True when no trade contributed to this vector
    pub fn has_trades(&self) -> bool {
        self.trade_count > 0 && self.total_volume() > 0.0
    }
}

/// Bounded trade buffer and latest book snapshot
#[derive(Debug)]
pub struct FeatureAggregator {
    config: AggregatorConfig,
    trades: VecDeque<TradePrint>,
    book: Option<BookSnapshot>,
}

impl FeatureAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: AggregatorConfig { capacity, ..config },
            trades: VecDeque::with_capacity(capacity),
            book: None,
        }
    }

    /// Create an aggregator wrapped for sharing across tasks
    pub fn shared(config: AggregatorConfig) -> SharedAggregator {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Apply an ingestion event
    pub fn update(&mut self, event: impl Into<MarketEvent>) {
        match event.into() {
            MarketEvent::Trade(trade) => self.push_trade(trade),
            MarketEvent::Book(book) => self.book = Some(book),
        }
    }

    fn push_trade(&mut self, trade: TradePrint) {
        if self.trades.len() == self.config.capacity {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Most recently recorded trade
    pub fn last_trade(&self) -> Option<&TradePrint> {
        self.trades.back()
    }

    /// Last trade price, unless that trade is older than `max_age` at `now`
    pub fn fresh_price(&self, now: DateTime<Utc>, max_age: Duration) -> Option<f64> {
        self.last_trade()
            .filter(|t| now - t.timestamp <= max_age)
            .map(|t| t.price)
    }

    /// Buffered trades newer than `since`, oldest first
    pub fn trades_since(&self, since: DateTime<Utc>) -> Vec<TradePrint> {
        self.trades.iter().filter(|t| t.timestamp > since).cloned().collect()
    }

    pub fn book(&self) -> Option<&BookSnapshot> {
        self.book.as_ref()
    }

    fn book_features(&self) -> (f64, f64) {
        match &self.book {
            Some(book) => {
                let spread = if book.best_bid > 0.0 {
                    (book.best_ask - book.best_bid) / book.best_bid
                } else {
                    0.0
                };
                (spread, book.depth_imbalance.clamp(-1.0, 1.0))
            }
            None => (0.0, 0.0),
        }
    }

    /// Compute the feature vector over the current buffer contents
    pub fn snapshot(&self, now: DateTime<Utc>) -> FeatureVector {
        let (spread, book_imbalance) = self.book_features();

        let Some(newest) = self.trades.iter().map(|t| t.timestamp).max() else {
            return FeatureVector::empty(now, spread, book_imbalance);
        };

        let window_secs = self.config.window_secs.max(1.0);
        let cutoff = newest - Duration::milliseconds((window_secs * 1000.0) as i64);
        let window: Vec<&TradePrint> = self
            .trades
            .iter()
            .filter(|t| t.timestamp > cutoff)
            .collect();
        let n = window.len() as f64;

        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut notional = 0.0;
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut price_sum = 0.0;

        for t in &window {
            match t.side {
                Side::Buy => buy_volume += t.size,
                Side::Sell => sell_volume += t.size,
            }
            notional += t.price * t.size;
            high = high.max(t.price);
            low = low.min(t.price);
            price_sum += t.price;
        }

        let total_volume = buy_volume + sell_volume;
        let mean_price = price_sum / n;
        let price_dispersion = if window.len() > 1 {
            let var = window
                .iter()
                .map(|t| (t.price - mean_price).powi(2))
                .sum::<f64>()
                / n;
            var.sqrt()
        } else {
            0.0
        };

        let price_range = high - low;
        let price_range_fraction = if low > 0.0 { price_range / low } else { 0.0 };

        let mean_size = total_volume / n;
        let large = window
            .iter()
            .filter(|t| t.size > mean_size * self.config.large_trade_multiple)
            .count();

        let (aggressive_buy_ratio, aggressive_sell_ratio, volume_weighted_price) = if total_volume > 0.0 {
            (
                buy_volume / total_volume,
                sell_volume / total_volume,
                notional / total_volume,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let volume_imbalance = self.weighted_imbalance(&window, newest, book_imbalance);

        FeatureVector {
            buy_volume,
            sell_volume,
            volume_imbalance,
            large_trade_ratio: large as f64 / n,
            aggressive_buy_ratio,
            aggressive_sell_ratio,
            spread,
            book_imbalance,
            volume_weighted_price,
            trade_intensity: n / window_secs,
            price_range,
            price_range_fraction,
            price_dispersion,
            trade_count: window.len(),
            last_trade_at: Some(newest),
            computed_at: now,
        }
    }

    /// Time-decayed, size-weighted trade imbalance blended with the book imbalance
    fn weighted_imbalance(&self, window: &[&TradePrint], newest: DateTime<Utc>, book_imbalance: f64) -> f64 {
        let decay = self.config.imbalance_decay_ms.max(1.0);
        let mut weighted_buy = 0.0;
        let mut weighted_sell = 0.0;

        for t in window {
            let age_ms = (newest - t.timestamp).num_milliseconds().max(0) as f64;
            let weight = (-age_ms / decay).exp() * t.size.max(0.0).powf(self.config.size_exponent);
            match t.side {
                Side::Buy => weighted_buy += weight,
                Side::Sell => weighted_sell += weight,
            }
        }

        let total = weighted_buy + weighted_sell;
        if total <= 0.0 {
            return 0.0;
        }

        let trade_imbalance = (weighted_buy - weighted_sell) / total;
        let w = self.config.trade_imbalance_weight.clamp(0.0, 1.0);
        (w * trade_imbalance + (1.0 - w) * book_imbalance).clamp(-1.0, 1.0)
    }
}
