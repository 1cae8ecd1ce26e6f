//! Market data events consumed by the feature aggregator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade print
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single trade print. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePrint {
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

impl TradePrint {
    pub fn new(price: f64, size: f64, side: Side, timestamp: DateTime<Utc>) -> Self {
        Self { price, size, side, timestamp }
    }
}

/// Top of book. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    /// (bid depth - ask depth) / (bid depth + ask depth), in [-1, 1]
    pub depth_imbalance: f64,
    pub timestamp: DateTime<Utc>,
}

impl BookSnapshot {
    /// Build a snapshot from top-of-book sizes
    pub fn from_sizes(
        best_bid: f64,
        best_ask: f64,
        bid_size: f64,
        ask_size: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let total = bid_size + ask_size;
        let depth_imbalance = if total > 0.0 {
            (bid_size - ask_size) / total
        } else {
            0.0
        };

        Self {
            best_bid,
            best_ask,
            depth_imbalance,
            timestamp,
        }
    }
}

/// Ingestion event pushed by the streaming collaborator
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade(TradePrint),
    Book(BookSnapshot),
}

impl From<TradePrint> for MarketEvent {
    fn from(trade: TradePrint) -> Self {
        MarketEvent::Trade(trade)
    }
}

impl From<BookSnapshot> for MarketEvent {
    fn from(book: BookSnapshot) -> Self {
        MarketEvent::Book(book)
    }
}
