use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::orderflow::{RangeEstimate, SharedAggregator};
use crate::trading_core::EngineEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    Range(RangeEstimate),
    Engine { event: EngineEvent },
    Connected { symbols: Vec<String> },
    Error { message: String },
}

/// Shared application state
pub struct AppState {
    pub tx: broadcast::Sender<WsMessage>,
    pub aggregator: SharedAggregator,
    /// Latest estimate served by the prediction loop
    pub latest: RwLock<RangeEstimate>,
    pub symbols: Vec<String>,
    /// Used to classify volatility for API consumers
    pub trend_threshold: f64,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        tx: broadcast::Sender<WsMessage>,
        aggregator: SharedAggregator,
        initial: RangeEstimate,
        symbols: Vec<String>,
        trend_threshold: f64,
    ) -> Self {
        Self {
            tx,
            aggregator,
            latest: RwLock::new(initial),
            symbols,
            trend_threshold,
            started_at: Utc::now(),
        }
    }

    /// Store a new estimate and broadcast it. Returns the number of listeners.
    pub async fn publish(&self, estimate: RangeEstimate) -> usize {
        *self.latest.write().await = estimate.clone();
        self.tx.send(WsMessage::Range(estimate)).unwrap_or(0)
    }
}
