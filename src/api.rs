use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{Duration, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::orderflow::{RangeEstimate, SimpleRangePayload, TradePrint, VolatilityClass};
use crate::types::{AppState, WsMessage};

/// Response for the full range endpoint
#[derive(Serialize)]
pub struct MarketRangeResponse {
    #[serde(flatten)]
    pub estimate: RangeEstimate,
    pub volatility: VolatilityClass,
    pub age_ms: i64,
}

#[derive(Deserialize)]
pub struct HistoricalQuery {
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
}

fn default_lookback_minutes() -> i64 {
    60
}

#[derive(Serialize)]
pub struct HistoricalResponse {
    pub data: Vec<TradePrint>,
    pub count: usize,
    pub lookback_minutes: i64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub symbols: Vec<String>,
    pub buffered_trades: usize,
    pub uptime_secs: i64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/market-range", get(get_market_range))
        .route("/market-range/simple", get(get_market_range_simple))
        .route("/orderflow/metrics", get(get_orderflow_metrics))
        .route("/orderflow/historical", get(get_orderflow_historical))
        .route("/health", get(get_health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// GET /market-range - Latest estimate with classification
pub async fn get_market_range(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let estimate = state.latest.read().await.clone();
    let volatility = estimate.volatility_class(state.trend_threshold);
    let age_ms = (Utc::now() - estimate.computed_at).num_milliseconds();
    Json(MarketRangeResponse {
        estimate,
        volatility,
        age_ms,
    })
}

/// GET /market-range/simple - `{expected_range, imbalance, computed_at}`
pub async fn get_market_range_simple(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let estimate = state.latest.read().await;
    Json(SimpleRangePayload::from(&*estimate))
}

/// GET /orderflow/metrics - Current feature vector (read-only snapshot)
pub async fn get_orderflow_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let features = state.aggregator.lock().map(|agg| agg.snapshot(Utc::now()));
    match features {
        Ok(features) => (StatusCode::OK, Json(serde_json::json!(features))),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Aggregator unavailable"})),
        ),
    }
}

/// GET /orderflow/historical?lookback_minutes=N - Buffered trade prints, 404 when none
pub async fn get_orderflow_historical(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoricalQuery>,
) -> impl IntoResponse {
    let lookback_minutes = query.lookback_minutes.max(1);
    let since = Utc::now() - Duration::minutes(lookback_minutes);
    let data = match state.aggregator.lock() {
        Ok(agg) => agg.trades_since(since),
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Aggregator unavailable"})),
            )
        }
    };

    if data.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "No historical data available"})),
        );
    }

    let response = HistoricalResponse {
        count: data.len(),
        data,
        lookback_minutes,
    };
    (StatusCode::OK, Json(serde_json::json!(response)))
}

/// GET /health
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let buffered_trades = state.aggregator.lock().map(|agg| agg.len()).unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        symbols: state.symbols.clone(),
        buffered_trades,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();

    // Send current state to new client
    let welcome = WsMessage::Connected {
        symbols: state.symbols.clone(),
    };
    let current = WsMessage::Range(state.latest.read().await.clone());
    for msg in [welcome, current] {
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = sender.send(Message::Text(json.into())).await;
        }
    }

    // Forward broadcasts to this client
    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Read-only feed: drain the client until it goes away
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderflow::{AggregatorConfig, EstimateSource, FeatureAggregator, Side, TradePrint};
    use tokio::sync::broadcast;

    async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn state() -> Arc<AppState> {
        let (tx, _rx) = broadcast::channel(16);
        Arc::new(AppState::new(
            tx,
            FeatureAggregator::shared(AggregatorConfig::default()),
            RangeEstimate::fallback(150.0, Utc::now()),
            vec!["XAUUSD".to_string()],
            150.0,
        ))
    }

    #[tokio::test]
    async fn test_range_endpoints() {
        let state = state();
        let mut live = RangeEstimate::fallback(180.0, Utc::now());
        live.source = EstimateSource::Live;
        live.imbalance = -0.25;
        state.publish(live).await;

        let base = serve(state).await;
        let full: serde_json::Value = reqwest::get(format!("{}/market-range", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(full["expected_range"], 180.0);
        assert_eq!(full["source"], "live");
        assert_eq!(full["volatility"], "medium");

        let simple: SimpleRangePayload = reqwest::get(format!("{}/market-range/simple", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(simple.expected_range, 180.0);
        assert_eq!(simple.imbalance, Some(-0.25));
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let state = state();
        state
            .aggregator
            .lock()
            .unwrap()
            .update(TradePrint::new(2000.0, 3.0, Side::Buy, Utc::now()));

        let base = serve(state).await;
        let metrics: serde_json::Value = reqwest::get(format!("{}/orderflow/metrics", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["trade_count"], 1);
        assert_eq!(metrics["buy_volume"], 3.0);

        let historical = reqwest::get(format!("{}/orderflow/historical?lookback_minutes=5", base))
            .await
            .unwrap();
        assert_eq!(historical.status(), reqwest::StatusCode::OK);
        let historical: serde_json::Value = historical.json().await.unwrap();
        assert_eq!(historical["count"], 1);
        assert_eq!(historical["lookback_minutes"], 5);
        assert_eq!(historical["data"][0]["price"], 2000.0);

        let health: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["buffered_trades"], 1);
    }

    #[tokio::test]
    async fn test_historical_without_trades_is_not_found() {
        let base = serve(state()).await;
        let response = reqwest::get(format!("{}/orderflow/historical", base)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
