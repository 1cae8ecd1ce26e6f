//! Prediction Cache / Gateway
//!
//! Serves the latest [`RangeEstimate`] under a minimum refresh interval. A
//! refresh that cannot produce a live value degrades to the last known-good
//! estimate (relabelled `Cached`), or to the configured default when there is
//! none. Callers never see an error from here.
//!
//! Two sources share the same cache discipline: [`PredictionGateway`] reads the
//! in-process aggregator, [`RemoteRangeSource`] polls another process over HTTP.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::aggregator::SharedAggregator;
use super::estimator::{EstimateSource, RangeEstimate, RangeEstimator};

/// Why a refresh could not produce a live estimate
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no trades observed")]
    NoData,
    #[error("live data is stale, last trade at {0}")]
    Stale(DateTime<Utc>),
    #[error("aggregator lock poisoned")]
    LockPoisoned,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("non-success status {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("upstream is serving {0} data")]
    Degraded(EstimateSource),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::Malformed(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Gateway timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Within this interval the served value is returned unchanged
    pub min_refresh_ms: i64,
    /// Live data older than this is treated as unavailable
    pub stale_after_secs: i64,
    /// Client-side timeout for the remote source
    pub remote_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_refresh_ms: 1_000,
            stale_after_secs: 30,
            remote_timeout_ms: 2_000,
        }
    }
}

/// Refresh-interval and last-good bookkeeping shared by both sources
#[derive(Debug, Clone)]
pub struct PredictionCache {
    min_refresh: Duration,
    default_range: f64,
    served: Option<(DateTime<Utc>, RangeEstimate)>,
    last_good: Option<RangeEstimate>,
    degraded: bool,
}

impl PredictionCache {
    pub fn new(min_refresh: Duration, default_range: f64) -> Self {
        Self {
            min_refresh,
            default_range,
            served: None,
            last_good: None,
            degraded: false,
        }
    }

    /// The served value, if it is still inside the refresh interval
    pub fn current(&self, now: DateTime<Utc>) -> Option<RangeEstimate> {
        match &self.served {
            Some((refreshed_at, estimate)) if now - *refreshed_at < self.min_refresh => {
                Some(estimate.clone())
            }
            _ => None,
        }
    }

    /// Record the outcome of a refresh and return what should be served
    pub fn accept(&mut self, now: DateTime<Utc>, result: Result<RangeEstimate, GatewayError>) -> RangeEstimate {
        let result = result.and_then(|estimate| match estimate.source {
            EstimateSource::Live if estimate.is_well_formed() => Ok(estimate),
            EstimateSource::Live => Err(GatewayError::Malformed(format!(
                "range {} imbalance {}",
                estimate.expected_range, estimate.imbalance
            ))),
            other => Err(GatewayError::Degraded(other)),
        });

        let served = match result {
            Ok(estimate) => {
                if self.degraded {
                    info!("GATEWAY: live estimates restored ({:.1})", estimate.expected_range);
                    self.degraded = false;
                }
                self.last_good = Some(estimate.clone());
                estimate
            }
            Err(e) => {
                let served = match &self.last_good {
                    Some(good) => good.as_cached(),
                    None => RangeEstimate::fallback(self.default_range, now),
                };
                if !self.degraded {
                    warn!("GATEWAY: {} - serving {} range {:.1}", e, served.source, served.expected_range);
                    self.degraded = true;
                } else {
                    debug!("Gateway still degraded: {}", e);
                }
                served
            }
        };

        self.served = Some((now, served.clone()));
        served
    }
}

/// In-process gateway over the shared aggregator
pub struct PredictionGateway {
    aggregator: SharedAggregator,
    estimator: RangeEstimator,
    cache: PredictionCache,
    stale_after: Duration,
}

impl PredictionGateway {
    pub fn new(aggregator: SharedAggregator, estimator: RangeEstimator, config: &GatewayConfig) -> Self {
        let cache = PredictionCache::new(
            Duration::milliseconds(config.min_refresh_ms.max(0)),
            estimator.config().default_range,
        );
        Self {
            aggregator,
            estimator,
            cache,
            stale_after: Duration::seconds(config.stale_after_secs.max(0)),
        }
    }

    pub fn get_latest(&mut self) -> RangeEstimate {
        self.get_latest_at(Utc::now())
    }

    /// Latest estimate as of `now`. Never fails.
    pub fn get_latest_at(&mut self, now: DateTime<Utc>) -> RangeEstimate {
        if let Some(estimate) = self.cache.current(now) {
            return estimate;
        }
        let result = self.refresh(now);
        self.cache.accept(now, result)
    }

    fn refresh(&self, now: DateTime<Utc>) -> Result<RangeEstimate, GatewayError> {
        // Lock only long enough to snapshot
        let features = {
            let aggregator = self.aggregator.lock().map_err(|_| GatewayError::LockPoisoned)?;
            aggregator.snapshot(now)
        };

        match features.last_trade_at {
            None => return Err(GatewayError::NoData),
            Some(last) if now - last > self.stale_after => return Err(GatewayError::Stale(last)),
            Some(_) => {}
        }

        Ok(self.estimator.estimate(features))
    }
}

/// Wire payload of `GET /market-range/simple`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleRangePayload {
    pub expected_range: f64,
    #[serde(default)]
    pub imbalance: Option<f64>,
    pub computed_at: DateTime<Utc>,
    /// Absent from older servers; treated as live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EstimateSource>,
}

impl From<&RangeEstimate> for SimpleRangePayload {
    fn from(estimate: &RangeEstimate) -> Self {
        Self {
            expected_range: estimate.expected_range,
            imbalance: Some(estimate.imbalance),
            computed_at: estimate.computed_at,
            source: Some(estimate.source),
        }
    }
}

impl SimpleRangePayload {
    /// Validate the payload and turn it into an estimate, keeping the sender's source
    pub fn into_estimate(self) -> Result<RangeEstimate, GatewayError> {
        let estimate = RangeEstimate {
            expected_range: self.expected_range,
            imbalance: self.imbalance.unwrap_or(0.0),
            computed_at: self.computed_at,
            source: self.source.unwrap_or(EstimateSource::Live),
        };
        if !estimate.is_well_formed() {
            return Err(GatewayError::Malformed(format!(
                "range {} imbalance {}",
                estimate.expected_range, estimate.imbalance
            )));
        }
        Ok(estimate)
    }
}

/// Parse a `/market-range/simple` body
pub fn parse_simple_payload(body: &str) -> Result<RangeEstimate, GatewayError> {
    let payload: SimpleRangePayload =
        serde_json::from_str(body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    payload.into_estimate()
}

/// Gateway client for an estimator running in another process
pub struct RemoteRangeSource {
    client: Client,
    url: String,
    cache: PredictionCache,
    stale_after: Duration,
}

impl RemoteRangeSource {
    pub fn new(url: impl Into<String>, config: &GatewayConfig, default_range: f64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.remote_timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            cache: PredictionCache::new(Duration::milliseconds(config.min_refresh_ms.max(0)), default_range),
            stale_after: Duration::seconds(config.stale_after_secs.max(0)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Latest estimate as of `now`. Never fails.
    pub async fn get_latest_at(&mut self, now: DateTime<Utc>) -> RangeEstimate {
        if let Some(estimate) = self.cache.current(now) {
            return estimate;
        }
        let result = self.fetch(now).await;
        self.cache.accept(now, result)
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<RangeEstimate, GatewayError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let estimate = parse_simple_payload(&body)?;
        if now - estimate.computed_at > self.stale_after {
            return Err(GatewayError::Stale(estimate.computed_at));
        }
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderflow::aggregator::{AggregatorConfig, FeatureAggregator};
    use crate::orderflow::estimator::EstimatorConfig;
    use crate::orderflow::trades::{Side, TradePrint};
    use axum::{http::StatusCode, routing::get, Json, Router};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn gateway() -> (SharedAggregator, PredictionGateway) {
        let agg = FeatureAggregator::shared(AggregatorConfig::default());
        let gw = PredictionGateway::new(
            agg.clone(),
            RangeEstimator::new(EstimatorConfig::default()),
            &GatewayConfig::default(),
        );
        (agg, gw)
    }

    fn push(agg: &SharedAggregator, price: f64, side: Side, secs: i64) {
        agg.lock().unwrap().update(TradePrint::new(price, 2.0, side, ts(secs)));
    }

    #[test]
    fn test_empty_aggregator_serves_fallback() {
        let (_agg, mut gw) = gateway();
        let est = gw.get_latest_at(ts(0));
        assert_eq!(est.source, EstimateSource::Fallback);
        assert_eq!(est.expected_range, 150.0);
    }

    #[test]
    fn test_refresh_interval_keeps_computed_at() {
        let (agg, mut gw) = gateway();
        push(&agg, 2000.0, Side::Buy, 0);
        push(&agg, 2001.0, Side::Sell, 0);

        let first = gw.get_latest_at(ts(0));
        assert_eq!(first.source, EstimateSource::Live);

        push(&agg, 2010.0, Side::Buy, 0);
        let within = gw.get_latest_at(ts(0) + Duration::milliseconds(500));
        assert_eq!(within, first);

        let after = gw.get_latest_at(ts(2));
        assert_eq!(after.computed_at, ts(2));
        assert!(after.expected_range > first.expected_range);
    }

    #[test]
    fn test_stale_data_serves_last_good_as_cached() {
        let (agg, mut gw) = gateway();
        push(&agg, 2000.0, Side::Buy, 0);
        push(&agg, 2001.0, Side::Sell, 0);
        let live = gw.get_latest_at(ts(1));

        let stale = gw.get_latest_at(ts(120));
        assert_eq!(stale.source, EstimateSource::Cached);
        assert_eq!(stale.expected_range, live.expected_range);
        assert_eq!(stale.computed_at, live.computed_at);
    }

    #[test]
    fn test_poisoned_lock_degrades() {
        let (agg, mut gw) = gateway();
        let poisoner = agg.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the aggregator");
        })
        .join();

        let est = gw.get_latest_at(ts(0));
        assert_eq!(est.source, EstimateSource::Fallback);
    }

    #[test]
    fn test_parse_simple_payload() {
        let est = parse_simple_payload(
            r#"{"expected_range": 180.5, "computed_at": "2024-03-01T14:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(est.expected_range, 180.5);
        assert_eq!(est.imbalance, 0.0);
        assert_eq!(est.source, EstimateSource::Live);

        assert!(matches!(
            parse_simple_payload(r#"{"expected_range": -1, "computed_at": "2024-03-01T14:30:00Z"}"#),
            Err(GatewayError::Malformed(_))
        ));
        assert!(matches!(parse_simple_payload("not json"), Err(GatewayError::Malformed(_))));
    }

    #[test]
    fn test_payload_keeps_sender_source() {
        let fallback = RangeEstimate::fallback(150.0, ts(0));
        let body = serde_json::to_string(&SimpleRangePayload::from(&fallback)).unwrap();
        let est = parse_simple_payload(&body).unwrap();
        assert_eq!(est.source, EstimateSource::Fallback);

        let mut cached = RangeEstimate::fallback(210.0, ts(0));
        cached.source = EstimateSource::Cached;
        let body = serde_json::to_string(&SimpleRangePayload::from(&cached)).unwrap();
        assert_eq!(parse_simple_payload(&body).unwrap().source, EstimateSource::Cached);
    }

    #[test]
    fn test_cache_rejects_degraded_upstream() {
        let mut cache = PredictionCache::new(Duration::seconds(1), 150.0);
        let mut live = RangeEstimate::fallback(240.0, ts(0));
        live.source = EstimateSource::Live;
        cache.accept(ts(0), Ok(live));

        // A fallback from upstream never becomes last-good
        let served = cache.accept(ts(5), Ok(RangeEstimate::fallback(150.0, ts(5))));
        assert_eq!(served.source, EstimateSource::Cached);
        assert_eq!(served.expected_range, 240.0);
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_remote_source_caches_and_degrades() {
        let base = serve(
            Router::new()
                .route(
                    "/ok",
                    get(|| async {
                        Json(SimpleRangePayload {
                            expected_range: 220.0,
                            imbalance: Some(0.3),
                            computed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                            source: None,
                        })
                    }),
                )
                .route("/error", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
                .route("/garbage", get(|| async { "{\"expected_range\": \"wide\"}" })),
        )
        .await;

        let config = GatewayConfig::default();

        let mut ok = RemoteRangeSource::new(format!("{}/ok", base), &config, 150.0).unwrap();
        let est = ok.get_latest_at(ts(0)).await;
        assert_eq!(est.source, EstimateSource::Live);
        assert_eq!(est.expected_range, 220.0);
        assert_eq!(est.imbalance, 0.3);

        let mut failing = RemoteRangeSource::new(format!("{}/error", base), &config, 150.0).unwrap();
        let est = failing.get_latest_at(ts(0)).await;
        assert_eq!(est.source, EstimateSource::Fallback);
        assert_eq!(est.expected_range, 150.0);

        let mut garbage = RemoteRangeSource::new(format!("{}/garbage", base), &config, 150.0).unwrap();
        assert_eq!(garbage.get_latest_at(ts(0)).await.source, EstimateSource::Fallback);
    }

    #[tokio::test]
    async fn test_remote_source_rejects_stale_and_non_live() {
        let base = serve(
            Router::new()
                .route(
                    "/fallback",
                    get(|| async { Json(SimpleRangePayload::from(&RangeEstimate::fallback(150.0, ts(0)))) }),
                )
                .route(
                    "/old",
                    get(|| async {
                        Json(SimpleRangePayload {
                            expected_range: 260.0,
                            imbalance: None,
                            computed_at: ts(0),
                            source: Some(EstimateSource::Live),
                        })
                    }),
                ),
        )
        .await;
        let config = GatewayConfig::default();

        let mut fallback = RemoteRangeSource::new(format!("{}/fallback", base), &config, 100.0).unwrap();
        let est = fallback.get_latest_at(ts(0)).await;
        assert_eq!(est.source, EstimateSource::Fallback);
        assert_eq!(est.expected_range, 100.0);

        // Fresh enough the first time, three hours later the same body is stale
        let mut old = RemoteRangeSource::new(format!("{}/old", base), &config, 100.0).unwrap();
        assert_eq!(old.get_latest_at(ts(10)).await.source, EstimateSource::Live);
        let est = old.get_latest_at(ts(3 * 3600)).await;
        assert_eq!(est.source, EstimateSource::Cached);
        assert_eq!(est.expected_range, 260.0);
    }

    #[tokio::test]
    async fn test_remote_source_unreachable_falls_back() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut remote = RemoteRangeSource::new(
            format!("http://127.0.0.1:{}/market-range/simple", port),
            &GatewayConfig::default(),
            150.0,
        )
        .unwrap();

        let est = remote.get_latest_at(ts(0)).await;
        assert_eq!(est.source, EstimateSource::Fallback);
        assert_eq!(est.expected_range, 150.0);
    }
}
