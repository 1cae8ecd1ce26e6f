//! Order-flow feature pipeline and range estimation

pub mod aggregator;
pub mod estimator;
pub mod gateway;
pub mod trades;

pub use aggregator::{AggregatorConfig, FeatureAggregator, FeatureVector, SharedAggregator};
pub use estimator::{
    EstimateSource, EstimatorConfig, FactorBand, RangeEstimate, RangeEstimator, RangeFactors,
    VolatilityClass,
};
pub use gateway::{
    parse_simple_payload, GatewayConfig, GatewayError, PredictionCache, PredictionGateway,
    RemoteRangeSource, SimpleRangePayload,
};
pub use trades::{BookSnapshot, MarketEvent, Side, TradePrint};
