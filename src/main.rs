use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use rangeflow::api;
use rangeflow::execution::{BrokerConfig, SimulatedBroker};
use rangeflow::orderflow::{
    AggregatorConfig, EstimatorConfig, FeatureAggregator, GatewayConfig, PredictionGateway, RangeEstimate,
    RangeEstimator, RemoteRangeSource,
};
use rangeflow::streams::run_databento_stream;
use rangeflow::trading_core::{CycleEngine, EngineConfig, EngineEvent, EngineSnapshot};
use rangeflow::types::{AppState, WsMessage};

/// Seconds between reconnect attempts to Databento
const RECONNECT_DELAY_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Databento API key
    #[arg(short, long, env = "DATABENTO_API_KEY")]
    api_key: String,

    /// Databento dataset
    #[arg(short, long, env = "DATABENTO_DATASET", default_value = "GLBX.MDP3")]
    dataset: String,

    /// Symbols to subscribe to (comma-separated)
    #[arg(short, long, default_value = "GC.c.0")]
    symbols: String,

    /// Port to run the web server on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Run the cycle engine against the simulated broker
    #[arg(long)]
    paper: bool,

    /// Named engine preset: default, aggressive, conservative, scalping
    #[arg(long, default_value = "default")]
    preset: String,

    /// JSON engine config (overrides --preset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where the engine persists daily and recovery state
    #[arg(long, env = "RANGEFLOW_STATE_FILE", default_value = "rangeflow-state.json")]
    state_file: PathBuf,

    /// Read estimates from another rangeflow instance instead of the local estimator
    #[arg(long, env = "RANGEFLOW_REMOTE_URL")]
    remote_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rangeflow=info".parse()?)
                .add_directive("databento=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let engine_config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::preset(&args.preset)?,
    };
    engine_config.validate().context("Invalid engine configuration")?;

    let symbols: Vec<String> = args.symbols.split(',').map(|s| s.trim().to_string()).collect();

    info!("Starting rangeflow");
    info!("Symbols: {:?} ({})", symbols, args.dataset);
    info!("Port: {}", args.port);
    info!("Paper trading: {}", args.paper);

    let (tx, _rx) = broadcast::channel::<WsMessage>(1000);

    let aggregator = FeatureAggregator::shared(AggregatorConfig::default());
    let estimator_config = EstimatorConfig::default();
    estimator_config.validate().context("Invalid estimator configuration")?;
    let gateway_config = GatewayConfig::default();

    let state = Arc::new(AppState::new(
        tx.clone(),
        aggregator.clone(),
        RangeEstimate::fallback(estimator_config.default_range, Utc::now()),
        symbols.clone(),
        engine_config.selector.trend_threshold,
    ));

    // Databento ingestion, reconnecting on failure
    {
        let api_key = args.api_key.clone();
        let dataset = args.dataset.clone();
        let aggregator = aggregator.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    run_databento_stream(api_key.clone(), dataset.clone(), symbols.clone(), aggregator.clone(), tx.clone())
                        .await
                {
                    error!("Databento stream error: {:#}", e);
                    let _ = tx.send(WsMessage::Error {
                        message: format!("Market data disconnected: {}", e),
                    });
                }
                warn!("Reconnecting to Databento in {}s", RECONNECT_DELAY_SECS);
                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        });
    }

    // Prediction loop: one estimate per second, served over HTTP and WS
    {
        let state = state.clone();
        let mut gateway =
            PredictionGateway::new(aggregator.clone(), RangeEstimator::new(estimator_config.clone()), &gateway_config);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let estimate = gateway.get_latest();
                state.publish(estimate).await;
            }
        });
    }

    if args.paper {
        let remote = match &args.remote_url {
            Some(url) => {
                let remote = RemoteRangeSource::new(url.clone(), &gateway_config, estimator_config.default_range)?;
                info!("Engine reads estimates from {}", remote.url());
                Some(remote)
            }
            None => None,
        };
        let engine = CycleEngine::new(engine_config)?;
        let state = state.clone();
        let state_file = args.state_file.clone();
        let stale_after = chrono::Duration::seconds(gateway_config.stale_after_secs.max(0));
        tokio::spawn(async move {
            if let Err(e) = run_paper_engine(engine, remote, state, state_file, stale_after).await {
                error!("Paper engine stopped: {:#}", e);
            }
        });
    }

    let app = api::router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Tick the engine once a second against the simulated broker.
/// Seconds whose last trade is older than `stale_after` are skipped.
async fn run_paper_engine(
    mut engine: CycleEngine,
    mut remote: Option<RemoteRangeSource>,
    state: Arc<AppState>,
    state_file: PathBuf,
    stale_after: chrono::Duration,
) -> Result<()> {
    if let Some(snapshot) = EngineSnapshot::load(&state_file)? {
        engine.restore(snapshot);
    }

    let mut broker = SimulatedBroker::new(BrokerConfig {
        instrument: engine.config().instrument.clone(),
        ..Default::default()
    });

    let mut feed_stale = false;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let now = Utc::now();
        let price = match state.aggregator.lock() {
            Ok(agg) => agg.fresh_price(now, stale_after),
            Err(_) => anyhow::bail!("Aggregator lock poisoned"),
        };
        let Some(price) = price else {
            if !feed_stale {
                warn!("No trades in the last {}s, pausing the engine", stale_after.num_seconds());
                feed_stale = true;
            }
            continue;
        };
        if feed_stale {
            info!("Trades resumed, engine ticking again");
            feed_stale = false;
        }
        let estimate = match remote.as_mut() {
            Some(remote) => remote.get_latest_at(now).await,
            None => state.latest.read().await.clone(),
        };

        broker.mark(now, price);
        let events = match engine.tick(now, price, &estimate, &mut broker) {
            Ok(events) => events,
            Err(e) => {
                warn!("Tick rejected: {}", e);
                continue;
            }
        };

        let mut persist = false;
        for event in events {
            persist |= matches!(
                event,
                EngineEvent::CycleClosed(_) | EngineEvent::DayReset { .. } | EngineEvent::RecoveryExited { .. }
            );
            let _ = state.tx.send(WsMessage::Engine { event });
        }

        if persist {
            let recent = engine.outcomes();
            let wins = recent.iter().filter(|o| o.is_win()).count();
            info!(
                "Balance ${:.2} | unrealized ${:.2} | net {:+.2} lots | {} cycles, {}/{} recent wins",
                broker.book().running_balance(),
                broker.book().unrealized_pnl(price),
                broker.book().net_position(),
                engine.cycles_closed(),
                wins,
                recent.len()
            );
            if let Err(e) = engine.snapshot(now).save(&state_file) {
                warn!("Failed to save engine state: {:#}", e);
            }
        }
    }
}
