use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use databento::{
    dbn::{Mbp1Msg, SType, Schema, TradeMsg},
    live::Subscription,
    LiveClient,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::orderflow::{BookSnapshot, MarketEvent, SharedAggregator, Side, TradePrint};
use crate::types::WsMessage;

/// Databento fixed-point prices carry 9 decimals
const PRICE_SCALE: f64 = 1_000_000_000.0;

/// Null price sentinel in DBN records
const UNDEF_PRICE: i64 = i64::MAX;

fn fixed_price(raw: i64) -> Option<f64> {
    if raw == UNDEF_PRICE || raw <= 0 {
        return None;
    }
    Some(raw as f64 / PRICE_SCALE)
}

/// 'A' = Ask side hit (buyer aggressor), 'B' = Bid side hit (seller aggressor)
fn aggressor(side: u8) -> Option<Side> {
    match side {
        b'A' | b'a' => Some(Side::Buy),
        b'B' | b'b' => Some(Side::Sell),
        _ => None,
    }
}

fn event_time(ts_event: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(ts_event as i64)
}

fn trade_print(trade: &TradeMsg) -> Option<TradePrint> {
    let price = fixed_price(trade.price)?;
    let side = aggressor(trade.side as u8)?;
    Some(TradePrint::new(price, trade.size as f64, side, event_time(trade.hd.ts_event)))
}

fn book_snapshot(mbp: &Mbp1Msg) -> Option<BookSnapshot> {
    let level = &mbp.levels[0];
    let bid = fixed_price(level.bid_px)?;
    let ask = fixed_price(level.ask_px)?;
    Some(BookSnapshot::from_sizes(
        bid,
        ask,
        level.bid_sz as f64,
        level.ask_sz as f64,
        event_time(mbp.hd.ts_event),
    ))
}

/// Live mode: trades and top of book from Databento into the aggregator
pub async fn run_databento_stream(
    api_key: String,
    dataset: String,
    symbols: Vec<String>,
    aggregator: SharedAggregator,
    tx: broadcast::Sender<WsMessage>,
) -> Result<()> {
    info!("Connecting to Databento ({})...", dataset);

    let mut client = LiveClient::builder()
        .key(api_key)?
        .dataset(dataset)
        .build()
        .await
        .context("Failed to connect to Databento")?;

    info!("Connected to Databento");

    for schema in [Schema::Trades, Schema::Mbp1] {
        let subscription = Subscription::builder()
            .symbols(symbols.clone())
            .schema(schema)
            .stype_in(SType::RawSymbol)
            .build();

        client
            .subscribe(subscription)
            .await
            .with_context(|| format!("Failed to subscribe to {:?}", schema))?;
    }

    info!("Subscribed to: {:?} (trades + mbp-1)", symbols);

    // Notify clients we're connected
    let _ = tx.send(WsMessage::Connected { symbols: symbols.clone() });

    client.start().await.context("Failed to start stream")?;

    let mut trades = 0u64;
    while let Some(record) = client.next_record().await? {
        let event: Option<MarketEvent> = if let Some(trade) = record.get::<TradeMsg>() {
            trade_print(trade).map(MarketEvent::from)
        } else if let Some(mbp) = record.get::<Mbp1Msg>() {
            book_snapshot(mbp).map(MarketEvent::from)
        } else {
            None
        };

        let Some(event) = event else { continue };
        if matches!(event, MarketEvent::Trade(_)) {
            trades += 1;
            if trades % 10_000 == 0 {
                debug!("{} trades ingested", trades);
            }
        }

        // Lock only for the push
        match aggregator.lock() {
            Ok(mut agg) => agg.update(event),
            Err(_) => {
                warn!("Aggregator lock poisoned, stopping ingestion");
                break;
            }
        }
    }

    warn!("Databento stream ended");
    Ok(())
}
