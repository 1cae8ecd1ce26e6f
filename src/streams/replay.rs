//! Historical trade prints from CSV for the replay tool
//!
//! Expected header: `timestamp,price,size,side`. Timestamps are RFC 3339 or
//! integer epoch seconds, milliseconds or nanoseconds. Sides are `buy`/`sell`
//! or the Databento CSV codes `B`/`A`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::orderflow::{Side, TradePrint};

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    price: f64,
    size: f64,
    side: String,
}

fn parse_side(raw: &str) -> Option<Side> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "buy" | "b" => Some(Side::Buy),
        "sell" | "a" | "s" => Some(Side::Sell),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        let ts = if n > 1_000_000_000_000_000 {
            Some(DateTime::<Utc>::from_timestamp_nanos(n))
        } else if n > 100_000_000_000 {
            DateTime::<Utc>::from_timestamp_millis(n)
        } else {
            DateTime::<Utc>::from_timestamp(n, 0)
        };
        return ts.with_context(|| format!("Timestamp out of range: {}", raw));
    }

    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse timestamp: {}", raw))?
        .with_timezone(&Utc))
}

/// Parse trade prints, skipping rows with an unknown side or a non-positive price
pub fn parse_trades<R: Read>(reader: R) -> Result<Vec<TradePrint>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut trades = Vec::new();
    let mut skipped = 0u64;

    for result in csv_reader.deserialize() {
        let row: CsvRow = result.context("Failed to parse CSV row")?;

        let Some(side) = parse_side(&row.side) else {
            skipped += 1;
            continue;
        };
        if !(row.price > 0.0) || !(row.size > 0.0) {
            skipped += 1;
            continue;
        }

        trades.push(TradePrint::new(row.price, row.size, side, parse_timestamp(&row.timestamp)?));
    }

    if skipped > 0 {
        debug!("Skipped {} unusable rows", skipped);
    }
    if trades.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
        trades.sort_by_key(|t| t.timestamp);
    }
    Ok(trades)
}

pub fn load_trade_csv(path: &Path) -> Result<Vec<TradePrint>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let trades = parse_trades(BufReader::new(file)).with_context(|| format!("Failed to load {:?}", path))?;
    if trades.is_empty() {
        bail!("No trades in {:?}", path);
    }
    Ok(trades)
}
