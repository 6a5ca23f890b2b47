//! Historical candle backfill collaborator
//!
//! Used once per (symbol, timeframe) session to bootstrap analysis when
//! live aggregation has not yet accumulated enough candles.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::types::{Candle, Interval, PriceSource, Symbol};

/// External historical-data collaborator.
#[async_trait]
pub trait HistoricalCandles: Send + Sync {
    async fn fetch(&self, symbol: &Symbol, interval: Interval, limit: usize)
        -> Result<Vec<Candle>>;
}

/// Binance klines REST backfill.
pub struct BinanceBackfill {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceBackfill {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn interval_param(interval: Interval) -> &'static str {
        match interval {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
        }
    }

    fn parse_row(row: &[serde_json::Value]) -> Option<Candle> {
        if row.len() < 7 {
            return None;
        }
        let open_time = row[0].as_i64()?;
        let open: f64 = row[1].as_str()?.parse().ok()?;
        let high: f64 = row[2].as_str()?.parse().ok()?;
        let low: f64 = row[3].as_str()?.parse().ok()?;
        let close: f64 = row[4].as_str()?.parse().ok()?;
        let trades = row.get(8).and_then(|v| v.as_u64()).unwrap_or(0);

        Some(Candle {
            bucket_start: open_time,
            open,
            high,
            low,
            close,
            tick_count: trades,
            source: PriceSource::Binance,
        })
    }
}

#[async_trait]
impl HistoricalCandles for BinanceBackfill {
    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/klines", self.base_url);
        tracing::info!(
            symbol = %symbol,
            interval = %interval,
            limit,
            "📥 Fetching historical candles..."
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.exchange_pair()),
                ("interval", Self::interval_param(interval).to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .context("Failed to fetch historical candles")?;

        if !response.status().is_success() {
            bail!("Klines API returned error: {}", response.status());
        }

        // Response: array of arrays
        // [[open_time, open, high, low, close, volume, close_time, ...], ...]
        let klines: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse klines response")?;

        let candles: Vec<Candle> = klines.iter().filter_map(|row| Self::parse_row(row)).collect();
        tracing::info!(
            symbol = %symbol,
            interval = %interval,
            count = candles.len(),
            "✅ Historical candles fetched"
        );
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_valid_kline_row() {
        let row = json!([
            1700000040000i64,
            "50000.1",
            "50100.2",
            "49900.3",
            "50050.4",
            "12.5",
            1700000099999i64,
            "625000.0",
            321
        ]);
        let candle = BinanceBackfill::parse_row(row.as_array().unwrap()).unwrap();
        assert_eq!(candle.bucket_start, 1_700_000_040_000);
        assert_eq!(candle.open, 50000.1);
        assert_eq!(candle.high, 50100.2);
        assert_eq!(candle.low, 49900.3);
        assert_eq!(candle.close, 50050.4);
        assert_eq!(candle.tick_count, 321);
        assert_eq!(candle.source, PriceSource::Binance);
    }

    #[test]
    fn parse_short_or_malformed_row_is_none() {
        let short = json!([1700000040000i64, "50000.1"]);
        assert!(BinanceBackfill::parse_row(short.as_array().unwrap()).is_none());

        let bad_price = json!([
            1700000040000i64,
            "not-a-number",
            "1",
            "1",
            "1",
            "1",
            1700000099999i64
        ]);
        assert!(BinanceBackfill::parse_row(bad_price.as_array().unwrap()).is_none());
    }

    #[test]
    fn trades_field_is_optional() {
        let row = json!([
            1700000040000i64,
            "1.0",
            "1.0",
            "1.0",
            "1.0",
            "0.0",
            1700000099999i64
        ]);
        let candle = BinanceBackfill::parse_row(row.as_array().unwrap()).unwrap();
        assert_eq!(candle.tick_count, 0);
    }

    #[test]
    fn interval_params_cover_all_granularities() {
        let params: Vec<&str> = Interval::ALL
            .iter()
            .map(|i| BinanceBackfill::interval_param(*i))
            .collect();
        assert_eq!(params, vec!["1m", "5m", "15m", "1h", "4h", "1d"]);
    }
}
