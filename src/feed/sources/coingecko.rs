//! CoinGecko REST poller, the aggregator of last resort
//!
//! Polls `simple/price` at a fixed interval. Only symbols with a
//! configured coin id are covered; poll failures run through the shared
//! backoff policy and eventually fail the driver terminally.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

use crate::config::CoinGeckoSection;
use crate::feed::driver::{jitter, Backoff, BackoffSettings, ConnectionDriver, SourceEvent};
use crate::types::{now_ms, PriceSource, RawTick, Symbol};

const REST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct CoinPrice {
    usd: Option<f64>,
    last_updated_at: Option<i64>,
}

pub struct CoinGeckoDriver {
    cfg: CoinGeckoSection,
    backoff: BackoffSettings,
}

impl CoinGeckoDriver {
    pub fn new(cfg: CoinGeckoSection, backoff: BackoffSettings) -> Self {
        Self { cfg, backoff }
    }

    /// Coin-id -> symbol map for the covered part of the roster.
    fn id_map(&self, symbols: &[Symbol]) -> HashMap<String, Symbol> {
        symbols
            .iter()
            .filter_map(|s| {
                self.cfg
                    .ids
                    .get(s.as_str())
                    .map(|id| (id.clone(), s.clone()))
            })
            .collect()
    }

    async fn poll_once(
        &self,
        client: &reqwest::Client,
        ids: &HashMap<String, Symbol>,
    ) -> Result<Vec<RawTick>> {
        let mut id_list: Vec<&str> = ids.keys().map(String::as_str).collect();
        id_list.sort_unstable();
        let url = format!("{}/simple/price", self.cfg.base_url);

        let response = client
            .get(&url)
            .query(&[
                ("ids", id_list.join(",")),
                ("vs_currencies", "usd".to_string()),
                ("include_last_updated_at", "true".to_string()),
            ])
            .send()
            .await
            .context("CoinGecko request failed")?;
        if !response.status().is_success() {
            bail!("CoinGecko API returned error: {}", response.status());
        }

        let prices: HashMap<String, CoinPrice> = response
            .json()
            .await
            .context("Failed to parse CoinGecko response")?;

        let fallback_ts = now_ms();
        let ticks = prices
            .into_iter()
            .filter_map(|(id, coin)| {
                let symbol = ids.get(&id)?;
                let price = coin.usd.filter(|p| p.is_finite() && *p > 0.0)?;
                let ts = coin
                    .last_updated_at
                    .map(|s| s.saturating_mul(1000))
                    .unwrap_or(fallback_ts);
                Some(RawTick {
                    ts,
                    symbol: symbol.clone(),
                    price,
                    source: PriceSource::CoinGecko,
                })
            })
            .collect();
        Ok(ticks)
    }
}

#[async_trait]
impl ConnectionDriver for CoinGeckoDriver {
    fn source(&self) -> PriceSource {
        PriceSource::CoinGecko
    }

    fn covers(&self, symbol: &Symbol) -> bool {
        self.cfg.ids.contains_key(symbol.as_str())
    }

    async fn run(self: Box<Self>, symbols: Vec<Symbol>, tx: Sender<SourceEvent>) {
        let ids = self.id_map(&symbols);
        if ids.is_empty() {
            tracing::warn!(source = %"CoinGecko", "No configured coin ids for roster; driver idle");
            return;
        }
        let client = match reqwest::Client::builder().timeout(REST_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(SourceEvent::Failed(PriceSource::CoinGecko, e.to_string()))
                    .await;
                return;
            }
        };

        if tx
            .send(SourceEvent::Connecting(PriceSource::CoinGecko))
            .await
            .is_err()
        {
            return;
        }

        let mut backoff = Backoff::new(self.backoff);
        let mut connected = false;

        loop {
            match self.poll_once(&client, &ids).await {
                Ok(ticks) => {
                    if !connected {
                        connected = true;
                        backoff.reset();
                        let _ = tx
                            .send(SourceEvent::Connected(PriceSource::CoinGecko))
                            .await;
                        tracing::info!(source = %"CoinGecko", coins = ids.len(), "✅ Polling CoinGecko");
                    }
                    for tick in ticks {
                        if tx.send(SourceEvent::Tick(tick)).await.is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(self.cfg.poll_ms)).await;
                }
                Err(e) => {
                    if connected {
                        connected = false;
                        let _ = tx
                            .send(SourceEvent::Disconnected(PriceSource::CoinGecko))
                            .await;
                    }
                    tracing::warn!(source = %"CoinGecko", error = %e, "Poll failed");
                    let _ = tx
                        .send(SourceEvent::Error(PriceSource::CoinGecko, e.to_string()))
                        .await;

                    let Some(delay) = backoff.next_delay() else {
                        let _ = tx
                            .send(SourceEvent::Failed(
                                PriceSource::CoinGecko,
                                format!(
                                    "max poll attempts ({}) reached",
                                    self.backoff.max_attempts
                                ),
                            ))
                            .await;
                        return;
                    };
                    tokio::time::sleep(jitter(delay)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> CoinGeckoDriver {
        CoinGeckoDriver::new(
            CoinGeckoSection {
                enabled: true,
                base_url: "https://example".to_string(),
                poll_ms: 10_000,
                ids: [("BTC".to_string(), "bitcoin".to_string())]
                    .into_iter()
                    .collect(),
            },
            BackoffSettings::default(),
        )
    }

    #[test]
    fn covers_only_mapped_symbols() {
        let driver = driver();
        assert!(driver.covers(&Symbol::new("BTC").unwrap()));
        assert!(!driver.covers(&Symbol::new("ETH").unwrap()));
    }

    #[test]
    fn id_map_skips_unmapped_roster_entries() {
        let driver = driver();
        let map = driver.id_map(&[Symbol::new("BTC").unwrap(), Symbol::new("ETH").unwrap()]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("bitcoin").unwrap().as_str(), "BTC");
    }
}
