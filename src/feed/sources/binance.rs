//! Binance WebSocket driver for real-time trade data
//!
//! Connects to the combined aggTrade stream for all subscribed symbols.
//! While the socket is down and the driver is backing off, an optional
//! REST ticker poll keeps prices from going fully stale.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::BinanceSection;
use crate::feed::driver::{jitter, Backoff, BackoffSettings, ConnectionDriver, SourceEvent};
use crate::types::{now_ms, PriceSource, RawTick, Symbol};

const REST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BinanceDriver {
    cfg: BinanceSection,
    backoff: BackoffSettings,
}

impl BinanceDriver {
    pub fn new(cfg: BinanceSection, backoff: BackoffSettings) -> Self {
        Self { cfg, backoff }
    }

    fn stream_url(&self, roster: &HashMap<String, Symbol>) -> String {
        let streams: Vec<String> = roster
            .keys()
            .map(|pair| format!("{}@aggTrade", pair.to_lowercase()))
            .collect();
        format!("{}?streams={}", self.cfg.ws_url, streams.join("/"))
    }

    async fn handle_message(
        text: &str,
        roster: &HashMap<String, Symbol>,
        tx: &Sender<SourceEvent>,
    ) -> Result<()> {
        // Combined stream format: {"stream":"btcusdt@aggTrade","data":{...}}
        let wrapper: serde_json::Value = serde_json::from_str(text)?;
        let stream = wrapper["stream"]
            .as_str()
            .context("Missing stream name in message")?;
        if !stream.contains("@aggTrade") {
            return Ok(());
        }
        let data = &wrapper["data"];

        let pair = data["s"].as_str().context("Missing symbol")?;
        let Some(symbol) = roster.get(&pair.to_uppercase()) else {
            // Not a symbol this driver was asked to cover
            return Ok(());
        };

        let price: f64 = data["p"]
            .as_str()
            .context("Missing price")?
            .parse()
            .context("Unparseable price")?;
        let ts = data["T"].as_i64().unwrap_or_else(now_ms);

        let _ = tx
            .send(SourceEvent::Tick(RawTick {
                ts,
                symbol: symbol.clone(),
                price,
                source: PriceSource::Binance,
            }))
            .await;
        Ok(())
    }

    /// One REST ticker sweep over the roster; best effort.
    async fn poll_rest_once(
        &self,
        client: &reqwest::Client,
        roster: &HashMap<String, Symbol>,
        tx: &Sender<SourceEvent>,
    ) {
        #[derive(Debug, Deserialize)]
        struct TickerPrice {
            symbol: String,
            price: String,
        }

        let pairs: Vec<&String> = roster.keys().collect();
        let symbols_param = match serde_json::to_string(&pairs) {
            Ok(s) => s,
            Err(_) => return,
        };
        let url = format!("{}/ticker/price", self.cfg.rest_url);

        let response = match client
            .get(&url)
            .query(&[("symbols", symbols_param.as_str())])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(source = %"Binance", error = %e, "REST fallback poll failed");
                return;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(source = %"Binance", status = %response.status(), "REST fallback poll rejected");
            return;
        }
        let tickers: Vec<TickerPrice> = match response.json().await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(source = %"Binance", error = %e, "REST fallback parse failed");
                return;
            }
        };

        let ts = now_ms();
        for ticker in tickers {
            let Some(symbol) = roster.get(&ticker.symbol.to_uppercase()) else {
                continue;
            };
            let Ok(price) = ticker.price.parse::<f64>() else {
                continue;
            };
            let _ = tx
                .send(SourceEvent::Tick(RawTick {
                    ts,
                    symbol: symbol.clone(),
                    price,
                    source: PriceSource::Binance,
                }))
                .await;
        }
    }
}

#[async_trait]
impl ConnectionDriver for BinanceDriver {
    fn source(&self) -> PriceSource {
        PriceSource::Binance
    }

    fn covers(&self, _symbol: &Symbol) -> bool {
        // Every validated symbol maps to a {SYMBOL}USDT pair
        true
    }

    async fn run(self: Box<Self>, symbols: Vec<Symbol>, tx: Sender<SourceEvent>) {
        let roster: HashMap<String, Symbol> = symbols
            .iter()
            .map(|s| (s.exchange_pair(), s.clone()))
            .collect();
        if roster.is_empty() {
            return;
        }
        let url = self.stream_url(&roster);
        let rest_client = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .ok();
        let mut backoff = Backoff::new(self.backoff);

        loop {
            if tx
                .send(SourceEvent::Connecting(PriceSource::Binance))
                .await
                .is_err()
            {
                return;
            }
            tracing::info!(
                source = %"Binance",
                url = %url.split('?').next().unwrap_or(url.as_str()),
                attempt = backoff.attempt(),
                "Connecting to Binance WebSocket..."
            );

            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    backoff.reset();
                    let _ = tx.send(SourceEvent::Connected(PriceSource::Binance)).await;
                    tracing::info!(source = %"Binance", "✅ Connected to Binance WebSocket");

                    let (mut write, mut read) = ws_stream.split();
                    loop {
                        match read.next().await {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(e) = Self::handle_message(&text, &roster, &tx).await {
                                    tracing::warn!(source = %"Binance", error = %e, "Failed to parse message");
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                tracing::warn!(source = %"Binance", "Connection closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = tx
                                    .send(SourceEvent::Error(
                                        PriceSource::Binance,
                                        e.to_string(),
                                    ))
                                    .await;
                                break;
                            }
                            None => {
                                tracing::warn!(source = %"Binance", "Stream ended");
                                break;
                            }
                        }
                    }
                    let _ = tx
                        .send(SourceEvent::Disconnected(PriceSource::Binance))
                        .await;
                }
                Err(e) => {
                    tracing::error!(source = %"Binance", error = %e, "Connection failed");
                    let _ = tx
                        .send(SourceEvent::Error(PriceSource::Binance, e.to_string()))
                        .await;
                }
            }

            let Some(delay) = backoff.next_delay() else {
                let _ = tx
                    .send(SourceEvent::Failed(
                        PriceSource::Binance,
                        format!("max reconnect attempts ({}) reached", self.backoff.max_attempts),
                    ))
                    .await;
                return;
            };
            let delay = jitter(delay);
            tracing::info!(
                source = %"Binance",
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt(),
                "🔄 Reconnecting after backoff"
            );

            if self.cfg.rest_fallback {
                if let Some(client) = &rest_client {
                    // Substitute REST polling at a fixed cadence for the
                    // whole backoff window.
                    let deadline = Instant::now() + delay;
                    loop {
                        self.poll_rest_once(client, &roster, &tx).await;
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let step =
                            Duration::from_millis(self.cfg.fallback_poll_ms).min(deadline - now);
                        tokio::time::sleep(step).await;
                    }
                    continue;
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn roster() -> HashMap<String, Symbol> {
        [Symbol::new("BTC").unwrap(), Symbol::new("ETH").unwrap()]
            .into_iter()
            .map(|s| (s.exchange_pair(), s))
            .collect()
    }

    #[tokio::test]
    async fn agg_trade_message_becomes_tick() {
        let (tx, mut rx) = mpsc::channel(8);
        let text = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","s":"BTCUSDT","p":"50123.45","T":1700000000000}}"#;
        BinanceDriver::handle_message(text, &roster(), &tx)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            SourceEvent::Tick(tick) => {
                assert_eq!(tick.symbol.as_str(), "BTC");
                assert_eq!(tick.price, 50123.45);
                assert_eq!(tick.ts, 1_700_000_000_000);
                assert_eq!(tick.source, PriceSource::Binance);
            }
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn uncovered_symbol_is_never_emitted() {
        let (tx, mut rx) = mpsc::channel(8);
        let text = r#"{"stream":"dogeusdt@aggTrade","data":{"e":"aggTrade","s":"DOGEUSDT","p":"0.1","T":1700000000000}}"#;
        BinanceDriver::handle_message(text, &roster(), &tx)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_message_is_an_error_not_a_tick() {
        let (tx, mut rx) = mpsc::channel(8);
        assert!(
            BinanceDriver::handle_message("not json", &roster(), &tx)
                .await
                .is_err()
        );
        assert!(rx.try_recv().is_err());
    }
}
