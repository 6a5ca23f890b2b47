//! Chainlink oracle stream driver
//!
//! Connects to a real-time data service that relays Chainlink price feed
//! updates over WebSocket. Subscription is an explicit JSON request; the
//! server pushes `crypto_prices_chainlink` updates either as single-value
//! payloads or as an initial batch of rows.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::ChainlinkSection;
use crate::feed::driver::{jitter, Backoff, BackoffSettings, ConnectionDriver, SourceEvent};
use crate::types::{now_ms, PriceSource, RawTick, Symbol};

const PRICE_TOPIC: &str = "crypto_prices_chainlink";
const PING_INTERVAL_SECS: u64 = 15;
const WATCHDOG_TICK_SECS: u64 = 5;
const WATCHDOG_SILENCE_SECS: u64 = 20;

fn should_reconnect_due_to_silence(last_message: Instant, silence_secs: u64) -> bool {
    last_message.elapsed().as_secs() >= silence_secs
}

/// Oracle feeds report in seconds or milliseconds depending on relay age.
fn normalize_epoch_millis(ts: i64) -> i64 {
    if ts > 0 && ts < 1_000_000_000_000 {
        ts.saturating_mul(1000)
    } else {
        ts
    }
}

#[derive(Debug, Clone, Serialize)]
struct SubscribeRequest {
    action: String,
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Serialize)]
struct Subscription {
    topic: String,
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    filters: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OracleMessage {
    topic: Option<String>,
    payload: Option<OraclePayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct OraclePayload {
    symbol: Option<String>,
    timestamp: Option<i64>,
    value: Option<f64>,
    data: Option<Vec<OraclePriceRow>>,
}

#[derive(Debug, Clone, Deserialize)]
struct OraclePriceRow {
    symbol: Option<String>,
    timestamp: Option<i64>,
    value: Option<f64>,
}

pub struct ChainlinkDriver {
    cfg: ChainlinkSection,
    backoff: BackoffSettings,
}

impl ChainlinkDriver {
    pub fn new(cfg: ChainlinkSection, backoff: BackoffSettings) -> Self {
        Self { cfg, backoff }
    }

    fn subscribe_request(feeds: &HashMap<String, Symbol>) -> SubscribeRequest {
        let mut names: Vec<&String> = feeds.keys().collect();
        names.sort();
        SubscribeRequest {
            action: "subscribe".to_string(),
            subscriptions: vec![Subscription {
                topic: PRICE_TOPIC.to_string(),
                msg_type: "update".to_string(),
                filters: serde_json::to_string(&names).ok(),
            }],
        }
    }

    async fn emit_row(
        feeds: &HashMap<String, Symbol>,
        feed_symbol: &str,
        value: f64,
        ts: Option<i64>,
        tx: &Sender<SourceEvent>,
    ) {
        let Some(symbol) = feeds.get(feed_symbol) else {
            return;
        };
        if !value.is_finite() || value <= 0.0 {
            return;
        }
        let ts = ts.map(normalize_epoch_millis).unwrap_or_else(now_ms);
        let _ = tx
            .send(SourceEvent::Tick(RawTick {
                ts,
                symbol: symbol.clone(),
                price: value,
                source: PriceSource::Chainlink,
            }))
            .await;
    }

    async fn handle_message(
        text: &str,
        feeds: &HashMap<String, Symbol>,
        tx: &Sender<SourceEvent>,
    ) -> Result<()> {
        let message: OracleMessage = serde_json::from_str(text)?;
        if message.topic.as_deref() != Some(PRICE_TOPIC) {
            return Ok(());
        }
        let Some(payload) = message.payload else {
            return Ok(());
        };

        // Single update payload
        if let (Some(feed_symbol), Some(value)) = (payload.symbol.as_deref(), payload.value) {
            Self::emit_row(feeds, feed_symbol, value, payload.timestamp, tx).await;
        }
        // Initial batch of rows
        if let Some(rows) = payload.data {
            for row in rows {
                if let (Some(feed_symbol), Some(value)) = (row.symbol.as_deref(), row.value) {
                    Self::emit_row(feeds, feed_symbol, value, row.timestamp, tx).await;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionDriver for ChainlinkDriver {
    fn source(&self) -> PriceSource {
        PriceSource::Chainlink
    }

    fn covers(&self, _symbol: &Symbol) -> bool {
        true
    }

    async fn run(self: Box<Self>, symbols: Vec<Symbol>, tx: Sender<SourceEvent>) {
        let feeds: HashMap<String, Symbol> = symbols
            .iter()
            .map(|s| (s.oracle_feed(), s.clone()))
            .collect();
        if feeds.is_empty() {
            return;
        }
        let mut backoff = Backoff::new(self.backoff);

        loop {
            if tx
                .send(SourceEvent::Connecting(PriceSource::Chainlink))
                .await
                .is_err()
            {
                return;
            }
            tracing::info!(
                source = %"Chainlink",
                url = %self.cfg.ws_url,
                attempt = backoff.attempt(),
                "Connecting to oracle stream..."
            );

            match connect_async(&self.cfg.ws_url).await {
                Ok((ws_stream, _)) => {
                    let (mut write, mut read) = ws_stream.split();

                    let request = Self::subscribe_request(&feeds);
                    let subscribe_failed = match serde_json::to_string(&request) {
                        Ok(json) => write.send(Message::Text(json)).await.is_err(),
                        Err(_) => true,
                    };
                    if subscribe_failed {
                        let _ = tx
                            .send(SourceEvent::Error(
                                PriceSource::Chainlink,
                                "failed to send subscribe request".to_string(),
                            ))
                            .await;
                    } else {
                        backoff.reset();
                        let _ = tx
                            .send(SourceEvent::Connected(PriceSource::Chainlink))
                            .await;
                        tracing::info!(source = %"Chainlink", "✅ Subscribed to oracle price topic");

                        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
                        let mut watchdog =
                            tokio::time::interval(Duration::from_secs(WATCHDOG_TICK_SECS));
                        let mut last_message = Instant::now();

                        loop {
                            tokio::select! {
                                msg = read.next() => match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        last_message = Instant::now();
                                        if let Err(e) = Self::handle_message(&text, &feeds, &tx).await {
                                            tracing::warn!(source = %"Chainlink", error = %e, "Failed to parse message");
                                        }
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        last_message = Instant::now();
                                        let _ = write.send(Message::Pong(data)).await;
                                    }
                                    Some(Ok(Message::Pong(_))) => {
                                        last_message = Instant::now();
                                    }
                                    Some(Ok(Message::Close(_))) => {
                                        tracing::warn!(source = %"Chainlink", "Connection closed by server");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        let _ = tx
                                            .send(SourceEvent::Error(PriceSource::Chainlink, e.to_string()))
                                            .await;
                                        break;
                                    }
                                    None => {
                                        tracing::warn!(source = %"Chainlink", "Stream ended");
                                        break;
                                    }
                                },
                                _ = ping.tick() => {
                                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                                        break;
                                    }
                                }
                                _ = watchdog.tick() => {
                                    if should_reconnect_due_to_silence(last_message, WATCHDOG_SILENCE_SECS) {
                                        tracing::warn!(
                                            source = %"Chainlink",
                                            silence_secs = WATCHDOG_SILENCE_SECS,
                                            "No messages from oracle stream; forcing reconnect"
                                        );
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    let _ = tx
                        .send(SourceEvent::Disconnected(PriceSource::Chainlink))
                        .await;
                }
                Err(e) => {
                    tracing::error!(source = %"Chainlink", error = %e, "Connection failed");
                    let _ = tx
                        .send(SourceEvent::Error(PriceSource::Chainlink, e.to_string()))
                        .await;
                }
            }

            let Some(delay) = backoff.next_delay() else {
                let _ = tx
                    .send(SourceEvent::Failed(
                        PriceSource::Chainlink,
                        format!("max reconnect attempts ({}) reached", self.backoff.max_attempts),
                    ))
                    .await;
                return;
            };
            tokio::time::sleep(jitter(delay)).await;
        }
    }
}
