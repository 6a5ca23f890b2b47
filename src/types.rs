//! Core types used throughout FeedMux
//!
//! Defines common data structures for symbols, sources, ticks, candles
//! and connection state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("invalid symbol '{0}': expected 1-12 alphanumeric characters")]
    InvalidSymbol(String),
    #[error("unknown interval '{0}'")]
    UnknownInterval(String),
}

/// Validated ticker symbol (e.g. "BTC", "ETH").
///
/// Always stored uppercase. The symbol set is open-ended, so this stays a
/// string newtype rather than an enum; validation happens at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: &str) -> Result<Self, TypeError> {
        let trimmed = s.trim();
        if trimmed.is_empty()
            || trimmed.len() > 12
            || !trimmed.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(TypeError::InvalidSymbol(s.to_string()));
        }
        Ok(Symbol(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trading pair for CEX APIs (e.g. "BTCUSDT").
    pub fn exchange_pair(&self) -> String {
        format!("{}USDT", self.0)
    }

    /// Feed identifier for oracle streams (e.g. "btc/usd").
    pub fn oracle_feed(&self) -> String {
        format!("{}/usd", self.0.to_ascii_lowercase())
    }
}

impl TryFrom<String> for Symbol {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Price source identifier.
///
/// The priority order is a fixed total order and never changes at runtime:
/// Binance (primary trade venue) > Chainlink (oracle stream) > CoinGecko
/// (REST aggregator of last resort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriceSource {
    Binance,
    Chainlink,
    CoinGecko,
}

impl PriceSource {
    pub const ALL: [PriceSource; 3] = [
        PriceSource::Binance,
        PriceSource::Chainlink,
        PriceSource::CoinGecko,
    ];

    /// Higher value wins arbitration.
    pub fn priority(&self) -> u8 {
        match self {
            PriceSource::Binance => 2,
            PriceSource::Chainlink => 1,
            PriceSource::CoinGecko => 0,
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSource::Binance => write!(f, "Binance"),
            PriceSource::Chainlink => write!(f, "Chainlink"),
            PriceSource::CoinGecko => write!(f, "CoinGecko"),
        }
    }
}

/// Supported candle intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    Min1,
    Min5,
    Min15,
    Hour1,
    Hour4,
    Day1,
}

impl Interval {
    pub const ALL: [Interval; 6] = [
        Interval::Min1,
        Interval::Min5,
        Interval::Min15,
        Interval::Hour1,
        Interval::Hour4,
        Interval::Day1,
    ];

    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::Min1 => 60_000,
            Interval::Min5 => 300_000,
            Interval::Min15 => 900_000,
            Interval::Hour1 => 3_600_000,
            Interval::Hour4 => 14_400_000,
            Interval::Day1 => 86_400_000,
        }
    }

    /// Finalized history cap per (symbol, interval). FIFO eviction beyond it.
    pub fn max_history(&self) -> usize {
        match self {
            Interval::Min1 => 720,
            Interval::Min5 => 576,
            Interval::Min15 => 384,
            Interval::Hour1 => 336,
            Interval::Hour4 => 360,
            Interval::Day1 => 365,
        }
    }

    /// Persistence TTL; shorter intervals expire sooner.
    pub fn retention_ms(&self) -> i64 {
        match self {
            Interval::Min1 => 2 * 3_600_000,
            Interval::Min5 => 12 * 3_600_000,
            Interval::Min15 => 24 * 3_600_000,
            Interval::Hour1 => 3 * 86_400_000,
            Interval::Hour4 => 7 * 86_400_000,
            Interval::Day1 => 30 * 86_400_000,
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypeError> {
        match s.to_lowercase().as_str() {
            "1m" | "1min" => Ok(Interval::Min1),
            "5m" | "5min" => Ok(Interval::Min5),
            "15m" | "15min" => Ok(Interval::Min15),
            "1h" | "1hour" => Ok(Interval::Hour1),
            "4h" | "4hour" => Ok(Interval::Hour4),
            "1d" | "1day" => Ok(Interval::Day1),
            _ => Err(TypeError::UnknownInterval(s.to_string())),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Min1 => write!(f, "1m"),
            Interval::Min5 => write!(f, "5m"),
            Interval::Min15 => write!(f, "15m"),
            Interval::Hour1 => write!(f, "1h"),
            Interval::Hour4 => write!(f, "4h"),
            Interval::Day1 => write!(f, "1d"),
        }
    }
}

/// Start of the bucket containing `ts` for the given interval.
pub fn bucket_start(ts: i64, interval: Interval) -> i64 {
    let ms = interval.duration_ms();
    ts.div_euclid(ms) * ms
}

/// Normalized price tick from any source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    /// Timestamp in milliseconds (exchange/oracle time)
    pub ts: i64,
    pub symbol: Symbol,
    pub price: f64,
    pub source: PriceSource,
}

/// Authoritative "latest" value per symbol, mutated in place by the
/// multiplexer; never historized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub symbol: Symbol,
    pub price: f64,
    pub source: PriceSource,
    pub ts: i64,
}

impl PriceRecord {
    pub fn from_tick(tick: &RawTick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            price: tick.price,
            source: tick.source,
            ts: tick.ts,
        }
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        (now - self.ts).max(0)
    }

    pub fn is_stale(&self, now: i64, threshold_ms: i64) -> bool {
        self.age_ms(now) > threshold_ms
    }
}

/// A price record annotated with its staleness at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub record: PriceRecord,
    pub stale: bool,
}

/// OHLC aggregate over a fixed time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_count: u64,
    pub source: PriceSource,
}

impl Candle {
    pub fn from_tick(bucket_start: i64, tick: &RawTick) -> Self {
        Self {
            bucket_start,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            tick_count: 1,
            source: tick.source,
        }
    }

    pub fn apply(&mut self, price: f64, source: PriceSource) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.tick_count += 1;
        self.source = source;
    }
}

/// Connection status of a single driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// One per connection driver, owned by the multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub source: PriceSource,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

impl ConnectionState {
    pub fn new(source: PriceSource) -> Self {
        Self {
            source,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            reconnect_attempt: 0,
        }
    }
}
