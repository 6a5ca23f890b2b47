//! Configuration management for FeedMux
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

use crate::feed::driver::BackoffSettings;
use crate::types::Symbol;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub feed: FeedSection,
    pub backoff: BackoffSection,
    pub sources: SourcesSection,
    pub store: StoreSection,
    pub analysis: AnalysisSection,
    pub monitor: MonitorSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// Symbols to track
    pub symbols: Vec<String>,
    /// Root directory for persisted state
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSection {
    /// Age after which a lower-priority source may override a higher one (ms)
    pub staleness_ms: i64,
    /// Age after which a last-known record is no longer served (hours)
    pub record_ttl_hours: i64,
}

impl FeedSection {
    pub fn record_ttl_ms(&self) -> i64 {
        self.record_ttl_hours * 3_600_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSection {
    pub base_ms: u64,
    pub multiplier: f64,
    pub ceiling_ms: u64,
    pub max_attempts: u32,
}

impl BackoffSection {
    pub fn settings(&self) -> BackoffSettings {
        BackoffSettings {
            base_ms: self.base_ms,
            multiplier: self.multiplier,
            ceiling_ms: self.ceiling_ms,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesSection {
    pub binance: BinanceSection,
    pub chainlink: ChainlinkSection,
    pub coingecko: CoinGeckoSection,
}

impl SourcesSection {
    pub fn any_enabled(&self) -> bool {
        self.binance.enabled || self.chainlink.enabled || self.coingecko.enabled
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceSection {
    pub enabled: bool,
    pub ws_url: String,
    pub rest_url: String,
    /// Poll the REST ticker while the WebSocket is down
    pub rest_fallback: bool,
    pub fallback_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainlinkSection {
    pub enabled: bool,
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinGeckoSection {
    pub enabled: bool,
    pub base_url: String,
    pub poll_ms: u64,
    /// Symbol -> CoinGecko coin id; symbols absent here are not covered
    #[serde(default = "default_coingecko_ids")]
    pub ids: HashMap<String, String>,
}

fn default_coingecko_ids() -> HashMap<String, String> {
    [
        ("BTC", "bitcoin"),
        ("ETH", "ethereum"),
        ("SOL", "solana"),
        ("XRP", "ripple"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Candle snapshot flush period (seconds)
    pub flush_candles_secs: u64,
    /// Tick history flush period (seconds)
    pub flush_ticks_secs: u64,
    /// In-memory tick buffer cap per symbol
    pub max_ticks: usize,
    /// Persisted tick retention (hours)
    pub tick_retention_hours: i64,
}

impl StoreSection {
    pub fn tick_retention_ms(&self) -> i64 {
        self.tick_retention_hours * 3_600_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisSection {
    /// Minimum completed candles before a timeframe is analyzed
    pub min_candles: usize,
    /// Candle window used for analysis
    pub window: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub oscillator_period: usize,
    pub backfill_enabled: bool,
    pub backfill_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    /// Per-symbol alert cooldown (seconds)
    pub cooldown_secs: u64,
    /// Minimum severity that fires an alert: low|medium|high|critical
    pub min_severity: String,
    pub low_pct: f64,
    pub medium_pct: f64,
    pub high_pct: f64,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // App defaults
            .set_default("app.symbols", vec!["BTC", "ETH", "SOL", "XRP"])?
            .set_default("app.data_dir", "./data")?
            // Feed defaults
            .set_default("feed.staleness_ms", 5_000)?
            .set_default("feed.record_ttl_hours", 24)?
            // Backoff defaults
            .set_default("backoff.base_ms", 1_000)?
            .set_default("backoff.multiplier", 1.5)?
            .set_default("backoff.ceiling_ms", 60_000)?
            .set_default("backoff.max_attempts", 10)?
            // Source defaults
            .set_default("sources.binance.enabled", true)?
            .set_default("sources.binance.ws_url", "wss://stream.binance.com:9443/stream")?
            .set_default("sources.binance.rest_url", "https://api.binance.com/api/v3")?
            .set_default("sources.binance.rest_fallback", true)?
            .set_default("sources.binance.fallback_poll_ms", 5_000)?
            .set_default("sources.chainlink.enabled", true)?
            .set_default("sources.chainlink.ws_url", "wss://ws-live-data.polymarket.com")?
            .set_default("sources.coingecko.enabled", true)?
            .set_default("sources.coingecko.base_url", "https://api.coingecko.com/api/v3")?
            .set_default("sources.coingecko.poll_ms", 10_000)?
            // Store defaults
            .set_default("store.flush_candles_secs", 10)?
            .set_default("store.flush_ticks_secs", 30)?
            .set_default("store.max_ticks", 5_000)?
            .set_default("store.tick_retention_hours", 24)?
            // Analysis defaults
            .set_default("analysis.min_candles", 20)?
            .set_default("analysis.window", 50)?
            .set_default("analysis.ema_fast", 9)?
            .set_default("analysis.ema_slow", 21)?
            .set_default("analysis.oscillator_period", 14)?
            .set_default("analysis.backfill_enabled", true)?
            .set_default("analysis.backfill_limit", 100)?
            // Monitor defaults
            .set_default("monitor.enabled", true)?
            .set_default("monitor.scan_interval_secs", 10)?
            .set_default("monitor.cooldown_secs", 60)?
            .set_default("monitor.min_severity", "medium")?
            .set_default("monitor.low_pct", 0.5)?
            .set_default("monitor.medium_pct", 1.0)?
            .set_default("monitor.high_pct", 2.0)?
            // Optional config file, then environment overrides
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("FEEDMUX").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Parsed, validated symbol roster.
    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        self.app
            .symbols
            .iter()
            .map(|s| Symbol::new(s).map_err(Into::into))
            .collect()
    }

    /// Fatal configuration checks; everything here halts startup.
    pub fn validate(&self) -> Result<()> {
        if self.app.symbols.is_empty() {
            bail!("No symbols configured");
        }
        for s in &self.app.symbols {
            Symbol::new(s).with_context(|| format!("Invalid symbol in app.symbols: '{}'", s))?;
        }
        if !self.sources.any_enabled() {
            bail!("No price source enabled; enable at least one under [sources]");
        }
        if self.backoff.multiplier < 1.0 {
            bail!("backoff.multiplier must be >= 1.0");
        }
        if self.backoff.max_attempts == 0 {
            bail!("backoff.max_attempts must be > 0");
        }
        if self.analysis.ema_fast >= self.analysis.ema_slow {
            bail!("analysis.ema_fast must be shorter than analysis.ema_slow");
        }
        if !(self.monitor.low_pct < self.monitor.medium_pct
            && self.monitor.medium_pct < self.monitor.high_pct)
        {
            bail!("monitor severity thresholds must be strictly increasing");
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        let mut sources = Vec::new();
        if self.sources.binance.enabled {
            sources.push("binance");
        }
        if self.sources.chainlink.enabled {
            sources.push("chainlink");
        }
        if self.sources.coingecko.enabled {
            sources.push("coingecko");
        }
        format!(
            "symbols={:?} sources={:?} staleness_ms={} data_dir={}",
            self.app.symbols, sources, self.feed.staleness_ms, self.app.data_dir
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
