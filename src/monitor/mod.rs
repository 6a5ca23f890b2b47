//! Cross-validation monitor
//!
//! Compares the two highest-priority per-source prices for each symbol,
//! classifies the deviation severity and applies a per-symbol cooldown so
//! disagreement does not turn into a notification storm. Pure observer:
//! never mutates price state.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::config::MonitorSection;
use crate::feed::FeedMultiplexer;
use crate::types::{now_ms, PriceRecord, PriceSource, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => bail!("Unknown severity '{}'", other),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Severity band edges, in percent of the reference price.
#[derive(Debug, Clone, Copy)]
pub struct DeviationThresholds {
    pub low_pct: f64,
    pub medium_pct: f64,
    pub high_pct: f64,
}

impl Default for DeviationThresholds {
    fn default() -> Self {
        Self {
            low_pct: 0.5,
            medium_pct: 1.0,
            high_pct: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviationAlert {
    pub id: String,
    pub ts: i64,
    pub symbol: Symbol,
    pub source_a: PriceSource,
    pub price_a: f64,
    pub source_b: PriceSource,
    pub price_b: f64,
    /// Signed; severity is classified on the absolute value
    pub deviation_pct: f64,
    pub severity: Severity,
}

pub struct CrossValidationMonitor {
    thresholds: DeviationThresholds,
    cooldown_ms: i64,
    min_severity: Severity,
    last_alert: HashMap<Symbol, i64>,
}

impl CrossValidationMonitor {
    pub fn new(thresholds: DeviationThresholds, cooldown_ms: i64, min_severity: Severity) -> Self {
        Self {
            thresholds,
            cooldown_ms,
            min_severity,
            last_alert: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &MonitorSection) -> Result<Self> {
        Ok(Self::new(
            DeviationThresholds {
                low_pct: cfg.low_pct,
                medium_pct: cfg.medium_pct,
                high_pct: cfg.high_pct,
            },
            cfg.cooldown_secs as i64 * 1_000,
            Severity::parse(&cfg.min_severity)?,
        ))
    }

    pub fn deviation_percent(price_a: f64, price_b: f64) -> f64 {
        (price_a - price_b) / price_b * 100.0
    }

    pub fn classify(&self, deviation_pct: f64) -> Severity {
        let abs = deviation_pct.abs();
        if abs < self.thresholds.low_pct {
            Severity::Low
        } else if abs < self.thresholds.medium_pct {
            Severity::Medium
        } else if abs < self.thresholds.high_pct {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    /// Compare two independently-sourced records for one symbol. Returns
    /// an alert when severity reaches the configured minimum and the
    /// symbol is out of cooldown.
    pub fn check_at(
        &mut self,
        record_a: &PriceRecord,
        record_b: &PriceRecord,
        now: i64,
    ) -> Option<DeviationAlert> {
        if record_b.price <= 0.0 {
            return None;
        }
        let deviation_pct = Self::deviation_percent(record_a.price, record_b.price);
        let severity = self.classify(deviation_pct);
        if severity < self.min_severity {
            return None;
        }

        let symbol = record_a.symbol.clone();
        if let Some(last) = self.last_alert.get(&symbol) {
            if now - last < self.cooldown_ms {
                return None;
            }
        }
        self.last_alert.insert(symbol.clone(), now);

        let alert = DeviationAlert {
            id: uuid::Uuid::new_v4().to_string(),
            ts: now,
            symbol,
            source_a: record_a.source,
            price_a: record_a.price,
            source_b: record_b.source,
            price_b: record_b.price,
            deviation_pct,
            severity,
        };
        warn!(
            symbol = %alert.symbol,
            source_a = %alert.source_a,
            source_b = %alert.source_b,
            deviation_pct = format!("{:+.3}", alert.deviation_pct),
            severity = %alert.severity,
            "⚠️ Cross-source price deviation"
        );
        Some(alert)
    }

    /// One pass over the roster, comparing the two highest-priority
    /// sources currently known for each symbol.
    pub fn scan(&mut self, mux: &FeedMultiplexer, symbols: &[Symbol]) -> Vec<DeviationAlert> {
        let now = now_ms();
        let mut alerts = Vec::new();
        for symbol in symbols {
            let records = mux.source_prices(symbol);
            if records.len() < 2 {
                continue;
            }
            if let Some(alert) = self.check_at(&records[0], &records[1], now) {
                alerts.push(alert);
            }
        }
        alerts
    }
}
