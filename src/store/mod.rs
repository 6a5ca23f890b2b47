//! Durable per-symbol state and bounded tick history
//!
//! One JSON document per symbol holds the finalized candles per interval,
//! the open candles, the recent tick history and the save timestamp.
//! Persistence is a continuity optimization, not a correctness
//! requirement: every failure here is logged and swallowed, and the
//! system degrades to memory-only operation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{Candle, Interval, RawTick, Symbol};

/// Durable record layout: one of these per symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedSymbolState {
    #[serde(default)]
    pub candles: BTreeMap<Interval, Vec<Candle>>,
    #[serde(default)]
    pub open_candles: BTreeMap<Interval, Candle>,
    #[serde(default)]
    pub tick_history: Vec<RawTick>,
    #[serde(default)]
    pub last_saved: i64,
}

/// JSON-document-per-symbol durable layer. Single writer: the flush
/// timers in the composition root.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("state");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, symbol: &Symbol) -> PathBuf {
        self.dir.join(format!("{}.json", symbol))
    }

    /// Load a symbol document, dropping entries past their TTLs. Expired
    /// entries are filtered out and not re-persisted until the next flush
    /// rewrites the document.
    pub fn load(
        &self,
        symbol: &Symbol,
        now: i64,
        tick_retention_ms: i64,
    ) -> Result<Option<PersistedSymbolState>> {
        let path = self.path_for(symbol);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut state: PersistedSymbolState = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        // Interval-specific TTLs: shorter intervals expire sooner
        for (interval, candles) in state.candles.iter_mut() {
            let cutoff = now - interval.retention_ms();
            candles.retain(|c| c.bucket_start >= cutoff);
        }
        state.candles.retain(|_, candles| !candles.is_empty());
        state
            .open_candles
            .retain(|interval, candle| candle.bucket_start >= now - interval.retention_ms());

        let tick_cutoff = now - tick_retention_ms;
        state.tick_history.retain(|t| t.ts >= tick_cutoff);

        Ok(Some(state))
    }

    pub fn save(&self, symbol: &Symbol, state: &PersistedSymbolState) -> Result<()> {
        let path = self.path_for(symbol);
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Read-modify-write of one symbol document; `last_saved` is stamped
    /// here so both flush cadences share one layout.
    pub fn update(
        &self,
        symbol: &Symbol,
        now: i64,
        tick_retention_ms: i64,
        f: impl FnOnce(&mut PersistedSymbolState),
    ) -> Result<()> {
        let mut state = self
            .load(symbol, now, tick_retention_ms)
            .unwrap_or_else(|e| {
                debug!(symbol = %symbol, error = %e, "Unreadable state document; starting fresh");
                None
            })
            .unwrap_or_default();
        f(&mut state);
        state.last_saved = now;
        self.save(symbol, &state)
    }

    /// Delete documents whose last save is beyond the longest retention.
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let max_retention = Interval::ALL
            .iter()
            .map(|i| i.retention_ms())
            .max()
            .unwrap_or(0);
        let mut purged = 0usize;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(json) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<PersistedSymbolState>(&json) else {
                // Unparseable document: drop it rather than carrying it forever
                let _ = fs::remove_file(&path);
                purged += 1;
                continue;
            };
            if now - state.last_saved > max_retention {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged expired state documents");
        }
        Ok(purged)
    }
}

/// Append-bounded per-symbol tick history used to warm-start aggregation
/// after a restart.
pub struct TickStore {
    buffers: HashMap<Symbol, VecDeque<RawTick>>,
    max_ticks: usize,
    retention_ms: i64,
}

impl TickStore {
    pub fn new(max_ticks: usize, retention_ms: i64) -> Self {
        Self {
            buffers: HashMap::new(),
            max_ticks,
            retention_ms,
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// Append to the in-memory buffer. Durable flushing is batched on a
    /// timer, never per call.
    pub fn append(&mut self, tick: RawTick) {
        let buffer = self.buffers.entry(tick.symbol.clone()).or_default();
        buffer.push_back(tick);
        while buffer.len() > self.max_ticks {
            buffer.pop_front();
        }
    }

    pub fn ticks(&self, symbol: &Symbol) -> Vec<RawTick> {
        self.buffers
            .get(symbol)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Count- and time-based eviction; invoked on every flush.
    pub fn evict(&mut self, now: i64) {
        let cutoff = now - self.retention_ms;
        for buffer in self.buffers.values_mut() {
            while buffer.front().is_some_and(|t| t.ts < cutoff) {
                buffer.pop_front();
            }
            while buffer.len() > self.max_ticks {
                buffer.pop_front();
            }
        }
        self.buffers.retain(|_, b| !b.is_empty());
    }

    /// Load persisted ticks within the retention TTL and seed the
    /// in-memory buffer. Returns the loaded ticks so the caller can
    /// replay them into the aggregator when no candle snapshot survived.
    /// Failures degrade to an empty warm start.
    pub fn warm_start(&mut self, store: &StateStore, symbol: &Symbol, now: i64) -> Vec<RawTick> {
        let ticks = match store.load(symbol, now, self.retention_ms) {
            Ok(Some(state)) => state.tick_history,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Tick warm start failed; starting empty");
                Vec::new()
            }
        };
        let buffer = self.buffers.entry(symbol.clone()).or_default();
        for tick in &ticks {
            buffer.push_back(tick.clone());
        }
        while buffer.len() > self.max_ticks {
            buffer.pop_front();
        }
        ticks
    }

    /// Batched flush of every buffer into the durable layer. Persistence
    /// errors are swallowed; the store keeps serving from memory.
    pub fn flush(&mut self, store: &StateStore, now: i64) {
        self.evict(now);
        for (symbol, buffer) in &self.buffers {
            let history: Vec<RawTick> = buffer.iter().cloned().collect();
            if let Err(e) = store.update(symbol, now, self.retention_ms, |state| {
                state.tick_history = history;
            }) {
                warn!(symbol = %symbol, error = %e, "Tick flush failed; continuing memory-only");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceSource;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("feedmux_store_{}_{}", test_name, uuid::Uuid::new_v4()))
    }

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn tick(symbol: &str, price: f64, ts: i64) -> RawTick {
        RawTick {
            ts,
            symbol: sym(symbol),
            price,
            source: PriceSource::Binance,
        }
    }

    fn candle(bucket_start: i64, close: f64) -> Candle {
        Candle {
            bucket_start,
            open: close,
            high: close,
            low: close,
            close,
            tick_count: 1,
            source: PriceSource::Binance,
        }
    }

    #[test]
    fn state_roundtrip() {
        let dir = temp_data_dir("roundtrip");
        let store = StateStore::new(&dir).unwrap();
        let now = 1_700_000_000_000;

        let mut state = PersistedSymbolState::default();
        state
            .candles
            .insert(Interval::Min1, vec![candle(now - 60_000, 100.0)]);
        state.tick_history.push(tick("BTC", 100.0, now));
        state.last_saved = now;
        store.save(&sym("BTC"), &state).unwrap();

        let loaded = store
            .load(&sym("BTC"), now, 24 * 3_600_000)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.candles[&Interval::Min1].len(), 1);
        assert_eq!(loaded.tick_history.len(), 1);
        assert_eq!(loaded.last_saved, now);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_filters_expired_entries_per_interval() {
        let dir = temp_data_dir("ttl");
        let store = StateStore::new(&dir).unwrap();
        let now = 1_700_000_000_000;

        let mut state = PersistedSymbolState::default();
        // One fresh and one beyond the 1m retention (2h)
        state.candles.insert(
            Interval::Min1,
            vec![
                candle(now - Interval::Min1.retention_ms() - 60_000, 90.0),
                candle(now - 60_000, 100.0),
            ],
        );
        // Daily retention is 30d, so this one survives
        state
            .candles
            .insert(Interval::Day1, vec![candle(now - 5 * 86_400_000, 95.0)]);
        state.tick_history = vec![
            tick("BTC", 90.0, now - 25 * 3_600_000),
            tick("BTC", 100.0, now - 1_000),
        ];
        state.last_saved = now;
        store.save(&sym("BTC"), &state).unwrap();

        let loaded = store
            .load(&sym("BTC"), now, 24 * 3_600_000)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.candles[&Interval::Min1].len(), 1);
        assert_eq!(loaded.candles[&Interval::Min1][0].close, 100.0);
        assert_eq!(loaded.candles[&Interval::Day1].len(), 1);
        assert_eq!(loaded.tick_history.len(), 1);
        assert_eq!(loaded.tick_history[0].price, 100.0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn purge_expired_removes_old_documents() {
        let dir = temp_data_dir("purge");
        let store = StateStore::new(&dir).unwrap();
        let now = 1_700_000_000_000;

        let old = PersistedSymbolState {
            last_saved: now - 31 * 86_400_000,
            ..Default::default()
        };
        let fresh = PersistedSymbolState {
            last_saved: now - 1_000,
            ..Default::default()
        };
        store.save(&sym("OLD"), &old).unwrap();
        store.save(&sym("NEW"), &fresh).unwrap();

        let purged = store.purge_expired(now).unwrap();
        assert_eq!(purged, 1);
        assert!(store.load(&sym("OLD"), now, 1).unwrap().is_none());
        assert!(store.load(&sym("NEW"), now, 1).unwrap().is_some());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn tick_buffer_is_count_bounded() {
        let mut ticks = TickStore::new(5, 24 * 3_600_000);
        for i in 0..8 {
            ticks.append(tick("BTC", 100.0 + i as f64, 1_000 + i));
        }
        let remaining = ticks.ticks(&sym("BTC"));
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].price, 103.0);
    }

    #[test]
    fn evict_is_time_and_count_based() {
        let mut ticks = TickStore::new(100, 10_000);
        let now = 1_700_000_000_000;
        ticks.append(tick("BTC", 90.0, now - 20_000));
        ticks.append(tick("BTC", 100.0, now - 1_000));
        ticks.evict(now);
        let remaining = ticks.ticks(&sym("BTC"));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].price, 100.0);
    }

    #[test]
    fn flush_then_warm_start_roundtrip() {
        let dir = temp_data_dir("warm");
        let store = StateStore::new(&dir).unwrap();
        let now = 1_700_000_000_000;

        let mut ticks = TickStore::new(100, 24 * 3_600_000);
        ticks.append(tick("BTC", 100.0, now - 2_000));
        ticks.append(tick("BTC", 101.0, now - 1_000));
        ticks.flush(&store, now);

        let mut restarted = TickStore::new(100, 24 * 3_600_000);
        let loaded = restarted.warm_start(&store, &sym("BTC"), now);
        assert_eq!(loaded.len(), 2);
        assert_eq!(restarted.ticks(&sym("BTC")).len(), 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn persistence_failure_is_swallowed() {
        let dir = temp_data_dir("failure");
        let store = StateStore::new(&dir).unwrap();
        // Occupy the document path with a directory so writes must fail
        fs::create_dir_all(dir.join("state").join("BTC.json")).unwrap();

        let now = 1_700_000_000_000;
        let mut ticks = TickStore::new(100, 24 * 3_600_000);
        ticks.append(tick("BTC", 100.0, now));
        // Must not panic or propagate; memory stays intact
        ticks.flush(&store, now);
        assert_eq!(ticks.ticks(&sym("BTC")).len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }
}
