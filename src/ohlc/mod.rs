//! OHLC aggregator - buckets the tick stream into candles
//!
//! Each tick is applied to all six interval granularities independently.
//! History is immutable once finalized: late ticks are dropped, never
//! reopened. The aggregator is the single writer of candle state; readers
//! get cloned snapshots.

use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::store::PersistedSymbolState;
use crate::types::{bucket_start, Candle, Interval, RawTick, Symbol};

/// Per-symbol candle snapshot for persistence.
#[derive(Debug, Clone, Default)]
pub struct CandleSnapshot {
    pub candles: BTreeMap<Interval, Vec<Candle>>,
    pub open_candles: BTreeMap<Interval, Candle>,
}

impl CandleSnapshot {
    pub fn from_persisted(state: &PersistedSymbolState) -> Self {
        Self {
            candles: state.candles.clone(),
            open_candles: state.open_candles.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct IntervalSeries {
    open: Option<Candle>,
    history: VecDeque<Candle>,
}

pub struct OhlcAggregator {
    series: HashMap<(Symbol, Interval), IntervalSeries>,
    late_dropped: u64,
}

impl Default for OhlcAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl OhlcAggregator {
    pub fn new() -> Self {
        Self {
            series: HashMap::new(),
            late_dropped: 0,
        }
    }

    /// Apply one tick to every interval. Per interval this either updates
    /// the open candle, finalizes it and opens the next bucket, or drops
    /// the tick as late.
    pub fn process_tick(&mut self, tick: &RawTick) {
        for interval in Interval::ALL {
            self.apply(tick, interval);
        }
    }

    fn apply(&mut self, tick: &RawTick, interval: Interval) {
        let bs = bucket_start(tick.ts, interval);
        let series = self
            .series
            .entry((tick.symbol.clone(), interval))
            .or_default();

        match series.open.as_ref().map(|open| open.bucket_start) {
            Some(open_bucket) if bs == open_bucket => {
                if let Some(open) = series.open.as_mut() {
                    open.apply(tick.price, tick.source);
                }
            }
            Some(open_bucket) if bs > open_bucket => {
                if let Some(finalized) = series.open.take() {
                    push_history(&mut series.history, finalized, interval.max_history());
                }
                series.open = Some(Candle::from_tick(bs, tick));
            }
            Some(_) => {
                // Earlier bucket than the open candle: history stays immutable
                self.late_dropped += 1;
                debug!(symbol = %tick.symbol, interval = %interval, ts = tick.ts, "Dropped late tick");
            }
            None => {
                let already_finalized = series
                    .history
                    .back()
                    .is_some_and(|last| bs <= last.bucket_start);
                if already_finalized {
                    self.late_dropped += 1;
                    debug!(symbol = %tick.symbol, interval = %interval, ts = tick.ts, "Dropped replayed tick");
                } else {
                    series.open = Some(Candle::from_tick(bs, tick));
                }
            }
        }
    }

    /// Finalize open candles whose bucket window has elapsed with no new
    /// tick. Returns the number of candles finalized.
    pub fn roll_open(&mut self, now: i64) -> usize {
        let mut rolled = 0usize;
        for ((_, interval), series) in self.series.iter_mut() {
            let elapsed = series
                .open
                .as_ref()
                .is_some_and(|open| open.bucket_start + interval.duration_ms() <= now);
            if elapsed {
                if let Some(open) = series.open.take() {
                    push_history(&mut series.history, open, interval.max_history());
                    rolled += 1;
                }
            }
        }
        rolled
    }

    /// Finalized history plus the open candle appended as the most recent
    /// (possibly still-mutating) entry; oldest first.
    pub fn candles(&self, symbol: &Symbol, interval: Interval) -> Vec<Candle> {
        let Some(series) = self.series.get(&(symbol.clone(), interval)) else {
            return Vec::new();
        };
        let mut out: Vec<Candle> = series.history.iter().cloned().collect();
        if let Some(open) = &series.open {
            out.push(open.clone());
        }
        out
    }

    /// History only, for analyses that must not react to a forming candle.
    pub fn completed_candles(&self, symbol: &Symbol, interval: Interval) -> Vec<Candle> {
        self.series
            .get(&(symbol.clone(), interval))
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Merge backfilled candles beneath live data. Live entries win on
    /// bucket collision; nothing newer than the open candle is accepted.
    pub fn seed_history(&mut self, symbol: &Symbol, interval: Interval, candles: Vec<Candle>) {
        let series = self.series.entry((symbol.clone(), interval)).or_default();
        let mut merged: BTreeMap<i64, Candle> = series
            .history
            .drain(..)
            .map(|c| (c.bucket_start, c))
            .collect();
        for candle in candles {
            if let Some(open) = &series.open {
                if candle.bucket_start >= open.bucket_start {
                    continue;
                }
            }
            merged.entry(candle.bucket_start).or_insert(candle);
        }
        series.history = merged.into_values().collect();
        while series.history.len() > interval.max_history() {
            series.history.pop_front();
        }
    }

    /// Per-symbol snapshot for the periodic persistence flush.
    pub fn snapshot(&self, symbol: &Symbol) -> CandleSnapshot {
        let mut snapshot = CandleSnapshot::default();
        for interval in Interval::ALL {
            if let Some(series) = self.series.get(&(symbol.clone(), interval)) {
                if !series.history.is_empty() {
                    snapshot
                        .candles
                        .insert(interval, series.history.iter().cloned().collect());
                }
                if let Some(open) = &series.open {
                    snapshot.open_candles.insert(interval, open.clone());
                }
            }
        }
        snapshot
    }

    /// Restore a persisted snapshot. An in-progress candle is resumed if
    /// its bucket window still contains `now`, otherwise finalized
    /// immediately.
    pub fn restore(&mut self, symbol: &Symbol, snapshot: CandleSnapshot, now: i64) {
        for interval in Interval::ALL {
            let history = snapshot.candles.get(&interval).cloned().unwrap_or_default();
            let open = snapshot.open_candles.get(&interval).cloned();
            if history.is_empty() && open.is_none() {
                continue;
            }

            let series = self.series.entry((symbol.clone(), interval)).or_default();
            let mut sorted = history;
            sorted.sort_by_key(|c| c.bucket_start);
            series.history = sorted.into_iter().collect();

            if let Some(open) = open {
                let window_end = open.bucket_start + interval.duration_ms();
                if open.bucket_start <= now && now < window_end {
                    series.open = Some(open);
                } else if window_end <= now {
                    push_history(&mut series.history, open, interval.max_history());
                }
            }
            while series.history.len() > interval.max_history() {
                series.history.pop_front();
            }
        }
    }

    /// Whether any candle state exists for the symbol (used to decide
    /// between snapshot restore and tick replay at warm start).
    pub fn has_data(&self, symbol: &Symbol) -> bool {
        Interval::ALL.iter().any(|interval| {
            self.series
                .get(&(symbol.clone(), *interval))
                .map(|s| s.open.is_some() || !s.history.is_empty())
                .unwrap_or(false)
        })
    }
}

fn push_history(history: &mut VecDeque<Candle>, candle: Candle, cap: usize) {
    history.push_back(candle);
    while history.len() > cap {
        history.pop_front();
    }
}
