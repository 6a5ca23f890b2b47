//! Feed multiplexer - single point of truth for "current price of X"
//!
//! Owns one connection driver per upstream source, merges their events
//! into a latest-price table with priority + staleness arbitration, and
//! re-broadcasts applied ticks to the aggregation pipeline. Lifecycle is
//! reference-counted: the first subscription starts the drivers, the last
//! unsubscribe tears everything down.

pub mod driver;
pub mod sources;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::types::{
    now_ms, ConnectionState, ConnectionStatus, PriceQuote, PriceRecord, PriceSource, RawTick,
    Symbol,
};
use driver::{ConnectionDriver, SourceEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const TICK_BROADCAST_CAPACITY: usize = 1024;
const TICK_RATE_WINDOW_MS: i64 = 1_000;

/// Fatal multiplexer configuration errors. Everything else is absorbed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no price source is enabled; enable at least one under [sources]")]
    NoSourcesEnabled,
    #[error("no enabled source covers symbol {0}")]
    UncoveredSymbol(Symbol),
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Age after which a lower-priority source may take over (ms)
    pub staleness_ms: i64,
    /// Age after which a last-known record is no longer served (ms)
    pub record_ttl_ms: i64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            staleness_ms: 5_000,
            record_ttl_ms: 24 * 3_600_000,
        }
    }
}

/// Connection/health telemetry for downstream display.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedHealth {
    pub connected: bool,
    pub primary_source: Option<PriceSource>,
    pub ticks_per_second: usize,
}

pub type DriverFactory = Box<dyn Fn() -> Vec<Box<dyn ConnectionDriver>> + Send + Sync>;

struct MuxRuntime {
    subscribers: usize,
    roster: BTreeSet<Symbol>,
    event_tx: Option<mpsc::Sender<SourceEvent>>,
    driver_tasks: Vec<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
}

struct MuxInner {
    cfg: FeedConfig,
    factory: DriverFactory,
    /// Authoritative latest price per symbol
    prices: RwLock<HashMap<Symbol, PriceRecord>>,
    /// Latest price per (source, symbol), for cross-validation and demotion
    per_source: RwLock<HashMap<PriceSource, HashMap<Symbol, PriceRecord>>>,
    states: RwLock<HashMap<PriceSource, ConnectionState>>,
    /// Timestamps of applied ticks within the last second
    tick_window: Mutex<VecDeque<i64>>,
    tick_tx: broadcast::Sender<RawTick>,
    runtime: Mutex<MuxRuntime>,
}

/// Cheaply cloneable handle to the process-wide feed service.
#[derive(Clone)]
pub struct FeedMultiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for FeedMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedMultiplexer").finish_non_exhaustive()
    }
}

/// Reference-counted subscription. Dropping (or calling `unsubscribe`)
/// releases the reference; the last release stops all drivers and clears
/// internal state.
pub struct SubscriptionHandle {
    inner: Arc<MuxInner>,
    released: bool,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut rt = self.inner.runtime.lock().unwrap();
        rt.subscribers = rt.subscribers.saturating_sub(1);
        if rt.subscribers == 0 {
            self.inner.teardown_locked(&mut rt);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl FeedMultiplexer {
    /// Construct the service. Fatal if the factory yields no drivers.
    pub fn new(cfg: FeedConfig, factory: DriverFactory) -> Result<Self, FeedError> {
        if factory().is_empty() {
            return Err(FeedError::NoSourcesEnabled);
        }
        let (tick_tx, _) = broadcast::channel(TICK_BROADCAST_CAPACITY);
        Ok(Self {
            inner: Arc::new(MuxInner {
                cfg,
                factory,
                prices: RwLock::new(HashMap::new()),
                per_source: RwLock::new(HashMap::new()),
                states: RwLock::new(HashMap::new()),
                tick_window: Mutex::new(VecDeque::new()),
                tick_tx,
                runtime: Mutex::new(MuxRuntime {
                    subscribers: 0,
                    roster: BTreeSet::new(),
                    event_tx: None,
                    driver_tasks: Vec::new(),
                    pump_task: None,
                }),
            }),
        })
    }

    /// Register interest in a set of symbols. The first live subscription
    /// starts the drivers; widening the roster restarts them with the
    /// union of all subscribed symbols.
    pub fn subscribe(&self, symbols: &[Symbol]) -> Result<SubscriptionHandle, FeedError> {
        let drivers = (self.inner.factory)();
        for symbol in symbols {
            if !drivers.iter().any(|d| d.covers(symbol)) {
                return Err(FeedError::UncoveredSymbol(symbol.clone()));
            }
        }

        let mut rt = self.inner.runtime.lock().unwrap();
        rt.subscribers += 1;
        let before = rt.roster.len();
        rt.roster.extend(symbols.iter().cloned());
        let roster_grew = rt.roster.len() > before;

        if rt.pump_task.is_none() {
            MuxInner::start_locked(&self.inner, &mut rt, drivers);
        } else if roster_grew {
            info!(
                roster = rt.roster.len(),
                "Symbol roster widened; restarting drivers"
            );
            MuxInner::restart_drivers_locked(&self.inner, &mut rt, drivers);
        }

        Ok(SubscriptionHandle {
            inner: Arc::clone(&self.inner),
            released: false,
        })
    }

    /// O(1) lookup of the authoritative price; never blocks on I/O.
    /// Records older than the record TTL are treated as absent; records
    /// older than the staleness threshold are flagged stale.
    pub fn get_price(&self, symbol: &Symbol) -> Option<PriceQuote> {
        let now = now_ms();
        let prices = self.inner.prices.read().unwrap();
        let record = prices.get(symbol)?;
        if record.age_ms(now) > self.inner.cfg.record_ttl_ms {
            return None;
        }
        Some(PriceQuote {
            record: record.clone(),
            stale: record.is_stale(now, self.inner.cfg.staleness_ms),
        })
    }

    /// Snapshot of all known symbols, ordered by symbol.
    pub fn get_all(&self) -> Vec<PriceQuote> {
        let now = now_ms();
        let prices = self.inner.prices.read().unwrap();
        let mut quotes: Vec<PriceQuote> = prices
            .values()
            .filter(|r| r.age_ms(now) <= self.inner.cfg.record_ttl_ms)
            .map(|r| PriceQuote {
                record: r.clone(),
                stale: r.is_stale(now, self.inner.cfg.staleness_ms),
            })
            .collect();
        quotes.sort_by(|a, b| a.record.symbol.cmp(&b.record.symbol));
        quotes
    }

    /// Latest per-source records for a symbol, highest priority first.
    /// Read by the cross-validation monitor; never includes TTL-expired
    /// records.
    pub fn source_prices(&self, symbol: &Symbol) -> Vec<PriceRecord> {
        let now = now_ms();
        let per_source = self.inner.per_source.read().unwrap();
        let mut records: Vec<PriceRecord> = PriceSource::ALL
            .iter()
            .filter_map(|source| per_source.get(source).and_then(|m| m.get(symbol)))
            .filter(|r| r.age_ms(now) <= self.inner.cfg.record_ttl_ms)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.source.priority().cmp(&a.source.priority()));
        records
    }

    pub fn connection_states(&self) -> Vec<ConnectionState> {
        let states = self.inner.states.read().unwrap();
        let mut list: Vec<ConnectionState> = states.values().cloned().collect();
        list.sort_by(|a, b| b.source.priority().cmp(&a.source.priority()));
        list
    }

    pub fn health(&self) -> FeedHealth {
        let states = self.inner.states.read().unwrap();
        let primary_source = states
            .values()
            .filter(|s| s.status == ConnectionStatus::Connected)
            .map(|s| s.source)
            .max_by_key(|s| s.priority());

        let now = now_ms();
        let mut window = self.inner.tick_window.lock().unwrap();
        while window
            .front()
            .is_some_and(|ts| now - *ts > TICK_RATE_WINDOW_MS)
        {
            window.pop_front();
        }

        FeedHealth {
            connected: primary_source.is_some(),
            primary_source,
            ticks_per_second: window.len(),
        }
    }

    /// Stream of applied (arbitration-winning) ticks for the pipeline.
    pub fn tick_stream(&self) -> broadcast::Receiver<RawTick> {
        self.inner.tick_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.runtime.lock().unwrap().subscribers
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().unwrap().pump_task.is_some()
    }

    #[cfg(test)]
    fn apply_tick_at(&self, tick: RawTick, now: i64) -> bool {
        self.inner.apply_tick_at(tick, now)
    }
}

impl MuxInner {
    fn start_locked(
        inner: &Arc<MuxInner>,
        rt: &mut MuxRuntime,
        drivers: Vec<Box<dyn ConnectionDriver>>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        rt.event_tx = Some(event_tx.clone());

        let pump_inner = Arc::clone(inner);
        rt.pump_task = Some(tokio::spawn(async move {
            pump_inner.pump(event_rx).await;
        }));

        inner.spawn_drivers_locked(rt, drivers, event_tx);
        info!(roster = rt.roster.len(), "Feed multiplexer started");
    }

    fn restart_drivers_locked(
        inner: &Arc<MuxInner>,
        rt: &mut MuxRuntime,
        drivers: Vec<Box<dyn ConnectionDriver>>,
    ) {
        for task in rt.driver_tasks.drain(..) {
            task.abort();
        }
        let Some(event_tx) = rt.event_tx.clone() else {
            return;
        };
        inner.spawn_drivers_locked(rt, drivers, event_tx);
    }

    fn spawn_drivers_locked(
        &self,
        rt: &mut MuxRuntime,
        drivers: Vec<Box<dyn ConnectionDriver>>,
        event_tx: mpsc::Sender<SourceEvent>,
    ) {
        for driver in drivers {
            let source = driver.source();
            let symbols: Vec<Symbol> = rt
                .roster
                .iter()
                .filter(|s| driver.covers(s))
                .cloned()
                .collect();
            if symbols.is_empty() {
                continue;
            }
            self.states
                .write()
                .unwrap()
                .insert(source, ConnectionState::new(source));
            let tx = event_tx.clone();
            rt.driver_tasks
                .push(tokio::spawn(async move { driver.run(symbols, tx).await }));
        }
    }

    /// Full teardown: abort every task and clear all shared state.
    fn teardown_locked(&self, rt: &mut MuxRuntime) {
        for task in rt.driver_tasks.drain(..) {
            task.abort();
        }
        if let Some(pump) = rt.pump_task.take() {
            pump.abort();
        }
        rt.event_tx = None;
        rt.roster.clear();
        self.prices.write().unwrap().clear();
        self.per_source.write().unwrap().clear();
        self.states.write().unwrap().clear();
        self.tick_window.lock().unwrap().clear();
        info!("Last subscriber left; feed multiplexer torn down");
    }

    /// Single-writer event pump: the only task that mutates the price
    /// tables, connection states and tick-rate counter.
    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<SourceEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SourceEvent::Tick(tick) => {
                    self.apply_tick_at(tick, now_ms());
                }
                SourceEvent::Connecting(source) => {
                    self.update_state(source, |s| {
                        s.status = ConnectionStatus::Connecting;
                        s.reconnect_attempt += 1;
                    });
                }
                SourceEvent::Connected(source) => {
                    self.update_state(source, |s| {
                        s.status = ConnectionStatus::Connected;
                        s.reconnect_attempt = 0;
                        s.last_error = None;
                    });
                }
                SourceEvent::Disconnected(source) => {
                    self.update_state(source, |s| s.status = ConnectionStatus::Disconnected);
                }
                SourceEvent::Error(source, error) => {
                    self.update_state(source, |s| s.last_error = Some(error.clone()));
                }
                SourceEvent::Failed(source, error) => {
                    warn!(
                        source = %source,
                        error = %error,
                        "Source failed terminally; symbols demote to lower-priority sources"
                    );
                    self.update_state(source, |s| {
                        s.status = ConnectionStatus::Degraded;
                        s.last_error = Some(error.clone());
                    });
                }
            }
        }
    }

    fn update_state(&self, source: PriceSource, f: impl FnOnce(&mut ConnectionState)) {
        let mut states = self.states.write().unwrap();
        let state = states
            .entry(source)
            .or_insert_with(|| ConnectionState::new(source));
        f(state);
    }

    /// Arbitration: apply iff no record exists, the tick's source has
    /// equal-or-higher priority, or the incumbent has gone stale. Ties
    /// between equal priorities are last-writer-wins.
    fn apply_tick_at(&self, tick: RawTick, now: i64) -> bool {
        let applied = {
            let mut prices = self.prices.write().unwrap();
            let apply = match prices.get(&tick.symbol) {
                None => true,
                Some(current) => {
                    tick.source.priority() >= current.source.priority()
                        || current.is_stale(now, self.cfg.staleness_ms)
                }
            };
            if apply {
                prices.insert(tick.symbol.clone(), PriceRecord::from_tick(&tick));
            }
            apply
        };

        self.per_source
            .write()
            .unwrap()
            .entry(tick.source)
            .or_default()
            .insert(tick.symbol.clone(), PriceRecord::from_tick(&tick));

        if applied {
            let mut window = self.tick_window.lock().unwrap();
            window.push_back(now);
            while window
                .front()
                .is_some_and(|ts| now - *ts > TICK_RATE_WINDOW_MS)
            {
                window.pop_front();
            }
            drop(window);
            let _ = self.tick_tx.send(tick);
        }
        applied
    }
}
