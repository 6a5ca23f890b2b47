//! End-to-end pipeline tests: scripted drivers through the multiplexer
//! into the aggregator and tick store, plus a restart warm-start cycle.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use feedmux::analysis::{analyze_timeframe, AnalysisConfig};
use feedmux::feed::driver::{ConnectionDriver, SourceEvent};
use feedmux::feed::{DriverFactory, FeedConfig, FeedMultiplexer};
use feedmux::ohlc::{CandleSnapshot, OhlcAggregator};
use feedmux::store::{StateStore, TickStore};
use feedmux::types::{bucket_start, now_ms, Interval, PriceSource, RawTick, Symbol};

fn sym(s: &str) -> Symbol {
    Symbol::new(s).unwrap()
}

fn temp_data_dir(test_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "feedmux_pipeline_{}_{}",
        test_name,
        uuid::Uuid::new_v4()
    ))
}

struct ScriptedDriver {
    source: PriceSource,
    ticks: Vec<RawTick>,
}

#[async_trait]
impl ConnectionDriver for ScriptedDriver {
    fn source(&self) -> PriceSource {
        self.source
    }

    fn covers(&self, _symbol: &Symbol) -> bool {
        true
    }

    async fn run(self: Box<Self>, _symbols: Vec<Symbol>, tx: mpsc::Sender<SourceEvent>) {
        let _ = tx.send(SourceEvent::Connected(self.source)).await;
        for tick in self.ticks.clone() {
            let _ = tx.send(SourceEvent::Tick(tick)).await;
        }
        std::future::pending::<()>().await;
    }
}

fn scripted_factory(scripts: Vec<(PriceSource, Vec<RawTick>)>) -> DriverFactory {
    Box::new(move || {
        scripts
            .iter()
            .map(|(source, ticks)| {
                Box::new(ScriptedDriver {
                    source: *source,
                    ticks: ticks.clone(),
                }) as Box<dyn ConnectionDriver>
            })
            .collect()
    })
}

fn tick(symbol: &str, price: f64, source: PriceSource, ts: i64) -> RawTick {
    RawTick {
        ts,
        symbol: sym(symbol),
        price,
        source,
    }
}

#[tokio::test]
async fn ticks_flow_from_driver_to_candles() {
    // Anchor inside the current 1m bucket so nothing rolls mid-test
    let base = bucket_start(now_ms(), Interval::Min1);
    let script = vec![(
        PriceSource::Binance,
        vec![
            tick("BTC", 100.0, PriceSource::Binance, base + 1_000),
            tick("BTC", 105.0, PriceSource::Binance, base + 2_000),
            tick("BTC", 95.0, PriceSource::Binance, base + 3_000),
        ],
    )];

    let mux = FeedMultiplexer::new(FeedConfig::default(), scripted_factory(script)).unwrap();
    let mut tick_rx = mux.tick_stream();
    let subscription = mux.subscribe(&[sym("BTC")]).unwrap();

    let aggregator = Arc::new(RwLock::new(OhlcAggregator::new()));
    let tick_store = Arc::new(RwLock::new(TickStore::new(5_000, 24 * 3_600_000)));
    {
        let aggregator = Arc::clone(&aggregator);
        let tick_store = Arc::clone(&tick_store);
        tokio::spawn(async move {
            while let Ok(tick) = tick_rx.recv().await {
                aggregator.write().unwrap().process_tick(&tick);
                tick_store.write().unwrap().append(tick);
            }
        });
    }

    // Wait for the pipeline to absorb all three ticks
    let mut candles = Vec::new();
    for _ in 0..100 {
        candles = aggregator.read().unwrap().candles(&sym("BTC"), Interval::Min1);
        if candles.first().map(|c| c.tick_count) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(candles.len(), 1);
    let candle = &candles[0];
    assert_eq!(candle.bucket_start, base);
    assert_eq!(candle.open, 100.0);
    assert_eq!(candle.high, 105.0);
    assert_eq!(candle.low, 95.0);
    assert_eq!(candle.close, 95.0);
    assert_eq!(candle.tick_count, 3);

    assert_eq!(tick_store.read().unwrap().ticks(&sym("BTC")).len(), 3);

    let quote = mux.get_price(&sym("BTC")).unwrap();
    assert_eq!(quote.record.price, 95.0);
    subscription.unsubscribe();
    assert!(mux.get_price(&sym("BTC")).is_none());
}

#[tokio::test]
async fn high_priority_source_wins_eventually() {
    let now = now_ms();
    let script = vec![
        (
            PriceSource::CoinGecko,
            vec![tick("ETH", 3_050.0, PriceSource::CoinGecko, now)],
        ),
        (
            PriceSource::Binance,
            vec![tick("ETH", 3_000.0, PriceSource::Binance, now)],
        ),
    ];
    let mux = FeedMultiplexer::new(FeedConfig::default(), scripted_factory(script)).unwrap();
    let _subscription = mux.subscribe(&[sym("ETH")]).unwrap();

    // Whichever arrival order the tasks produce, the primary source ends
    // up owning the record inside the staleness window.
    let mut winner = None;
    for _ in 0..100 {
        let records = mux.source_prices(&sym("ETH"));
        if records.len() == 2 {
            winner = mux.get_price(&sym("ETH")).map(|q| q.record.source);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(winner, Some(PriceSource::Binance));
}

#[tokio::test]
async fn restart_warm_starts_from_persisted_state() {
    let dir = temp_data_dir("warm_start");
    let store = StateStore::new(&dir).unwrap();
    let symbol = sym("BTC");
    let now = now_ms();
    let base = bucket_start(now, Interval::Min1);

    // First life: aggregate a finalized candle plus an open one, flush
    {
        let mut aggregator = OhlcAggregator::new();
        let mut ticks = TickStore::new(5_000, 24 * 3_600_000);
        for t in [
            tick("BTC", 100.0, PriceSource::Binance, base - 60_000),
            tick("BTC", 102.0, PriceSource::Binance, base - 30_000),
            tick("BTC", 101.0, PriceSource::Binance, base + 1_000),
        ] {
            aggregator.process_tick(&t);
            ticks.append(t);
        }
        ticks.flush(&store, now);
        let snapshot = aggregator.snapshot(&symbol);
        store
            .update(&symbol, now, 24 * 3_600_000, |state| {
                state.candles = snapshot.candles.clone();
                state.open_candles = snapshot.open_candles.clone();
            })
            .unwrap();
    }

    // Second life: restore the snapshot and keep aggregating in-bucket
    {
        let mut aggregator = OhlcAggregator::new();
        let mut ticks = TickStore::new(5_000, 24 * 3_600_000);
        let loaded = ticks.warm_start(&store, &symbol, now);
        assert_eq!(loaded.len(), 3);

        let state = store.load(&symbol, now, 24 * 3_600_000).unwrap().unwrap();
        aggregator.restore(&symbol, CandleSnapshot::from_persisted(&state), now);

        let completed = aggregator.completed_candles(&symbol, Interval::Min1);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].open, 100.0);
        assert_eq!(completed[0].close, 102.0);

        // The open candle resumed; a new tick keeps mutating it
        aggregator.process_tick(&tick("BTC", 99.0, PriceSource::Binance, base + 2_000));
        let candles = aggregator.candles(&symbol, Interval::Min1);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].tick_count, 2);
        assert_eq!(candles[1].low, 99.0);
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tick_replay_rebuilds_candles_without_snapshot() {
    let dir = temp_data_dir("tick_replay");
    let store = StateStore::new(&dir).unwrap();
    let symbol = sym("BTC");
    let now = now_ms();
    let base = bucket_start(now, Interval::Min1);

    // First life persists only ticks (no candle snapshot survived)
    {
        let mut ticks = TickStore::new(5_000, 24 * 3_600_000);
        ticks.append(tick("BTC", 100.0, PriceSource::Binance, base - 120_000));
        ticks.append(tick("BTC", 104.0, PriceSource::Binance, base - 60_000));
        ticks.flush(&store, now);
    }

    // Second life replays them through a fresh aggregator
    {
        let mut aggregator = OhlcAggregator::new();
        let mut ticks = TickStore::new(5_000, 24 * 3_600_000);
        for t in ticks.warm_start(&store, &symbol, now) {
            aggregator.process_tick(&t);
        }
        let candles = aggregator.candles(&symbol, Interval::Min1);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 100.0);
        assert_eq!(candles[1].close, 104.0);
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn analysis_runs_over_aggregated_candles() {
    let mut aggregator = OhlcAggregator::new();
    let base = 1_700_000_040_000i64;
    // 30 one-minute buckets of steadily rising prices
    for i in 0..30i64 {
        aggregator.process_tick(&tick(
            "BTC",
            100.0 + i as f64,
            PriceSource::Binance,
            base + i * 60_000,
        ));
    }

    let completed = aggregator.completed_candles(&sym("BTC"), Interval::Min1);
    assert_eq!(completed.len(), 29);

    let analysis =
        analyze_timeframe(Interval::Min1, &completed, &AnalysisConfig::default()).unwrap();
    assert_eq!(analysis.trend, feedmux::analysis::Trend::Bullish);
    assert!(analysis.trend_strength > 50.0);
    assert!(analysis.ema_fast > analysis.ema_slow);
    // single-tick candles: low == close of the first completed candle
    assert_eq!(analysis.support, 100.0);
    assert_eq!(analysis.resistance, 128.0);
}
