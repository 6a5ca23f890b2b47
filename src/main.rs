//! FeedMux composition root
//!
//! Wires config -> state store -> multiplexer -> pipeline -> analysis and
//! owns every periodic timer. All mutable state is written by exactly one
//! task; everything else reads snapshots.

use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use feedmux::analysis::backfill::BinanceBackfill;
use feedmux::analysis::{AnalysisConfig, AnalysisEngine};
use feedmux::config::AppConfig;
use feedmux::feed::{sources, DriverFactory, FeedConfig, FeedMultiplexer};
use feedmux::monitor::CrossValidationMonitor;
use feedmux::ohlc::{CandleSnapshot, OhlcAggregator};
use feedmux::store::{StateStore, TickStore};
use feedmux::types::{now_ms, Symbol};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = AppConfig::load()?;
    info!(config = %cfg.digest(), "🚀 Starting feedmux");
    let symbols = cfg.symbols()?;

    // Durable layer: an unusable data dir is a configuration error
    let store = Arc::new(StateStore::new(&cfg.app.data_dir)?);
    let aggregator = Arc::new(RwLock::new(OhlcAggregator::new()));
    let tick_store = Arc::new(RwLock::new(TickStore::new(
        cfg.store.max_ticks,
        cfg.store.tick_retention_ms(),
    )));

    warm_start(&cfg, &store, &aggregator, &tick_store, &symbols);

    // Feed multiplexer and its driver roster
    let sources_cfg = cfg.sources.clone();
    let backoff = cfg.backoff.settings();
    let factory: DriverFactory = Box::new(move || sources::build_drivers(&sources_cfg, backoff));
    let mux = FeedMultiplexer::new(
        FeedConfig {
            staleness_ms: cfg.feed.staleness_ms,
            record_ttl_ms: cfg.feed.record_ttl_ms(),
        },
        factory,
    )?;
    let mut tick_rx = mux.tick_stream();
    let subscription = mux.subscribe(&symbols)?;

    // Pipeline task: sole writer of the aggregator and tick store
    {
        let aggregator = Arc::clone(&aggregator);
        let tick_store = Arc::clone(&tick_store);
        tokio::spawn(async move {
            loop {
                match tick_rx.recv().await {
                    Ok(tick) => {
                        aggregator.write().unwrap().process_tick(&tick);
                        tick_store.write().unwrap().append(tick);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tick pipeline lagged; ticks skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Wall-clock candle roll
    {
        let aggregator = Arc::clone(&aggregator);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(1));
            loop {
                timer.tick().await;
                aggregator.write().unwrap().roll_open(now_ms());
            }
        });
    }

    // Candle snapshot flush
    {
        let aggregator = Arc::clone(&aggregator);
        let store = Arc::clone(&store);
        let symbols = symbols.clone();
        let tick_retention_ms = cfg.store.tick_retention_ms();
        let period = Duration::from_secs(cfg.store.flush_candles_secs);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                flush_candles(&store, &aggregator, &symbols, tick_retention_ms);
            }
        });
    }

    // Tick history flush + eviction + state purge
    {
        let tick_store = Arc::clone(&tick_store);
        let store = Arc::clone(&store);
        let period = Duration::from_secs(cfg.store.flush_ticks_secs);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                let now = now_ms();
                tick_store.write().unwrap().flush(&store, now);
                if let Err(e) = store.purge_expired(now) {
                    warn!(error = %e, "State purge failed");
                }
            }
        });
    }

    // Cross-validation monitor
    if cfg.monitor.enabled {
        let mut monitor = CrossValidationMonitor::from_config(&cfg.monitor)?;
        let mux = mux.clone();
        let symbols = symbols.clone();
        let period = Duration::from_secs(cfg.monitor.scan_interval_secs);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                monitor.scan(&mux, &symbols);
            }
        });
    }

    // Periodic multi-timeframe analysis
    {
        let mut engine = AnalysisEngine::new(AnalysisConfig {
            min_candles: cfg.analysis.min_candles,
            window: cfg.analysis.window,
            ema_fast: cfg.analysis.ema_fast,
            ema_slow: cfg.analysis.ema_slow,
            oscillator_period: cfg.analysis.oscillator_period,
        });
        if cfg.analysis.backfill_enabled {
            match BinanceBackfill::new(&cfg.sources.binance.rest_url) {
                Ok(backfill) => {
                    engine = engine.with_backfill(Arc::new(backfill), cfg.analysis.backfill_limit);
                }
                Err(e) => warn!(error = %e, "Backfill client unavailable"),
            }
        }
        let aggregator = Arc::clone(&aggregator);
        let mux = mux.clone();
        let symbols = symbols.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(60));
            loop {
                timer.tick().await;
                for symbol in &symbols {
                    if let Some(analysis) = engine.analyze(symbol, &aggregator).await {
                        info!(
                            symbol = %symbol,
                            bias = %analysis.confluence.bias,
                            strength = format!("{:.2}", analysis.confluence.strength),
                            timeframes = analysis.timeframes.len(),
                            recommendation = %analysis.confluence.recommendation,
                            "Analysis"
                        );
                    }
                }
                let health = mux.health();
                info!(
                    connected = health.connected,
                    primary = ?health.primary_source,
                    tps = health.ticks_per_second,
                    "Feed health"
                );
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down; flushing state...");

    let now = now_ms();
    tick_store.write().unwrap().flush(&store, now);
    flush_candles(&store, &aggregator, &symbols, cfg.store.tick_retention_ms());
    subscription.unsubscribe();
    info!("Bye");
    Ok(())
}

/// Restore persisted state: candle snapshots win; ticks replay through
/// the aggregator only when no snapshot survived TTL filtering.
fn warm_start(
    cfg: &AppConfig,
    store: &StateStore,
    aggregator: &RwLock<OhlcAggregator>,
    tick_store: &RwLock<TickStore>,
    symbols: &[Symbol],
) {
    let now = now_ms();
    for symbol in symbols {
        let ticks = tick_store.write().unwrap().warm_start(store, symbol, now);
        let snapshot = match store.load(symbol, now, cfg.store.tick_retention_ms()) {
            Ok(Some(state)) => Some(CandleSnapshot::from_persisted(&state)),
            Ok(None) => None,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Warm start failed; starting cold");
                None
            }
        };

        let mut agg = aggregator.write().unwrap();
        if let Some(snap) = snapshot {
            agg.restore(symbol, snap, now);
        }
        if agg.has_data(symbol) {
            info!(symbol = %symbol, ticks = ticks.len(), "Warm start from candle snapshot");
        } else if !ticks.is_empty() {
            // No snapshot survived TTL filtering: rebuild from raw ticks
            info!(symbol = %symbol, ticks = ticks.len(), "Warm start by tick replay");
            for tick in &ticks {
                agg.process_tick(tick);
            }
        }
    }
}

fn flush_candles(
    store: &StateStore,
    aggregator: &RwLock<OhlcAggregator>,
    symbols: &[Symbol],
    tick_retention_ms: i64,
) {
    let now = now_ms();
    for symbol in symbols {
        let snapshot = aggregator.read().unwrap().snapshot(symbol);
        if snapshot.candles.is_empty() && snapshot.open_candles.is_empty() {
            continue;
        }
        if let Err(e) = store.update(symbol, now, tick_retention_ms, |state| {
            state.candles = snapshot.candles.clone();
            state.open_candles = snapshot.open_candles.clone();
        }) {
            warn!(symbol = %symbol, error = %e, "Candle flush failed; continuing memory-only");
        }
    }
}
