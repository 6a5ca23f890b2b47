//! Multi-timeframe technical analysis
//!
//! Pure computation over completed candle series: trend classification,
//! trend strength, swing structure, moving averages, a bounded
//! oscillator, volume trend and support/resistance per timeframe, plus a
//! cross-timeframe confluence verdict. A timeframe with too few candles
//! is withheld rather than fabricated.

pub mod backfill;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::ohlc::OhlcAggregator;
use crate::types::{now_ms, Candle, Interval, Symbol};
use backfill::HistoricalCandles;

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub min_candles: usize,
    pub window: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub oscillator_period: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_candles: 20,
            window: 50,
            ema_fast: 9,
            ema_slow: 21,
            oscillator_period: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bullish => write!(f, "bullish"),
            Trend::Bearish => write!(f, "bearish"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Swing-structure flags comparing the two most recent swing points of
/// each type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwingStructure {
    pub higher_highs: bool,
    pub higher_lows: bool,
    pub lower_highs: bool,
    pub lower_lows: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeAnalysis {
    pub interval: Interval,
    pub trend: Trend,
    /// 0-100, displacement combined with directional consistency
    pub trend_strength: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    /// 0-100 Wilder-style oscillator
    pub oscillator: f64,
    pub swings: SwingStructure,
    pub support: f64,
    pub resistance: f64,
    pub volume_trend: VolumeTrend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceVerdict {
    pub bias: Trend,
    /// Majority share among timeframes with a valid analysis
    pub strength: f64,
    pub aligned: usize,
    pub total: usize,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTimeframeAnalysis {
    pub symbol: Symbol,
    pub ts: i64,
    /// Only timeframes with enough candles appear here; partial results
    /// are expected while the feed warms up.
    pub timeframes: BTreeMap<Interval, TimeframeAnalysis>,
    pub confluence: ConfluenceVerdict,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Bullish if the second-half mean exceeds the first-half mean by more
/// than 1%, bearish if it trails by more than 1%, else neutral.
fn classify_trend(closes: &[f64]) -> Trend {
    let half = closes.len() / 2;
    let first = mean(&closes[..half]);
    let second = mean(&closes[half..]);
    if first <= 0.0 {
        return Trend::Neutral;
    }
    let change = (second - first) / first;
    if change > 0.01 {
        Trend::Bullish
    } else if change < -0.01 {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// 0-100: half from total percentage displacement (saturating at 10%),
/// half from the fraction of consecutive moves agreeing with the overall
/// direction.
fn trend_strength(closes: &[f64]) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let first = closes[0];
    let last = closes[closes.len() - 1];
    if first <= 0.0 {
        return 0.0;
    }
    let displacement_pct = (last - first) / first * 100.0;
    let direction = displacement_pct.signum();

    let mut agreeing = 0usize;
    let mut moves = 0usize;
    for pair in closes.windows(2) {
        let delta = pair[1] - pair[0];
        if delta == 0.0 {
            continue;
        }
        moves += 1;
        if delta.signum() == direction {
            agreeing += 1;
        }
    }
    let consistency = if moves == 0 {
        0.0
    } else {
        agreeing as f64 / moves as f64
    };

    let displacement_score = (displacement_pct.abs() * 10.0).min(100.0);
    (displacement_score * 0.5 + consistency * 100.0 * 0.5).clamp(0.0, 100.0)
}

/// Exponential moving average, seeded with the first observation
/// (alpha = 2 / (period + 1)).
pub fn ema(values: &[f64], period: usize) -> f64 {
    if values.is_empty() || period == 0 {
        return 0.0;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = values[0];
    for price in &values[1..] {
        value = alpha * price + (1.0 - alpha) * value;
    }
    value
}

/// Wilder-style bounded oscillator over closes, 0-100. Defined as 100
/// when the average loss is zero.
pub fn wilder_oscillator(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in closes[..=period].windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum += -change;
        }
    }
    let w = period as f64;
    let mut avg_gain = gain_sum / w;
    let mut avg_loss = loss_sum / w;

    for pair in closes[period..].windows(2) {
        let change = pair[1] - pair[0];
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { -change } else { 0.0 };
        avg_gain = (avg_gain * (w - 1.0) + gain) / w;
        avg_loss = (avg_loss * (w - 1.0) + loss) / w;
    }

    if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// A swing high/low needs two higher/lower neighbors on each side
/// (5-candle window). Flags compare the two most recent swings of each
/// type.
fn swing_structure(candles: &[Candle]) -> SwingStructure {
    let mut swing_highs = Vec::new();
    let mut swing_lows = Vec::new();
    if candles.len() >= 5 {
        for i in 2..candles.len() - 2 {
            let high = candles[i].high;
            if high > candles[i - 1].high
                && high > candles[i - 2].high
                && high > candles[i + 1].high
                && high > candles[i + 2].high
            {
                swing_highs.push(high);
            }
            let low = candles[i].low;
            if low < candles[i - 1].low
                && low < candles[i - 2].low
                && low < candles[i + 1].low
                && low < candles[i + 2].low
            {
                swing_lows.push(low);
            }
        }
    }

    let mut swings = SwingStructure::default();
    if swing_highs.len() >= 2 {
        let prev = swing_highs[swing_highs.len() - 2];
        let last = swing_highs[swing_highs.len() - 1];
        swings.higher_highs = last > prev;
        swings.lower_highs = last < prev;
    }
    if swing_lows.len() >= 2 {
        let prev = swing_lows[swing_lows.len() - 2];
        let last = swing_lows[swing_lows.len() - 1];
        swings.higher_lows = last > prev;
        swings.lower_lows = last < prev;
    }
    swings
}

/// Volume proxy is the candle tick count: the feed carries no trade
/// sizes. Compares the mean of the last 3 candles against the first 3.
fn classify_volume(candles: &[Candle]) -> VolumeTrend {
    if candles.len() < 6 {
        return VolumeTrend::Stable;
    }
    let first: f64 = mean(
        &candles[..3]
            .iter()
            .map(|c| c.tick_count as f64)
            .collect::<Vec<_>>(),
    );
    let last: f64 = mean(
        &candles[candles.len() - 3..]
            .iter()
            .map(|c| c.tick_count as f64)
            .collect::<Vec<_>>(),
    );
    if first <= 0.0 {
        return VolumeTrend::Stable;
    }
    if last > first * 1.2 {
        VolumeTrend::Increasing
    } else if last < first * 0.8 {
        VolumeTrend::Decreasing
    } else {
        VolumeTrend::Stable
    }
}

/// Analyze one timeframe; withheld (`None`) below the minimum candle
/// count.
pub fn analyze_timeframe(
    interval: Interval,
    candles: &[Candle],
    cfg: &AnalysisConfig,
) -> Option<TimeframeAnalysis> {
    if candles.len() < cfg.min_candles {
        return None;
    }
    let window = &candles[candles.len().saturating_sub(cfg.window)..];
    let closes: Vec<f64> = window.iter().map(|c| c.close).collect();

    let support = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let resistance = window
        .iter()
        .map(|c| c.high)
        .fold(f64::NEG_INFINITY, f64::max);

    Some(TimeframeAnalysis {
        interval,
        trend: classify_trend(&closes),
        trend_strength: trend_strength(&closes),
        ema_fast: ema(&closes, cfg.ema_fast),
        ema_slow: ema(&closes, cfg.ema_slow),
        oscillator: wilder_oscillator(&closes, cfg.oscillator_period),
        swings: swing_structure(window),
        support,
        resistance,
        volume_trend: classify_volume(window),
    })
}

/// Majority vote across timeframes. Bias is bullish/bearish only when it
/// strictly outnumbers both other classes.
pub fn confluence(timeframes: &BTreeMap<Interval, TimeframeAnalysis>) -> ConfluenceVerdict {
    let total = timeframes.len();
    let bullish = timeframes
        .values()
        .filter(|a| a.trend == Trend::Bullish)
        .count();
    let bearish = timeframes
        .values()
        .filter(|a| a.trend == Trend::Bearish)
        .count();
    let neutral = total - bullish - bearish;

    let (bias, aligned) = if bullish > bearish && bullish > neutral {
        (Trend::Bullish, bullish)
    } else if bearish > bullish && bearish > neutral {
        (Trend::Bearish, bearish)
    } else {
        (Trend::Neutral, bullish.max(bearish).max(neutral))
    };
    let strength = if total == 0 {
        0.0
    } else {
        aligned as f64 / total as f64
    };

    let recommendation = match bias {
        Trend::Neutral => "Mixed signals across timeframes; no clear bias".to_string(),
        _ if aligned == total => {
            format!("Strong {} alignment across all {} timeframes", bias, total)
        }
        _ => format!(
            "{} majority ({}/{} timeframes); trade with the higher-timeframe trend",
            bias, aligned, total
        ),
    };

    ConfluenceVerdict {
        bias,
        strength,
        aligned,
        total,
        recommendation,
    }
}

/// Stateful wrapper over the pure analysis: reads completed candles from
/// the aggregator and bootstraps thin timeframes through a one-shot
/// historical backfill.
pub struct AnalysisEngine {
    cfg: AnalysisConfig,
    backfill: Option<Arc<dyn HistoricalCandles>>,
    backfill_limit: usize,
    attempted: HashSet<(Symbol, Interval)>,
}

impl AnalysisEngine {
    pub fn new(cfg: AnalysisConfig) -> Self {
        Self {
            cfg,
            backfill: None,
            backfill_limit: 100,
            attempted: HashSet::new(),
        }
    }

    pub fn with_backfill(mut self, backfill: Arc<dyn HistoricalCandles>, limit: usize) -> Self {
        self.backfill = Some(backfill);
        self.backfill_limit = limit;
        self
    }

    /// Forget which (symbol, timeframe) pairs were already backfilled;
    /// called when the symbol roster changes. Results of any in-flight
    /// fetch are seeded into the aggregator and simply superseded.
    pub fn reset_session(&mut self) {
        self.attempted.clear();
    }

    /// Multi-timeframe analysis for a symbol; `None` until at least one
    /// timeframe has enough completed candles.
    pub async fn analyze(
        &mut self,
        symbol: &Symbol,
        aggregator: &RwLock<OhlcAggregator>,
    ) -> Option<MultiTimeframeAnalysis> {
        let mut timeframes = BTreeMap::new();
        for interval in Interval::ALL {
            let mut candles = aggregator
                .read()
                .unwrap()
                .completed_candles(symbol, interval);
            if candles.len() < self.cfg.min_candles {
                if self.try_backfill(symbol, interval, aggregator).await {
                    candles = aggregator
                        .read()
                        .unwrap()
                        .completed_candles(symbol, interval);
                }
            }
            if let Some(analysis) = analyze_timeframe(interval, &candles, &self.cfg) {
                timeframes.insert(interval, analysis);
            } else {
                debug!(symbol = %symbol, interval = %interval, count = candles.len(), "Timeframe withheld: not enough candles");
            }
        }

        if timeframes.is_empty() {
            return None;
        }
        let confluence = confluence(&timeframes);
        Some(MultiTimeframeAnalysis {
            symbol: symbol.clone(),
            ts: now_ms(),
            timeframes,
            confluence,
        })
    }

    /// At most one backfill attempt per (symbol, timeframe) per session,
    /// so a failing upstream is not hammered. Returns whether new candles
    /// were seeded.
    async fn try_backfill(
        &mut self,
        symbol: &Symbol,
        interval: Interval,
        aggregator: &RwLock<OhlcAggregator>,
    ) -> bool {
        let Some(backfill) = self.backfill.clone() else {
            return false;
        };
        let key = (symbol.clone(), interval);
        if !self.attempted.insert(key) {
            return false;
        }

        match backfill.fetch(symbol, interval, self.backfill_limit).await {
            Ok(candles) if !candles.is_empty() => {
                aggregator
                    .write()
                    .unwrap()
                    .seed_history(symbol, interval, candles);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(symbol = %symbol, interval = %interval, error = %e, "Historical backfill failed; will not retry this session");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceSource;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: i64 = 1_700_000_040_000;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn candle_at(i: i64, close: f64, ticks: u64) -> Candle {
        Candle {
            bucket_start: T0 + i * 60_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            tick_count: ticks,
            source: PriceSource::Binance,
        }
    }

    fn series(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| candle_at(i as i64, *c, 10))
            .collect()
    }

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    fn falling(n: usize) -> Vec<f64> {
        (0..n).map(|i| 200.0 - i as f64).collect()
    }

    #[test]
    fn trend_classification() {
        assert_eq!(classify_trend(&rising(20)), Trend::Bullish);
        assert_eq!(classify_trend(&falling(20)), Trend::Bearish);
        assert_eq!(classify_trend(&vec![100.0; 20]), Trend::Neutral);
        // Under 1% half-to-half change stays neutral
        let drift: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.01).collect();
        assert_eq!(classify_trend(&drift), Trend::Neutral);
    }

    #[test]
    fn strength_rewards_consistent_displacement() {
        let consistent = trend_strength(&rising(20));
        // Same endpoints but choppy path
        let mut choppy = rising(20);
        for value in choppy.iter_mut().skip(1).step_by(2) {
            *value -= 3.0;
        }
        let choppy_strength = trend_strength(&choppy);
        assert!(consistent > choppy_strength);
        assert!((0.0..=100.0).contains(&consistent));
        assert!((0.0..=100.0).contains(&choppy_strength));
    }

    #[test]
    fn ema_seeds_with_first_observation() {
        // alpha = 0.5 for period 3: 10 -> 10.5 -> 11.25 -> 12.125
        let values = [10.0, 11.0, 12.0, 13.0];
        assert!((ema(&values, 3) - 12.125).abs() < 1e-10);
        assert!((ema(&values[..1], 3) - 10.0).abs() < 1e-10);
    }

    #[test]
    fn oscillator_is_100_when_average_loss_is_zero() {
        let closes = rising(20);
        assert_eq!(wilder_oscillator(&closes, 14), 100.0);
    }

    #[test]
    fn oscillator_is_bounded_and_directional() {
        let up = wilder_oscillator(&rising(30), 14);
        let down = wilder_oscillator(&falling(30), 14);
        assert!(up > 50.0 && up <= 100.0);
        assert!((0.0..50.0).contains(&down));
        // Too little data: no signal fabricated
        assert_eq!(wilder_oscillator(&rising(10), 14), 50.0);
    }

    #[test]
    fn swing_flags_compare_last_two_swings() {
        // Two peaks, the second higher; two troughs, the second higher
        let closes = [
            100.0, 101.0, 105.0, 101.0, 100.0, 99.0, 102.0, 103.0, 108.0, 103.0, 102.0,
        ];
        let candles = series(&closes);
        let swings = swing_structure(&candles);
        assert!(swings.higher_highs);
        assert!(!swings.lower_highs);

        let closes_down = [
            100.0, 101.0, 108.0, 101.0, 100.0, 99.0, 102.0, 103.0, 105.0, 103.0, 102.0,
        ];
        let swings_down = swing_structure(&series(&closes_down));
        assert!(swings_down.lower_highs);
        assert!(!swings_down.higher_highs);
    }

    #[test]
    fn volume_trend_thresholds() {
        let mut increasing = series(&rising(10));
        for (i, candle) in increasing.iter_mut().enumerate() {
            candle.tick_count = if i < 3 { 10 } else { 20 };
        }
        assert_eq!(classify_volume(&increasing), VolumeTrend::Increasing);

        let mut decreasing = series(&rising(10));
        for (i, candle) in decreasing.iter_mut().enumerate() {
            candle.tick_count = if i < 3 { 20 } else { 10 };
        }
        assert_eq!(classify_volume(&decreasing), VolumeTrend::Decreasing);

        let stable = series(&rising(10));
        assert_eq!(classify_volume(&stable), VolumeTrend::Stable);
    }

    #[test]
    fn analysis_withheld_below_min_candles() {
        let cfg = AnalysisConfig::default();
        let candles = series(&rising(10));
        assert!(analyze_timeframe(Interval::Min1, &candles, &cfg).is_none());
        assert!(analyze_timeframe(Interval::Min1, &series(&rising(20)), &cfg).is_some());
    }

    #[test]
    fn support_resistance_are_window_extrema() {
        let cfg = AnalysisConfig::default();
        let analysis = analyze_timeframe(Interval::Min1, &series(&rising(20)), &cfg).unwrap();
        assert_eq!(analysis.support, 99.0); // low of first candle
        assert_eq!(analysis.resistance, 120.0); // high of last candle
    }

    fn fake_analysis(interval: Interval, trend: Trend) -> TimeframeAnalysis {
        TimeframeAnalysis {
            interval,
            trend,
            trend_strength: 50.0,
            ema_fast: 0.0,
            ema_slow: 0.0,
            oscillator: 50.0,
            swings: SwingStructure::default(),
            support: 0.0,
            resistance: 0.0,
            volume_trend: VolumeTrend::Stable,
        }
    }

    #[test]
    fn confluence_majority_and_unanimity() {
        let mut timeframes = BTreeMap::new();
        timeframes.insert(Interval::Min1, fake_analysis(Interval::Min1, Trend::Bullish));
        timeframes.insert(Interval::Min5, fake_analysis(Interval::Min5, Trend::Bullish));
        timeframes.insert(Interval::Min15, fake_analysis(Interval::Min15, Trend::Bearish));

        let verdict = confluence(&timeframes);
        assert_eq!(verdict.bias, Trend::Bullish);
        assert_eq!(verdict.aligned, 2);
        assert_eq!(verdict.total, 3);
        assert!((verdict.strength - 2.0 / 3.0).abs() < 1e-10);
        assert!(verdict.recommendation.contains("majority"));

        timeframes.insert(Interval::Min15, fake_analysis(Interval::Min15, Trend::Bullish));
        let unanimous = confluence(&timeframes);
        assert_eq!(unanimous.strength, 1.0);
        assert!(unanimous.recommendation.contains("all 3 timeframes"));
    }

    #[test]
    fn confluence_requires_strict_majority() {
        let mut timeframes = BTreeMap::new();
        timeframes.insert(Interval::Min1, fake_analysis(Interval::Min1, Trend::Bullish));
        timeframes.insert(Interval::Min5, fake_analysis(Interval::Min5, Trend::Bearish));
        let verdict = confluence(&timeframes);
        assert_eq!(verdict.bias, Trend::Neutral);
        assert!(verdict.recommendation.contains("Mixed"));
    }

    struct CountingBackfill {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HistoricalCandles for CountingBackfill {
        async fn fetch(
            &self,
            _symbol: &Symbol,
            _interval: Interval,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..limit as i64).map(|i| candle_at(i, 100.0, 5)).collect())
        }
    }

    #[tokio::test]
    async fn backfill_is_attempted_once_per_timeframe_session() {
        let backfill = Arc::new(CountingBackfill {
            calls: AtomicUsize::new(0),
        });
        let mut engine =
            AnalysisEngine::new(AnalysisConfig::default()).with_backfill(backfill.clone(), 30);
        let aggregator = RwLock::new(OhlcAggregator::new());

        let first = engine.analyze(&sym("BTC"), &aggregator).await;
        assert!(first.is_some());
        let calls_after_first = backfill.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_first, Interval::ALL.len());

        // Second pass: seeded timeframes are full; nothing refetches
        engine.analyze(&sym("BTC"), &aggregator).await;
        assert_eq!(backfill.calls.load(Ordering::SeqCst), calls_after_first);

        // Session reset re-arms the bookkeeping
        engine.reset_session();
        let aggregator = RwLock::new(OhlcAggregator::new());
        engine.analyze(&sym("BTC"), &aggregator).await;
        assert_eq!(
            backfill.calls.load(Ordering::SeqCst),
            calls_after_first * 2
        );
    }

    #[tokio::test]
    async fn analysis_is_none_with_no_data_and_no_backfill() {
        let mut engine = AnalysisEngine::new(AnalysisConfig::default());
        let aggregator = RwLock::new(OhlcAggregator::new());
        assert!(engine.analyze(&sym("BTC"), &aggregator).await.is_none());
    }
}
