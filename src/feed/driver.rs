//! Connection driver contract shared by all upstream sources.
//!
//! Each driver owns exactly one connection or poll loop and communicates
//! with the multiplexer only through `SourceEvent`s; it never touches
//! shared state directly.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

use crate::types::{PriceSource, RawTick, Symbol};

/// Events emitted by price source drivers
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Normalized tick ready
    Tick(RawTick),
    /// Driver started a connection attempt
    Connecting(PriceSource),
    /// Connection established
    Connected(PriceSource),
    /// Connection lost; driver will retry
    Disconnected(PriceSource),
    /// Recoverable error occurred
    Error(PriceSource, String),
    /// Terminal failure: reconnect attempts exhausted, driver gave up
    Failed(PriceSource, String),
}

/// Trait for upstream connection drivers.
///
/// `run` is the driver's whole lifetime: it connects, reconnects with
/// backoff and emits events until it fails terminally or its task is
/// aborted by the multiplexer (the only stop mechanism, which also
/// cancels any pending reconnect sleep).
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    fn source(&self) -> PriceSource;

    /// Whether this driver can serve the symbol at all.
    fn covers(&self, symbol: &Symbol) -> bool;

    async fn run(self: Box<Self>, symbols: Vec<Symbol>, tx: Sender<SourceEvent>);
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub multiplier: f64,
    pub ceiling_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            multiplier: 1.5,
            ceiling_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// Exponential reconnect backoff with a capped ceiling and a maximum
/// attempt count. Deterministic; callers add jitter at the sleep site.
#[derive(Debug, Clone)]
pub struct Backoff {
    settings: BackoffSettings,
    attempt: u32,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            attempt: 0,
        }
    }

    /// Next delay, or `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.settings.max_attempts {
            return None;
        }
        let exp = self.settings.multiplier.powi(self.attempt as i32);
        let delay_ms = (self.settings.base_ms as f64 * exp) as u64;
        self.attempt += 1;
        Some(Duration::from_millis(delay_ms.min(self.settings.ceiling_ms)))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.settings.max_attempts
    }
}

/// Small random addition so simultaneously-failing drivers do not
/// reconnect in lockstep.
pub fn jitter(delay: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..250);
    delay + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BackoffSettings {
        BackoffSettings {
            base_ms: 1_000,
            multiplier: 1.5,
            ceiling_ms: 10_000,
            max_attempts: 8,
        }
    }

    #[test]
    fn delays_grow_monotonically_up_to_ceiling() {
        let mut backoff = Backoff::new(settings());
        let mut prev = Duration::ZERO;
        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            assert!(delay >= prev, "delays must be non-decreasing");
            assert!(delay <= Duration::from_millis(10_000));
            prev = delay;
            delays.push(delay);
        }
        assert_eq!(delays.len(), 8);
        assert_eq!(delays[0], Duration::from_millis(1_000));
        assert_eq!(delays[1], Duration::from_millis(1_500));
        assert_eq!(delays[2], Duration::from_millis(2_250));
        // 1000 * 1.5^7 = 17085 -> capped
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(10_000));
    }

    #[test]
    fn attempts_stop_at_configured_maximum() {
        let mut backoff = Backoff::new(BackoffSettings {
            max_attempts: 3,
            ..settings()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.exhausted());
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(settings());
        let first = backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().unwrap(), first);
    }
}
