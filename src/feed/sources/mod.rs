//! Upstream source adapters (Binance, Chainlink oracle stream, CoinGecko)

mod binance;
mod chainlink;
mod coingecko;

pub use binance::BinanceDriver;
pub use chainlink::ChainlinkDriver;
pub use coingecko::CoinGeckoDriver;

use crate::config::SourcesSection;
use crate::feed::driver::{BackoffSettings, ConnectionDriver};

/// Build one driver per enabled source, in priority order.
pub fn build_drivers(
    cfg: &SourcesSection,
    backoff: BackoffSettings,
) -> Vec<Box<dyn ConnectionDriver>> {
    let mut drivers: Vec<Box<dyn ConnectionDriver>> = Vec::new();
    if cfg.binance.enabled {
        drivers.push(Box::new(BinanceDriver::new(cfg.binance.clone(), backoff)));
    }
    if cfg.chainlink.enabled {
        drivers.push(Box::new(ChainlinkDriver::new(cfg.chainlink.clone(), backoff)));
    }
    if cfg.coingecko.enabled {
        drivers.push(Box::new(CoinGeckoDriver::new(cfg.coingecko.clone(), backoff)));
    }
    drivers
}
