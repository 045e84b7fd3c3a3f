// Test fixtures shared by the sensor unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::events::{FootprintProfile, LevelVolume, PriceLevel};
use crate::market_data::candle_maker::FootprintCandle;
use crate::market_data::MtfContext;

pub fn make_candle(ts: u64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> FootprintCandle {
    FootprintCandle {
        timestamp: ts,
        symbol: "BTCUSDT".into(),
        timeframe: "1m",
        open,
        high,
        low,
        close,
        volume,
        profile: FootprintProfile::new(),
        delta: 0.0,
        poc: 0.0,
        vah: 0.0,
        val: 0.0,
    }
}

pub fn context_of(candle: FootprintCandle, bar_index: u64) -> MtfContext {
    MtfContext {
        symbol: candle.symbol.clone(),
        base: Arc::new(candle),
        bar_index,
        frames: BTreeMap::new(),
    }
}

/// A flat context whose 1m candle closes at `close`.
pub fn context_from_series(symbol: &str, index: u64, close: f64, volume: f64) -> MtfContext {
    let mut candle = make_candle(index * 60, close, close, close, close, volume);
    candle.symbol = symbol.to_string();
    context_of(candle, index + 1)
}

/// Attach a footprint level to a candle.
pub fn with_level(mut candle: FootprintCandle, price: f64, bid: f64, ask: f64) -> FootprintCandle {
    candle
        .profile
        .insert(PriceLevel::from_price(price), LevelVolume { bid, ask });
    candle.volume += bid + ask;
    candle.delta += ask - bid;
    candle
}
