// =============================================================================
// Candle Maker — ticks to 1m footprint candles
// =============================================================================
//
// Per-symbol state: each symbol has its own open candle, so multi-symbol
// streams can never contaminate each other. A tick whose floored timestamp
// crosses into a new minute closes the previous candle; the close is
// dispatched fire-and-forget so the tick loop never blocks on downstream work.
//
// On emission the candle's footprint profile is reduced to POC / VAH / VAL.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::{EventBus, FootprintProfile, LevelVolume, PriceLevel};
use crate::types::{Tick, TickSide};

/// Candle period in seconds.
pub const CANDLE_PERIOD_SECS: u64 = 60;

/// Value Area coverage target (fraction of candle volume).
const VALUE_AREA_FRACTION: f64 = 0.70;

/// A 1m OHLCV candle augmented with its per-level bid/ask volume breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootprintCandle {
    /// Candle open time, floored to the period (epoch seconds).
    pub timestamp: u64,
    pub symbol: String,
    pub timeframe: &'static str,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub profile: FootprintProfile,
    /// Net aggressive buy volume minus aggressive sell volume.
    pub delta: f64,
    /// Price of the level with maximum total volume.
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
}

impl FootprintCandle {
    fn new(timestamp: u64, symbol: String, tick: &Tick) -> Self {
        Self {
            timestamp,
            symbol,
            timeframe: "1m",
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: 0.0,
            profile: FootprintProfile::new(),
            delta: 0.0,
            poc: 0.0,
            vah: 0.0,
            val: 0.0,
        }
    }

    fn apply(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;

        let level = self
            .profile
            .entry(PriceLevel::from_price(tick.price))
            .or_insert_with(LevelVolume::default);
        match tick.side {
            TickSide::Bid => {
                level.bid += tick.volume;
                self.delta -= tick.volume;
            }
            TickSide::Ask => {
                level.ask += tick.volume;
                self.delta += tick.volume;
            }
            TickSide::Unknown => {}
        }
    }
}

/// POC / VAH / VAL computed from a footprint profile.
///
/// POC is the level with maximum total volume (lowest price wins a tie, since
/// the profile iterates in ascending price order). The Value Area is the
/// contiguous span around the POC covering at least 70% of candle volume,
/// expanded one level at a time toward the side whose adjacent level carries
/// more volume; equal adjacent volumes expand DOWN (dual-auction rule).
pub fn footprint_stats(profile: &FootprintProfile, total_volume: f64) -> (f64, f64, f64) {
    if profile.is_empty() || total_volume <= 0.0 {
        return (0.0, 0.0, 0.0);
    }

    let levels: Vec<(f64, f64)> = profile.iter().map(|(p, v)| (p.price(), v.total())).collect();

    let mut poc_idx = 0;
    let mut max_vol = f64::MIN;
    for (i, (_, vol)) in levels.iter().enumerate() {
        if *vol > max_vol {
            max_vol = *vol;
            poc_idx = i;
        }
    }
    let poc = levels[poc_idx].0;

    let target = total_volume * VALUE_AREA_FRACTION;
    let mut covered = levels[poc_idx].1;
    let mut up = poc_idx;
    let mut down = poc_idx;

    while covered < target {
        let vol_up = if up + 1 < levels.len() { levels[up + 1].1 } else { 0.0 };
        let vol_down = if down > 0 { levels[down - 1].1 } else { 0.0 };

        if vol_up == 0.0 && vol_down == 0.0 {
            break;
        }

        if vol_up > vol_down {
            up += 1;
            covered += vol_up;
        } else {
            // Tie goes down.
            down -= 1;
            covered += vol_down;
        }
    }

    (poc, levels[up].0, levels[down].0)
}

/// Tick-to-candle assembler for all symbols of the session.
pub struct CandleMaker {
    bus: EventBus,
    period_secs: u64,
    current: HashMap<String, FootprintCandle>,
}

impl CandleMaker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            period_secs: CANDLE_PERIOD_SECS,
            current: HashMap::new(),
        }
    }

    /// Consume ticks from the bus until the channel closes.
    pub async fn run(mut self) {
        let mut ticks = self.bus.ticks.subscribe();
        info!("candle maker started");
        loop {
            match ticks.recv().await {
                Ok(tick) => self.on_tick(&tick),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "candle maker lagged behind tick stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("candle maker stopped");
    }

    /// Process one tick; emits the previous candle when a boundary is crossed.
    pub fn on_tick(&mut self, tick: &Tick) {
        let candle_start = (tick.timestamp as u64) - (tick.timestamp as u64) % self.period_secs;

        let needs_rollover = self
            .current
            .get(&tick.symbol)
            .map(|c| candle_start > c.timestamp)
            .unwrap_or(false);

        if needs_rollover {
            if let Some(closed) = self.current.remove(&tick.symbol) {
                self.emit(closed);
            }
        }

        let candle = self
            .current
            .entry(tick.symbol.clone())
            .or_insert_with(|| FootprintCandle::new(candle_start, tick.symbol.clone(), tick));
        candle.apply(tick);
    }

    fn emit(&self, mut candle: FootprintCandle) {
        let (poc, vah, val) = footprint_stats(&candle.profile, candle.volume);
        candle.poc = poc;
        candle.vah = vah;
        candle.val = val;

        info!(
            symbol = %candle.symbol,
            ts = candle.timestamp,
            close = candle.close,
            volume = candle.volume,
            delta = format!("{:.2}", candle.delta),
            poc = candle.poc,
            "candle closed"
        );

        // Fire-and-forget: broadcast send never blocks the tick path.
        let _ = self.bus.candles.send(Arc::new(candle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, ts: f64, price: f64, volume: f64, side: TickSide) -> Tick {
        Tick {
            timestamp: ts,
            symbol: symbol.into(),
            price,
            volume,
            side,
        }
    }

    #[test]
    fn candle_boundary_emits_previous_and_opens_new() {
        let bus = EventBus::new();
        let mut rx = bus.candles.subscribe();
        let mut maker = CandleMaker::new(bus);

        maker.on_tick(&tick("BTCUSDT", 59.9, 100.0, 1.0, TickSide::Ask));
        assert!(rx.try_recv().is_err());

        maker.on_tick(&tick("BTCUSDT", 60.1, 101.0, 1.0, TickSide::Ask));
        let closed = rx.try_recv().expect("candle should emit at boundary");
        assert_eq!(closed.timestamp, 0);
        assert!((closed.close - 100.0).abs() < 1e-9);

        // New candle opened at 101.
        let open = maker.current.get("BTCUSDT").unwrap();
        assert_eq!(open.timestamp, 60);
        assert!((open.open - 101.0).abs() < 1e-9);
    }

    #[test]
    fn candle_timestamps_strictly_increase_per_symbol() {
        let bus = EventBus::new();
        let mut rx = bus.candles.subscribe();
        let mut maker = CandleMaker::new(bus);

        for (ts, price) in [(5.0, 100.0), (65.0, 101.0), (125.0, 102.0), (185.0, 103.0)] {
            maker.on_tick(&tick("BTCUSDT", ts, price, 1.0, TickSide::Ask));
        }

        let mut last_ts = None;
        while let Ok(candle) = rx.try_recv() {
            if let Some(prev) = last_ts {
                assert!(candle.timestamp > prev, "timestamps must strictly increase");
            }
            last_ts = Some(candle.timestamp);
        }
        assert_eq!(last_ts, Some(120));
    }

    #[test]
    fn symbols_do_not_share_candle_state() {
        let bus = EventBus::new();
        let mut maker = CandleMaker::new(bus);

        maker.on_tick(&tick("BTCUSDT", 10.0, 100.0, 1.0, TickSide::Ask));
        maker.on_tick(&tick("ETHUSDT", 10.0, 2000.0, 1.0, TickSide::Bid));

        assert!((maker.current["BTCUSDT"].close - 100.0).abs() < 1e-9);
        assert!((maker.current["ETHUSDT"].close - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn delta_accumulates_signed_volume() {
        let bus = EventBus::new();
        let mut maker = CandleMaker::new(bus);

        maker.on_tick(&tick("BTCUSDT", 1.0, 100.0, 3.0, TickSide::Ask));
        maker.on_tick(&tick("BTCUSDT", 2.0, 100.0, 1.0, TickSide::Bid));

        let candle = maker.current.get("BTCUSDT").unwrap();
        assert!((candle.delta - 2.0).abs() < 1e-9);
        let level = candle.profile.get(&PriceLevel::from_price(100.0)).unwrap();
        assert!((level.ask - 3.0).abs() < 1e-9);
        assert!((level.bid - 1.0).abs() < 1e-9);
    }

    #[test]
    fn footprint_poc_and_value_area_expansion() {
        // Profile {100: bid 1 / ask 4, 101: bid 2 / ask 3, 102: bid 1 / ask 1},
        // volume 12. POC = 100 (vol 5), target 8.4; expansion covers 101
        // (cumulative 10 >= 8.4) so VAL = 100, VAH = 101.
        let mut profile = FootprintProfile::new();
        profile.insert(PriceLevel::from_price(100.0), LevelVolume { bid: 1.0, ask: 4.0 });
        profile.insert(PriceLevel::from_price(101.0), LevelVolume { bid: 2.0, ask: 3.0 });
        profile.insert(PriceLevel::from_price(102.0), LevelVolume { bid: 1.0, ask: 1.0 });

        let (poc, vah, val) = footprint_stats(&profile, 12.0);
        assert!((poc - 100.0).abs() < 1e-9);
        assert!((vah - 101.0).abs() < 1e-9);
        assert!((val - 100.0).abs() < 1e-9);
    }

    #[test]
    fn value_area_tie_expands_down() {
        // Equal volume above and below the POC: the downward level wins.
        let mut profile = FootprintProfile::new();
        profile.insert(PriceLevel::from_price(99.0), LevelVolume { bid: 2.0, ask: 0.0 });
        profile.insert(PriceLevel::from_price(100.0), LevelVolume { bid: 0.0, ask: 6.0 });
        profile.insert(PriceLevel::from_price(101.0), LevelVolume { bid: 2.0, ask: 0.0 });

        let (poc, vah, val) = footprint_stats(&profile, 10.0);
        assert!((poc - 100.0).abs() < 1e-9);
        assert!((val - 99.0).abs() < 1e-9);
        assert!((vah - 100.0).abs() < 1e-9);
    }

    #[test]
    fn empty_profile_yields_zeroes() {
        let profile = FootprintProfile::new();
        assert_eq!(footprint_stats(&profile, 0.0), (0.0, 0.0, 0.0));
    }
}
