// =============================================================================
// Typed event bus — one broadcast channel per event kind
// =============================================================================
//
// Every component holds a clone of `EventBus` and subscribes to the channels
// it cares about. Channel-per-kind keeps dispatch ordering deterministic per
// kind and lets the compiler enforce payload types; listeners on the same
// channel observe events in the same order.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::market_data::candle_maker::FootprintCandle;
use crate::types::{ConsensusSide, Side, Tick};

/// Bid/ask volume accumulated at one price level of a footprint profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelVolume {
    pub bid: f64,
    pub ask: f64,
}

impl LevelVolume {
    pub fn total(&self) -> f64 {
        self.bid + self.ask
    }
}

/// Fixed-point price level key. `f64` is not `Ord`, so profile maps key on the
/// price scaled to 1e-8 resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriceLevel(pub i64);

impl PriceLevel {
    const SCALE: f64 = 1e8;

    pub fn from_price(price: f64) -> Self {
        Self((price * Self::SCALE).round() as i64)
    }

    pub fn price(&self) -> f64 {
        self.0 as f64 / Self::SCALE
    }
}

/// Per-level footprint profile, ordered by price.
pub type FootprintProfile = BTreeMap<PriceLevel, LevelVolume>;

/// One higher-timeframe aggregate candle. `is_complete == false` marks a
/// window still mid-formation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggCandle {
    pub timestamp: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_complete: bool,
}

/// A raw vote from one sensor.
#[derive(Debug, Clone, Serialize)]
pub struct RawSignal {
    pub side: Side,
    /// Signal strength in [0, 1].
    pub score: f64,
    pub timeframe: &'static str,
    #[serde(skip)]
    pub tp_pct: Option<f64>,
    #[serde(skip)]
    pub sl_pct: Option<f64>,
}

impl RawSignal {
    pub fn new(side: Side, score: f64, timeframe: &'static str) -> Self {
        Self {
            side,
            score,
            timeframe,
            tp_pct: None,
            sl_pct: None,
        }
    }
}

/// A raw signal annotated with its origin, as dispatched to the aggregator.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub symbol: String,
    pub sensor_id: &'static str,
    pub family: crate::sensors::SensorFamily,
    pub signal: RawSignal,
}

/// Output of the weighted-consensus aggregator, one per (symbol, bar) window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSignal {
    pub symbol: String,
    pub candle_timestamp: u64,
    pub selected_sensor: String,
    pub sensor_score: f64,
    pub side: ConsensusSide,
    /// Margin of victory scaled by the selected sensor's score, in [0, 1].
    pub confidence: f64,
    pub total_signals: usize,
    pub strategy_name: Option<String>,
    pub sigma_long: f64,
    pub sigma_short: f64,
    pub margin: f64,
    #[serde(skip)]
    pub tp_pct: Option<f64>,
    #[serde(skip)]
    pub sl_pct: Option<f64>,
}

/// A sized trading decision emitted by the player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub symbol: String,
    pub side: Side,
    /// Fraction of equity to commit.
    pub bet_size: f64,
    pub tp_pct: Option<f64>,
    pub sl_pct: Option<f64>,
    pub selected_sensor: String,
    pub timestamp: f64,
}

/// Normalized order update from the user-data stream (regular or algo).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub side: String,
    pub order_type: String,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    pub average: f64,
    pub is_algo: bool,
}

/// A completed round trip, published when a position leaves the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub fee: f64,
    pub exit_reason: String,
    pub sensor_id: String,
    pub won: bool,
}

/// L2 book snapshot from the depth stream.
#[derive(Debug, Clone)]
pub struct OrderBookEvent {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: f64,
}

/// The engine's typed event bus. Cheap to clone; every clone shares the same
/// underlying channels.
#[derive(Clone)]
pub struct EventBus {
    pub ticks: broadcast::Sender<Tick>,
    pub candles: broadcast::Sender<Arc<FootprintCandle>>,
    pub signals: broadcast::Sender<SignalEvent>,
    pub aggregated: broadcast::Sender<AggregatedSignal>,
    pub decisions: broadcast::Sender<Decision>,
    pub order_updates: broadcast::Sender<OrderUpdate>,
    pub closed_trades: broadcast::Sender<ClosedTrade>,
    pub order_books: broadcast::Sender<OrderBookEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        // Capacities are per-channel ring buffers; a lagged receiver skips to
        // the oldest retained event rather than backpressuring senders.
        Self {
            ticks: broadcast::channel(4096).0,
            candles: broadcast::channel(512).0,
            signals: broadcast::channel(1024).0,
            aggregated: broadcast::channel(256).0,
            decisions: broadcast::channel(64).0,
            order_updates: broadcast::channel(256).0,
            closed_trades: broadcast::channel(256).0,
            order_books: broadcast::channel(256).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_level_roundtrip() {
        let p = PriceLevel::from_price(37020.55);
        assert!((p.price() - 37020.55).abs() < 1e-6);
        assert!(PriceLevel::from_price(100.0) < PriceLevel::from_price(101.0));
    }

    #[tokio::test]
    async fn bus_delivers_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.decisions.subscribe();
        for i in 0..3 {
            bus.decisions
                .send(Decision {
                    decision_id: format!("d{i}"),
                    symbol: "BTCUSDT".into(),
                    side: crate::types::Side::Long,
                    bet_size: 0.01,
                    tp_pct: None,
                    sl_pct: None,
                    selected_sensor: "EmaCrossover".into(),
                    timestamp: 0.0,
                })
                .unwrap();
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().decision_id, format!("d{i}"));
        }
    }
}
