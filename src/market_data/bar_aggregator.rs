// =============================================================================
// Bar Aggregator — fold 1m candles into higher timeframes
// =============================================================================
//
// On each 1m candle the aggregator pushes into every timeframe buffer; a full
// buffer folds into a completed HTF candle, otherwise the partial aggregate is
// exposed with `is_complete = false`. Completed candles keep a bounded history
// for sensors that need lookback.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::events::AggCandle;
use crate::market_data::candle_maker::FootprintCandle;

/// Higher timeframes derived from the 1m base stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M5,
    M15,
    H1,
    H4,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M5, Timeframe::M15, Timeframe::H1, Timeframe::H4];

    pub fn minutes(&self) -> usize {
        match self {
            Self::M5 => 5,
            Self::M15 => 15,
            Self::H1 => 60,
            Self::H4 => 240,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }
}

/// Bounded history of completed candles per timeframe.
const HISTORY_LEN: usize = 100;

/// Multi-timeframe view handed to sensors for one 1m close.
#[derive(Debug, Clone)]
pub struct MtfContext {
    pub symbol: String,
    /// The 1m footprint candle that triggered this context.
    pub base: Arc<FootprintCandle>,
    /// Per-symbol bar index (increments once per 1m candle).
    pub bar_index: u64,
    /// Latest aggregate per higher timeframe (partial or complete).
    pub frames: BTreeMap<Timeframe, AggCandle>,
}

impl MtfContext {
    pub fn frame(&self, tf: Timeframe) -> Option<&AggCandle> {
        self.frames.get(&tf)
    }
}

struct TimeframeState {
    buffer: Vec<Arc<FootprintCandle>>,
    completed: Option<AggCandle>,
    history: VecDeque<AggCandle>,
}

impl TimeframeState {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            completed: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }
}

/// Per-symbol 1m-to-HTF aggregation.
pub struct BarAggregator {
    states: HashMap<Timeframe, TimeframeState>,
    candle_count: u64,
}

impl BarAggregator {
    pub fn new() -> Self {
        Self {
            states: Timeframe::ALL.iter().map(|tf| (*tf, TimeframeState::new())).collect(),
            candle_count: 0,
        }
    }

    /// Fold one 1m candle and return the resulting multi-timeframe context.
    pub fn on_candle(&mut self, candle: Arc<FootprintCandle>) -> MtfContext {
        self.candle_count += 1;
        let mut frames = BTreeMap::new();

        for tf in Timeframe::ALL {
            let state = self.states.get_mut(&tf).expect("all timeframes initialised");
            state.buffer.push(candle.clone());

            if state.buffer.len() >= tf.minutes() {
                let folded = fold(&state.buffer, true);
                state.completed = Some(folded.clone());
                state.history.push_back(folded.clone());
                while state.history.len() > HISTORY_LEN {
                    state.history.pop_front();
                }
                state.buffer.clear();
                frames.insert(tf, folded);
            } else {
                // Mid-window: expose the partial aggregate.
                frames.insert(tf, fold(&state.buffer, false));
            }
        }

        MtfContext {
            symbol: candle.symbol.clone(),
            base: candle,
            bar_index: self.candle_count,
            frames,
        }
    }

    /// Last `lookback` completed candles for a timeframe (oldest first).
    pub fn history(&self, tf: Timeframe, lookback: usize) -> Vec<AggCandle> {
        match self.states.get(&tf) {
            Some(state) => {
                let len = state.history.len();
                state.history.iter().skip(len.saturating_sub(lookback)).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn candle_count(&self) -> u64 {
        self.candle_count
    }
}

impl Default for BarAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn fold(buffer: &[Arc<FootprintCandle>], is_complete: bool) -> AggCandle {
    debug_assert!(!buffer.is_empty());
    AggCandle {
        timestamp: buffer[0].timestamp,
        open: buffer[0].open,
        high: buffer.iter().map(|c| c.high).fold(f64::MIN, f64::max),
        low: buffer.iter().map(|c| c.low).fold(f64::MAX, f64::min),
        close: buffer[buffer.len() - 1].close,
        volume: buffer.iter().map(|c| c.volume).sum(),
        is_complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FootprintProfile;

    fn candle(ts: u64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Arc<FootprintCandle> {
        Arc::new(FootprintCandle {
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
        })
    }

    #[test]
    fn five_minute_fold_completes_on_fifth_candle() {
        let mut agg = BarAggregator::new();

        for i in 0..4 {
            let ctx = agg.on_candle(candle(i * 60, 100.0 + i as f64, 101.0 + i as f64, 99.0, 100.5, 10.0));
            assert!(!ctx.frame(Timeframe::M5).unwrap().is_complete);
        }

        let ctx = agg.on_candle(candle(240, 104.0, 110.0, 95.0, 105.0, 10.0));
        let m5 = ctx.frame(Timeframe::M5).unwrap();
        assert!(m5.is_complete);
        assert_eq!(m5.timestamp, 0);
        assert!((m5.open - 100.0).abs() < 1e-9);
        assert!((m5.high - 110.0).abs() < 1e-9);
        assert!((m5.low - 95.0).abs() < 1e-9);
        assert!((m5.close - 105.0).abs() < 1e-9);
        assert!((m5.volume - 50.0).abs() < 1e-9);
    }

    #[test]
    fn partial_aggregate_reflects_buffer_so_far() {
        let mut agg = BarAggregator::new();
        agg.on_candle(candle(0, 100.0, 102.0, 99.0, 101.0, 10.0));
        let ctx = agg.on_candle(candle(60, 101.0, 105.0, 100.0, 104.0, 5.0));

        let m15 = ctx.frame(Timeframe::M15).unwrap();
        assert!(!m15.is_complete);
        assert!((m15.open - 100.0).abs() < 1e-9);
        assert!((m15.high - 105.0).abs() < 1e-9);
        assert!((m15.close - 104.0).abs() < 1e-9);
        assert!((m15.volume - 15.0).abs() < 1e-9);
    }

    #[test]
    fn history_is_bounded() {
        let mut agg = BarAggregator::new();
        // 5m completes every 5 candles; run enough for > HISTORY_LEN folds.
        for i in 0..(5 * (HISTORY_LEN as u64 + 10)) {
            agg.on_candle(candle(i * 60, 100.0, 101.0, 99.0, 100.0, 1.0));
        }
        assert_eq!(agg.history(Timeframe::M5, usize::MAX).len(), HISTORY_LEN);
        assert_eq!(agg.history(Timeframe::M5, 7).len(), 7);
    }

    #[test]
    fn bar_index_increments() {
        let mut agg = BarAggregator::new();
        let c1 = agg.on_candle(candle(0, 1.0, 1.0, 1.0, 1.0, 1.0));
        let c2 = agg.on_candle(candle(60, 1.0, 1.0, 1.0, 1.0, 1.0));
        assert_eq!(c1.bar_index, 1);
        assert_eq!(c2.bar_index, 2);
    }
}
