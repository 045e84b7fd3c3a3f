// =============================================================================
// Signal Aggregator — time-windowed weighted consensus (ΣL vs ΣS)
// =============================================================================
//
// Signals buffer per (symbol, candle timestamp); the first signal of a bar
// starts a 100ms window, after which the batch is scored:
//
//   1. Quality gate: sensors scoring < 0.5 are dropped.
//   2. HTF context: majority direction of the context sensors.
//   3. Weighted sums: weight = historical_score * signal_strength.
//   4. Exact tie -> SKIP.
//   5. Margin < 10% -> SKIP, unless an order-flow sensor sits on the winning
//      side (high-conviction fast track).
//   6. Consensus against the HTF direction -> SKIP.
//   7. Strategy trigger: a non-empty allow-list must intersect the winners;
//      the best sensor is picked from the intersection.
//   8. confidence = margin * selected sensor's weight, clamped to [0, 1].
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::decision::sensor_tracker::SensorTracker;
use crate::events::{AggregatedSignal, EventBus, SignalEvent};
use crate::sensors::SensorFamily;
use crate::types::{ConsensusSide, Side};

/// Collection window per (symbol, bar).
const SIGNAL_WINDOW: Duration = Duration::from_millis(100);

/// Sensors below this historical score do not participate.
const MIN_SCORE_THRESHOLD: f64 = 0.5;

/// Minimum margin of victory for conviction.
const MIN_MARGIN_RATIO: f64 = 0.10;

/// Buffered bars kept per symbol.
const MAX_BUFFERED_BARS: usize = 5;

/// One signal with its consensus weight attached.
#[derive(Debug, Clone)]
pub struct WeightedSignal {
    pub sensor_id: String,
    pub family: SensorFamily,
    pub side: Side,
    /// historical_score * signal_strength
    pub weight: f64,
    pub tp_pct: Option<f64>,
    pub sl_pct: Option<f64>,
}

/// Pure consensus outcome, before event packaging.
#[derive(Debug)]
pub enum Consensus {
    Skip { reason: &'static str },
    Trade {
        side: Side,
        selected: WeightedSignal,
        sigma_long: f64,
        sigma_short: f64,
        margin: f64,
        confidence: f64,
    },
}

/// Weighted-consensus core. Pure so the filter chain is directly testable.
///
/// `signals` must already be quality-gated and stripped of context sensors.
pub fn weighted_consensus(
    signals: &[WeightedSignal],
    htf_context: Option<Side>,
    strategy_sensors: &[String],
) -> Consensus {
    if signals.is_empty() {
        return Consensus::Skip { reason: "no trading signals" };
    }

    let sigma_long: f64 = signals.iter().filter(|s| s.side == Side::Long).map(|s| s.weight).sum();
    let sigma_short: f64 = signals.iter().filter(|s| s.side == Side::Short).map(|s| s.weight).sum();
    let total = sigma_long + sigma_short;

    if (sigma_long - sigma_short).abs() < f64::EPSILON {
        return Consensus::Skip { reason: "exact tie" };
    }

    let (side, winner_sum, loser_sum) = if sigma_long > sigma_short {
        (Side::Long, sigma_long, sigma_short)
    } else {
        (Side::Short, sigma_short, sigma_long)
    };
    let winners: Vec<&WeightedSignal> = signals.iter().filter(|s| s.side == side).collect();

    let margin = if total > 0.0 { (winner_sum - loser_sum) / total } else { 0.0 };

    // Order-flow sensors carry enough conviction to bypass the margin gate.
    let has_order_flow = winners.iter().any(|s| s.family == SensorFamily::OrderFlow);
    if !has_order_flow && margin < MIN_MARGIN_RATIO && loser_sum > 0.0 {
        return Consensus::Skip { reason: "low conviction margin" };
    }

    if let Some(htf) = htf_context {
        if htf != side {
            return Consensus::Skip { reason: "against HTF trend" };
        }
    }

    let selected = if strategy_sensors.is_empty() {
        best_of(&winners)
    } else {
        let strategy_winners: Vec<&WeightedSignal> = winners
            .iter()
            .copied()
            .filter(|s| strategy_sensors.iter().any(|name| name == &s.sensor_id))
            .collect();
        if strategy_winners.is_empty() {
            return Consensus::Skip { reason: "no strategy sensor in consensus" };
        }
        best_of(&strategy_winners)
    };

    let confidence = (margin * selected.weight).clamp(0.0, 1.0);

    Consensus::Trade {
        side,
        selected,
        sigma_long,
        sigma_short,
        margin,
        confidence,
    }
}

fn best_of(candidates: &[&WeightedSignal]) -> WeightedSignal {
    let best = candidates
        .iter()
        .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal))
        .expect("candidates are non-empty");
    (*best).clone()
}

/// HTF majority among context-sensor signals.
fn htf_majority(signals: &[SignalEvent]) -> Option<Side> {
    let mut long_count = 0u32;
    let mut short_count = 0u32;
    for s in signals.iter().filter(|s| s.family == SensorFamily::Context) {
        match s.signal.side {
            Side::Long => long_count += 1,
            Side::Short => short_count += 1,
        }
    }
    match long_count.cmp(&short_count) {
        std::cmp::Ordering::Greater => Some(Side::Long),
        std::cmp::Ordering::Less => Some(Side::Short),
        std::cmp::Ordering::Equal => None,
    }
}

pub struct SignalAggregator {
    bus: EventBus,
    tracker: Arc<SensorTracker>,
    strategy_sensors: Vec<String>,
    strategy_name: Option<String>,
    /// symbol -> candle_ts -> buffered signals
    buffer: Mutex<HashMap<String, BTreeMap<u64, Vec<SignalEvent>>>>,
    latest_candle_ts: Mutex<HashMap<String, u64>>,
}

impl SignalAggregator {
    pub fn new(
        bus: EventBus,
        tracker: Arc<SensorTracker>,
        strategy_sensors: Vec<String>,
        strategy_name: Option<String>,
    ) -> Self {
        Self {
            bus,
            tracker,
            strategy_sensors,
            strategy_name,
            buffer: Mutex::new(HashMap::new()),
            latest_candle_ts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut signals = self.bus.signals.subscribe();
        let mut candles = self.bus.candles.subscribe();
        info!("signal aggregator started");

        loop {
            tokio::select! {
                sig = signals.recv() => match sig {
                    Ok(event) => self.on_signal(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "aggregator lagged behind signal stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                candle = candles.recv() => match candle {
                    Ok(candle) => self.on_candle(&candle.symbol, candle.timestamp),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "aggregator lagged behind candle stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("signal aggregator stopped");
    }

    /// Track candle progression: flush leftovers of the previous bar when a
    /// new one starts, and prune stale buffers.
    fn on_candle(self: &Arc<Self>, symbol: &str, new_ts: u64) {
        let previous = {
            let mut latest = self.latest_candle_ts.lock();
            latest.insert(symbol.to_string(), new_ts)
        };

        if let Some(prev_ts) = previous {
            if prev_ts != new_ts {
                let has_leftovers = self
                    .buffer
                    .lock()
                    .get(symbol)
                    .map(|bars| bars.contains_key(&prev_ts))
                    .unwrap_or(false);
                if has_leftovers {
                    self.process_batch(symbol.to_string(), prev_ts);
                }
            }
        }

        let mut buffer = self.buffer.lock();
        if let Some(bars) = buffer.get_mut(symbol) {
            while bars.len() > MAX_BUFFERED_BARS {
                let oldest = *bars.keys().next().expect("non-empty map");
                bars.remove(&oldest);
            }
        }
    }

    fn on_signal(self: &Arc<Self>, event: SignalEvent) {
        let candle_ts = match self.latest_candle_ts.lock().get(&event.symbol) {
            Some(ts) => *ts,
            None => {
                warn!(symbol = %event.symbol, "signal received before any candle, dropping");
                return;
            }
        };

        let is_first = {
            let mut buffer = self.buffer.lock();
            let bars = buffer.entry(event.symbol.clone()).or_default();
            let batch = bars.entry(candle_ts).or_default();
            batch.push(event.clone());
            batch.len() == 1
        };

        if is_first {
            // First signal of this bar: arm the collection window.
            let me = self.clone();
            let symbol = event.symbol;
            tokio::spawn(async move {
                tokio::time::sleep(SIGNAL_WINDOW).await;
                me.process_batch(symbol, candle_ts);
            });
            debug!(ts = candle_ts, "signal window armed");
        }
    }

    fn process_batch(self: &Arc<Self>, symbol: String, candle_ts: u64) {
        let signals = {
            let mut buffer = self.buffer.lock();
            match buffer.get_mut(&symbol).and_then(|bars| bars.remove(&candle_ts)) {
                Some(batch) => batch,
                None => return,
            }
        };
        let total_signals = signals.len();

        // 1. Quality gate.
        let valid: Vec<SignalEvent> = signals
            .into_iter()
            .filter(|s| self.tracker.score(s.sensor_id) >= MIN_SCORE_THRESHOLD)
            .collect();
        if valid.is_empty() {
            debug!(symbol = %symbol, ts = candle_ts, "all signals below quality gate");
            self.emit_skip(&symbol, candle_ts, total_signals);
            return;
        }

        // 2. HTF context from the context sensors.
        let htf_context = htf_majority(&valid);

        // 3. Weighted trading signals (context sensors removed).
        let weighted: Vec<WeightedSignal> = valid
            .iter()
            .filter(|s| s.family != SensorFamily::Context)
            .map(|s| WeightedSignal {
                sensor_id: s.sensor_id.to_string(),
                family: s.family,
                side: s.signal.side,
                weight: self.tracker.score(s.sensor_id) * s.signal.score,
                tp_pct: s.signal.tp_pct,
                sl_pct: s.signal.sl_pct,
            })
            .collect();

        match weighted_consensus(&weighted, htf_context, &self.strategy_sensors) {
            Consensus::Skip { reason } => {
                info!(symbol = %symbol, ts = candle_ts, reason, "consensus SKIP");
                self.emit_skip(&symbol, candle_ts, total_signals);
            }
            Consensus::Trade {
                side,
                selected,
                sigma_long,
                sigma_short,
                margin,
                confidence,
            } => {
                info!(
                    symbol = %symbol,
                    side = %side,
                    sigma_long = format!("{sigma_long:.2}"),
                    sigma_short = format!("{sigma_short:.2}"),
                    margin = format!("{margin:.3}"),
                    trigger = %selected.sensor_id,
                    confidence = format!("{confidence:.3}"),
                    "weighted consensus"
                );
                let _ = self.bus.aggregated.send(AggregatedSignal {
                    symbol: symbol.clone(),
                    candle_timestamp: candle_ts,
                    selected_sensor: selected.sensor_id.clone(),
                    sensor_score: selected.weight,
                    side: side.into(),
                    confidence,
                    total_signals,
                    strategy_name: self.strategy_name.clone(),
                    sigma_long,
                    sigma_short,
                    margin,
                    tp_pct: selected.tp_pct,
                    sl_pct: selected.sl_pct,
                });
            }
        }
    }

    fn emit_skip(&self, symbol: &str, candle_ts: u64, total_signals: usize) {
        let _ = self.bus.aggregated.send(AggregatedSignal {
            symbol: symbol.to_string(),
            candle_timestamp: candle_ts,
            selected_sensor: "None".to_string(),
            sensor_score: 0.0,
            side: ConsensusSide::Skip,
            confidence: 0.0,
            total_signals,
            strategy_name: None,
            sigma_long: 0.0,
            sigma_short: 0.0,
            margin: 0.0,
            tp_pct: None,
            sl_pct: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(sensor_id: &str, family: SensorFamily, side: Side, weight: f64) -> WeightedSignal {
        WeightedSignal {
            sensor_id: sensor_id.to_string(),
            family,
            side,
            weight,
            tp_pct: None,
            sl_pct: None,
        }
    }

    #[test]
    fn margin_below_ten_percent_skips() {
        // ΣL = 1.5 vs ΣS = 1.4, margin = 0.1/2.9 ≈ 0.034 < 0.10 -> SKIP.
        let signals = vec![
            ws("A", SensorFamily::Technical, Side::Long, 0.6),
            ws("B", SensorFamily::Technical, Side::Long, 0.5),
            ws("C", SensorFamily::Technical, Side::Long, 0.4),
            ws("D", SensorFamily::Technical, Side::Short, 0.7),
            ws("E", SensorFamily::Technical, Side::Short, 0.7),
        ];
        match weighted_consensus(&signals, None, &[]) {
            Consensus::Skip { reason } => assert_eq!(reason, "low conviction margin"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn order_flow_bypasses_margin_gate() {
        let signals = vec![
            ws("A", SensorFamily::OrderFlow, Side::Long, 0.6),
            ws("B", SensorFamily::Technical, Side::Long, 0.5),
            ws("C", SensorFamily::Technical, Side::Long, 0.4),
            ws("D", SensorFamily::Technical, Side::Short, 0.7),
            ws("E", SensorFamily::Technical, Side::Short, 0.7),
        ];
        match weighted_consensus(&signals, None, &[]) {
            Consensus::Trade { side, selected, .. } => {
                assert_eq!(side, Side::Long);
                assert_eq!(selected.sensor_id, "A");
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn exact_tie_skips() {
        let signals = vec![
            ws("A", SensorFamily::Technical, Side::Long, 0.5),
            ws("B", SensorFamily::Technical, Side::Short, 0.5),
        ];
        match weighted_consensus(&signals, None, &[]) {
            Consensus::Skip { reason } => assert_eq!(reason, "exact tie"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn htf_misalignment_skips() {
        let signals = vec![ws("A", SensorFamily::Technical, Side::Long, 0.9)];
        match weighted_consensus(&signals, Some(Side::Short), &[]) {
            Consensus::Skip { reason } => assert_eq!(reason, "against HTF trend"),
            other => panic!("expected skip, got {other:?}"),
        }
        match weighted_consensus(&signals, Some(Side::Long), &[]) {
            Consensus::Trade { side, .. } => assert_eq!(side, Side::Long),
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn strategy_filter_requires_intersection_and_picks_from_it() {
        let signals = vec![
            ws("Best", SensorFamily::Technical, Side::Long, 0.9),
            ws("InStrategy", SensorFamily::Technical, Side::Long, 0.6),
        ];

        // No intersection -> SKIP.
        match weighted_consensus(&signals, None, &["Elsewhere".to_string()]) {
            Consensus::Skip { reason } => assert_eq!(reason, "no strategy sensor in consensus"),
            other => panic!("expected skip, got {other:?}"),
        }

        // Intersection picks the strategy sensor, not the overall best.
        match weighted_consensus(&signals, None, &["InStrategy".to_string()]) {
            Consensus::Trade { selected, .. } => assert_eq!(selected.sensor_id, "InStrategy"),
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn confidence_is_margin_times_selected_weight() {
        let signals = vec![
            ws("A", SensorFamily::Technical, Side::Long, 0.8),
            ws("B", SensorFamily::Technical, Side::Short, 0.2),
        ];
        match weighted_consensus(&signals, None, &[]) {
            Consensus::Trade { margin, confidence, selected, .. } => {
                assert!((margin - 0.6).abs() < 1e-9);
                assert!((confidence - 0.6 * selected.weight).abs() < 1e-9);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn unanimous_one_sided_batch_trades() {
        // loser_sum == 0: margin gate does not apply.
        let signals = vec![ws("A", SensorFamily::Technical, Side::Short, 0.5)];
        match weighted_consensus(&signals, None, &[]) {
            Consensus::Trade { side, .. } => assert_eq!(side, Side::Short),
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn htf_majority_counts_context_sensors_only() {
        use crate::events::RawSignal;
        let mk = |sensor_id: &'static str, family, side| SignalEvent {
            symbol: "BTCUSDT".into(),
            sensor_id,
            family,
            signal: RawSignal::new(side, 1.0, "1m"),
        };

        let signals = vec![
            mk("HigherTFTrend", SensorFamily::Context, Side::Long),
            mk("HurstRegime", SensorFamily::Context, Side::Long),
            mk("MTFImpulse", SensorFamily::Context, Side::Short),
            mk("EmaCrossover", SensorFamily::Technical, Side::Short),
            mk("RsiReversion", SensorFamily::Technical, Side::Short),
        ];
        assert_eq!(htf_majority(&signals), Some(Side::Long));

        let balanced = vec![
            mk("HigherTFTrend", SensorFamily::Context, Side::Long),
            mk("HurstRegime", SensorFamily::Context, Side::Short),
        ];
        assert_eq!(htf_majority(&balanced), None);
    }

    #[tokio::test]
    async fn window_collects_then_emits_once() {
        let bus = EventBus::new();
        let tracker = Arc::new(SensorTracker::new(
            std::env::temp_dir().join(format!("vega-agg-{}.json", std::process::id())),
        ));
        let agg = Arc::new(SignalAggregator::new(bus.clone(), tracker, Vec::new(), None));
        let mut rx = bus.aggregated.subscribe();

        agg.on_candle("BTCUSDT", 600);

        use crate::events::RawSignal;
        for sensor_id in ["EmaCrossover", "RsiReversion"] {
            agg.on_signal(SignalEvent {
                symbol: "BTCUSDT".into(),
                sensor_id,
                family: SensorFamily::Technical,
                signal: RawSignal::new(Side::Long, 1.0, "1m"),
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let out = rx.try_recv().expect("one aggregated signal after the window");
        assert_eq!(out.side, ConsensusSide::Long);
        assert_eq!(out.total_signals, 2);
        assert_eq!(out.candle_timestamp, 600);
        assert!(rx.try_recv().is_err(), "window emits at most once");
    }
}
