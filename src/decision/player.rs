// =============================================================================
// Adaptive Player — bet sizing over aggregated signals
// =============================================================================
//
// Consumes aggregated signals, applies the per-symbol position cap and the
// in-flight debounce, sizes the bet (half-Kelly from the triggering sensor's
// history, fixed fraction as fallback), and emits a uniquely-identified
// Decision. Dispatch is non-blocking; execution is the order manager's job.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::croupier::Croupier;
use crate::decision::sensor_tracker::SensorTracker;
use crate::events::{AggregatedSignal, Decision, EventBus};
use crate::runtime_config::RuntimeConfig;
use crate::types::epoch_now;

pub struct AdaptivePlayer {
    bus: EventBus,
    croupier: Arc<Croupier>,
    tracker: Arc<SensorTracker>,
    config: Arc<RuntimeConfig>,
}

impl AdaptivePlayer {
    pub fn new(
        bus: EventBus,
        croupier: Arc<Croupier>,
        tracker: Arc<SensorTracker>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        let mode = if config.use_kelly { "kelly" } else { "fixed" };
        info!(
            mode,
            bet_size = format!("{:.1}%", config.bet_size * 100.0),
            kelly_max = format!("{:.1}%", config.kelly_max * 100.0),
            max_positions = config.max_positions_per_symbol,
            "adaptive player initialised"
        );
        Self {
            bus,
            croupier,
            tracker,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut signals = self.bus.aggregated.subscribe();
        info!("adaptive player started");

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Ok(signal) => self.on_aggregated_signal(&signal),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "player lagged behind aggregated signals");
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
        info!("adaptive player stopped");
    }

    pub fn on_aggregated_signal(&self, signal: &AggregatedSignal) {
        let Some(side) = signal.side.as_side() else {
            return;
        };

        // No new entries while the session is draining.
        if self.croupier.is_drain_mode() {
            debug!(symbol = %signal.symbol, "drain mode, entries suppressed");
            return;
        }

        // Per-symbol position cap.
        let open_for_symbol = self.croupier.tracker.open_for_symbol(&signal.symbol).len();
        if open_for_symbol >= self.config.max_positions_per_symbol as usize {
            debug!(
                symbol = %signal.symbol,
                open = open_for_symbol,
                limit = self.config.max_positions_per_symbol,
                "at position limit, skipping signal"
            );
            return;
        }

        // In-flight entry debounce.
        if self.croupier.is_pending(&signal.symbol) {
            warn!(symbol = %signal.symbol, "entry in flight, skipping signal");
            return;
        }

        let (bet_size, sizing) = if self.config.use_kelly {
            (
                self.tracker
                    .kelly_fraction(&signal.selected_sensor, self.config.kelly_max),
                "kelly",
            )
        } else {
            (self.config.bet_size, "fixed")
        };

        let decision_id = format!("DEC_{}", &Uuid::new_v4().simple().to_string()[..16]);
        info!(
            decision_id = %decision_id,
            symbol = %signal.symbol,
            side = %side,
            sizing,
            bet_size = format!("{:.2}%", bet_size * 100.0),
            sensor = %signal.selected_sensor,
            "decision emitted"
        );

        let _ = self.bus.decisions.send(Decision {
            decision_id,
            symbol: signal.symbol.clone(),
            side,
            bet_size,
            tp_pct: signal.tp_pct,
            sl_pct: signal.sl_pct,
            selected_sensor: signal.selected_sensor.clone(),
            timestamp: epoch_now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::croupier::position_tracker::{new_position, PositionTracker};
    use crate::observability::Metrics;
    use crate::resilience::ErrorHandler;
    use crate::types::{ConsensusSide, Side, TradeMode};

    fn setup(tag: &str) -> (Arc<AdaptivePlayer>, Arc<Croupier>, EventBus) {
        let state = std::env::temp_dir().join(format!("vega-player-{}-{}.json", tag, std::process::id()));
        let stats = std::env::temp_dir().join(format!("vega-player-stats-{}-{}.json", tag, std::process::id()));
        let _ = std::fs::remove_file(&state);
        let _ = std::fs::remove_file(&stats);

        let bus = EventBus::new();
        let handler = Arc::new(ErrorHandler::new());
        let connector = Arc::new(crate::binance::BinanceConnector::new(
            "",
            "",
            TradeMode::Testing,
            handler.clone(),
        ));
        let position_tracker = Arc::new(PositionTracker::new(state));
        let croupier = Arc::new(Croupier::new(
            connector,
            handler,
            position_tracker,
            bus.clone(),
            TradeMode::Testing,
            Arc::new(Metrics::new()),
        ));
        let sensor_tracker = Arc::new(SensorTracker::new(stats));
        let player = Arc::new(AdaptivePlayer::new(
            bus.clone(),
            croupier.clone(),
            sensor_tracker,
            Arc::new(RuntimeConfig::default()),
        ));
        (player, croupier, bus)
    }

    fn aggregated(side: ConsensusSide) -> AggregatedSignal {
        AggregatedSignal {
            symbol: "BTCUSDT".into(),
            candle_timestamp: 60,
            selected_sensor: "EmaCrossover".into(),
            sensor_score: 0.6,
            side,
            confidence: 0.5,
            total_signals: 4,
            strategy_name: None,
            sigma_long: 1.2,
            sigma_short: 0.3,
            margin: 0.6,
            tp_pct: None,
            sl_pct: None,
        }
    }

    #[test]
    fn skip_signals_produce_no_decision() {
        let (player, _croupier, bus) = setup("skip");
        let mut rx = bus.decisions.subscribe();
        player.on_aggregated_signal(&aggregated(ConsensusSide::Skip));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn trade_signal_emits_unique_decisions() {
        let (player, _croupier, bus) = setup("emit");
        let mut rx = bus.decisions.subscribe();

        player.on_aggregated_signal(&aggregated(ConsensusSide::Long));
        player.on_aggregated_signal(&aggregated(ConsensusSide::Long));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.side, Side::Long);
        assert_ne!(first.decision_id, second.decision_id);
        // Unknown sensor: Kelly floor of 1%.
        assert!((first.bet_size - 0.01).abs() < 1e-9);
    }

    #[test]
    fn position_limit_suppresses_signal() {
        let (player, croupier, bus) = setup("limit");
        let mut rx = bus.decisions.subscribe();

        croupier.tracker.register(new_position(
            "T1".into(),
            "BTCUSDT".into(),
            Side::Long,
            100.0,
            1.0,
            102.0,
            99.0,
            "EmaCrossover".into(),
        ));

        player.on_aggregated_signal(&aggregated(ConsensusSide::Long));
        assert!(rx.try_recv().is_err(), "at the cap no decision is emitted");
    }

    #[test]
    fn drain_mode_suppresses_entries() {
        let (player, croupier, bus) = setup("drain");
        let mut rx = bus.decisions.subscribe();
        croupier.set_drain_mode(true);
        player.on_aggregated_signal(&aggregated(ConsensusSide::Long));
        assert!(rx.try_recv().is_err());
    }
}
