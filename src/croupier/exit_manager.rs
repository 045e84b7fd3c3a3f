// =============================================================================
// Exit Manager — dynamic exits beyond the static bracket
// =============================================================================
//
// Evaluated on every aggregated signal (reversal) and every candle close
// (time / breakeven / trailing), strictly for the position's own symbol.
// Precedence per candle: time exit, breakeven, trailing stop.
//
// Drain mode is the three-phase progressive wind-down of a timed session:
//   optimistic  — narrow every TP (soft exit)
//   defensive   — TP to fee-cover, SL tightened toward entry
//   aggressive  — force-close the worst 20% by bars held, defend the rest
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::croupier::position_tracker::OpenPosition;
use crate::croupier::Croupier;
use crate::events::{AggregatedSignal, EventBus};
use crate::market_data::FootprintCandle;
use crate::runtime_config::ExitParams;
use crate::types::Side;

pub struct ExitManager {
    croupier: Arc<Croupier>,
    bus: EventBus,
    params: ExitParams,
    max_hold_bars: u32,
}

impl ExitManager {
    pub fn new(croupier: Arc<Croupier>, bus: EventBus, params: ExitParams) -> Self {
        let max_hold_bars = params.max_hold_bars;
        Self {
            croupier,
            bus,
            params,
            max_hold_bars,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut signals = self.bus.aggregated.subscribe();
        let mut candles = self.bus.candles.subscribe();
        info!("exit manager started");

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Ok(signal) => self.on_signal(&signal).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "exit manager lagged behind signals");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                candle = candles.recv() => match candle {
                    Ok(candle) => self.on_candle(&candle).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "exit manager lagged behind candles");
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
        info!("exit manager stopped");
    }

    // -------------------------------------------------------------------------
    // Signal reversal
    // -------------------------------------------------------------------------

    async fn on_signal(&self, signal: &AggregatedSignal) {
        if !self.params.signal_reversal_enabled {
            return;
        }
        let Some(signal_side) = signal.side.as_side() else {
            return;
        };

        for position in self.croupier.tracker.open_for_symbol(&signal.symbol) {
            let threshold = self.params.reversal_threshold_for(&position.symbol);
            if signal_side != position.side.opposite() || signal.confidence < threshold {
                continue;
            }

            info!(
                trade_id = %position.trade_id,
                position_side = %position.side,
                signal_side = %signal_side,
                confidence = format!("{:.2}", signal.confidence),
                "signal reversal, closing position"
            );
            if let Err(e) = self
                .croupier
                .close_position(&position.trade_id, "SIGNAL_REVERSAL", None)
                .await
            {
                error!(trade_id = %position.trade_id, error = %e, "reversal close failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Candle-driven exits
    // -------------------------------------------------------------------------

    async fn on_candle(&self, candle: &FootprintCandle) {
        let current_price = candle.close;

        for position in self.croupier.tracker.open_for_symbol(&candle.symbol) {
            // Explicit symbol comparison: one symbol's candle must never move
            // another symbol's stops.
            debug_assert_eq!(position.symbol, candle.symbol);

            // 1. Time-based exits.
            if self.check_time_exit(&position).await {
                continue;
            }

            // 2. Breakeven.
            if self.params.breakeven_enabled {
                self.check_breakeven(&position, current_price).await;
            }

            // 3. Trailing stop.
            if self.params.trailing_enabled {
                self.check_trailing(&position, current_price).await;
            }
        }
    }

    /// Soft-exit at max hold; force close at twice max hold. Returns true when
    /// the position was closed.
    async fn check_time_exit(&self, position: &OpenPosition) -> bool {
        if position.bars_held >= self.max_hold_bars * 2 {
            warn!(
                trade_id = %position.trade_id,
                bars_held = position.bars_held,
                "double max hold reached, force closing"
            );
            if let Err(e) = self
                .croupier
                .close_position(&position.trade_id, "HARD_TIME_EXIT", None)
                .await
            {
                error!(trade_id = %position.trade_id, error = %e, "hard time exit failed");
            }
            return true;
        }

        if position.bars_held >= self.max_hold_bars && !position.soft_exit_triggered {
            self.execute_soft_exit(position, "max hold time").await;
        }
        false
    }

    /// Narrow the TP toward entry so a stale position exits on a smaller move.
    async fn execute_soft_exit(&self, position: &OpenPosition, reason: &str) {
        info!(trade_id = %position.trade_id, reason, "soft exit, narrowing TP");

        let original_distance = (position.tp_level - position.entry_price).abs();
        let narrowed = original_distance * self.params.soft_exit_tp_mult;
        let new_tp = match position.side {
            Side::Long => position.entry_price + narrowed,
            Side::Short => position.entry_price - narrowed,
        };

        match self.croupier.modify_tp(&position.trade_id, new_tp).await {
            Ok(()) => {
                self.croupier
                    .tracker
                    .modify(&position.trade_id, |p| p.soft_exit_triggered = true);
            }
            Err(e) => error!(trade_id = %position.trade_id, error = %e, "soft exit failed"),
        }
    }

    /// Move the SL to entry (0.1% cushion for fees) once profit clears the
    /// activation threshold.
    async fn check_breakeven(&self, position: &OpenPosition, current_price: f64) {
        if position.entry_price <= 0.0 {
            return;
        }

        let (profit_pct, already_at_breakeven, new_sl) = match position.side {
            Side::Long => (
                (current_price - position.entry_price) / position.entry_price,
                position.sl_level >= position.entry_price,
                position.entry_price * 1.001,
            ),
            Side::Short => (
                (position.entry_price - current_price) / position.entry_price,
                position.sl_level <= position.entry_price,
                position.entry_price * 0.999,
            ),
        };

        if already_at_breakeven || profit_pct < self.params.breakeven_activation_pct {
            return;
        }

        info!(
            trade_id = %position.trade_id,
            profit_pct = format!("{:.4}", profit_pct),
            new_sl,
            "breakeven activation"
        );
        if let Err(e) = self.croupier.modify_sl(&position.trade_id, new_sl).await {
            error!(trade_id = %position.trade_id, error = %e, "breakeven SL move failed");
        }
    }

    /// Trail the SL behind price once profit clears the activation threshold;
    /// only strictly-improving moves are submitted.
    async fn check_trailing(&self, position: &OpenPosition, current_price: f64) {
        if position.entry_price <= 0.0 {
            return;
        }

        match position.side {
            Side::Long => {
                let profit_pct = (current_price - position.entry_price) / position.entry_price;
                if profit_pct < self.params.trailing_activation_pct {
                    return;
                }
                let new_sl = current_price - current_price * self.params.trailing_distance_pct;
                if new_sl > position.sl_level {
                    if let Err(e) = self.croupier.modify_sl(&position.trade_id, new_sl).await {
                        error!(trade_id = %position.trade_id, error = %e, "trailing SL move failed");
                    }
                }
            }
            Side::Short => {
                let profit_pct = (position.entry_price - current_price) / position.entry_price;
                if profit_pct < self.params.trailing_activation_pct {
                    return;
                }
                let new_sl = current_price + current_price * self.params.trailing_distance_pct;
                if new_sl < position.sl_level {
                    if let Err(e) = self.croupier.modify_sl(&position.trade_id, new_sl).await {
                        error!(trade_id = %position.trade_id, error = %e, "trailing SL move failed");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Drain phases
    // -------------------------------------------------------------------------

    /// Phase 1 (optimistic): narrow every TP.
    pub async fn trigger_soft_exits(&self) {
        info!("drain: optimistic phase, narrowing all TPs");
        for position in self.croupier.tracker.open_positions() {
            self.execute_soft_exit(&position, "session drain (optimistic)").await;
        }
    }

    /// Phase 2 (defensive): TP to fee cover, SL tightened.
    pub async fn trigger_defensive_exits(&self) {
        info!("drain: defensive phase");
        for position in self.croupier.tracker.open_positions() {
            self.execute_defensive_exit(&position).await;
        }
    }

    /// Phase 3 (aggressive): force-close the worst `fraction` by bars held,
    /// defensive-exit the rest.
    pub async fn trigger_aggressive_exits(&self, fraction: f64) {
        let mut positions = self.croupier.tracker.open_positions();
        if positions.is_empty() {
            return;
        }
        positions.sort_by(|a, b| b.bars_held.cmp(&a.bars_held));

        let target = ((positions.len() as f64 * fraction).floor() as usize).max(1);
        warn!(
            total = positions.len(),
            force_closing = target,
            "drain: aggressive phase"
        );

        for (i, position) in positions.iter().enumerate() {
            if i < target {
                info!(trade_id = %position.trade_id, symbol = %position.symbol, "drain force close");
                if let Err(e) = self
                    .croupier
                    .close_position(&position.trade_id, "DRAIN_AGGRESSIVE", None)
                    .await
                {
                    error!(trade_id = %position.trade_id, error = %e, "aggressive drain close failed");
                }
            } else if !position.defensive_exit_triggered {
                self.execute_defensive_exit(position).await;
            }
        }
    }

    /// Move TP to entry ± 0.2% (fee cover) and SL to entry ∓ 0.5%, SL only if
    /// it tightens.
    async fn execute_defensive_exit(&self, position: &OpenPosition) {
        if position.defensive_exit_triggered {
            return;
        }

        let (new_tp, new_sl, sl_tightens) = match position.side {
            Side::Long => {
                let sl = position.entry_price * 0.995;
                (position.entry_price * 1.002, sl, sl > position.sl_level)
            }
            Side::Short => {
                let sl = position.entry_price * 1.005;
                (position.entry_price * 0.998, sl, sl < position.sl_level)
            }
        };

        info!(trade_id = %position.trade_id, new_tp, "defensive exit, targeting breakeven");
        self.croupier
            .tracker
            .modify(&position.trade_id, |p| p.defensive_exit_triggered = true);

        if let Err(e) = self.croupier.modify_tp(&position.trade_id, new_tp).await {
            error!(trade_id = %position.trade_id, error = %e, "defensive TP move failed");
        }
        if sl_tightens {
            if let Err(e) = self.croupier.modify_sl(&position.trade_id, new_sl).await {
                error!(trade_id = %position.trade_id, error = %e, "defensive SL move failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::croupier::position_tracker::{new_position, PositionTracker};
    use crate::observability::Metrics;
    use crate::resilience::ErrorHandler;
    use crate::types::TradeMode;

    fn test_setup(tag: &str) -> (Arc<Croupier>, Arc<ExitManager>, EventBus) {
        let path = std::env::temp_dir().join(format!("vega-exit-{}-{}.json", tag, std::process::id()));
        let _ = std::fs::remove_file(&path);

        let bus = EventBus::new();
        let handler = Arc::new(ErrorHandler::new());
        let connector = Arc::new(crate::binance::BinanceConnector::new(
            "",
            "",
            TradeMode::Testing,
            handler.clone(),
        ));
        let tracker = Arc::new(PositionTracker::new(path));
        let croupier = Arc::new(Croupier::new(
            connector,
            handler,
            tracker,
            bus.clone(),
            TradeMode::Testing,
            Arc::new(Metrics::new()),
        ));
        let exits = Arc::new(ExitManager::new(croupier.clone(), bus.clone(), ExitParams::default()));
        (croupier, exits, bus)
    }

    fn open_long(croupier: &Croupier, trade_id: &str, bars_held: u32) {
        let mut pos = new_position(
            trade_id.into(),
            "BTCUSDT".into(),
            Side::Long,
            100.0,
            1.0,
            102.0,
            99.0,
            "EmaCrossover".into(),
        );
        pos.bars_held = bars_held;
        pos.exchange_tp_id = Some("1".into());
        pos.exchange_sl_id = Some("2".into());
        croupier.tracker.register(pos);
    }

    #[tokio::test]
    async fn soft_exit_narrows_tp_once() {
        let (croupier, exits, _bus) = test_setup("soft");
        open_long(&croupier, "T1", 60);

        let pos = croupier.tracker.get("T1").unwrap();
        exits.check_time_exit(&pos).await;

        let updated = croupier.tracker.get("T1").unwrap();
        assert!(updated.soft_exit_triggered);
        // TP distance halved: 100 + 2*0.5 = 101.
        assert!((updated.tp_level - 101.0).abs() < 1e-9);

        // Second candle does not narrow again.
        exits.check_time_exit(&updated).await;
        assert!((croupier.tracker.get("T1").unwrap().tp_level - 101.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn double_max_hold_force_closes() {
        let (croupier, exits, _bus) = test_setup("force");
        open_long(&croupier, "T1", 120);

        let pos = croupier.tracker.get("T1").unwrap();
        let closed = exits.check_time_exit(&pos).await;
        assert!(closed);
        assert_eq!(croupier.tracker.open_count(), 0);
        let trades = croupier.tracker.closed_trades();
        assert_eq!(trades[0].exit_reason, "HARD_TIME_EXIT");
    }

    #[tokio::test]
    async fn breakeven_moves_sl_to_entry_cushion() {
        let (croupier, exits, _bus) = test_setup("breakeven");
        open_long(&croupier, "T1", 1);

        let pos = croupier.tracker.get("T1").unwrap();
        // 0.5% profit >= 0.4% activation.
        exits.check_breakeven(&pos, 100.5).await;

        let updated = croupier.tracker.get("T1").unwrap();
        assert!((updated.sl_level - 100.1).abs() < 1e-9);

        // Already at/above entry: no further move.
        exits.check_breakeven(&updated, 100.5).await;
        assert!((croupier.tracker.get("T1").unwrap().sl_level - 100.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trailing_only_improves() {
        let (croupier, exits, _bus) = test_setup("trailing");
        open_long(&croupier, "T1", 1);

        let pos = croupier.tracker.get("T1").unwrap();
        // 1% profit, trail 0.3%: new SL = 101 - 0.303 = 100.697.
        exits.check_trailing(&pos, 101.0).await;
        let sl_after_first = croupier.tracker.get("T1").unwrap().sl_level;
        assert!((sl_after_first - (101.0 - 101.0 * 0.003)).abs() < 1e-9);

        // Price retreats: SL must NOT move down.
        let pos = croupier.tracker.get("T1").unwrap();
        exits.check_trailing(&pos, 100.7).await;
        assert!((croupier.tracker.get("T1").unwrap().sl_level - sl_after_first).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reversal_closes_on_confident_opposite_signal() {
        let (croupier, exits, _bus) = test_setup("reversal");
        open_long(&croupier, "T1", 1);

        let signal = AggregatedSignal {
            symbol: "BTCUSDT".into(),
            candle_timestamp: 0,
            selected_sensor: "DeltaDivergence".into(),
            sensor_score: 0.9,
            side: crate::types::ConsensusSide::Short,
            confidence: 0.9,
            total_signals: 3,
            strategy_name: None,
            sigma_long: 0.1,
            sigma_short: 0.9,
            margin: 0.8,
            tp_pct: None,
            sl_pct: None,
        };
        exits.on_signal(&signal).await;
        assert_eq!(croupier.tracker.open_count(), 0);
        assert_eq!(croupier.tracker.closed_trades()[0].exit_reason, "SIGNAL_REVERSAL");
    }

    #[tokio::test]
    async fn weak_reversal_is_ignored() {
        let (croupier, exits, _bus) = test_setup("weak");
        open_long(&croupier, "T1", 1);

        let signal = AggregatedSignal {
            symbol: "BTCUSDT".into(),
            candle_timestamp: 0,
            selected_sensor: "DeltaDivergence".into(),
            sensor_score: 0.3,
            side: crate::types::ConsensusSide::Short,
            confidence: 0.3,
            total_signals: 1,
            strategy_name: None,
            sigma_long: 0.4,
            sigma_short: 0.5,
            margin: 0.1,
            tp_pct: None,
            sl_pct: None,
        };
        exits.on_signal(&signal).await;
        assert_eq!(croupier.tracker.open_count(), 1);
    }

    #[tokio::test]
    async fn aggressive_drain_closes_worst_by_bars_held() {
        let (croupier, exits, _bus) = test_setup("drain");
        for (id, bars) in [("OLD", 50u32), ("MID", 20), ("NEW", 2), ("NEWER", 1), ("NEWEST", 0)] {
            open_long(&croupier, id, bars);
        }

        exits.trigger_aggressive_exits(0.2).await;

        // Worst 20% of 5 = 1 position ("OLD") force-closed.
        assert_eq!(croupier.tracker.open_count(), 4);
        assert!(croupier.tracker.get("OLD").is_none());
        // The survivors are defended.
        for id in ["MID", "NEW", "NEWER", "NEWEST"] {
            assert!(croupier.tracker.get(id).unwrap().defensive_exit_triggered);
        }
    }

    #[tokio::test]
    async fn candle_for_other_symbol_never_touches_position() {
        let (croupier, exits, _bus) = test_setup("isolation");
        open_long(&croupier, "T1", 60);

        let mut candle = crate::sensors::testutil::make_candle(0, 100.0, 101.0, 99.5, 100.5, 10.0);
        candle.symbol = "ETHUSDT".into();
        exits.on_candle(&candle).await;

        let pos = croupier.tracker.get("T1").unwrap();
        assert!(!pos.soft_exit_triggered, "foreign candle must not trigger exits");
    }
}
