// =============================================================================
// Order Manager — Decision consumer and sizing glue
// =============================================================================
//
// Turns Decisions into bracket executions:
//   - duplicate guard keyed by decision_id
//   - FIXED_NOTIONAL (equity * bet) or FIXED_RISK (equity * bet / sl_pct)
//   - amount floored to step size; zero after flooring is rejected
//
// On candles it advances position bar counts, confirms candle-detected exits
// in testing mode (live/demo trusts the exchange stream), and runs the
// conditional integrity validation that reconciliation repairs arm.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::croupier::Croupier;
use crate::events::{Decision, EventBus};
use crate::market_data::FootprintCandle;
use crate::observability::Metrics;
use crate::runtime_config::{RuntimeConfig, SizingMode};

/// Candles between conditional integrity validations while armed.
const VALIDATION_INTERVAL: u32 = 5;

pub struct OrderManager {
    croupier: Arc<Croupier>,
    bus: EventBus,
    config: Arc<RuntimeConfig>,
    metrics: Arc<Metrics>,
    processed_decisions: Mutex<HashSet<String>>,
    validation_needed: AtomicBool,
    validation_candle_count: AtomicU32,
    /// Last close per symbol; sizing fallback when no ticker cache exists.
    last_close: Mutex<std::collections::HashMap<String, f64>>,
}

impl OrderManager {
    pub fn new(croupier: Arc<Croupier>, bus: EventBus, config: Arc<RuntimeConfig>, metrics: Arc<Metrics>) -> Self {
        Self {
            croupier,
            bus,
            config,
            metrics,
            processed_decisions: Mutex::new(HashSet::new()),
            validation_needed: AtomicBool::new(false),
            validation_candle_count: AtomicU32::new(0),
            last_close: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut decisions = self.bus.decisions.subscribe();
        let mut candles = self.bus.candles.subscribe();
        info!("order manager started");

        loop {
            tokio::select! {
                decision = decisions.recv() => match decision {
                    Ok(decision) => self.on_decision(decision).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "order manager lagged behind decisions");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                candle = candles.recv() => match candle {
                    Ok(candle) => self.on_candle(&candle).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "order manager lagged behind candles");
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
        info!("order manager stopped");
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    pub async fn on_decision(&self, decision: Decision) {
        // Duplicate guard: a decision id is executed at most once.
        if !self.processed_decisions.lock().insert(decision.decision_id.clone()) {
            warn!(decision_id = %decision.decision_id, "duplicate decision detected, skipping");
            return;
        }

        info!(
            decision_id = %decision.decision_id,
            symbol = %decision.symbol,
            side = %decision.side,
            bet_size = format!("{:.2}%", decision.bet_size * 100.0),
            sensor = %decision.selected_sensor,
            "decision received"
        );

        let tp_pct = decision.tp_pct.unwrap_or(self.config.take_profit_pct);
        let sl_pct = decision.sl_pct.unwrap_or(self.config.stop_loss_pct);

        let equity = self.croupier.get_equity();
        let notional = match self.config.sizing_mode {
            SizingMode::FixedNotional => equity * decision.bet_size,
            SizingMode::FixedRisk => {
                if sl_pct <= 0.0 {
                    error!(sl_pct, "fixed-risk sizing requires a positive stop distance");
                    return;
                }
                equity * decision.bet_size / sl_pct
            }
        };

        let price_hint = self.last_close.lock().get(&decision.symbol).copied();
        let price = match self.croupier.current_price(&decision.symbol, price_hint).await {
            Ok(p) if p > 0.0 => p,
            Ok(p) => {
                error!(symbol = %decision.symbol, price = p, "unusable price for sizing");
                return;
            }
            Err(e) => {
                error!(symbol = %decision.symbol, error = %e, "failed to price decision");
                return;
            }
        };

        let amount_raw = notional / price;
        let amount: f64 = self
            .croupier
            .connector
            .amount_to_precision(&decision.symbol, amount_raw)
            .parse()
            .unwrap_or(0.0);
        if amount <= 0.0 {
            error!(
                symbol = %decision.symbol,
                amount_raw,
                equity,
                "order too small after precision flooring, rejected"
            );
            return;
        }

        info!(
            symbol = %decision.symbol,
            equity,
            notional = format!("{notional:.2}"),
            price,
            amount,
            "order sized"
        );

        match self
            .croupier
            .open_bracket(&decision, amount, price, tp_pct, sl_pct)
            .await
        {
            Ok(position) => {
                info!(
                    trade_id = %position.trade_id,
                    symbol = %position.symbol,
                    "decision executed"
                );
                self.metrics.decisions_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Abandoned decision: no partial state remains.
                error!(
                    decision_id = %decision.decision_id,
                    error = %e,
                    "decision execution failed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    pub async fn on_candle(&self, candle: &FootprintCandle) {
        self.last_close
            .lock()
            .insert(candle.symbol.clone(), candle.close);

        // Reconciliation repairs arm conditional validation.
        if self.croupier.integrity_check_failed.swap(false, Ordering::SeqCst) {
            self.validation_needed.store(true, Ordering::SeqCst);
            info!("integrity failure flagged, conditional validation armed");
        }

        if self.validation_needed.load(Ordering::SeqCst) {
            let count = self.validation_candle_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= VALIDATION_INTERVAL {
                self.validation_candle_count.store(0, Ordering::SeqCst);
                info!("running conditional position integrity validation");
                match self.croupier.validate_all_positions_integrity().await {
                    Ok(()) => {
                        if !self.croupier.integrity_check_failed.load(Ordering::SeqCst) {
                            self.validation_needed.store(false, Ordering::SeqCst);
                            info!("validation clean, conditional checks disarmed");
                        }
                    }
                    Err(e) => error!(error = %e, "integrity validation failed"),
                }
            }
        }

        // Bars-held advance + TP/SL touch detection.
        let detected = self.croupier.tracker.on_candle(candle);
        if detected.is_empty() {
            return;
        }

        if self.croupier.mode().is_exchange_backed() {
            // Live/demo: TP/SL fills arrive via the user-data stream and MUST
            // be trusted; candle detection is observation only.
            for exit in detected {
                tracing::debug!(
                    trade_id = %exit.trade_id,
                    reason = exit.exit_reason,
                    "candle touched a bracket level, awaiting exchange confirmation"
                );
            }
            return;
        }

        for exit in detected {
            match self
                .croupier
                .close_position(&exit.trade_id, exit.exit_reason, Some(exit.exit_price))
                .await
            {
                Ok(trade) => info!(
                    trade_id = %trade.trade_id,
                    reason = %trade.exit_reason,
                    pnl = format!("{:.4}", trade.pnl),
                    "simulated exit confirmed"
                ),
                Err(e) => error!(trade_id = %exit.trade_id, error = %e, "simulated exit failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::croupier::position_tracker::PositionTracker;
    use crate::resilience::ErrorHandler;
    use crate::types::{Side, TradeMode};

    fn setup(tag: &str) -> (Arc<OrderManager>, Arc<Croupier>, EventBus) {
        let path = std::env::temp_dir().join(format!("vega-om-{}-{}.json", tag, std::process::id()));
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
        croupier.set_equity(10_000.0);

        let config = Arc::new(RuntimeConfig::default());
        let om = Arc::new(OrderManager::new(
            croupier.clone(),
            bus.clone(),
            config,
            Arc::new(Metrics::new()),
        ));
        (om, croupier, bus)
    }

    fn decision(id: &str) -> Decision {
        Decision {
            decision_id: id.into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            bet_size: 0.01,
            tp_pct: None,
            sl_pct: None,
            selected_sensor: "EmaCrossover".into(),
            timestamp: 0.0,
        }
    }

    #[tokio::test]
    async fn decision_opens_simulated_position() {
        let (om, croupier, _bus) = setup("open");
        om.last_close.lock().insert("BTCUSDT".into(), 50_000.0);

        om.on_decision(decision("DEC_1")).await;
        assert_eq!(croupier.tracker.open_count(), 1);

        let pos = &croupier.tracker.open_positions()[0];
        // 1% of 10k = 100 USDT at 50k = 0.002 BTC.
        assert!((pos.amount - 0.002).abs() < 1e-9);
        assert!((pos.entry_price - 50_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn duplicate_decision_is_executed_once() {
        let (om, croupier, _bus) = setup("dup");
        om.last_close.lock().insert("BTCUSDT".into(), 50_000.0);

        om.on_decision(decision("DEC_SAME")).await;
        om.on_decision(decision("DEC_SAME")).await;
        assert_eq!(croupier.tracker.open_count(), 1);
    }

    #[tokio::test]
    async fn decision_without_price_is_abandoned() {
        let (om, croupier, _bus) = setup("noprice");
        om.on_decision(decision("DEC_NP")).await;
        // No price hint, testing mode, no cache: no partial state.
        assert_eq!(croupier.tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn candle_exit_confirms_in_testing_mode() {
        let (om, croupier, _bus) = setup("exit");
        om.last_close.lock().insert("BTCUSDT".into(), 50_000.0);
        om.on_decision(decision("DEC_X")).await;
        assert_eq!(croupier.tracker.open_count(), 1);
        let tp_level = croupier.tracker.open_positions()[0].tp_level;

        // Candle sweeps through the TP.
        let candle = crate::sensors::testutil::make_candle(
            60,
            50_000.0,
            tp_level + 100.0,
            49_900.0,
            tp_level + 50.0,
            5.0,
        );
        om.on_candle(&candle).await;

        assert_eq!(croupier.tracker.open_count(), 0);
        let trades = croupier.tracker.closed_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "TP");
        assert!(trades[0].won);
    }

    #[tokio::test]
    async fn fixed_risk_sizing_divides_by_stop_distance() {
        let (_om, croupier, bus) = setup("risk");
        let mut config = RuntimeConfig::default();
        config.sizing_mode = SizingMode::FixedRisk;
        let om = Arc::new(OrderManager::new(
            croupier.clone(),
            bus,
            Arc::new(config),
            Arc::new(Metrics::new()),
        ));
        om.last_close.lock().insert("BTCUSDT".into(), 50_000.0);

        om.on_decision(decision("DEC_R")).await;
        let pos = &croupier.tracker.open_positions()[0];
        // risk = 100 USDT; sl 0.5% -> notional 20k -> amount 0.4.
        assert!((pos.amount - 0.4).abs() < 1e-9, "amount = {}", pos.amount);
    }
}
