// =============================================================================
// OCO Manager — bracket entry with atomic protective registration
// =============================================================================
//
// Bracket flow:
//   1. Market entry with an ENTRY client id.
//   2. Fill price from the response average (ticker fallback).
//   3. TP/SL prices from side + tp_pct + sl_pct.
//   4. Native OCO bracket referencing the position.
//   5. Atomic registration in the tracker with both child ids present.
//
// A bracket failure after the fill is unwound immediately with a reduce-only
// market close: the engine never sits on a naked position.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::binance::client::OrderParams;
use crate::binance::BinanceConnector;
use crate::croupier::order_executor::OrderExecutor;
use crate::croupier::position_tracker::{new_position, OpenPosition, PositionTracker};
use crate::events::Decision;
use crate::types::{Side, TradeMode};

pub struct OcoManager {
    connector: Arc<BinanceConnector>,
    executor: Arc<OrderExecutor>,
    tracker: Arc<PositionTracker>,
    mode: TradeMode,
}

impl OcoManager {
    pub fn new(
        connector: Arc<BinanceConnector>,
        executor: Arc<OrderExecutor>,
        tracker: Arc<PositionTracker>,
        mode: TradeMode,
    ) -> Self {
        Self {
            connector,
            executor,
            tracker,
            mode,
        }
    }

    /// Execute the full bracket for a decision. Returns the registered
    /// position.
    pub async fn open_bracket(
        &self,
        decision: &Decision,
        amount: f64,
        reference_price: f64,
        tp_pct: f64,
        sl_pct: f64,
    ) -> Result<OpenPosition> {
        if !self.mode.is_exchange_backed() {
            return Ok(self.open_simulated(decision, amount, reference_price, tp_pct, sl_pct));
        }

        // 1. Entry.
        let entry = self
            .executor
            .execute_market_order(
                &decision.symbol,
                decision.side.entry_order(),
                amount,
                OrderParams::default(),
                Some(std::time::Duration::from_secs(20)),
            )
            .await
            .context("bracket entry failed")?;

        // 2. Fill price.
        let fill_price = if entry.average > 0.0 {
            entry.average
        } else {
            warn!(symbol = %decision.symbol, "entry response missing average, falling back to ticker");
            self.connector
                .fetch_ticker(&decision.symbol)
                .await
                .map(|t| t.last)
                .unwrap_or(reference_price)
        };
        let filled_amount = if entry.filled > 0.0 { entry.filled } else { amount };

        // 3. Bracket levels.
        let (tp_price, sl_price) = bracket_levels(decision.side, fill_price, tp_pct, sl_pct);

        // 4. Native OCO.
        let bracket = match self
            .connector
            .create_native_oco(
                &decision.symbol,
                decision.side.exit_order(),
                filled_amount,
                tp_price,
                sl_price,
                None,
            )
            .await
        {
            Ok(b) => b,
            Err(e) => {
                // The position is live without protection: close it NOW.
                error!(
                    symbol = %decision.symbol,
                    error = %e,
                    "OCO bracket failed after fill, unwinding entry"
                );
                self.unwind_entry(&decision.symbol, decision.side, filled_amount).await;
                return Err(e).context("bracket protection failed, entry unwound");
            }
        };

        // 5. Atomic registration.
        let mut position = new_position(
            decision.decision_id.clone(),
            decision.symbol.clone(),
            decision.side,
            fill_price,
            filled_amount,
            tp_price,
            sl_price,
            decision.selected_sensor.clone(),
        );
        position.tp_order_id = Some(bracket.client_algo_id.clone());
        position.sl_order_id = Some(bracket.client_algo_id.clone());
        position.exchange_tp_id = Some(bracket.exchange_tp_id);
        position.exchange_sl_id = Some(bracket.exchange_sl_id);

        self.tracker.register(position.clone());

        info!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            entry = fill_price,
            tp = tp_price,
            sl = sl_price,
            "bracket complete"
        );
        Ok(position)
    }

    fn open_simulated(
        &self,
        decision: &Decision,
        amount: f64,
        reference_price: f64,
        tp_pct: f64,
        sl_pct: f64,
    ) -> OpenPosition {
        let (tp_price, sl_price) = bracket_levels(decision.side, reference_price, tp_pct, sl_pct);
        let sim_id = Uuid::new_v4().simple().to_string();

        let mut position = new_position(
            decision.decision_id.clone(),
            decision.symbol.clone(),
            decision.side,
            reference_price,
            amount,
            tp_price,
            sl_price,
            decision.selected_sensor.clone(),
        );
        position.tp_order_id = Some(format!("SIM_TP_{}", &sim_id[..12]));
        position.sl_order_id = Some(format!("SIM_STOP_{}", &sim_id[..12]));
        position.exchange_tp_id = position.tp_order_id.clone();
        position.exchange_sl_id = position.sl_order_id.clone();

        info!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            entry = reference_price,
            "simulated bracket registered"
        );
        self.tracker.register(position.clone());
        position
    }

    async fn unwind_entry(&self, symbol: &str, side: Side, amount: f64) {
        let params = OrderParams {
            reduce_only: true,
            ..Default::default()
        };
        match self
            .executor
            .execute_market_order(symbol, side.exit_order(), amount, params, None)
            .await
        {
            Ok(_) => info!(symbol, "unprotected entry closed"),
            Err(e) => error!(symbol, error = %e, "FAILED to unwind unprotected entry, manual action required"),
        }
    }
}

/// TP/SL levels from side + entry + fractional distances.
pub fn bracket_levels(side: Side, entry: f64, tp_pct: f64, sl_pct: f64) -> (f64, f64) {
    match side {
        Side::Long => (entry * (1.0 + tp_pct), entry * (1.0 - sl_pct)),
        Side::Short => (entry * (1.0 - tp_pct), entry * (1.0 + sl_pct)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ErrorHandler;

    #[test]
    fn bracket_levels_respect_side() {
        let (tp, sl) = bracket_levels(Side::Long, 100.0, 0.02, 0.01);
        assert!((tp - 102.0).abs() < 1e-9);
        assert!((sl - 99.0).abs() < 1e-9);

        let (tp, sl) = bracket_levels(Side::Short, 100.0, 0.02, 0.01);
        assert!((tp - 98.0).abs() < 1e-9);
        assert!((sl - 101.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn simulated_bracket_registers_with_ids() {
        let path = std::env::temp_dir().join(format!("vega-oco-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let handler = Arc::new(ErrorHandler::new());
        let connector = Arc::new(BinanceConnector::new("", "", TradeMode::Testing, handler.clone()));
        let executor = Arc::new(OrderExecutor::new(connector.clone(), handler));
        let tracker = Arc::new(PositionTracker::new(path.clone()));
        let oco = OcoManager::new(connector, executor, tracker.clone(), TradeMode::Testing);

        let decision = Decision {
            decision_id: "DEC_test".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            bet_size: 0.01,
            tp_pct: None,
            sl_pct: None,
            selected_sensor: "EmaCrossover".into(),
            timestamp: 0.0,
        };

        let position = oco.open_bracket(&decision, 0.01, 37000.0, 0.01, 0.005).await.unwrap();
        assert!(position.bracket_intact());
        assert!((position.tp_level - 37370.0).abs() < 1e-6);
        assert!((position.sl_level - 36815.0).abs() < 1e-6);
        assert!((position.notional - 370.0).abs() < 1e-6);
        assert_eq!(tracker.open_count(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
