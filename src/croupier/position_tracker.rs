// =============================================================================
// Position Tracker — authoritative local view of open positions
// =============================================================================
//
// Only the Croupier mutates this state; everything else takes snapshots.
// Every mutation rewrites the bot-state JSON atomically so a restart can
// reconstruct the session. An open position MUST carry both exchange-side
// TP and SL ids; a nulled id marks the position as a reconciliation
// candidate.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::events::ClosedTrade;
use crate::market_data::FootprintCandle;
use crate::types::{epoch_now, Side};

/// Taker fee fraction applied to notional on close.
pub const TAKER_FEE: f64 = 0.0006;

/// A tracked open position with its protective order bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Position size in contracts.
    pub amount: f64,
    /// Entry notional in quote units. Always tracked; a non-positive value is
    /// a reconciliation defect, never an estimate.
    pub notional: f64,
    pub tp_level: f64,
    pub sl_level: f64,
    /// Client ids of the protective orders.
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    /// Exchange-side ids; both must be non-null while the position is open.
    pub exchange_tp_id: Option<String>,
    pub exchange_sl_id: Option<String>,
    pub bars_held: u32,
    pub soft_exit_triggered: bool,
    pub defensive_exit_triggered: bool,
    pub opened_at: f64,
    /// Sensor that triggered the entry ("Adopted" for reconciled orphans).
    pub sensor_id: String,
    pub adopted: bool,
}

impl OpenPosition {
    /// Whether the protective bracket is fully bound to the exchange.
    pub fn bracket_intact(&self) -> bool {
        self.exchange_tp_id.is_some() && self.exchange_sl_id.is_some()
    }
}

/// A TP/SL touch detected from candle data (testing mode only).
#[derive(Debug, Clone)]
pub struct DetectedExit {
    pub trade_id: String,
    pub exit_reason: &'static str,
    pub exit_price: f64,
}

/// Persisted session state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotState {
    pub positions: Vec<OpenPosition>,
    pub start_balance: f64,
    pub current_balance: f64,
    #[serde(default)]
    pub closed_trades: Vec<ClosedTrade>,
}

pub struct PositionTracker {
    open: RwLock<HashMap<String, OpenPosition>>,
    closed: RwLock<Vec<ClosedTrade>>,
    state_path: PathBuf,
    start_balance: RwLock<f64>,
    current_balance: RwLock<f64>,
}

impl PositionTracker {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let mut open = HashMap::new();
        let mut closed = Vec::new();
        let mut start_balance = 0.0;
        let mut current_balance = 0.0;

        if let Ok(content) = std::fs::read_to_string(&state_path) {
            match serde_json::from_str::<BotState>(&content) {
                Ok(state) => {
                    info!(
                        path = %state_path.display(),
                        positions = state.positions.len(),
                        "bot state restored"
                    );
                    for pos in state.positions {
                        open.insert(pos.trade_id.clone(), pos);
                    }
                    closed = state.closed_trades;
                    start_balance = state.start_balance;
                    current_balance = state.current_balance;
                }
                Err(e) => error!(path = %state_path.display(), error = %e, "failed to parse bot state"),
            }
        }

        Self {
            open: RwLock::new(open),
            closed: RwLock::new(closed),
            state_path,
            start_balance: RwLock::new(start_balance),
            current_balance: RwLock::new(current_balance),
        }
    }

    // -------------------------------------------------------------------------
    // Registration & mutation
    // -------------------------------------------------------------------------

    /// Register a position atomically (called with both bracket ids present).
    pub fn register(&self, position: OpenPosition) {
        if !position.bracket_intact() && !position.adopted {
            warn!(
                trade_id = %position.trade_id,
                "registering position with incomplete bracket, reconciliation candidate"
            );
        }
        info!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            side = %position.side,
            entry = position.entry_price,
            amount = position.amount,
            tp = position.tp_level,
            sl = position.sl_level,
            "position registered"
        );
        self.open.write().insert(position.trade_id.clone(), position);
        self.persist();
    }

    /// Apply a mutation to one open position.
    pub fn modify<F: FnOnce(&mut OpenPosition)>(&self, trade_id: &str, f: F) -> bool {
        let mut open = self.open.write();
        match open.get_mut(trade_id) {
            Some(pos) => {
                f(pos);
                drop(open);
                self.persist();
                true
            }
            None => false,
        }
    }

    /// Remove a position without recording a trade (ghost cleanup).
    pub fn remove(&self, trade_id: &str) -> Option<OpenPosition> {
        let removed = self.open.write().remove(trade_id);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Close a position: move it to the closed list with its realised PnL.
    pub fn confirm_close(
        &self,
        trade_id: &str,
        exit_price: f64,
        exit_reason: &str,
        pnl: f64,
        fee: f64,
    ) -> Option<ClosedTrade> {
        let position = self.open.write().remove(trade_id)?;

        let trade = ClosedTrade {
            trade_id: position.trade_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            fee,
            exit_reason: exit_reason.to_string(),
            sensor_id: position.sensor_id.clone(),
            won: pnl > 0.0,
        };

        info!(
            trade_id,
            symbol = %trade.symbol,
            reason = exit_reason,
            exit_price,
            pnl = format!("{pnl:.4}"),
            won = trade.won,
            "trade closed"
        );

        {
            let mut balance = self.current_balance.write();
            *balance += pnl - fee;
        }
        self.closed.write().push(trade.clone());
        self.persist();
        Some(trade)
    }

    // -------------------------------------------------------------------------
    // Candle processing
    // -------------------------------------------------------------------------

    /// Advance bars_held for the candle's symbol and detect TP/SL touches.
    ///
    /// Touch detection is consumed only in testing mode; live/demo trusts the
    /// exchange's fills via the user-data stream.
    pub fn on_candle(&self, candle: &FootprintCandle) -> Vec<DetectedExit> {
        let mut exits = Vec::new();
        let mut changed = false;

        {
            let mut open = self.open.write();
            for pos in open.values_mut().filter(|p| p.symbol == candle.symbol) {
                pos.bars_held += 1;
                changed = true;

                match pos.side {
                    Side::Long => {
                        if candle.low <= pos.sl_level {
                            exits.push(DetectedExit {
                                trade_id: pos.trade_id.clone(),
                                exit_reason: "SL",
                                exit_price: pos.sl_level,
                            });
                        } else if candle.high >= pos.tp_level {
                            exits.push(DetectedExit {
                                trade_id: pos.trade_id.clone(),
                                exit_reason: "TP",
                                exit_price: pos.tp_level,
                            });
                        }
                    }
                    Side::Short => {
                        if candle.high >= pos.sl_level {
                            exits.push(DetectedExit {
                                trade_id: pos.trade_id.clone(),
                                exit_reason: "SL",
                                exit_price: pos.sl_level,
                            });
                        } else if candle.low <= pos.tp_level {
                            exits.push(DetectedExit {
                                trade_id: pos.trade_id.clone(),
                                exit_reason: "TP",
                                exit_price: pos.tp_level,
                            });
                        }
                    }
                }
            }
        }

        if changed {
            self.persist();
        }
        exits
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, trade_id: &str) -> Option<OpenPosition> {
        self.open.read().get(trade_id).cloned()
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_for_symbol(&self, symbol: &str) -> Vec<OpenPosition> {
        self.open
            .read()
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    /// Positions whose bracket is not fully bound (reconciliation candidates).
    pub fn integrity_candidates(&self) -> Vec<OpenPosition> {
        self.open
            .read()
            .values()
            .filter(|p| !p.bracket_intact() || p.notional <= 0.0)
            .cloned()
            .collect()
    }

    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.closed.read().clone()
    }

    // -------------------------------------------------------------------------
    // Balance bookkeeping & session summary
    // -------------------------------------------------------------------------

    pub fn set_balances(&self, start: f64, current: f64) {
        *self.start_balance.write() = start;
        *self.current_balance.write() = current;
        self.persist();
    }

    pub fn set_current_balance(&self, current: f64) {
        *self.current_balance.write() = current;
        self.persist();
    }

    pub fn balances(&self) -> (f64, f64) {
        (*self.start_balance.read(), *self.current_balance.read())
    }

    /// Aggregate statistics over the session's closed trades.
    pub fn session_summary(&self) -> SessionSummary {
        let closed = self.closed.read();
        let wins = closed.iter().filter(|t| t.won).count();
        let total_net_pnl: f64 = closed.iter().map(|t| t.pnl - t.fee).sum();
        let total_fees: f64 = closed.iter().map(|t| t.fee).sum();
        let (start, current) = self.balances();

        SessionSummary {
            count: closed.len(),
            wins,
            losses: closed.len() - wins,
            total_net_pnl,
            total_fees,
            start_balance: start,
            final_balance: current,
            account_delta: current - start,
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist(&self) {
        let state = BotState {
            positions: self.open.read().values().cloned().collect(),
            start_balance: *self.start_balance.read(),
            current_balance: *self.current_balance.read(),
            closed_trades: self.closed.read().clone(),
        };
        if let Err(e) = crate::persist::atomic_write_json(&self.state_path, &state) {
            error!(error = %e, "failed to persist bot state");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub count: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_net_pnl: f64,
    pub total_fees: f64,
    pub start_balance: f64,
    pub final_balance: f64,
    pub account_delta: f64,
}

/// Helper to build a freshly opened position.
#[allow(clippy::too_many_arguments)]
pub fn new_position(
    trade_id: String,
    symbol: String,
    side: Side,
    entry_price: f64,
    amount: f64,
    tp_level: f64,
    sl_level: f64,
    sensor_id: String,
) -> OpenPosition {
    OpenPosition {
        trade_id,
        symbol,
        side,
        entry_price,
        amount,
        notional: entry_price * amount,
        tp_level,
        sl_level,
        tp_order_id: None,
        sl_order_id: None,
        exchange_tp_id: None,
        exchange_sl_id: None,
        bars_held: 0,
        soft_exit_triggered: false,
        defensive_exit_triggered: false,
        opened_at: epoch_now(),
        sensor_id,
        adopted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::testutil::make_candle;

    fn temp_tracker(tag: &str) -> PositionTracker {
        let path = std::env::temp_dir().join(format!("vega-positions-{}-{}.json", tag, std::process::id()));
        let _ = std::fs::remove_file(&path);
        PositionTracker::new(path)
    }

    fn long_position(trade_id: &str) -> OpenPosition {
        let mut pos = new_position(
            trade_id.to_string(),
            "BTCUSDT".into(),
            Side::Long,
            100.0,
            1.0,
            102.0,
            99.0,
            "EmaCrossover".into(),
        );
        pos.tp_order_id = Some("C3_TP_aaaabbbbcccc".into());
        pos.sl_order_id = Some("C3_STOP_aaaabbbbcccc".into());
        pos.exchange_tp_id = Some("1001".into());
        pos.exchange_sl_id = Some("1002".into());
        pos
    }

    #[test]
    fn register_and_close_records_pnl() {
        let tracker = temp_tracker("close");
        tracker.register(long_position("T1"));
        assert_eq!(tracker.open_count(), 1);

        let trade = tracker.confirm_close("T1", 102.0, "TP", 2.0, 0.06).unwrap();
        assert!(trade.won);
        assert_eq!(tracker.open_count(), 0);
        assert_eq!(tracker.closed_trades().len(), 1);
    }

    #[test]
    fn candle_detection_long_sl_beats_tp() {
        let tracker = temp_tracker("detect");
        tracker.register(long_position("T1"));

        // Candle spans both levels: SL is checked first.
        let candle = make_candle(0, 100.0, 103.0, 98.0, 100.0, 10.0);
        let exits = tracker.on_candle(&candle);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].exit_reason, "SL");
        assert!((exits[0].exit_price - 99.0).abs() < 1e-9);
    }

    #[test]
    fn candle_detection_ignores_other_symbols_but_counts_bars() {
        let tracker = temp_tracker("bars");
        tracker.register(long_position("T1"));

        let mut eth_candle = make_candle(0, 100.0, 200.0, 50.0, 100.0, 10.0);
        eth_candle.symbol = "ETHUSDT".into();
        assert!(tracker.on_candle(&eth_candle).is_empty());
        assert_eq!(tracker.get("T1").unwrap().bars_held, 0);

        let btc_candle = make_candle(0, 100.0, 101.0, 99.5, 100.5, 10.0);
        assert!(tracker.on_candle(&btc_candle).is_empty());
        assert_eq!(tracker.get("T1").unwrap().bars_held, 1);
    }

    #[test]
    fn short_position_tp_detection() {
        let tracker = temp_tracker("short");
        let mut pos = long_position("T1");
        pos.side = Side::Short;
        pos.tp_level = 98.0;
        pos.sl_level = 101.5;
        tracker.register(pos);

        let candle = make_candle(0, 100.0, 100.4, 97.5, 98.2, 10.0);
        let exits = tracker.on_candle(&candle);
        assert_eq!(exits[0].exit_reason, "TP");
    }

    #[test]
    fn integrity_candidates_flag_null_ids_and_bad_notional() {
        let tracker = temp_tracker("integrity");
        tracker.register(long_position("GOOD"));

        let mut broken = long_position("BROKEN");
        broken.exchange_sl_id = None;
        tracker.register(broken);

        let mut no_notional = long_position("NO_NOTIONAL");
        no_notional.notional = 0.0;
        tracker.register(no_notional);

        let flagged: Vec<String> = tracker
            .integrity_candidates()
            .into_iter()
            .map(|p| p.trade_id)
            .collect();
        assert!(flagged.contains(&"BROKEN".to_string()));
        assert!(flagged.contains(&"NO_NOTIONAL".to_string()));
        assert!(!flagged.contains(&"GOOD".to_string()));
    }

    #[test]
    fn state_survives_restart() {
        let path = std::env::temp_dir().join(format!("vega-positions-restart-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let tracker = PositionTracker::new(path.clone());
            tracker.set_balances(1000.0, 1000.0);
            tracker.register(long_position("T1"));
        }

        let restored = PositionTracker::new(path.clone());
        assert_eq!(restored.open_count(), 1);
        let pos = restored.get("T1").unwrap();
        assert_eq!(pos.symbol, "BTCUSDT");
        assert!(pos.bracket_intact());
        assert_eq!(restored.balances().0, 1000.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn session_summary_aggregates() {
        let tracker = temp_tracker("summary");
        tracker.set_balances(1000.0, 1000.0);
        tracker.register(long_position("W"));
        tracker.confirm_close("W", 102.0, "TP", 2.0, 0.06);
        tracker.register(long_position("L"));
        tracker.confirm_close("L", 99.0, "SL", -1.0, 0.06);

        let summary = tracker.session_summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);
        assert!((summary.total_net_pnl - (2.0 - 0.06 - 1.0 - 0.06)).abs() < 1e-9);
        assert!((summary.account_delta - 0.88).abs() < 1e-9);
    }
}
