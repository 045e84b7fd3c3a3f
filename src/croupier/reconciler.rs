// =============================================================================
// Reconciler — converge local state on exchange state
// =============================================================================
//
// Runs at startup and every 5 minutes:
//   - ADOPT: exchange positions unknown to the tracker are reconstructed from
//     the exchange entry price and their detected C3_TP_* / C3_STOP_* orders.
//     No new orders are ever placed here.
//   - GHOST: tracker positions with no matching exchange position are removed.
//   - REBIND: tracker positions whose TP/SL ids no longer match any open
//     exchange order are repaired by re-binding the detected orders.
//
// Any repair flags the Croupier, which makes the order manager run
// conditional integrity validation until a clean pass.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::binance::client::NormalizedOrder;
use crate::binance::BinanceConnector;
use crate::croupier::order_executor::{classify_client_id, IdPrefix};
use crate::croupier::position_tracker::{OpenPosition, PositionTracker};
use crate::types::epoch_now;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub adopted: u64,
    pub ghosts_removed: u64,
    pub rebound: u64,
    pub positions_matched: u64,
}

impl ReconcileReport {
    pub fn clean(&self) -> bool {
        self.adopted == 0 && self.ghosts_removed == 0 && self.rebound == 0
    }

    pub fn repairs(&self) -> u64 {
        self.adopted + self.ghosts_removed + self.rebound
    }
}

pub struct Reconciler {
    connector: Arc<BinanceConnector>,
    tracker: Arc<PositionTracker>,
}

impl Reconciler {
    pub fn new(connector: Arc<BinanceConnector>, tracker: Arc<PositionTracker>) -> Self {
        Self { connector, tracker }
    }

    /// Run one reconciliation cycle, optionally restricted to `symbols`.
    pub async fn run(&self, symbols: Option<&[String]>) -> Result<ReconcileReport> {
        let exchange_positions = self
            .connector
            .fetch_positions(None)
            .await
            .context("reconcile: failed to fetch positions")?;
        let open_orders = self
            .connector
            .fetch_open_orders(None)
            .await
            .context("reconcile: failed to fetch open orders")?;

        let in_scope = |symbol: &str| symbols.map(|list| list.iter().any(|s| s == symbol)).unwrap_or(true);

        let report = self.reconcile_with(
            exchange_positions
                .into_iter()
                .filter(|p| in_scope(&p.symbol))
                .map(|p| (p.symbol, p.side, p.amount, p.entry_price))
                .collect(),
            open_orders.into_iter().filter(|o| in_scope(&o.symbol)).collect(),
        );

        info!(
            adopted = report.adopted,
            ghosts_removed = report.ghosts_removed,
            rebound = report.rebound,
            matched = report.positions_matched,
            "reconciliation cycle complete"
        );
        Ok(report)
    }

    /// Pure reconciliation against pre-fetched exchange snapshots.
    /// `exchange_positions`: (symbol, side, amount, entry_price).
    pub fn reconcile_with(
        &self,
        exchange_positions: Vec<(String, crate::types::Side, f64, f64)>,
        open_orders: Vec<NormalizedOrder>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let exchange_symbols: HashSet<&str> = exchange_positions.iter().map(|(s, ..)| s.as_str()).collect();
        let order_ids: HashSet<&str> = open_orders
            .iter()
            .flat_map(|o| [o.id.as_str(), o.client_order_id.as_str()])
            .filter(|id| !id.is_empty())
            .collect();

        // Protective orders per symbol, classified by client-id prefix first,
        // order type second.
        let mut protective: HashMap<&str, (Option<&NormalizedOrder>, Option<&NormalizedOrder>)> = HashMap::new();
        for order in &open_orders {
            let slot = protective.entry(order.symbol.as_str()).or_default();
            match classify_protective(order) {
                Some(IdPrefix::Tp) => slot.0 = slot.0.or(Some(order)),
                Some(IdPrefix::Stop) => slot.1 = slot.1.or(Some(order)),
                _ => {}
            }
        }

        let tracked = self.tracker.open_positions();
        let tracked_symbols: HashSet<&str> = tracked.iter().map(|p| p.symbol.as_str()).collect();

        // 1. GHOSTS: tracked position, no exchange position.
        for position in &tracked {
            if !exchange_symbols.contains(position.symbol.as_str()) {
                warn!(
                    trade_id = %position.trade_id,
                    symbol = %position.symbol,
                    "ghost position removed (no exchange counterpart)"
                );
                self.tracker.remove(&position.trade_id);
                report.ghosts_removed += 1;
            }
        }

        // 2. ADOPTION: exchange position, nothing tracked.
        for (symbol, side, amount, entry_price) in &exchange_positions {
            if tracked_symbols.contains(symbol.as_str()) {
                continue;
            }
            let (tp, sl) = protective.get(symbol.as_str()).copied().unwrap_or((None, None));

            let uid = Uuid::new_v4().simple().to_string();
            let mut position = OpenPosition {
                trade_id: format!("ADOPTED_{}", &uid[..12]),
                symbol: symbol.clone(),
                side: *side,
                entry_price: *entry_price,
                amount: *amount,
                notional: entry_price * amount,
                tp_level: tp.map(order_trigger).unwrap_or(0.0),
                sl_level: sl.map(order_trigger).unwrap_or(0.0),
                tp_order_id: tp.map(|o| o.client_order_id.clone()).filter(|s| !s.is_empty()),
                sl_order_id: sl.map(|o| o.client_order_id.clone()).filter(|s| !s.is_empty()),
                exchange_tp_id: tp.map(|o| o.id.clone()),
                exchange_sl_id: sl.map(|o| o.id.clone()),
                bars_held: 0,
                soft_exit_triggered: false,
                defensive_exit_triggered: false,
                opened_at: epoch_now(),
                sensor_id: "Adopted".to_string(),
                adopted: true,
            };
            if position.notional <= 0.0 {
                warn!(symbol = %symbol, "adopted position reports zero notional, flagging for repair");
                position.exchange_tp_id = None;
            }

            info!(
                trade_id = %position.trade_id,
                symbol = %symbol,
                entry = entry_price,
                tp_bound = position.exchange_tp_id.is_some(),
                sl_bound = position.exchange_sl_id.is_some(),
                "orphan exchange position adopted"
            );
            self.tracker.register(position);
            report.adopted += 1;
        }

        // 3. REBIND: tracked + exchange match, but stale order ids.
        for position in self.tracker.open_positions() {
            if !exchange_symbols.contains(position.symbol.as_str()) {
                continue;
            }
            report.positions_matched += 1;

            let tp_alive = position
                .exchange_tp_id
                .as_deref()
                .map(|id| order_ids.contains(id))
                .unwrap_or(false);
            let sl_alive = position
                .exchange_sl_id
                .as_deref()
                .map(|id| order_ids.contains(id))
                .unwrap_or(false);
            if tp_alive && sl_alive {
                continue;
            }

            let (tp, sl) = protective
                .get(position.symbol.as_str())
                .copied()
                .unwrap_or((None, None));
            let mut repaired = false;

            self.tracker.modify(&position.trade_id, |p| {
                if !tp_alive {
                    match tp {
                        Some(order) => {
                            p.exchange_tp_id = Some(order.id.clone());
                            p.tp_order_id =
                                Some(order.client_order_id.clone()).filter(|s| !s.is_empty());
                            if order_trigger(order) > 0.0 {
                                p.tp_level = order_trigger(order);
                            }
                            repaired = true;
                        }
                        None => p.exchange_tp_id = None,
                    }
                }
                if !sl_alive {
                    match sl {
                        Some(order) => {
                            p.exchange_sl_id = Some(order.id.clone());
                            p.sl_order_id =
                                Some(order.client_order_id.clone()).filter(|s| !s.is_empty());
                            if order_trigger(order) > 0.0 {
                                p.sl_level = order_trigger(order);
                            }
                            repaired = true;
                        }
                        None => p.exchange_sl_id = None,
                    }
                }
            });

            if repaired {
                warn!(
                    trade_id = %position.trade_id,
                    symbol = %position.symbol,
                    "stale bracket ids re-bound to live orders"
                );
                report.rebound += 1;
            } else {
                warn!(
                    trade_id = %position.trade_id,
                    symbol = %position.symbol,
                    "bracket orders missing and no replacement found, integrity candidate"
                );
            }
        }

        report
    }
}

/// Classify an open order as a protective TP or SL.
fn classify_protective(order: &NormalizedOrder) -> Option<IdPrefix> {
    if let Some(prefix) = classify_client_id(&order.client_order_id) {
        if matches!(prefix, IdPrefix::Tp | IdPrefix::Stop) {
            return Some(prefix);
        }
    }
    if order.order_type.contains("take_profit") {
        return Some(IdPrefix::Tp);
    }
    if order.order_type.contains("stop") {
        return Some(IdPrefix::Stop);
    }
    None
}

fn order_trigger(order: &NormalizedOrder) -> f64 {
    if order.stop_price > 0.0 {
        order.stop_price
    } else {
        order.price
    }
}
