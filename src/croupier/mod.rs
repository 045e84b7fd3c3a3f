// =============================================================================
// Croupier — execution & state engine
// =============================================================================
//
// Owns the order executor, the OCO bracket manager, the position tracker, the
// reconciler, and the exit manager. The Croupier is the ONLY component that
// mutates position state; everything else reads snapshots.
//
// The emergency sweep runs under shutdown mode (breaker bypass) with a
// thread-based heartbeat guard, so cleanup always gets its shot at the
// exchange even when the async runtime is wedged.
// =============================================================================

pub mod exit_manager;
pub mod oco_manager;
pub mod order_executor;
pub mod order_manager;
pub mod position_tracker;
pub mod reconciler;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::binance::client::OrderParams;
use crate::binance::BinanceConnector;
use crate::events::{ClosedTrade, Decision, EventBus, OrderUpdate};
use crate::observability::{Metrics, ShutdownGuard};
use crate::resilience::ErrorHandler;
use crate::types::{Side, TradeMode};

pub use oco_manager::OcoManager;
pub use order_executor::OrderExecutor;
pub use position_tracker::{OpenPosition, PositionTracker, SessionSummary, TAKER_FEE};
pub use reconciler::{ReconcileReport, Reconciler};

pub struct Croupier {
    pub connector: Arc<BinanceConnector>,
    pub error_handler: Arc<ErrorHandler>,
    pub tracker: Arc<PositionTracker>,
    pub executor: Arc<OrderExecutor>,
    oco: OcoManager,
    bus: EventBus,
    mode: TradeMode,
    metrics: Arc<Metrics>,
    equity: RwLock<f64>,
    /// Set by reconciliation repairs; read by the order manager to enable
    /// conditional integrity validation.
    pub integrity_check_failed: AtomicBool,
    drain_mode: AtomicBool,
    /// Symbols with an in-flight entry (debounce against double-entry races).
    pending: Mutex<HashSet<String>>,
}

impl Croupier {
    pub fn new(
        connector: Arc<BinanceConnector>,
        error_handler: Arc<ErrorHandler>,
        tracker: Arc<PositionTracker>,
        bus: EventBus,
        mode: TradeMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        let executor = Arc::new(OrderExecutor::new(connector.clone(), error_handler.clone()));
        let oco = OcoManager::new(connector.clone(), executor.clone(), tracker.clone(), mode);

        Self {
            connector,
            error_handler,
            tracker,
            executor,
            oco,
            bus,
            mode,
            metrics,
            equity: RwLock::new(0.0),
            integrity_check_failed: AtomicBool::new(false),
            drain_mode: AtomicBool::new(false),
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> TradeMode {
        self.mode
    }

    // -------------------------------------------------------------------------
    // Equity
    // -------------------------------------------------------------------------

    pub fn get_equity(&self) -> f64 {
        *self.equity.read()
    }

    pub fn set_equity(&self, equity: f64) {
        *self.equity.write() = equity;
        self.metrics.set_balance(equity);
    }

    /// Refresh equity from the exchange (no-op in testing mode).
    pub async fn refresh_equity(&self) -> Result<f64> {
        if !self.mode.is_exchange_backed() {
            return Ok(self.get_equity());
        }
        let balance = self.connector.fetch_usdt_balance().await?;
        self.set_equity(balance);
        self.tracker.set_current_balance(balance);
        Ok(balance)
    }

    // -------------------------------------------------------------------------
    // Pending debounce
    // -------------------------------------------------------------------------

    pub fn is_pending(&self, symbol: &str) -> bool {
        self.pending.lock().contains(symbol)
    }

    // -------------------------------------------------------------------------
    // Pricing
    // -------------------------------------------------------------------------

    /// Best available price: hint > WS cache > REST ticker.
    pub async fn current_price(&self, symbol: &str, hint: Option<f64>) -> Result<f64> {
        if let Some(p) = hint.filter(|p| *p > 0.0) {
            return Ok(p);
        }
        if let Some(p) = self.connector.cached_price(symbol) {
            return Ok(p);
        }
        if !self.mode.is_exchange_backed() {
            bail!("no price available for {symbol} in testing mode");
        }
        let ticker = self.connector.fetch_ticker(symbol).await?;
        Ok(ticker.last)
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Open a bracket for a decision. Duplicate-entry races are debounced via
    /// the pending set.
    pub async fn open_bracket(
        &self,
        decision: &Decision,
        amount: f64,
        reference_price: f64,
        tp_pct: f64,
        sl_pct: f64,
    ) -> Result<OpenPosition> {
        if !self.pending.lock().insert(decision.symbol.clone()) {
            bail!("entry already in flight for {}", decision.symbol);
        }

        let result = self
            .oco
            .open_bracket(decision, amount, reference_price, tp_pct, sl_pct)
            .await;

        self.pending.lock().remove(&decision.symbol);

        match &result {
            Ok(_) => {
                self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
                self.metrics.orders_filled.fetch_add(1, Ordering::Relaxed);
                self.metrics.positions_opened.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.metrics.orders_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close a position at market: cancel its bracket, then reduce-only close.
    pub async fn close_position(
        &self,
        trade_id: &str,
        exit_reason: &str,
        price_hint: Option<f64>,
    ) -> Result<ClosedTrade> {
        let position = self
            .tracker
            .get(trade_id)
            .with_context(|| format!("position {trade_id} not tracked"))?;

        if self.mode.is_exchange_backed() {
            self.cancel_bracket_orders(&position).await;

            let order = self
                .executor
                .execute_market_order(
                    &position.symbol,
                    position.side.exit_order(),
                    position.amount,
                    OrderParams {
                        reduce_only: true,
                        ..Default::default()
                    },
                    None,
                )
                .await
                .context("market close failed")?;

            let exit_price = if order.average > 0.0 {
                order.average
            } else {
                self.current_price(&position.symbol, price_hint).await?
            };
            self.finalize_close(&position, exit_price, exit_reason)
        } else {
            let exit_price = price_hint
                .or_else(|| self.connector.cached_price(&position.symbol))
                .unwrap_or(position.entry_price);
            self.finalize_close(&position, exit_price, exit_reason)
        }
    }

    fn finalize_close(&self, position: &OpenPosition, exit_price: f64, exit_reason: &str) -> Result<ClosedTrade> {
        let pnl = position.side.sign() * (exit_price - position.entry_price) * position.amount;
        let fee = position.notional * TAKER_FEE;

        let trade = self
            .tracker
            .confirm_close(&position.trade_id, exit_price, exit_reason, pnl, fee)
            .with_context(|| format!("position {} vanished during close", position.trade_id))?;

        self.metrics.positions_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self.bus.closed_trades.send(trade.clone());
        Ok(trade)
    }

    async fn cancel_bracket_orders(&self, position: &OpenPosition) {
        let mut ids: Vec<&String> = Vec::new();
        if let Some(id) = &position.exchange_tp_id {
            ids.push(id);
        }
        if let Some(id) = &position.exchange_sl_id {
            if Some(id) != position.exchange_tp_id.as_ref() {
                ids.push(id);
            }
        }
        for id in ids {
            if let Err(e) = self.connector.cancel_order(id, &position.symbol).await {
                warn!(trade_id = %position.trade_id, order_id = %id, error = %e, "bracket cancel failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // TP / SL modification (cancel + recreate; algo orders do not amend)
    // -------------------------------------------------------------------------

    pub async fn modify_tp(&self, trade_id: &str, new_tp_price: f64) -> Result<()> {
        let position = self
            .tracker
            .get(trade_id)
            .with_context(|| format!("position {trade_id} not tracked"))?;

        if self.mode.is_exchange_backed() {
            if let Some(old_id) = &position.exchange_tp_id {
                if let Err(e) = self.connector.cancel_order(old_id, &position.symbol).await {
                    warn!(trade_id, order_id = %old_id, error = %e, "old TP cancel failed");
                }
            }
            let order = self
                .executor
                .execute_take_profit_order(
                    &position.symbol,
                    position.side.exit_order(),
                    position.amount,
                    new_tp_price,
                    OrderParams::default(),
                )
                .await
                .context("replacement TP failed")?;

            self.tracker.modify(trade_id, |p| {
                p.tp_level = new_tp_price;
                p.tp_order_id = Some(order.client_order_id.clone()).filter(|s| !s.is_empty());
                p.exchange_tp_id = Some(order.id.clone());
            });
        } else {
            self.tracker.modify(trade_id, |p| p.tp_level = new_tp_price);
        }

        info!(trade_id, new_tp = new_tp_price, "take profit moved");
        Ok(())
    }

    pub async fn modify_sl(&self, trade_id: &str, new_sl_price: f64) -> Result<()> {
        let position = self
            .tracker
            .get(trade_id)
            .with_context(|| format!("position {trade_id} not tracked"))?;

        if self.mode.is_exchange_backed() {
            if let Some(old_id) = &position.exchange_sl_id {
                if let Err(e) = self.connector.cancel_order(old_id, &position.symbol).await {
                    warn!(trade_id, order_id = %old_id, error = %e, "old SL cancel failed");
                }
            }
            let order = self
                .executor
                .execute_stop_order(
                    &position.symbol,
                    position.side.exit_order(),
                    position.amount,
                    new_sl_price,
                    OrderParams::default(),
                )
                .await
                .context("replacement SL failed")?;

            self.tracker.modify(trade_id, |p| {
                p.sl_level = new_sl_price;
                p.sl_order_id = Some(order.client_order_id.clone()).filter(|s| !s.is_empty());
                p.exchange_sl_id = Some(order.id.clone());
            });
        } else {
            self.tracker.modify(trade_id, |p| p.sl_level = new_sl_price);
        }

        info!(trade_id, new_sl = new_sl_price, "stop loss moved");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // User-data order updates
    // -------------------------------------------------------------------------

    /// Consume ORDER_TRADE_UPDATE / STRATEGY_UPDATE events: a filled bracket
    /// child closes the position, and the surviving sibling must be confirmed
    /// canceled (explicitly, if the native OCO did not do it).
    pub async fn run_order_update_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut updates = self.bus.order_updates.subscribe();
        info!("order update loop started");

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(update) => self.handle_order_update(update).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "order update loop lagged");
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
        info!("order update loop stopped");
    }

    async fn handle_order_update(&self, update: OrderUpdate) {
        if !self.mode.is_exchange_backed() {
            return;
        }

        let matched = self.tracker.open_positions().into_iter().find_map(|p| {
            match_bracket_leg(&p, &update).map(|leg| (p, leg))
        });
        let Some((position, leg)) = matched else {
            return;
        };

        match update.status.as_str() {
            "closed" => {
                // Ambiguous legs (shared OCO id) classify by fill price.
                let exit_reason = match leg {
                    BracketLeg::TakeProfit => "TP",
                    BracketLeg::StopLoss => "SL",
                    BracketLeg::Ambiguous => {
                        let fill = if update.average > 0.0 {
                            update.average
                        } else {
                            position.entry_price
                        };
                        if position.side.sign() * (fill - position.entry_price) >= 0.0 {
                            "TP"
                        } else {
                            "SL"
                        }
                    }
                };
                let exit_price = if update.average > 0.0 {
                    update.average
                } else if exit_reason == "TP" {
                    position.tp_level
                } else {
                    position.sl_level
                };

                info!(
                    trade_id = %position.trade_id,
                    symbol = %position.symbol,
                    reason = exit_reason,
                    exit_price,
                    "bracket child filled"
                );

                // The native OCO should cancel the sibling; make it certain.
                let sibling = match exit_reason {
                    "TP" => position.exchange_sl_id.clone(),
                    _ => position.exchange_tp_id.clone(),
                };
                if let Some(sibling_id) = sibling {
                    let matched_id = if update.order_id.is_empty() {
                        update.client_order_id.clone()
                    } else {
                        update.order_id.clone()
                    };
                    if sibling_id != matched_id {
                        if let Err(e) = self.connector.cancel_order(&sibling_id, &position.symbol).await {
                            // Already gone is the expected outcome.
                            tracing::debug!(order_id = %sibling_id, error = %e, "sibling cancel (expected if OCO fired)");
                        }
                    }
                }

                if let Err(e) = self
                    .finalize_close(&position, exit_price, exit_reason)
                    .map(|_| ())
                {
                    error!(trade_id = %position.trade_id, error = %e, "failed to finalize exchange close");
                }
            }
            "canceled" => {
                // A protective order vanished while the position is open:
                // null the binding so reconciliation repairs it.
                warn!(
                    trade_id = %position.trade_id,
                    order_id = %update.order_id,
                    "bracket child canceled externally, flagging integrity"
                );
                self.tracker.modify(&position.trade_id, |p| match leg {
                    BracketLeg::TakeProfit => p.exchange_tp_id = None,
                    BracketLeg::StopLoss => p.exchange_sl_id = None,
                    BracketLeg::Ambiguous => {
                        p.exchange_tp_id = None;
                        p.exchange_sl_id = None;
                    }
                });
                self.integrity_check_failed.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    pub async fn reconcile(&self, symbols: Option<&[String]>) -> Result<ReconcileReport> {
        let reconciler = Reconciler::new(self.connector.clone(), self.tracker.clone());
        let report = reconciler.run(symbols).await?;

        self.metrics.reconcile_runs.fetch_add(1, Ordering::Relaxed);
        if !report.clean() {
            self.metrics
                .reconcile_repairs
                .fetch_add(report.repairs(), Ordering::Relaxed);
            self.integrity_check_failed.store(true, Ordering::SeqCst);
        }
        Ok(report)
    }

    /// Re-verify every open position's bracket against the exchange.
    pub async fn validate_all_positions_integrity(&self) -> Result<()> {
        let report = self.reconcile(None).await?;
        if report.clean() {
            info!("position integrity validation passed");
        }
        Ok(())
    }

    /// Cancel all orders (regular + algo) for a symbol; positions untouched.
    pub async fn cleanup_symbol(&self, symbol: &str) -> Result<()> {
        self.connector.cancel_all_orders(symbol).await
    }

    // -------------------------------------------------------------------------
    // Drain mode
    // -------------------------------------------------------------------------

    pub fn set_drain_mode(&self, enabled: bool) {
        self.drain_mode.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("drain mode ENABLED");
        }
    }

    pub fn is_drain_mode(&self) -> bool {
        self.drain_mode.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Emergency sweep
    // -------------------------------------------------------------------------

    /// Final exchange sweep: cancel every order for every session symbol and
    /// optionally close all positions with a tiered fallback
    /// (MARKET -> aggressive LIMIT -> price-band LIMIT).
    pub async fn emergency_sweep(
        &self,
        symbols: Option<Vec<String>>,
        close_positions: bool,
        guard: &ShutdownGuard,
    ) {
        self.error_handler.set_shutdown_mode(true);

        let mut sweep_symbols: HashSet<String> = symbols.unwrap_or_default().into_iter().collect();
        for p in self.tracker.open_positions() {
            sweep_symbols.insert(p.symbol);
        }
        if self.mode.is_exchange_backed() {
            match self.connector.fetch_active_symbols().await {
                Ok(active) => sweep_symbols.extend(active),
                Err(e) => warn!(error = %e, "active symbol discovery failed during sweep"),
            }
        }

        info!(
            symbols = sweep_symbols.len(),
            close_positions, "emergency sweep starting"
        );

        for symbol in &sweep_symbols {
            guard.heartbeat();
            if self.mode.is_exchange_backed() {
                if let Err(e) = self.cleanup_symbol(symbol).await {
                    error!(symbol = %symbol, error = %e, "sweep order cleanup failed");
                }
            }
        }

        if !close_positions {
            return;
        }

        if self.mode.is_exchange_backed() {
            let positions = match self.connector.fetch_positions(None).await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "sweep could not list positions");
                    return;
                }
            };
            for pos in positions {
                guard.heartbeat();
                self.tiered_close(&pos.symbol, pos.side, pos.amount).await;
            }
            // Converge the tracker on whatever the exchange now reports.
            for tracked in self.tracker.open_positions() {
                let _ = self.finalize_close(
                    &tracked,
                    tracked.entry_price,
                    "SESSION_END",
                );
            }
        } else {
            for tracked in self.tracker.open_positions() {
                guard.heartbeat();
                let exit = self
                    .connector
                    .cached_price(&tracked.symbol)
                    .unwrap_or(tracked.entry_price);
                let _ = self.finalize_close(&tracked, exit, "SESSION_END");
            }
        }
    }

    /// MARKET -> aggressive LIMIT at ±5% of mark -> LIMIT at the price-band
    /// boundary parsed from the rejection.
    async fn tiered_close(&self, symbol: &str, side: Side, amount: f64) {
        let exit_side = side.exit_order();
        let reduce = OrderParams {
            reduce_only: true,
            ..Default::default()
        };

        match self
            .executor
            .execute_market_order(symbol, exit_side, amount, reduce.clone(), None)
            .await
        {
            Ok(_) => {
                info!(symbol, "sweep close: market fill");
                return;
            }
            Err(e) => warn!(symbol, error = %e, "sweep market close rejected, trying aggressive limit"),
        }

        let mark = self.connector.cached_price(symbol).unwrap_or(0.0);
        if mark > 0.0 {
            // Cross the spread hard: 5% through the mark.
            let aggressive = match exit_side {
                crate::types::OrderSide::Sell => mark * 0.95,
                crate::types::OrderSide::Buy => mark * 1.05,
            };
            match self
                .executor
                .execute_limit_order(symbol, exit_side, amount, aggressive, reduce.clone())
                .await
            {
                Ok(_) => {
                    info!(symbol, price = aggressive, "sweep close: aggressive limit placed");
                    return;
                }
                Err(e) => {
                    // The band boundary often rides in the rejection text.
                    let band_price = parse_price_band(&format!("{e:#}")).unwrap_or(match exit_side {
                        crate::types::OrderSide::Sell => mark * 0.90,
                        crate::types::OrderSide::Buy => mark * 1.10,
                    });
                    match self
                        .executor
                        .execute_limit_order(symbol, exit_side, amount, band_price, reduce)
                        .await
                    {
                        Ok(_) => info!(symbol, price = band_price, "sweep close: band limit placed"),
                        Err(e2) => error!(symbol, error = %e2, "sweep close EXHAUSTED all tiers"),
                    }
                }
            }
        } else {
            error!(symbol, "sweep close: no mark price for limit fallback");
        }
    }

    pub fn session_summary(&self) -> SessionSummary {
        self.tracker.session_summary()
    }
}

/// Which bracket leg an order update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BracketLeg {
    TakeProfit,
    StopLoss,
    /// The OCO pair shares one exchange id; classify by fill price.
    Ambiguous,
}

fn match_bracket_leg(position: &OpenPosition, update: &OrderUpdate) -> Option<BracketLeg> {
    let id_matches = |candidate: &Option<String>| {
        candidate.as_ref().is_some_and(|id| {
            !id.is_empty() && (*id == update.order_id || *id == update.client_order_id)
        })
    };

    let tp_hit = id_matches(&position.exchange_tp_id) || id_matches(&position.tp_order_id);
    let sl_hit = id_matches(&position.exchange_sl_id) || id_matches(&position.sl_order_id);

    match (tp_hit, sl_hit) {
        (true, true) => Some(BracketLeg::Ambiguous),
        (true, false) => Some(BracketLeg::TakeProfit),
        (false, true) => Some(BracketLeg::StopLoss),
        (false, false) => None,
    }
}

/// Pull the last parseable decimal out of a rejection message (price band).
fn parse_price_band(message: &str) -> Option<f64> {
    message
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|tok| !tok.is_empty() && tok.contains('.'))
        .filter_map(|tok| tok.parse::<f64>().ok())
        .filter(|p| *p > 0.0)
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_with_ids(tp: Option<&str>, sl: Option<&str>) -> OpenPosition {
        let mut p = position_tracker::new_position(
            "T1".into(),
            "BTCUSDT".into(),
            Side::Long,
            100.0,
            1.0,
            102.0,
            99.0,
            "EmaCrossover".into(),
        );
        p.exchange_tp_id = tp.map(str::to_string);
        p.exchange_sl_id = sl.map(str::to_string);
        p
    }

    fn update_for(order_id: &str) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.into(),
            client_order_id: String::new(),
            symbol: "BTCUSDT".into(),
            status: "closed".into(),
            side: "sell".into(),
            order_type: "take_profit_market".into(),
            price: 0.0,
            amount: 1.0,
            filled: 1.0,
            average: 102.0,
            is_algo: true,
        }
    }

    #[test]
    fn bracket_leg_matching() {
        let p = position_with_ids(Some("111"), Some("222"));
        assert_eq!(match_bracket_leg(&p, &update_for("111")), Some(BracketLeg::TakeProfit));
        assert_eq!(match_bracket_leg(&p, &update_for("222")), Some(BracketLeg::StopLoss));
        assert_eq!(match_bracket_leg(&p, &update_for("333")), None);

        // Shared OCO id is ambiguous.
        let shared = position_with_ids(Some("777"), Some("777"));
        assert_eq!(match_bracket_leg(&shared, &update_for("777")), Some(BracketLeg::Ambiguous));
    }

    #[test]
    fn price_band_parsing() {
        assert_eq!(
            parse_price_band("(-4131) Limit price can't be higher than 41234.56"),
            Some(41234.56)
        );
        assert_eq!(parse_price_band("no numbers here"), None);
        assert_eq!(parse_price_band("code -4131 only ints 42"), None);
    }
}
