// =============================================================================
// Vega Futures Engine — Main Entry Point
// =============================================================================
//
// Startup order matters: connect, reconcile, then streams, sensors, and the
// decision pipeline. Shutdown order matters more: stop the pipeline first so
// the session is quiet, then run the emergency sweep under shutdown mode with
// a hard-exit guard, then fetch the final balance and print the summary.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod croupier;
mod decision;
mod events;
mod market_data;
mod observability;
mod persist;
mod resilience;
mod runtime_config;
mod sensors;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceConnector;
use crate::croupier::exit_manager::ExitManager;
use crate::croupier::order_manager::OrderManager;
use crate::croupier::position_tracker::PositionTracker;
use crate::croupier::Croupier;
use crate::decision::{AdaptivePlayer, SensorTracker, SignalAggregator};
use crate::events::EventBus;
use crate::market_data::{CandleMaker, StreamManager};
use crate::observability::{Metrics, ShutdownGuard, Watchdog};
use crate::resilience::ErrorHandler;
use crate::runtime_config::RuntimeConfig;
use crate::sensors::pool::SensorPool;
use crate::types::TradeMode;

#[derive(Parser, Debug)]
#[command(name = "vega-bot", about = "Autonomous perpetual-futures trading engine")]
struct Cli {
    /// Exchange backend.
    #[arg(long, default_value = "binance")]
    exchange: String,

    /// Trading pair (native format, e.g. BTCUSDT) or MULTI for the configured
    /// symbol list.
    #[arg(long, default_value = "MULTI")]
    symbol: String,

    /// Execution mode.
    #[arg(long, default_value = "testing")]
    mode: String,

    /// Override the base bet size (fraction of equity).
    #[arg(long)]
    bet_size: Option<f64>,

    /// Stop the session after N minutes.
    #[arg(long)]
    timeout: Option<u64>,

    /// Market-close every open position during the final sweep.
    #[arg(long, default_value_t = false)]
    close_on_exit: bool,

    /// API key override (else BINANCE_API_KEY / BINANCE_TESTNET_API_KEY).
    #[arg(long)]
    wallet: Option<String>,

    /// API secret override (else BINANCE_API_SECRET / BINANCE_TESTNET_SECRET).
    #[arg(long)]
    key: Option<String>,

    /// Cap the number of traded symbols in MULTI mode.
    #[arg(long)]
    max_symbols: Option<usize>,

    /// Runtime config path.
    #[arg(long, default_value = "runtime_config.json")]
    config: String,
}

fn parse_mode(raw: &str) -> Option<TradeMode> {
    match raw.to_lowercase().as_str() {
        "live" => Some(TradeMode::Live),
        "demo" => Some(TradeMode::Demo),
        "testing" => Some(TradeMode::Testing),
        _ => None,
    }
}

fn resolve_keys(cli: &Cli, mode: TradeMode) -> (String, String) {
    if let (Some(wallet), Some(key)) = (&cli.wallet, &cli.key) {
        return (wallet.clone(), key.clone());
    }
    match mode {
        TradeMode::Live => (
            std::env::var("BINANCE_API_KEY").unwrap_or_default(),
            std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
        ),
        _ => (
            std::env::var("BINANCE_TESTNET_API_KEY")
                .or_else(|_| std::env::var("BINANCE_API_KEY"))
                .unwrap_or_default(),
            std::env::var("BINANCE_TESTNET_SECRET")
                .or_else(|_| std::env::var("BINANCE_API_SECRET"))
                .unwrap_or_default(),
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.exchange.to_lowercase() != "binance" {
        error!(exchange = %cli.exchange, "unsupported exchange");
        std::process::exit(1);
    }

    let Some(mode) = parse_mode(&cli.mode) else {
        error!(mode = %cli.mode, "invalid mode, expected live|testing|demo");
        std::process::exit(1);
    };

    let mut config = RuntimeConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    config.mode = mode;
    if let Some(bet) = cli.bet_size {
        config.bet_size = bet;
    }
    if cli.symbol != "MULTI" {
        config.symbols = vec![cli.symbol.to_uppercase()];
    }
    if let Some(max) = cli.max_symbols {
        config.symbols.truncate(max);
    }
    if config.symbols.is_empty() {
        error!("no symbols configured");
        std::process::exit(1);
    }

    info!(
        mode = %config.mode,
        symbols = ?config.symbols,
        bet_size = config.bet_size,
        timeout_min = ?cli.timeout,
        close_on_exit = cli.close_on_exit,
        "Vega Futures Engine starting"
    );

    let config = Arc::new(config);

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let bus = EventBus::new();
    let error_handler = Arc::new(ErrorHandler::new());
    let metrics = Arc::new(Metrics::new());
    let watchdog = Arc::new(Watchdog::new());
    let healthy = Arc::new(RwLock::new(true));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 3. Connector ─────────────────────────────────────────────────────
    let (api_key, api_secret) = resolve_keys(&cli, mode);
    if mode == TradeMode::Live && (api_key.is_empty() || api_secret.is_empty()) {
        error!("live mode requires API credentials");
        std::process::exit(1);
    }

    let connector = Arc::new(BinanceConnector::new(
        api_key,
        api_secret,
        mode,
        error_handler.clone(),
    ));
    connector.set_order_update_sender(bus.order_updates.clone());

    if let Err(e) = connector.connect().await {
        let classification = binance::classify::classify(&e);
        error!(error = %e, category = ?classification.category, "connector failed to start");
        // Authentication failures are fatal by contract.
        std::process::exit(1);
    }

    // ── 4. Croupier & decision pipeline state ────────────────────────────
    let position_tracker = Arc::new(PositionTracker::new(&config.bot_state_path));
    let sensor_tracker = Arc::new(SensorTracker::new(&config.sensor_stats_path));
    let croupier = Arc::new(Croupier::new(
        connector.clone(),
        error_handler.clone(),
        position_tracker.clone(),
        bus.clone(),
        mode,
        metrics.clone(),
    ));

    match mode {
        TradeMode::Testing => croupier.set_equity(10_000.0),
        _ => match croupier.refresh_equity().await {
            Ok(balance) => {
                let (start, _) = position_tracker.balances();
                if start <= 0.0 {
                    position_tracker.set_balances(balance, balance);
                }
                info!(balance, "starting equity loaded");
            }
            Err(e) => {
                error!(error = %e, "failed to fetch starting balance");
                std::process::exit(1);
            }
        },
    }

    // ── 5. Startup reconciliation (adopt orphans before trading) ─────────
    if mode.is_exchange_backed() {
        match croupier.reconcile(None).await {
            Ok(report) => info!(
                adopted = report.adopted,
                ghosts = report.ghosts_removed,
                rebound = report.rebound,
                "startup reconciliation complete"
            ),
            Err(e) => error!(error = %e, "startup reconciliation failed"),
        }
    }

    // ── 6. Metrics endpoint & watchdog ───────────────────────────────────
    tokio::spawn(observability::metrics::serve(
        config.metrics_bind.clone(),
        metrics.clone(),
        error_handler.clone(),
        healthy.clone(),
    ));
    tokio::spawn(watchdog.clone().run(connector.clone(), shutdown_rx.clone()));

    // ── 7. Market data: streams + candle maker ───────────────────────────
    let stream_manager = Arc::new(StreamManager::new(
        connector.clone(),
        error_handler.clone(),
        bus.clone(),
        watchdog.clone(),
        shutdown_rx.clone(),
    ));
    stream_manager.start(&config.symbols, config.enable_orderbook_stream);
    tokio::spawn(CandleMaker::new(bus.clone()).run());

    // ── 8. Sensor pool + aggregator + player ─────────────────────────────
    let pool = SensorPool::new(&config, bus.clone());
    tokio::spawn(pool.run(shutdown_rx.clone()));

    let aggregator = Arc::new(SignalAggregator::new(
        bus.clone(),
        sensor_tracker.clone(),
        config.strategy_sensors.clone(),
        config.strategy_name.clone(),
    ));
    tokio::spawn(aggregator.run(shutdown_rx.clone()));

    let player = Arc::new(AdaptivePlayer::new(
        bus.clone(),
        croupier.clone(),
        sensor_tracker.clone(),
        config.clone(),
    ));
    tokio::spawn(player.run(shutdown_rx.clone()));

    // ── 9. Croupier loops: orders, exits, user-data updates ──────────────
    let order_manager = Arc::new(OrderManager::new(
        croupier.clone(),
        bus.clone(),
        config.clone(),
        metrics.clone(),
    ));
    tokio::spawn(order_manager.run(shutdown_rx.clone()));

    let exit_manager = Arc::new(ExitManager::new(
        croupier.clone(),
        bus.clone(),
        config.exit.clone(),
    ));
    tokio::spawn(exit_manager.clone().run(shutdown_rx.clone()));

    tokio::spawn(croupier.clone().run_order_update_loop(shutdown_rx.clone()));

    // Closed trades feed the sensor performance memory.
    {
        let tracker = sensor_tracker.clone();
        let croupier = croupier.clone();
        let mut closed_rx = bus.closed_trades.subscribe();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    trade = closed_rx.recv() => match trade {
                        Ok(trade) => {
                            if trade.sensor_id != "Adopted" {
                                tracker.update(&trade.sensor_id, trade.pnl, trade.won);
                            }
                            if let Err(e) = croupier.refresh_equity().await {
                                warn!(error = %e, "equity refresh after close failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Periodic reconciliation every 5 minutes.
    if mode.is_exchange_backed() {
        let croupier = croupier.clone();
        let watchdog_handle = watchdog.clone();
        let mut shutdown = shutdown_rx.clone();
        watchdog.register("reconciliation_loop", Duration::from_secs(600));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip the immediate tick; startup already ran
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        watchdog_handle.heartbeat("reconciliation_loop");
                        match croupier.reconcile(None).await {
                            Ok(report) if !report.clean() => warn!(
                                adopted = report.adopted,
                                ghosts = report.ghosts_removed,
                                rebound = report.rebound,
                                "reconciliation repaired state"
                            ),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "periodic reconciliation failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    info!("all subsystems running");

    // ── 10. Session loop: timeout countdown + drain phases ───────────────
    let session_start = Instant::now();
    let drain_minutes = config.drain_phase_minutes;
    let mut drain_phase: u8 = 0;
    let mut exit_reason = "SIGNAL";
    watchdog.register("main_loop", Duration::from_secs(30));

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let loop_start = Instant::now();
                watchdog.heartbeat("main_loop");

                if let Some(timeout_min) = cli.timeout {
                    let elapsed_min = session_start.elapsed().as_secs() / 60;

                    if elapsed_min >= timeout_min {
                        exit_reason = "TIMEOUT";
                        info!(timeout_min, "session timeout reached");
                        break;
                    }

                    // Drain phases fill the tail of the session. A timeout
                    // shorter than the drain window skips straight to the
                    // aggressive phase.
                    let drain_start_min = timeout_min.saturating_sub(drain_minutes);
                    if elapsed_min >= drain_start_min {
                        if !croupier.is_drain_mode() {
                            croupier.set_drain_mode(true);
                        }
                        let drain_window = timeout_min - drain_start_min;
                        let into_drain = elapsed_min - drain_start_min;
                        let target_phase: u8 = if drain_window == 0 || timeout_min < drain_minutes {
                            3
                        } else if into_drain >= drain_window * 2 / 3 {
                            3
                        } else if into_drain >= drain_window / 3 {
                            2
                        } else {
                            1
                        };

                        while drain_phase < target_phase {
                            drain_phase += 1;
                            match drain_phase {
                                1 => exit_manager.trigger_soft_exits().await,
                                2 => exit_manager.trigger_defensive_exits().await,
                                _ => exit_manager.trigger_aggressive_exits(0.2).await,
                            }
                        }
                    }
                }

                metrics
                    .loop_lag_ms
                    .store(loop_start.elapsed().as_millis() as i64, Ordering::Relaxed);
            }
            _ = tokio::signal::ctrl_c() => {
                exit_reason = "SIGNAL";
                warn!("shutdown signal received");
                break;
            }
        }
    }

    // ── 11. Shutdown ─────────────────────────────────────────────────────
    info!(reason = exit_reason, "stopping session");
    *healthy.write() = false;
    let _ = shutdown_tx.send(true);
    // Children observe the shutdown watch within one iteration.
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Emergency sweep under a hard-exit guard: no progress in 120s kills the
    // process rather than hanging a dead session.
    let guard = ShutdownGuard::arm(Duration::from_secs(120));
    croupier
        .emergency_sweep(Some(config.symbols.clone()), cli.close_on_exit, &guard)
        .await;
    guard.heartbeat();

    // Final balance for the summary.
    if mode.is_exchange_backed() {
        match croupier.refresh_equity().await {
            Ok(balance) => info!(balance, "final balance fetched"),
            Err(e) => error!(error = %e, "final balance fetch failed"),
        }
    }
    guard.heartbeat();

    let summary = croupier.session_summary();
    info!("==========================================");
    info!("SESSION SUMMARY");
    info!(reason = exit_reason, "  exit");
    info!(start = summary.start_balance, final_balance = summary.final_balance, "  balance");
    info!(
        net_pnl = format!("{:+.4}", summary.total_net_pnl),
        fees = format!("{:.4}", summary.total_fees),
        delta = format!("{:+.4}", summary.account_delta),
        "  pnl"
    );
    info!(
        trades = summary.count,
        wins = summary.wins,
        losses = summary.losses,
        win_rate = format!(
            "{:.2}%",
            if summary.count > 0 {
                summary.wins as f64 / summary.count as f64 * 100.0
            } else {
                0.0
            }
        ),
        "  trades"
    );
    info!("==========================================");

    if let Err(e) = sensor_tracker.save() {
        error!(error = %e, "failed to save sensor stats on shutdown");
    }
    if let Err(e) = config.save(&cli.config) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    connector.close().await;
    guard.disarm();

    info!("shutdown complete");
    Ok(())
}
