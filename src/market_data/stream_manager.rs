// =============================================================================
// Stream Manager — per-symbol WebSocket consumer loops with auto-recovery
// =============================================================================
//
// One task per (symbol, stream kind). Each iteration runs the breaker-wrapped
// watch call bounded by a wait timeout; failures back off exponentially. A
// symbol that fails 10 consecutive times is disabled so it cannot drag the
// rest of the session down; three disabled symbols indicate a systemic outage
// and escalate to a connector hard reset.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::binance::BinanceConnector;
use crate::events::EventBus;
use crate::observability::watchdog::Watchdog;
use crate::resilience::{ErrorHandler, RetryConfig};
use crate::types::{Tick, TickSide};

/// Consecutive failures before a symbol stream is disabled.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Disabled symbols that trigger a global hard reset.
const MAX_DISABLED_BEFORE_RESET: usize = 3;

/// Per-iteration wait bounds.
const TICKER_WAIT: Duration = Duration::from_secs(10);
const TRADES_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Ticker,
    Trades,
    OrderBook,
}

impl StreamKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trades => "trades",
            Self::OrderBook => "orderbook",
        }
    }
}

pub struct StreamManager {
    connector: Arc<BinanceConnector>,
    error_handler: Arc<ErrorHandler>,
    bus: EventBus,
    watchdog: Arc<Watchdog>,
    disabled: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

impl StreamManager {
    pub fn new(
        connector: Arc<BinanceConnector>,
        error_handler: Arc<ErrorHandler>,
        bus: EventBus,
        watchdog: Arc<Watchdog>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            error_handler,
            bus,
            watchdog,
            disabled: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// Spawn consumer loops for every symbol plus the health-check heartbeat.
    pub fn start(self: &Arc<Self>, symbols: &[String], include_order_book: bool) {
        for symbol in symbols {
            self.connector.subscribe_ticker(symbol);
            self.connector.subscribe_trades(symbol);
            if include_order_book {
                self.connector.subscribe_order_book(symbol);
            }

            let me = self.clone();
            let sym = symbol.clone();
            tokio::spawn(async move { me.run_stream_loop(sym, StreamKind::Ticker).await });

            let me = self.clone();
            let sym = symbol.clone();
            tokio::spawn(async move { me.run_stream_loop(sym, StreamKind::Trades).await });

            if include_order_book {
                let me = self.clone();
                let sym = symbol.clone();
                tokio::spawn(async move { me.run_stream_loop(sym, StreamKind::OrderBook).await });
            }
        }

        let me = self.clone();
        tokio::spawn(async move { me.run_health_check().await });

        info!(count = symbols.len(), "stream manager started");
    }

    pub fn disabled_symbols(&self) -> Vec<String> {
        self.disabled.lock().iter().cloned().collect()
    }

    async fn run_health_check(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        self.watchdog.register("stream_health_check", Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            self.watchdog.heartbeat("stream_health_check");
            if let Err(e) = self.connector.ensure_websocket().await {
                error!(error = %e, "websocket health check failed");
            }
        }
    }

    async fn run_stream_loop(self: Arc<Self>, symbol: String, kind: StreamKind) {
        let breaker_name = format!("{}_stream_{}", kind.label(), symbol);
        let task_name = format!("stream_{}_{}", kind.label(), symbol);
        self.watchdog.register(&task_name, Duration::from_secs(120));

        let mut consecutive_failures: u32 = 0;
        let mut shutdown = self.shutdown.clone();
        let wait = match kind {
            StreamKind::Ticker => TICKER_WAIT,
            StreamKind::Trades | StreamKind::OrderBook => TRADES_WAIT,
        };

        info!(symbol = %symbol, kind = kind.label(), "stream loop started");

        loop {
            if *shutdown.borrow() {
                info!(symbol = %symbol, kind = kind.label(), "stream loop stopping");
                return;
            }

            let result = tokio::select! {
                r = tokio::time::timeout(wait, self.consume_one(&symbol, kind, &breaker_name)) => r,
                _ = shutdown.changed() => continue,
            };

            match result {
                Ok(Ok(())) => {
                    self.watchdog.heartbeat(&task_name);
                    consecutive_failures = 0;
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    error!(
                        symbol = %symbol,
                        kind = kind.label(),
                        failures = consecutive_failures,
                        max = MAX_CONSECUTIVE_FAILURES,
                        error = %e,
                        "stream error"
                    );
                    if self
                        .handle_failure_threshold(&symbol, kind, &breaker_name, consecutive_failures)
                        .await
                    {
                        return;
                    }
                    let backoff = 2u64.pow(consecutive_failures.min(6)).min(60);
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
                Err(_elapsed) => {
                    // Trade streams go silent on quiet markets; silence alone
                    // is not a failure there.
                    if kind == StreamKind::Trades {
                        debug!(symbol = %symbol, "trade stream quiet");
                        self.watchdog.heartbeat(&task_name);
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(
                        symbol = %symbol,
                        kind = kind.label(),
                        failures = consecutive_failures,
                        "stream wait timed out"
                    );
                    if self
                        .handle_failure_threshold(&symbol, kind, &breaker_name, consecutive_failures)
                        .await
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Disable the symbol at the failure threshold; escalate to hard reset
    /// when too many symbols are disabled. Returns true when the loop should
    /// exit.
    async fn handle_failure_threshold(
        &self,
        symbol: &str,
        kind: StreamKind,
        breaker_name: &str,
        consecutive_failures: u32,
    ) -> bool {
        if consecutive_failures < MAX_CONSECUTIVE_FAILURES {
            return false;
        }

        warn!(
            symbol = %symbol,
            kind = kind.label(),
            "stream failed {MAX_CONSECUTIVE_FAILURES} consecutive times, disabling symbol"
        );
        self.error_handler.reset_breaker(breaker_name);

        let disabled_count = {
            let mut disabled = self.disabled.lock();
            disabled.insert(symbol.to_string());
            disabled.len()
        };

        if disabled_count >= MAX_DISABLED_BEFORE_RESET {
            error!(
                disabled = disabled_count,
                "too many symbols disabled, systemic issue suspected, triggering hard reset"
            );
            match self.connector.hard_reset().await {
                Ok(()) => {
                    self.disabled.lock().clear();
                    info!("hard reset complete, disabled symbols cleared");
                }
                Err(e) => error!(error = %e, "hard reset failed"),
            }
        } else {
            error!(
                symbol = %symbol,
                disabled = disabled_count,
                threshold = MAX_DISABLED_BEFORE_RESET,
                "symbol disabled, session continues with remaining streams"
            );
        }
        true
    }

    async fn consume_one(&self, symbol: &str, kind: StreamKind, breaker_name: &str) -> anyhow::Result<()> {
        let retry = RetryConfig {
            max_retries: 3,
            backoff_base_secs: 1.0,
            backoff_max_secs: 30.0,
            ..Default::default()
        };

        match kind {
            StreamKind::Ticker => {
                let ticker = self
                    .error_handler
                    .execute_with_breaker(breaker_name, || self.connector.watch_ticker(symbol), retry, breaker_name)
                    .await?;
                // Ticker updates feed price-sensitive consumers as UNKNOWN-side
                // ticks; real order-flow sides come from the trade stream.
                let _ = self.bus.ticks.send(Tick {
                    timestamp: ticker.timestamp_ms as f64 / 1000.0,
                    symbol: symbol.to_string(),
                    price: ticker.last,
                    volume: 0.0,
                    side: TickSide::Unknown,
                });
            }
            StreamKind::Trades => {
                let tick = self
                    .error_handler
                    .execute_with_breaker(breaker_name, || self.connector.watch_trades(symbol), retry, breaker_name)
                    .await?;
                let _ = self.bus.ticks.send(tick);
            }
            StreamKind::OrderBook => {
                let book = self
                    .error_handler
                    .execute_with_breaker(
                        breaker_name,
                        || self.connector.watch_order_book(symbol),
                        retry,
                        breaker_name,
                    )
                    .await?;
                let _ = self.bus.order_books.send(book);
            }
        }
        Ok(())
    }
}
