// =============================================================================
// Metrics — atomic counters exposed as Prometheus text over HTTP
// =============================================================================
//
// Counters are plain atomics that any thread may bump lock-free. The axum
// endpoint renders them in Prometheus exposition format at GET /metrics;
// GET /healthz answers liveness probes.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::resilience::{CircuitState, ErrorHandler};

#[derive(Default)]
pub struct Metrics {
    pub orders_submitted: AtomicU64,
    pub orders_filled: AtomicU64,
    pub orders_failed: AtomicU64,
    pub positions_opened: AtomicU64,
    pub positions_closed: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub decisions_emitted: AtomicU64,
    pub reconcile_runs: AtomicU64,
    pub reconcile_repairs: AtomicU64,
    pub hard_resets: AtomicU64,
    /// Event-loop lag in milliseconds (gauge).
    pub loop_lag_ms: AtomicI64,
    /// Account balance scaled by 1e4 (gauge; atomics carry no floats).
    balance_scaled: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, balance: f64) {
        self.balance_scaled.store((balance * 1e4) as i64, Ordering::Relaxed);
    }

    pub fn balance(&self) -> f64 {
        self.balance_scaled.load(Ordering::Relaxed) as f64 / 1e4
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render(&self, error_handler: &ErrorHandler) -> String {
        let mut out = String::with_capacity(2048);

        let counters: [(&str, u64); 10] = [
            ("vega_orders_submitted_total", self.orders_submitted.load(Ordering::Relaxed)),
            ("vega_orders_filled_total", self.orders_filled.load(Ordering::Relaxed)),
            ("vega_orders_failed_total", self.orders_failed.load(Ordering::Relaxed)),
            ("vega_positions_opened_total", self.positions_opened.load(Ordering::Relaxed)),
            ("vega_positions_closed_total", self.positions_closed.load(Ordering::Relaxed)),
            ("vega_signals_emitted_total", self.signals_emitted.load(Ordering::Relaxed)),
            ("vega_decisions_emitted_total", self.decisions_emitted.load(Ordering::Relaxed)),
            ("vega_reconcile_runs_total", self.reconcile_runs.load(Ordering::Relaxed)),
            ("vega_reconcile_repairs_total", self.reconcile_repairs.load(Ordering::Relaxed)),
            ("vega_hard_resets_total", self.hard_resets.load(Ordering::Relaxed)),
        ];
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }

        out.push_str(&format!(
            "# TYPE vega_loop_lag_ms gauge\nvega_loop_lag_ms {}\n",
            self.loop_lag_ms.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "# TYPE vega_balance_usdt gauge\nvega_balance_usdt {:.4}\n",
            self.balance()
        ));

        out.push_str("# TYPE vega_circuit_breaker_state gauge\n");
        for stats in error_handler.breaker_stats() {
            let state_value = match stats.state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            out.push_str(&format!(
                "vega_circuit_breaker_state{{breaker=\"{}\"}} {state_value}\n",
                stats.name
            ));
        }

        out.push_str("# TYPE vega_errors_total counter\n");
        for (category, count) in error_handler.error_counts() {
            out.push_str(&format!(
                "vega_errors_total{{category=\"{}\"}} {count}\n",
                serde_json::to_string(&category).unwrap_or_default().trim_matches('"')
            ));
        }

        out
    }
}

#[derive(Clone)]
struct MetricsState {
    metrics: Arc<Metrics>,
    error_handler: Arc<ErrorHandler>,
    healthy: Arc<RwLock<bool>>,
}

async fn metrics_handler(State(state): State<MetricsState>) -> String {
    state.metrics.render(&state.error_handler)
}

async fn healthz_handler(State(state): State<MetricsState>) -> (axum::http::StatusCode, &'static str) {
    if *state.healthy.read() {
        (axum::http::StatusCode::OK, "ok")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    }
}

/// Serve /metrics and /healthz on `bind_addr` until the process exits.
pub async fn serve(
    bind_addr: String,
    metrics: Arc<Metrics>,
    error_handler: Arc<ErrorHandler>,
    healthy: Arc<RwLock<bool>>,
) {
    let state = MetricsState {
        metrics,
        error_handler,
        healthy,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state);

    match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(addr = %bind_addr, "metrics endpoint listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "metrics server failed");
            }
        }
        Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind metrics endpoint"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_counters_and_gauges() {
        let metrics = Metrics::new();
        let handler = ErrorHandler::new();
        metrics.orders_submitted.fetch_add(3, Ordering::Relaxed);
        metrics.set_balance(1234.5678);
        handler.breaker("exchange_orders");

        let text = metrics.render(&handler);
        assert!(text.contains("vega_orders_submitted_total 3"));
        assert!(text.contains("vega_balance_usdt 1234.5678"));
        assert!(text.contains("vega_circuit_breaker_state{breaker=\"exchange_orders\"} 0"));
    }

    #[test]
    fn balance_roundtrip_through_scaling() {
        let metrics = Metrics::new();
        metrics.set_balance(987.6543);
        assert!((metrics.balance() - 987.6543).abs() < 1e-3);
    }
}
