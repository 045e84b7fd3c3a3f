// =============================================================================
// Error Handler — classified retries + circuit breaker integration
// =============================================================================
//
// Every outbound exchange call passes through here. The breaker records
// failures only for systemic errors (network, timeout, server, temporary);
// validation-class errors are proof the exchange is alive and record SUCCESS,
// so one bad symbol can never trip the whole exchange.
//
// A global `shutdown_mode` flag bypasses breaker checks so emergency cleanup
// always reaches the exchange.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::binance::classify::{classify, ErrorCategory};
use crate::resilience::circuit_breaker::{BreakerStats, CircuitBreaker};

/// Configuration for retry behaviour.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 1.0,
            backoff_max_secs: 60.0,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

/// Centralized error handler with classified retries and named breakers.
pub struct ErrorHandler {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    shutdown_mode: AtomicBool,
    error_counts: RwLock<HashMap<ErrorCategory, u64>>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            shutdown_mode: AtomicBool::new(false),
            error_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a named circuit breaker with default parameters.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        let mut map = self.breakers.write();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name)))
            .clone()
    }

    /// Enable/disable shutdown mode. When enabled, breaker checks are
    /// bypassed for critical cleanup.
    pub fn set_shutdown_mode(&self, enabled: bool) {
        self.shutdown_mode.store(enabled, Ordering::SeqCst);
        info!(enabled, "error handler shutdown mode");
    }

    pub fn is_shutdown_mode(&self) -> bool {
        self.shutdown_mode.load(Ordering::SeqCst)
    }

    pub fn reset_breaker(&self, name: &str) {
        if let Some(b) = self.breakers.read().get(name) {
            b.reset();
        }
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.read().values().map(|b| b.stats()).collect()
    }

    pub fn error_counts(&self) -> HashMap<ErrorCategory, u64> {
        self.error_counts.read().clone()
    }

    fn count_error(&self, category: ErrorCategory) {
        *self.error_counts.write().entry(category).or_insert(0) += 1;
    }

    /// Execute `op` with automatic retry on retriable errors.
    pub async fn execute<T, F, Fut>(&self, op: F, retry: RetryConfig, context: &str) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = retry.max_retries.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let classification = classify(&e);
                    self.count_error(classification.category);

                    warn!(
                        context,
                        attempt = attempt + 1,
                        max = attempts,
                        category = ?classification.category,
                        error = %e,
                        "exchange call failed"
                    );

                    if !classification.is_retriable() {
                        error!(context, category = ?classification.category, "non-retriable error");
                        return Err(e);
                    }
                    if attempt + 1 >= attempts {
                        error!(context, "retries exhausted");
                        return Err(e);
                    }

                    let mut delay = backoff_delay(attempt, &retry);
                    // The classifier may override with a longer category delay
                    // (e.g. 60s for rate limits); take the smaller of the two
                    // so that backoff never waits past what the category needs.
                    if let Some(suggested) = classification.retry_delay_secs {
                        delay = delay.min(suggested.max(0.1));
                    }

                    debug!(context, delay_secs = delay, "retrying after backoff");
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry loop exhausted for {context}")))
    }

    /// Execute `op` behind the named circuit breaker, with retry.
    ///
    /// Breaker recording is selective: validation-class errors record success
    /// (proof-of-life), systemic errors record failure.
    pub async fn execute_with_breaker<T, F, Fut>(
        &self,
        breaker_name: &str,
        op: F,
        retry: RetryConfig,
        context: &str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(breaker_name);

        let guarded = || {
            let breaker = breaker.clone();
            let fut = op();
            async move {
                if !self.is_shutdown_mode() {
                    breaker.check_availability()?;
                }

                match fut.await {
                    Ok(v) => {
                        breaker.record_success();
                        Ok(v)
                    }
                    Err(e) => {
                        let classification = classify(&e);
                        if classification.category.is_proof_of_life() {
                            // The exchange answered with a validation error:
                            // the service is healthy, close the circuit.
                            breaker.record_success();
                        } else if classification.category != ErrorCategory::GracefulShutdown {
                            breaker.record_failure();
                        }
                        Err(e)
                    }
                }
            }
        };

        self.execute(guarded, retry, context).await
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with optional ±25% jitter.
fn backoff_delay(attempt: u32, retry: &RetryConfig) -> f64 {
    let mut delay = retry.backoff_base_secs * retry.backoff_factor.powi(attempt as i32);
    delay = delay.min(retry.backoff_max_secs);
    if retry.jitter {
        let jitter_range = delay * 0.25;
        delay += rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        delay = delay.max(0.1);
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::classify::ApiError;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::AtomicU32;

    fn api_err(code: i64) -> anyhow::Error {
        anyhow::Error::new(ApiError {
            code,
            msg: "probe".into(),
            http_status: 400,
        })
    }

    #[tokio::test]
    async fn non_retriable_fails_immediately() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);
        let res: Result<()> = handler
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(api_err(-1111))
                },
                RetryConfig::default(),
                "probe",
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retriable_retries_until_success() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);
        let retry = RetryConfig {
            backoff_base_secs: 0.01,
            jitter: false,
            ..Default::default()
        };
        let res = handler
            .execute(
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(api_err(-1001))
                    } else {
                        Ok(42)
                    }
                },
                retry,
                "probe",
            )
            .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_never_open_the_breaker() {
        let handler = ErrorHandler::new();
        let retry = RetryConfig {
            max_retries: 1,
            ..Default::default()
        };
        for _ in 0..10 {
            let _: Result<()> = handler
                .execute_with_breaker("exchange_orders", || async { Err(api_err(-2019)) }, retry, "probe")
                .await;
        }
        assert_eq!(handler.breaker("exchange_orders").state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn systemic_errors_open_the_breaker() {
        let handler = ErrorHandler::new();
        let retry = RetryConfig {
            max_retries: 1,
            ..Default::default()
        };
        for _ in 0..5 {
            let _: Result<()> = handler
                .execute_with_breaker("exchange_orders", || async { Err(api_err(503)) }, retry, "probe")
                .await;
        }
        assert_eq!(handler.breaker("exchange_orders").state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn shutdown_mode_bypasses_open_breaker() {
        let handler = ErrorHandler::new();
        let breaker = handler.breaker("cleanup");
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        handler.set_shutdown_mode(true);
        let res = handler
            .execute_with_breaker(
                "cleanup",
                || async { Ok::<_, anyhow::Error>(1u32) },
                RetryConfig::with_max_retries(1),
                "probe",
            )
            .await;
        assert_eq!(res.unwrap(), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert!((backoff_delay(0, &retry) - 1.0).abs() < 1e-9);
        assert!((backoff_delay(1, &retry) - 2.0).abs() < 1e-9);
        assert!((backoff_delay(2, &retry) - 4.0).abs() < 1e-9);
        assert!((backoff_delay(10, &retry) - 60.0).abs() < 1e-9);
    }
}
