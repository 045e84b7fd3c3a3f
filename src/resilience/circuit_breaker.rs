// =============================================================================
// Circuit Breaker — stateful gate over a failing dependency
// =============================================================================
//
// States:
//   CLOSED    — normal operation, calls pass through.
//   OPEN      — repeated failures; calls are rejected until the recovery
//               timeout elapses.
//   HALF_OPEN — probing recovery with a bounded number of test calls.
// =============================================================================

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::binance::classify::CircuitBreakerOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
}

/// Serialisable breaker stats for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub time_until_retry_secs: f64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout_secs: f64,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_params(name, 5, 60.0, 3)
    }

    pub fn with_params(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout_secs: f64,
        half_open_max_calls: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout_secs,
            half_open_max_calls,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Check whether a call may proceed. An OPEN breaker past its recovery
    /// timeout transitions to HALF_OPEN and admits the caller as a probe.
    pub fn check_availability(&self) -> Result<(), CircuitBreakerOpenError> {
        let mut s = self.inner.lock();

        if s.state == CircuitState::Open {
            let elapsed = s
                .last_failure
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(f64::MAX);
            if elapsed >= self.recovery_timeout_secs {
                info!(breaker = %self.name, "circuit breaker -> HALF_OPEN (testing recovery)");
                s.state = CircuitState::HalfOpen;
                s.success_count = 0;
                s.half_open_calls = 0;
            } else {
                return Err(CircuitBreakerOpenError {
                    name: self.name.clone(),
                    retry_after_secs: self.recovery_timeout_secs - elapsed,
                });
            }
        }

        if s.state == CircuitState::HalfOpen {
            if s.half_open_calls >= self.half_open_max_calls {
                return Err(CircuitBreakerOpenError {
                    name: self.name.clone(),
                    retry_after_secs: 1.0,
                });
            }
            s.half_open_calls += 1;
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut s = self.inner.lock();
        s.failure_count = 0;

        if s.state == CircuitState::HalfOpen {
            s.success_count += 1;
            if s.success_count >= self.half_open_max_calls {
                info!(breaker = %self.name, "circuit breaker -> CLOSED (recovered)");
                s.state = CircuitState::Closed;
                s.success_count = 0;
                s.half_open_calls = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.inner.lock();
        s.failure_count += 1;
        s.last_failure = Some(Instant::now());

        let should_open = s.state == CircuitState::HalfOpen || s.failure_count >= self.failure_threshold;
        if should_open && s.state != CircuitState::Open {
            warn!(
                breaker = %self.name,
                failures = s.failure_count,
                threshold = self.failure_threshold,
                "circuit breaker -> OPEN"
            );
            s.state = CircuitState::Open;
            s.success_count = 0;
            s.half_open_calls = 0;
        }
    }

    /// Manual reset to CLOSED (stream-disable cleanup path).
    pub fn reset(&self) {
        let mut s = self.inner.lock();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.success_count = 0;
        s.half_open_calls = 0;
        s.last_failure = None;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    pub fn stats(&self) -> BreakerStats {
        let s = self.inner.lock();
        let time_until_retry = if s.state == CircuitState::Open {
            s.last_failure
                .map(|t| (self.recovery_timeout_secs - t.elapsed().as_secs_f64()).max(0.0))
                .unwrap_or(0.0)
        } else {
            0.0
        };
        BreakerStats {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            time_until_retry_secs: time_until_retry,
        }
    }

    #[cfg(test)]
    fn force_last_failure_age(&self, secs: f64) {
        let mut s = self.inner.lock();
        s.last_failure = Some(Instant::now() - std::time::Duration::from_secs_f64(secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let b = CircuitBreaker::new("probe");
        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), CircuitState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.check_availability().is_err());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::new("probe");
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn recovery_cycle_open_half_open_closed() {
        let b = CircuitBreaker::new("probe");
        for _ in 0..6 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);

        // Request before the recovery timeout is rejected with a countdown.
        let err = b.check_availability().unwrap_err();
        assert!(err.retry_after_secs > 0.0);

        // After the recovery timeout the next attempt transitions HALF_OPEN.
        b.force_last_failure_age(61.0);
        assert!(b.check_availability().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // Three successes close the breaker.
        b.record_success();
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("probe");
        for _ in 0..5 {
            b.record_failure();
        }
        b.force_last_failure_age(61.0);
        assert!(b.check_availability().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_probe_calls() {
        let b = CircuitBreaker::new("probe");
        for _ in 0..5 {
            b.record_failure();
        }
        b.force_last_failure_age(61.0);
        for _ in 0..3 {
            assert!(b.check_availability().is_ok());
        }
        assert!(b.check_availability().is_err());
    }
}
