// =============================================================================
// Error classification — retriable vs fatal exchange errors
// =============================================================================
//
// The retry layer and the circuit breakers both consume this classification.
// Vendor error codes are matched structurally via `ApiError`; anything else
// falls back to message-pattern matching.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// A structured error returned by the exchange REST API.
#[derive(Debug, Clone, Error)]
#[error("({code}) {msg}")]
pub struct ApiError {
    /// Vendor error code (e.g. -1021) or the HTTP status when no body code.
    pub code: i64,
    pub msg: String,
    pub http_status: u16,
}

/// Raised when a circuit breaker rejects a call.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{name}' is open, retry after {retry_after_secs:.1}s")]
pub struct CircuitBreakerOpenError {
    pub name: String,
    pub retry_after_secs: f64,
}

/// Error categories. The first block is retriable, the second is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    ServerError,
    Temporary,

    Authentication,
    Authorization,
    InvalidSymbol,
    InvalidOrder,
    InsufficientFunds,
    GracefulShutdown,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError | Self::Temporary
        )
    }

    /// Validation-class categories prove the exchange is alive and must never
    /// trip a breaker.
    pub fn is_proof_of_life(&self) -> bool {
        matches!(
            self,
            Self::InvalidOrder
                | Self::InvalidSymbol
                | Self::InsufficientFunds
                | Self::Authentication
                | Self::Authorization
        )
    }
}

/// Classification result: category plus the suggested retry delay.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retry_delay_secs: Option<f64>,
}

impl Classification {
    pub fn is_retriable(&self) -> bool {
        self.category.is_retriable()
    }

    fn retriable(category: ErrorCategory) -> Self {
        let retry_delay_secs = Some(match category {
            ErrorCategory::RateLimit => 60.0,
            ErrorCategory::Timeout => 5.0,
            ErrorCategory::ServerError => 10.0,
            _ => 2.0,
        });
        Self {
            category,
            retry_delay_secs,
        }
    }

    fn fatal(category: ErrorCategory) -> Self {
        Self {
            category,
            retry_delay_secs: None,
        }
    }
}

/// Map a vendor error code to a category. `None` means the code carries no
/// classification on its own.
fn classify_code(code: i64) -> Option<ErrorCategory> {
    use ErrorCategory::*;
    match code {
        -1015 | -1003 | 429 => Some(RateLimit),
        -1001 | -1000 => Some(Temporary),
        // Timestamp outside recvWindow: the connector resyncs its clock and
        // the retry layer re-issues the request.
        -1021 => Some(Temporary),
        // ReduceOnly rejected before the position propagated (sync lag).
        -2022 | -4118 => Some(Temporary),
        -2015 | -1022 | 401 => Some(Authentication),
        403 => Some(Authorization),
        -2021 | -4131 | -1111 | -1116 | -1117 | -2011 | -2013 | -4003 | -4164 => Some(InvalidOrder),
        -1121 => Some(InvalidSymbol),
        -2019 | -4028 => Some(InsufficientFunds),
        500..=599 => Some(ServerError),
        _ => None,
    }
}

/// Message patterns checked when no code classification applies. Retriable
/// patterns are checked first, mirroring the priority of the code table.
fn classify_message(msg: &str) -> Option<ErrorCategory> {
    use ErrorCategory::*;
    let m = msg.to_lowercase();

    // Graceful shutdown noise takes precedence: these arrive when we close
    // connections on purpose and must not trigger recovery.
    if m.contains("connection to remote host was lost")
        || m.contains("lost websocket connection")
        || m.contains("websocket closed")
    {
        return Some(GracefulShutdown);
    }

    if m.contains("connection reset") || m.contains("connection refused") || m.contains("socket") {
        return Some(Network);
    }
    if m.contains("timed out") || m.contains("timeout") {
        return Some(Timeout);
    }
    if m.contains("rate limit") || m.contains("too many requests") {
        return Some(RateLimit);
    }
    if m.contains("internal server error")
        || m.contains("service unavailable")
        || m.contains("bad gateway")
        || m.contains("gateway timeout")
    {
        return Some(ServerError);
    }
    if m.contains("invalid api") || m.contains("invalid signature") || m.contains("unauthorized") {
        return Some(Authentication);
    }
    if m.contains("forbidden") || m.contains("permission denied") {
        return Some(Authorization);
    }
    if m.contains("invalid symbol") || m.contains("symbol not found") {
        return Some(InvalidSymbol);
    }
    if m.contains("invalid order") || m.contains("unknown order") {
        return Some(InvalidOrder);
    }
    if m.contains("insufficient") {
        return Some(InsufficientFunds);
    }
    if m.contains("try again") || m.contains("temporary") {
        return Some(Temporary);
    }
    None
}

/// Classify any error surfaced from an exchange call.
pub fn classify(err: &anyhow::Error) -> Classification {
    // Open breakers are retriable after the breaker's own cooldown.
    if let Some(cb) = err.downcast_ref::<CircuitBreakerOpenError>() {
        return Classification {
            category: ErrorCategory::Temporary,
            retry_delay_secs: Some(cb.retry_after_secs.max(1.0)),
        };
    }

    if let Some(api) = err.downcast_ref::<ApiError>() {
        if let Some(cat) = classify_code(api.code) {
            return if cat.is_retriable() {
                Classification::retriable(cat)
            } else {
                Classification::fatal(cat)
            };
        }
        if api.http_status >= 500 {
            return Classification::retriable(ErrorCategory::ServerError);
        }
        if api.http_status == 429 {
            return Classification::retriable(ErrorCategory::RateLimit);
        }
        if let Some(cat) = classify_message(&api.msg) {
            return if cat.is_retriable() {
                Classification::retriable(cat)
            } else {
                Classification::fatal(cat)
            };
        }
        // Unknown vendor code: be conservative, do not retry.
        return Classification::fatal(ErrorCategory::Unknown);
    }

    // reqwest network failures are retriable by nature.
    if let Some(req) = err.downcast_ref::<reqwest::Error>() {
        let cat = if req.is_timeout() {
            ErrorCategory::Timeout
        } else {
            ErrorCategory::Network
        };
        return Classification::retriable(cat);
    }

    if err.downcast_ref::<tokio_tungstenite::tungstenite::Error>().is_some() {
        return Classification::retriable(ErrorCategory::Network);
    }

    match classify_message(&format!("{err:#}")) {
        Some(cat) if cat.is_retriable() => Classification::retriable(cat),
        Some(cat) => Classification::fatal(cat),
        None => Classification::fatal(ErrorCategory::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(code: i64) -> anyhow::Error {
        anyhow::Error::new(ApiError {
            code,
            msg: "probe".into(),
            http_status: 400,
        })
    }

    #[test]
    fn rate_limit_codes_retriable_with_long_delay() {
        for code in [-1015, -1003] {
            let c = classify(&api(code));
            assert_eq!(c.category, ErrorCategory::RateLimit);
            assert!(c.is_retriable());
            assert_eq!(c.retry_delay_secs, Some(60.0));
        }
    }

    #[test]
    fn reduce_only_sync_lag_is_temporary() {
        for code in [-2022, -4118, -1021, -1001, -1000] {
            let c = classify(&api(code));
            assert_eq!(c.category, ErrorCategory::Temporary, "code {code}");
            assert!(c.is_retriable());
        }
    }

    #[test]
    fn validation_codes_fatal_and_proof_of_life() {
        for code in [-1111, -2011, -2013, -4003, -4131, -4164] {
            let c = classify(&api(code));
            assert_eq!(c.category, ErrorCategory::InvalidOrder, "code {code}");
            assert!(!c.is_retriable());
            assert!(c.category.is_proof_of_life());
        }
        for code in [-2019, -4028] {
            let c = classify(&api(code));
            assert_eq!(c.category, ErrorCategory::InsufficientFunds);
            assert!(c.category.is_proof_of_life());
        }
    }

    #[test]
    fn auth_codes_fatal() {
        for code in [-2015, -1022, 401] {
            let c = classify(&api(code));
            assert_eq!(c.category, ErrorCategory::Authentication);
            assert!(!c.is_retriable());
        }
        assert_eq!(classify(&api(403)).category, ErrorCategory::Authorization);
    }

    #[test]
    fn server_errors_retriable() {
        let c = classify(&api(503));
        assert_eq!(c.category, ErrorCategory::ServerError);
        assert_eq!(c.retry_delay_secs, Some(10.0));
    }

    #[test]
    fn breaker_open_maps_to_its_own_delay() {
        let err = anyhow::Error::new(CircuitBreakerOpenError {
            name: "exchange_orders".into(),
            retry_after_secs: 42.0,
        });
        let c = classify(&err);
        assert!(c.is_retriable());
        assert_eq!(c.retry_delay_secs, Some(42.0));
    }

    #[test]
    fn shutdown_noise_not_retriable() {
        let err = anyhow::anyhow!("Connection to remote host was lost.");
        let c = classify(&err);
        assert_eq!(c.category, ErrorCategory::GracefulShutdown);
        assert!(!c.is_retriable());
    }

    #[test]
    fn unknown_is_conservative() {
        let c = classify(&anyhow::anyhow!("weird unheard-of failure"));
        assert!(!c.is_retriable());
    }
}
