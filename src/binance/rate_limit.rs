// =============================================================================
// Rate Limiter — token bucket per endpoint class
// =============================================================================
//
// Binance-calibrated budgets: orders 5/s (300/min), account 1/s (60/min),
// market data 40/s (2400/min). Acquire waits for a token with a safety
// timeout; starvation is surfaced as a hard error because a bucket that never
// refills means the process is wedged, not throttled.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

/// Safety ceiling on a single acquire. Matches the longest REST timeout.
const ACQUIRE_TIMEOUT_SECS: f64 = 45.0;

/// Endpoint classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Orders,
    Account,
    MarketData,
    Default,
}

impl EndpointClass {
    fn label(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Account => "account",
            Self::MarketData => "market_data",
            Self::Default => "default",
        }
    }
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    acquired: u64,
}

impl Bucket {
    fn new(rate_per_sec: f64) -> Self {
        Self {
            capacity: rate_per_sec,
            tokens: rate_per_sec,
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
            acquired: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or return the wait until one becomes available.
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.acquired += 1;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Snapshot of acquired counts per class (for the metrics endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub acquired: HashMap<String, u64>,
}

/// Token-bucket rate limiter for exchange API calls.
pub struct RateLimiter {
    buckets: Mutex<HashMap<EndpointClass, Bucket>>,
}

impl RateLimiter {
    /// Binance USDT-M futures budgets.
    pub fn binance() -> Self {
        Self::new(5.0, 1.0, 40.0, 5.0)
    }

    pub fn new(orders: f64, account: f64, market_data: f64, default: f64) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(EndpointClass::Orders, Bucket::new(orders));
        buckets.insert(EndpointClass::Account, Bucket::new(account));
        buckets.insert(EndpointClass::MarketData, Bucket::new(market_data));
        buckets.insert(EndpointClass::Default, Bucket::new(default));
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Wait for a token from the class bucket.
    ///
    /// Raises after [`ACQUIRE_TIMEOUT_SECS`] of starvation; that failure is
    /// systemic and deliberately not retriable.
    pub async fn acquire(&self, class: EndpointClass) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(ACQUIRE_TIMEOUT_SECS);
        loop {
            let wait = {
                let mut buckets = self.buckets.lock();
                let bucket = if buckets.contains_key(&class) {
                    buckets.get_mut(&class).expect("checked above")
                } else {
                    buckets
                        .get_mut(&EndpointClass::Default)
                        .expect("default bucket always present")
                };
                match bucket.try_take() {
                    Ok(()) => {
                        debug!(class = class.label(), "rate limit token acquired");
                        return Ok(());
                    }
                    Err(wait) => wait,
                }
            };

            if Instant::now() + wait > deadline {
                error!(
                    class = class.label(),
                    timeout_secs = ACQUIRE_TIMEOUT_SECS,
                    "rate limit acquisition timed out"
                );
                bail!(
                    "rate limit acquisition timeout ({}) after {ACQUIRE_TIMEOUT_SECS}s",
                    class.label()
                );
            }
            tokio::time::sleep(wait).await;
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let buckets = self.buckets.lock();
        RateLimiterSnapshot {
            acquired: buckets
                .iter()
                .map(|(class, b)| (class.label().to_string(), b.acquired))
                .collect(),
        }
    }
}
