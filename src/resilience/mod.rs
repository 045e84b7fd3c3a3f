pub mod circuit_breaker;
pub mod error_handler;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use error_handler::{ErrorHandler, RetryConfig};
