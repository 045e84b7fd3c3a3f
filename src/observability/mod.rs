pub mod metrics;
pub mod watchdog;

pub use metrics::Metrics;
pub use watchdog::{ShutdownGuard, Watchdog};
