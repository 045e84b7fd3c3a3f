pub mod classify;
pub mod client;
pub mod queue;
pub mod rate_limit;

pub use client::BinanceConnector;
