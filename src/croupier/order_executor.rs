// =============================================================================
// Order Executor — validated order submission behind the orders breaker
// =============================================================================
//
// Every order gets a semantic client id (`C3_<PREFIX>_<12-hex>`) if the
// caller did not supply one, so orders are recognisable across retries,
// reconnects, and process restarts. All submissions pass through
// `execute_with_breaker("exchange_orders", ...)`: validation errors never
// trip the breaker, systemic errors do.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;
use uuid::Uuid;

use crate::binance::client::{NormalizedOrder, OrderParams};
use crate::binance::BinanceConnector;
use crate::resilience::{ErrorHandler, RetryConfig};
use crate::types::OrderSide;

/// Breaker shared by every order submission.
const ORDERS_BREAKER: &str = "exchange_orders";

/// Client-id prefixes by order role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Entry,
    Tp,
    Stop,
    Limit,
}

impl IdPrefix {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Tp => "TP",
            Self::Stop => "STOP",
            Self::Limit => "LIMIT",
        }
    }
}

/// `C3_<PREFIX>_<12-hex>`
pub fn semantic_client_id(prefix: IdPrefix) -> String {
    let uid = Uuid::new_v4().simple().to_string();
    format!("C3_{}_{}", prefix.as_str(), &uid[..12])
}

/// Classify an unknown client id back to its role (reconciliation).
pub fn classify_client_id(client_id: &str) -> Option<IdPrefix> {
    let role = client_id.strip_prefix("C3_")?.split('_').next()?;
    match role {
        "ENTRY" => Some(IdPrefix::Entry),
        "TP" => Some(IdPrefix::Tp),
        "STOP" => Some(IdPrefix::Stop),
        "LIMIT" => Some(IdPrefix::Limit),
        _ => None,
    }
}

pub struct OrderExecutor {
    connector: Arc<BinanceConnector>,
    error_handler: Arc<ErrorHandler>,
}

impl OrderExecutor {
    pub fn new(connector: Arc<BinanceConnector>, error_handler: Arc<ErrorHandler>) -> Self {
        Self {
            connector,
            error_handler,
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            backoff_base_secs: 1.0,
            backoff_factor: 2.0,
            backoff_max_secs: 60.0,
            jitter: true,
        }
    }

    /// Submit a market order.
    pub async fn execute_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        mut params: OrderParams,
        timeout: Option<Duration>,
    ) -> Result<NormalizedOrder> {
        validate_common(symbol, amount, &params)?;
        if params.client_order_id.is_none() {
            params.client_order_id = Some(semantic_client_id(IdPrefix::Entry));
        }

        info!(
            symbol,
            side = %side,
            amount,
            client_id = params.client_order_id.as_deref().unwrap_or(""),
            "executing market order"
        );

        self.error_handler
            .execute_with_breaker(
                ORDERS_BREAKER,
                || {
                    self.connector
                        .create_order(symbol, side, amount, None, "MARKET", params.clone(), timeout)
                },
                Self::retry_config(),
                "executor.market",
            )
            .await
    }

    /// Submit a limit order.
    pub async fn execute_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
        mut params: OrderParams,
    ) -> Result<NormalizedOrder> {
        validate_common(symbol, amount, &params)?;
        if price <= 0.0 {
            bail!("invalid price: {price}");
        }
        if params.client_order_id.is_none() {
            params.client_order_id = Some(semantic_client_id(IdPrefix::Limit));
        }

        info!(
            symbol,
            side = %side,
            amount,
            price,
            client_id = params.client_order_id.as_deref().unwrap_or(""),
            "executing limit order"
        );

        self.error_handler
            .execute_with_breaker(
                ORDERS_BREAKER,
                || {
                    self.connector
                        .create_order(symbol, side, amount, Some(price), "LIMIT", params.clone(), None)
                },
                Self::retry_config(),
                "executor.limit",
            )
            .await
    }

    /// Submit a STOP_MARKET (reduce-only protective stop).
    pub async fn execute_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        mut params: OrderParams,
    ) -> Result<NormalizedOrder> {
        params.reduce_only = true;
        params.stop_price = Some(stop_price);
        validate_common(symbol, amount, &params)?;
        if stop_price <= 0.0 {
            bail!("invalid stopPrice: {stop_price}");
        }
        if params.client_order_id.is_none() {
            params.client_order_id = Some(semantic_client_id(IdPrefix::Stop));
        }

        info!(
            symbol,
            side = %side,
            amount,
            stop_price,
            client_id = params.client_order_id.as_deref().unwrap_or(""),
            "executing stop order"
        );

        self.error_handler
            .execute_with_breaker(
                ORDERS_BREAKER,
                || {
                    self.connector
                        .create_order(symbol, side, amount, None, "STOP_MARKET", params.clone(), None)
                },
                Self::retry_config(),
                "executor.stop",
            )
            .await
    }

    /// Submit a TAKE_PROFIT_MARKET (reduce-only profit target).
    pub async fn execute_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        trigger_price: f64,
        mut params: OrderParams,
    ) -> Result<NormalizedOrder> {
        params.reduce_only = true;
        params.stop_price = Some(trigger_price);
        validate_common(symbol, amount, &params)?;
        if trigger_price <= 0.0 {
            bail!("invalid triggerPrice: {trigger_price}");
        }
        if params.client_order_id.is_none() {
            params.client_order_id = Some(semantic_client_id(IdPrefix::Tp));
        }

        info!(
            symbol,
            side = %side,
            amount,
            trigger_price,
            client_id = params.client_order_id.as_deref().unwrap_or(""),
            "executing take-profit order"
        );

        self.error_handler
            .execute_with_breaker(
                ORDERS_BREAKER,
                || {
                    self.connector.create_order(
                        symbol,
                        side,
                        amount,
                        None,
                        "TAKE_PROFIT_MARKET",
                        params.clone(),
                        None,
                    )
                },
                Self::retry_config(),
                "executor.take_profit",
            )
            .await
    }
}

fn validate_common(symbol: &str, amount: f64, params: &OrderParams) -> Result<()> {
    if symbol.is_empty() {
        bail!("missing symbol");
    }
    // closePosition orders legitimately carry zero quantity.
    if amount <= 0.0 && !params.close_position {
        bail!("invalid amount: {amount}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_have_semantic_shape() {
        let id = semantic_client_id(IdPrefix::Tp);
        assert!(id.starts_with("C3_TP_"));
        let hex = id.strip_prefix("C3_TP_").unwrap();
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn client_ids_are_unique() {
        let a = semantic_client_id(IdPrefix::Entry);
        let b = semantic_client_id(IdPrefix::Entry);
        assert_ne!(a, b);
    }

    #[test]
    fn classify_roundtrip() {
        for prefix in [IdPrefix::Entry, IdPrefix::Tp, IdPrefix::Stop, IdPrefix::Limit] {
            let id = semantic_client_id(prefix);
            assert_eq!(classify_client_id(&id), Some(prefix));
        }
        assert_eq!(classify_client_id("web_1234"), None);
        assert_eq!(classify_client_id("C3_WEIRD_abc"), None);
    }

    #[test]
    fn validation_rejects_bad_orders() {
        let ok_params = OrderParams::default();
        assert!(validate_common("", 1.0, &ok_params).is_err());
        assert!(validate_common("BTCUSDT", 0.0, &ok_params).is_err());
        assert!(validate_common("BTCUSDT", -1.0, &ok_params).is_err());
        assert!(validate_common("BTCUSDT", 1.0, &ok_params).is_ok());

        // closePosition allows zero amount.
        let close = OrderParams {
            close_position: true,
            ..Default::default()
        };
        assert!(validate_common("BTCUSDT", 0.0, &close).is_ok());
    }
}
