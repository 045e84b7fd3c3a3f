// =============================================================================
// Shared types used across the Vega trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite direction (used for reversal detection).
    pub fn opposite(&self) -> Side {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1.0 for long, -1.0 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side that opens a position in this direction.
    pub fn entry_order(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction.
    pub fn exit_order(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Consensus outcome of the signal aggregator. `Skip` means no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusSide {
    Long,
    Short,
    Skip,
}

impl ConsensusSide {
    pub fn as_side(&self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::Skip => None,
        }
    }
}

impl From<Side> for ConsensusSide {
    fn from(s: Side) -> Self {
        match s {
            Side::Long => Self::Long,
            Side::Short => Self::Short,
        }
    }
}

impl std::fmt::Display for ConsensusSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the book an aggressive trade hit.
///
/// `Bid` means an aggressive sell hit a resting bid; `Ask` means an
/// aggressive buy lifted a resting ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickSide {
    Bid,
    Ask,
    Unknown,
}

/// Execution mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    /// Real funds against mainnet.
    Live,
    /// Real API against testnet.
    Demo,
    /// No exchange writes; candle-based exit simulation.
    Testing,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Testing
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Demo => write!(f, "demo"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

impl TradeMode {
    /// Whether exchange-side TP/SL fills must be trusted (no local simulation).
    pub fn is_exchange_backed(&self) -> bool {
        matches!(self, Self::Live | Self::Demo)
    }
}

/// A single trade print from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Epoch seconds (fractional).
    pub timestamp: f64,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub side: TickSide,
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub free: f64,
}

/// Current epoch time in fractional seconds.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_orders() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
        assert_eq!(Side::Long.entry_order(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_order(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_order(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order(), OrderSide::Buy);
    }

    #[test]
    fn consensus_conversion() {
        assert_eq!(ConsensusSide::Long.as_side(), Some(Side::Long));
        assert_eq!(ConsensusSide::Skip.as_side(), None);
        assert_eq!(ConsensusSide::from(Side::Short), ConsensusSide::Short);
    }

    #[test]
    fn mode_exchange_backed() {
        assert!(TradeMode::Live.is_exchange_backed());
        assert!(TradeMode::Demo.is_exchange_backed());
        assert!(!TradeMode::Testing.is_exchange_backed());
    }
}
