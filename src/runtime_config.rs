// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable parameter lives here. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradeMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_bet_size() -> f64 {
    0.01
}

fn default_kelly_max() -> f64 {
    0.10
}

fn default_true() -> bool {
    true
}

fn default_take_profit_pct() -> f64 {
    0.010
}

fn default_stop_loss_pct() -> f64 {
    0.005
}

fn default_max_positions_per_symbol() -> u32 {
    1
}

fn default_max_hold_bars() -> u32 {
    60
}

fn default_soft_exit_tp_mult() -> f64 {
    0.5
}

fn default_breakeven_activation_pct() -> f64 {
    0.004
}

fn default_trailing_activation_pct() -> f64 {
    0.006
}

fn default_trailing_distance_pct() -> f64 {
    0.003
}

fn default_reversal_threshold() -> f64 {
    0.6
}

fn default_drain_phase_minutes() -> u64 {
    15
}

fn default_cooldown_bars() -> u64 {
    5
}

fn default_sensor_stats_path() -> String {
    "state/sensor_stats.json".to_string()
}

fn default_bot_state_path() -> String {
    "state/bot_state.json".to_string()
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9900".to_string()
}

// =============================================================================
// Sub-sections
// =============================================================================

/// How the notional of a new position is derived from the bet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingMode {
    /// notional = equity * bet_size
    FixedNotional,
    /// notional = equity * bet_size / sl_pct (bet_size is risked fraction)
    FixedRisk,
}

impl Default for SizingMode {
    fn default() -> Self {
        Self::FixedNotional
    }
}

/// Dynamic-exit parameters consumed by the exit manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitParams {
    /// Bars a position may be held before the soft exit narrows its TP.
    #[serde(default = "default_max_hold_bars")]
    pub max_hold_bars: u32,

    /// Fraction of the original TP distance kept by a soft exit.
    #[serde(default = "default_soft_exit_tp_mult")]
    pub soft_exit_tp_mult: f64,

    /// Profit fraction at which the SL moves to breakeven (+0.1% fee cushion).
    #[serde(default = "default_breakeven_activation_pct")]
    pub breakeven_activation_pct: f64,

    /// Profit fraction at which the trailing stop activates.
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: f64,

    /// Trailing distance as a fraction of current price.
    #[serde(default = "default_trailing_distance_pct")]
    pub trailing_distance_pct: f64,

    #[serde(default = "default_true")]
    pub breakeven_enabled: bool,

    #[serde(default = "default_true")]
    pub trailing_enabled: bool,

    #[serde(default = "default_true")]
    pub signal_reversal_enabled: bool,

    /// Minimum opposing-signal confidence that forces a reversal close.
    #[serde(default = "default_reversal_threshold")]
    pub signal_reversal_threshold: f64,

    /// Per-symbol reversal threshold overrides (empty by default).
    #[serde(default)]
    pub reversal_threshold_overrides: HashMap<String, f64>,
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            max_hold_bars: default_max_hold_bars(),
            soft_exit_tp_mult: default_soft_exit_tp_mult(),
            breakeven_activation_pct: default_breakeven_activation_pct(),
            trailing_activation_pct: default_trailing_activation_pct(),
            trailing_distance_pct: default_trailing_distance_pct(),
            breakeven_enabled: true,
            trailing_enabled: true,
            signal_reversal_enabled: true,
            signal_reversal_threshold: default_reversal_threshold(),
            reversal_threshold_overrides: HashMap::new(),
        }
    }
}

impl ExitParams {
    /// Effective reversal threshold for a symbol.
    pub fn reversal_threshold_for(&self, symbol: &str) -> f64 {
        self.reversal_threshold_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.signal_reversal_threshold)
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Vega engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Execution mode: live, demo (testnet), or testing.
    #[serde(default)]
    pub mode: TradeMode,

    /// Symbols the engine is watching and trading (native format, BTCUSDT).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Base bet size as a fraction of equity (Kelly fallback).
    #[serde(default = "default_bet_size")]
    pub bet_size: f64,

    /// Use half-Kelly sizing for sensors with enough history.
    #[serde(default = "default_true")]
    pub use_kelly: bool,

    /// Hard cap on the Kelly fraction.
    #[serde(default = "default_kelly_max")]
    pub kelly_max: f64,

    #[serde(default)]
    pub sizing_mode: SizingMode,

    /// Default take-profit distance as a fraction of entry price.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Default stop-loss distance as a fraction of entry price.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Maximum concurrent open positions per symbol.
    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: u32,

    #[serde(default)]
    pub exit: ExitParams,

    /// Minutes of drain at the tail of a timed session.
    #[serde(default = "default_drain_phase_minutes")]
    pub drain_phase_minutes: u64,

    /// Bars a (symbol, sensor) pair must wait between emitted signals.
    #[serde(default = "default_cooldown_bars")]
    pub cooldown_bars: u64,

    /// Sensor enable map. Sensors absent from the map default to enabled.
    #[serde(default)]
    pub sensors_enabled: HashMap<String, bool>,

    /// Active strategy's sensor allow-list. Empty means every trading sensor
    /// may trigger (debug-all mode).
    #[serde(default)]
    pub strategy_sensors: Vec<String>,

    /// Name attached to aggregated signals when the allow-list triggers.
    #[serde(default)]
    pub strategy_name: Option<String>,

    /// Subscribe to L2 depth streams as well as ticker/trades.
    #[serde(default)]
    pub enable_orderbook_stream: bool,

    #[serde(default = "default_sensor_stats_path")]
    pub sensor_stats_path: String,

    #[serde(default = "default_bot_state_path")]
    pub bot_state_path: String,

    /// Bind address of the /metrics + /healthz endpoint.
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: TradeMode::Testing,
            symbols: default_symbols(),
            bet_size: default_bet_size(),
            use_kelly: true,
            kelly_max: default_kelly_max(),
            sizing_mode: SizingMode::FixedNotional,
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            exit: ExitParams::default(),
            drain_phase_minutes: default_drain_phase_minutes(),
            cooldown_bars: default_cooldown_bars(),
            sensors_enabled: HashMap::new(),
            strategy_sensors: Vec::new(),
            strategy_name: None,
            enable_orderbook_stream: false,
            sensor_stats_path: default_sensor_stats_path(),
            bot_state_path: default_bot_state_path(),
            metrics_bind: default_metrics_bind(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            mode = %config.mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        crate::persist::atomic_write_json(path, self)
            .with_context(|| format!("failed to save runtime config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Whether a sensor participates. Absent entries default to enabled.
    pub fn sensor_enabled(&self, name: &str) -> bool {
        self.sensors_enabled.get(name).copied().unwrap_or(true)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.mode, TradeMode::Testing);
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!((cfg.bet_size - 0.01).abs() < f64::EPSILON);
        assert_eq!(cfg.sizing_mode, SizingMode::FixedNotional);
        assert_eq!(cfg.exit.max_hold_bars, 60);
        assert_eq!(cfg.cooldown_bars, 5);
        assert!(cfg.strategy_sensors.is_empty());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, TradeMode::Testing);
        assert!(cfg.use_kelly);
        assert!((cfg.exit.soft_exit_tp_mult - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "demo", "symbols": ["SOLUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, TradeMode::Demo);
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert!((cfg.take_profit_pct - 0.010).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.exit.max_hold_bars, cfg2.exit.max_hold_bars);
    }

    #[test]
    fn sensor_enabled_defaults_to_true() {
        let mut cfg = RuntimeConfig::default();
        assert!(cfg.sensor_enabled("EmaCrossover"));
        cfg.sensors_enabled.insert("EmaCrossover".into(), false);
        assert!(!cfg.sensor_enabled("EmaCrossover"));
    }

    #[test]
    fn reversal_threshold_override() {
        let mut exit = ExitParams::default();
        assert!((exit.reversal_threshold_for("BTCUSDT") - 0.6).abs() < f64::EPSILON);
        exit.reversal_threshold_overrides.insert("BTCUSDT".into(), 0.8);
        assert!((exit.reversal_threshold_for("BTCUSDT") - 0.8).abs() < f64::EPSILON);
        assert!((exit.reversal_threshold_for("ETHUSDT") - 0.6).abs() < f64::EPSILON);
    }
}
