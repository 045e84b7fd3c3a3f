// =============================================================================
// Sensor runtime — trait, families, and the compile-time registry
// =============================================================================
//
// Sensors are stateful per instance; the pool instantiates a fresh set per
// symbol inside each worker, so cross-symbol contamination is impossible by
// construction. The registry is a fixed constructor list filtered by the
// config's enable map.
// =============================================================================

pub mod context;
pub mod indicators;
pub mod orderflow;
pub mod pool;
pub mod technical;
#[cfg(test)]
pub(crate) mod testutil;

use serde::{Deserialize, Serialize};

use crate::events::RawSignal;
use crate::market_data::MtfContext;
use crate::runtime_config::RuntimeConfig;

/// Sensor role in the aggregation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorFamily {
    /// Directional filters (HTF trend, regime); never trade triggers.
    Context,
    /// Price/indicator pattern detectors.
    Technical,
    /// Footprint/delta detectors; bypass the consensus margin gate.
    OrderFlow,
}

/// A stateful detector evaluated once per closed 1m candle.
pub trait Sensor: Send {
    fn name(&self) -> &'static str;

    fn family(&self) -> SensorFamily {
        SensorFamily::Technical
    }

    /// Evaluate the multi-timeframe context. `None` means no opinion.
    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>>;
}

pub type SensorCtor = fn() -> Box<dyn Sensor>;

/// The full sensor roster. Order is stable; workers receive round-robin
/// slices of this list.
pub fn registry() -> Vec<(&'static str, SensorCtor)> {
    vec![
        ("HigherTFTrend", || Box::new(context::HigherTfTrend::new())),
        ("HurstRegime", || Box::new(context::HurstRegime::new())),
        ("MTFImpulse", || Box::new(context::MtfImpulse::new())),
        ("EmaCrossover", || Box::new(technical::EmaCrossover::new())),
        ("RsiReversion", || Box::new(technical::RsiReversion::new())),
        ("BollingerTouch", || Box::new(technical::BollingerTouch::new())),
        ("PinbarReversal", || Box::new(technical::PinbarReversal::new())),
        ("VolumeSpike", || Box::new(technical::VolumeSpike::new())),
        ("MomentumBurst", || Box::new(technical::MomentumBurst::new())),
        ("FootprintImbalance", || Box::new(orderflow::FootprintImbalance::new())),
        ("FootprintAbsorption", || Box::new(orderflow::FootprintAbsorption::new())),
        ("DeltaDivergence", || Box::new(orderflow::DeltaDivergence::new())),
    ]
}

/// Registry filtered by the config's enable map.
pub fn enabled_registry(config: &RuntimeConfig) -> Vec<(&'static str, SensorCtor)> {
    registry()
        .into_iter()
        .filter(|(name, _)| config.sensor_enabled(name))
        .collect()
}

/// Family lookup by sensor id (used by the aggregator's margin fast-track and
/// HTF context extraction).
pub fn family_of(sensor_id: &str) -> SensorFamily {
    match sensor_id {
        "HigherTFTrend" | "HurstRegime" | "MTFImpulse" => SensorFamily::Context,
        "FootprintImbalance" | "FootprintAbsorption" | "DeltaDivergence" => SensorFamily::OrderFlow,
        _ => SensorFamily::Technical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_instantiates_every_sensor() {
        for (name, ctor) in registry() {
            let sensor = ctor();
            assert_eq!(sensor.name(), name);
        }
    }

    #[test]
    fn registry_families_match_lookup() {
        for (name, ctor) in registry() {
            assert_eq!(ctor().family(), family_of(name), "family mismatch for {name}");
        }
    }

    #[test]
    fn enable_map_filters_registry() {
        let mut config = RuntimeConfig::default();
        let full = enabled_registry(&config).len();
        config.sensors_enabled.insert("EmaCrossover".into(), false);
        assert_eq!(enabled_registry(&config).len(), full - 1);
    }
}
