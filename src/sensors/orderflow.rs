// =============================================================================
// Order-flow sensors — footprint profile and delta detectors
// =============================================================================
//
// These read the 1m candle's per-level bid/ask breakdown. The aggregator lets
// them bypass the consensus margin gate.
// =============================================================================

use std::collections::VecDeque;

use crate::events::RawSignal;
use crate::market_data::MtfContext;
use crate::sensors::{Sensor, SensorFamily};
use crate::types::Side;

/// Stacked diagonal imbalance: several consecutive levels where one side's
/// aggressive volume dominates the other by a ratio.
pub struct FootprintImbalance {
    ratio: f64,
    min_stack: usize,
}

impl FootprintImbalance {
    pub fn new() -> Self {
        Self {
            ratio: 3.0,
            min_stack: 3,
        }
    }
}

impl Sensor for FootprintImbalance {
    fn name(&self) -> &'static str {
        "FootprintImbalance"
    }

    fn family(&self) -> SensorFamily {
        SensorFamily::OrderFlow
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let profile = &ctx.base.profile;
        if profile.len() < self.min_stack {
            return None;
        }

        let mut ask_stack = 0usize;
        let mut bid_stack = 0usize;
        let mut max_ask_stack = 0usize;
        let mut max_bid_stack = 0usize;

        for level in profile.values() {
            if level.ask >= level.bid * self.ratio && level.ask > 0.0 {
                ask_stack += 1;
                max_ask_stack = max_ask_stack.max(ask_stack);
            } else {
                ask_stack = 0;
            }
            if level.bid >= level.ask * self.ratio && level.bid > 0.0 {
                bid_stack += 1;
                max_bid_stack = max_bid_stack.max(bid_stack);
            } else {
                bid_stack = 0;
            }
        }

        if max_ask_stack >= self.min_stack && max_ask_stack > max_bid_stack {
            let score = (max_ask_stack as f64 / (self.min_stack as f64 * 2.0) + 0.4).clamp(0.6, 1.0);
            return Some(vec![RawSignal::new(Side::Long, score, "1m")]);
        }
        if max_bid_stack >= self.min_stack && max_bid_stack > max_ask_stack {
            let score = (max_bid_stack as f64 / (self.min_stack as f64 * 2.0) + 0.4).clamp(0.6, 1.0);
            return Some(vec![RawSignal::new(Side::Short, score, "1m")]);
        }
        None
    }
}

/// Absorption: heavy volume concentrated at a candle extreme while delta
/// opposes the excursion — passive players soaking up the aggression.
pub struct FootprintAbsorption {
    volume_share: f64,
}

impl FootprintAbsorption {
    pub fn new() -> Self {
        Self { volume_share: 0.35 }
    }
}

impl Sensor for FootprintAbsorption {
    fn name(&self) -> &'static str {
        "FootprintAbsorption"
    }

    fn family(&self) -> SensorFamily {
        SensorFamily::OrderFlow
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let c = &ctx.base;
        if c.profile.is_empty() || c.volume <= 0.0 {
            return None;
        }
        let range = c.high - c.low;
        if range <= 0.0 {
            return None;
        }

        // Volume resting in the bottom/top quarter of the range.
        let low_cut = c.low + range * 0.25;
        let high_cut = c.high - range * 0.25;
        let mut low_vol = 0.0;
        let mut high_vol = 0.0;
        for (level, vol) in &c.profile {
            let price = level.price();
            if price <= low_cut {
                low_vol += vol.total();
            } else if price >= high_cut {
                high_vol += vol.total();
            }
        }

        // Sellers hammered the low (negative delta) but volume piled up there
        // and price held: absorption, expect a bounce.
        if low_vol / c.volume >= self.volume_share && c.delta < 0.0 && c.close > c.low + range * 0.5 {
            let score = (low_vol / c.volume + 0.3).clamp(0.6, 1.0);
            return Some(vec![RawSignal::new(Side::Long, score, "1m")]);
        }
        if high_vol / c.volume >= self.volume_share && c.delta > 0.0 && c.close < c.high - range * 0.5 {
            let score = (high_vol / c.volume + 0.3).clamp(0.6, 1.0);
            return Some(vec![RawSignal::new(Side::Short, score, "1m")]);
        }
        None
    }
}

/// Delta divergence: price extends to a new extreme while cumulative delta
/// refuses to confirm.
pub struct DeltaDivergence {
    lookback: usize,
    closes: VecDeque<f64>,
    deltas: VecDeque<f64>,
}

impl DeltaDivergence {
    pub fn new() -> Self {
        Self {
            lookback: 10,
            closes: VecDeque::with_capacity(16),
            deltas: VecDeque::with_capacity(16),
        }
    }
}

impl Sensor for DeltaDivergence {
    fn name(&self) -> &'static str {
        "DeltaDivergence"
    }

    fn family(&self) -> SensorFamily {
        SensorFamily::OrderFlow
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let c = &ctx.base;

        let result = if self.closes.len() >= self.lookback {
            let max_close = self.closes.iter().copied().fold(f64::MIN, f64::max);
            let min_close = self.closes.iter().copied().fold(f64::MAX, f64::min);
            let max_delta = self.deltas.iter().copied().fold(f64::MIN, f64::max);
            let min_delta = self.deltas.iter().copied().fold(f64::MAX, f64::min);

            // New price high without a delta high: longs are trapped.
            if c.close > max_close && c.delta < max_delta && c.delta < 0.0 {
                Some(vec![RawSignal::new(Side::Short, 0.8, "1m")])
            } else if c.close < min_close && c.delta > min_delta && c.delta > 0.0 {
                Some(vec![RawSignal::new(Side::Long, 0.8, "1m")])
            } else {
                None
            }
        } else {
            None
        };

        self.closes.push_back(c.close);
        self.deltas.push_back(c.delta);
        while self.closes.len() > self.lookback {
            self.closes.pop_front();
            self.deltas.pop_front();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::testutil::{context_of, make_candle, with_level};

    #[test]
    fn stacked_ask_imbalance_is_long() {
        let mut sensor = FootprintImbalance::new();
        let mut candle = make_candle(0, 100.0, 103.0, 100.0, 103.0, 0.0);
        for i in 0..4 {
            candle = with_level(candle, 100.0 + i as f64, 1.0, 5.0);
        }
        let signals = sensor.calculate(&context_of(candle, 1)).expect("stack should fire");
        assert_eq!(signals[0].side, Side::Long);
    }

    #[test]
    fn balanced_profile_stays_silent() {
        let mut sensor = FootprintImbalance::new();
        let mut candle = make_candle(0, 100.0, 103.0, 100.0, 101.0, 0.0);
        for i in 0..4 {
            candle = with_level(candle, 100.0 + i as f64, 3.0, 3.0);
        }
        assert!(sensor.calculate(&context_of(candle, 1)).is_none());
    }

    #[test]
    fn absorption_long_when_sell_pressure_soaked_at_low() {
        let mut sensor = FootprintAbsorption::new();
        // Heavy bid-side volume at the low, close back above mid.
        let mut candle = make_candle(0, 100.0, 101.0, 98.0, 100.5, 0.0);
        candle = with_level(candle, 98.0, 40.0, 5.0);
        candle = with_level(candle, 100.5, 5.0, 10.0);
        let signals = sensor
            .calculate(&context_of(candle, 1))
            .expect("absorption should fire");
        assert_eq!(signals[0].side, Side::Long);
    }

    #[test]
    fn delta_divergence_shorts_unconfirmed_high() {
        let mut sensor = DeltaDivergence::new();
        for i in 0..10 {
            let mut candle = make_candle(i * 60, 100.0, 100.5, 99.5, 100.0 + i as f64 * 0.05, 10.0);
            candle.delta = 5.0;
            sensor.calculate(&context_of(candle, i + 1));
        }
        // New high with negative delta.
        let mut candle = make_candle(11 * 60, 100.5, 101.5, 100.4, 101.4, 10.0);
        candle.delta = -3.0;
        let signals = sensor
            .calculate(&context_of(candle, 12))
            .expect("divergence should fire");
        assert_eq!(signals[0].side, Side::Short);
    }
}
