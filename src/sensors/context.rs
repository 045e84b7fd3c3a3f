// =============================================================================
// Context sensors — higher-timeframe directional filters
// =============================================================================
//
// These never trigger trades on their own; the aggregator extracts a majority
// direction from them and rejects consensus that fights it.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use crate::events::RawSignal;
use crate::market_data::{MtfContext, Timeframe};
use crate::sensors::indicators::{ema, hurst_exponent};
use crate::sensors::{Sensor, SensorFamily};
use crate::types::Side;

/// Confirms trend via higher-timeframe EMA alignment: rising EMA with price
/// above it on a completed HTF candle.
pub struct HigherTfTrend {
    ema_period: usize,
    lookback: usize,
    closes: HashMap<Timeframe, VecDeque<f64>>,
    emas: HashMap<Timeframe, VecDeque<f64>>,
    last_ts: HashMap<Timeframe, u64>,
}

impl HigherTfTrend {
    const TIMEFRAMES: [Timeframe; 2] = [Timeframe::M15, Timeframe::H1];

    pub fn new() -> Self {
        Self {
            ema_period: 20,
            lookback: 3,
            closes: HashMap::new(),
            emas: HashMap::new(),
            last_ts: HashMap::new(),
        }
    }

    fn check_tf(&mut self, tf: Timeframe, ctx: &MtfContext) -> Option<RawSignal> {
        let candle = ctx.frame(tf)?;
        if !candle.is_complete || self.last_ts.get(&tf) == Some(&candle.timestamp) {
            return None;
        }
        self.last_ts.insert(tf, candle.timestamp);

        let closes = self.closes.entry(tf).or_insert_with(|| VecDeque::with_capacity(64));
        closes.push_back(candle.close);
        while closes.len() > self.ema_period + self.lookback + 10 {
            closes.pop_front();
        }

        let series: Vec<f64> = closes.iter().copied().collect();
        let current_ema = ema(&series, self.ema_period)?;

        let emas = self.emas.entry(tf).or_insert_with(|| VecDeque::with_capacity(8));
        emas.push_back(current_ema);
        while emas.len() > self.lookback + 5 {
            emas.pop_front();
        }
        if emas.len() < self.lookback {
            return None;
        }

        let recent: Vec<f64> = emas.iter().rev().take(self.lookback).rev().copied().collect();
        let rising = recent.windows(2).all(|w| w[0] < w[1]);
        let falling = recent.windows(2).all(|w| w[0] > w[1]);

        if rising && candle.close > current_ema {
            Some(RawSignal::new(Side::Long, 1.0, tf.label()))
        } else if falling && candle.close < current_ema {
            Some(RawSignal::new(Side::Short, 1.0, tf.label()))
        } else {
            None
        }
    }
}

impl Sensor for HigherTfTrend {
    fn name(&self) -> &'static str {
        "HigherTFTrend"
    }

    fn family(&self) -> SensorFamily {
        SensorFamily::Context
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let signals: Vec<RawSignal> = Self::TIMEFRAMES
            .iter()
            .filter_map(|tf| self.check_tf(*tf, ctx))
            .collect();
        if signals.is_empty() {
            None
        } else {
            Some(signals)
        }
    }
}

/// Classifies the market regime from the Hurst exponent of 1m closes.
/// A persistent regime (H > 0.55) sides with the recent drift; mean-reverting
/// regimes stay silent.
pub struct HurstRegime {
    window: usize,
    closes: VecDeque<f64>,
}

impl HurstRegime {
    pub fn new() -> Self {
        Self {
            window: 64,
            closes: VecDeque::with_capacity(64),
        }
    }
}

impl Sensor for HurstRegime {
    fn name(&self) -> &'static str {
        "HurstRegime"
    }

    fn family(&self) -> SensorFamily {
        SensorFamily::Context
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        self.closes.push_back(ctx.base.close);
        while self.closes.len() > self.window {
            self.closes.pop_front();
        }
        if self.closes.len() < self.window {
            return None;
        }

        let series: Vec<f64> = self.closes.iter().copied().collect();
        let h = hurst_exponent(&series)?;
        if h <= 0.55 {
            return None;
        }

        let drift = series[series.len() - 1] - series[0];
        if drift.abs() < f64::EPSILON {
            return None;
        }

        let side = if drift > 0.0 { Side::Long } else { Side::Short };
        let score = ((h - 0.55) / 0.3).clamp(0.3, 1.0);
        Some(vec![RawSignal::new(side, score, "1m")])
    }
}

/// Detects aligned impulse candles on 5m and 15m: wide bodies closing in the
/// same direction on both frames.
pub struct MtfImpulse {
    last_ts: u64,
}

impl MtfImpulse {
    pub fn new() -> Self {
        Self { last_ts: 0 }
    }

    fn body_direction(open: f64, high: f64, low: f64, close: f64) -> Option<Side> {
        let range = high - low;
        if range <= 0.0 {
            return None;
        }
        let body = (close - open).abs();
        if body / range < 0.6 {
            return None;
        }
        Some(if close > open { Side::Long } else { Side::Short })
    }
}

impl Sensor for MtfImpulse {
    fn name(&self) -> &'static str {
        "MTFImpulse"
    }

    fn family(&self) -> SensorFamily {
        SensorFamily::Context
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let m5 = ctx.frame(Timeframe::M5)?;
        let m15 = ctx.frame(Timeframe::M15)?;
        if !m5.is_complete || m5.timestamp == self.last_ts {
            return None;
        }
        self.last_ts = m5.timestamp;

        let dir5 = Self::body_direction(m5.open, m5.high, m5.low, m5.close)?;
        let dir15 = Self::body_direction(m15.open, m15.high, m15.low, m15.close)?;
        if dir5 != dir15 {
            return None;
        }

        Some(vec![RawSignal::new(dir5, 0.9, "5m")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::testutil::context_from_series;

    #[test]
    fn hurst_regime_sides_with_drift_in_persistent_market() {
        let mut sensor = HurstRegime::new();
        let mut out = None;
        for i in 0..70 {
            let ctx = context_from_series("BTCUSDT", i, 100.0 + i as f64, 1.0);
            out = sensor.calculate(&ctx);
        }
        let signals = out.expect("trending series should produce a regime signal");
        assert_eq!(signals[0].side, Side::Long);
        assert!(signals[0].score > 0.0);
    }

    #[test]
    fn mtf_impulse_requires_alignment() {
        let mut sensor = MtfImpulse::new();
        // Build a context whose 5m frame is complete and bullish but whose 15m
        // is a doji: no signal.
        let mut ctx = context_from_series("BTCUSDT", 4, 104.0, 1.0);
        ctx.frames.insert(
            Timeframe::M5,
            crate::events::AggCandle {
                timestamp: 0,
                open: 100.0,
                high: 105.0,
                low: 99.5,
                close: 104.8,
                volume: 10.0,
                is_complete: true,
            },
        );
        ctx.frames.insert(
            Timeframe::M15,
            crate::events::AggCandle {
                timestamp: 0,
                open: 100.0,
                high: 105.0,
                low: 95.0,
                close: 100.1,
                volume: 30.0,
                is_complete: false,
            },
        );
        assert!(sensor.calculate(&ctx).is_none());

        // Aligned bullish bodies fire a LONG.
        let mut sensor = MtfImpulse::new();
        ctx.frames.get_mut(&Timeframe::M15).unwrap().close = 104.5;
        ctx.frames.get_mut(&Timeframe::M15).unwrap().low = 99.0;
        let signals = sensor.calculate(&ctx).expect("aligned impulse should fire");
        assert_eq!(signals[0].side, Side::Long);
    }
}
