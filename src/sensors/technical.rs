// =============================================================================
// Technical sensors — indicator and candle-pattern detectors on the 1m frame
// =============================================================================

use std::collections::VecDeque;

use crate::events::RawSignal;
use crate::market_data::MtfContext;
use crate::sensors::indicators::{ema, rsi, sma, stddev};
use crate::sensors::Sensor;
use crate::types::Side;

fn push_bounded(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    buf.push_back(value);
    while buf.len() > cap {
        buf.pop_front();
    }
}

/// EMA(9) / EMA(21) crossover.
pub struct EmaCrossover {
    fast: usize,
    slow: usize,
    closes: VecDeque<f64>,
    prev_diff: Option<f64>,
}

impl EmaCrossover {
    pub fn new() -> Self {
        Self {
            fast: 9,
            slow: 21,
            closes: VecDeque::with_capacity(64),
            prev_diff: None,
        }
    }
}

impl Sensor for EmaCrossover {
    fn name(&self) -> &'static str {
        "EmaCrossover"
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        push_bounded(&mut self.closes, ctx.base.close, self.slow + 30);
        let series: Vec<f64> = self.closes.iter().copied().collect();

        let fast = ema(&series, self.fast)?;
        let slow = ema(&series, self.slow)?;
        let diff = fast - slow;
        let prev = self.prev_diff.replace(diff);

        let prev = prev?;
        if prev <= 0.0 && diff > 0.0 {
            // Strength grows with the separation relative to price.
            let score = (diff.abs() / ctx.base.close * 2000.0).clamp(0.4, 1.0);
            return Some(vec![RawSignal::new(Side::Long, score, "1m")]);
        }
        if prev >= 0.0 && diff < 0.0 {
            let score = (diff.abs() / ctx.base.close * 2000.0).clamp(0.4, 1.0);
            return Some(vec![RawSignal::new(Side::Short, score, "1m")]);
        }
        None
    }
}

/// RSI(14) mean reversion at the 30/70 bands.
pub struct RsiReversion {
    period: usize,
    closes: VecDeque<f64>,
}

impl RsiReversion {
    pub fn new() -> Self {
        Self {
            period: 14,
            closes: VecDeque::with_capacity(64),
        }
    }
}

impl Sensor for RsiReversion {
    fn name(&self) -> &'static str {
        "RsiReversion"
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        push_bounded(&mut self.closes, ctx.base.close, self.period * 3);
        let series: Vec<f64> = self.closes.iter().copied().collect();
        let value = rsi(&series, self.period)?;

        if value < 30.0 {
            let score = ((30.0 - value) / 30.0 + 0.5).clamp(0.5, 1.0);
            return Some(vec![RawSignal::new(Side::Long, score, "1m")]);
        }
        if value > 70.0 {
            let score = ((value - 70.0) / 30.0 + 0.5).clamp(0.5, 1.0);
            return Some(vec![RawSignal::new(Side::Short, score, "1m")]);
        }
        None
    }
}

/// Bollinger(20, 2) band touch reversion.
pub struct BollingerTouch {
    period: usize,
    mult: f64,
    closes: VecDeque<f64>,
}

impl BollingerTouch {
    pub fn new() -> Self {
        Self {
            period: 20,
            mult: 2.0,
            closes: VecDeque::with_capacity(64),
        }
    }
}

impl Sensor for BollingerTouch {
    fn name(&self) -> &'static str {
        "BollingerTouch"
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        push_bounded(&mut self.closes, ctx.base.close, self.period * 3);
        let series: Vec<f64> = self.closes.iter().copied().collect();

        let mid = sma(&series, self.period)?;
        let sd = stddev(&series, self.period)?;
        if sd < 1e-12 {
            return None;
        }

        let upper = mid + self.mult * sd;
        let lower = mid - self.mult * sd;
        let close = ctx.base.close;

        if close <= lower {
            let score = (((lower - close) / sd) + 0.6).clamp(0.6, 1.0);
            return Some(vec![RawSignal::new(Side::Long, score, "1m")]);
        }
        if close >= upper {
            let score = (((close - upper) / sd) + 0.6).clamp(0.6, 1.0);
            return Some(vec![RawSignal::new(Side::Short, score, "1m")]);
        }
        None
    }
}

/// Pin bar: a dominant wick with the close pinned to the opposite extreme.
pub struct PinbarReversal {
    min_wick_ratio: f64,
}

impl PinbarReversal {
    pub fn new() -> Self {
        Self { min_wick_ratio: 2.0 }
    }
}

impl Sensor for PinbarReversal {
    fn name(&self) -> &'static str {
        "PinbarReversal"
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let c = &ctx.base;
        let range = c.high - c.low;
        if range <= 0.0 {
            return None;
        }
        let body = (c.close - c.open).abs().max(range * 0.01);
        let upper_wick = c.high - c.close.max(c.open);
        let lower_wick = c.close.min(c.open) - c.low;

        // Long lower wick + close in the top third: buyers rejected the low.
        if lower_wick / body >= self.min_wick_ratio && c.close > c.low + range * 2.0 / 3.0 {
            let score = (lower_wick / range + 0.3).clamp(0.5, 1.0);
            return Some(vec![RawSignal::new(Side::Long, score, "1m")]);
        }
        if upper_wick / body >= self.min_wick_ratio && c.close < c.high - range * 2.0 / 3.0 {
            let score = (upper_wick / range + 0.3).clamp(0.5, 1.0);
            return Some(vec![RawSignal::new(Side::Short, score, "1m")]);
        }
        None
    }
}

/// Volume spike: 3x the 20-bar average, siding with the candle body.
pub struct VolumeSpike {
    period: usize,
    spike_mult: f64,
    volumes: VecDeque<f64>,
}

impl VolumeSpike {
    pub fn new() -> Self {
        Self {
            period: 20,
            spike_mult: 3.0,
            volumes: VecDeque::with_capacity(32),
        }
    }
}

impl Sensor for VolumeSpike {
    fn name(&self) -> &'static str {
        "VolumeSpike"
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        let c = &ctx.base;
        let avg = {
            let series: Vec<f64> = self.volumes.iter().copied().collect();
            sma(&series, self.period)
        };
        push_bounded(&mut self.volumes, c.volume, self.period * 2);

        let avg = avg?;
        if avg <= 0.0 || c.volume < avg * self.spike_mult || c.close == c.open {
            return None;
        }

        let side = if c.close > c.open { Side::Long } else { Side::Short };
        let score = (c.volume / (avg * self.spike_mult) * 0.6).clamp(0.6, 1.0);
        Some(vec![RawSignal::new(side, score, "1m")])
    }
}

/// Momentum burst: rate-of-change over 5 bars past a threshold with
/// expanding volume.
pub struct MomentumBurst {
    lookback: usize,
    roc_threshold: f64,
    closes: VecDeque<f64>,
    volumes: VecDeque<f64>,
}

impl MomentumBurst {
    pub fn new() -> Self {
        Self {
            lookback: 5,
            roc_threshold: 0.004,
            closes: VecDeque::with_capacity(16),
            volumes: VecDeque::with_capacity(16),
        }
    }
}

impl Sensor for MomentumBurst {
    fn name(&self) -> &'static str {
        "MomentumBurst"
    }

    fn calculate(&mut self, ctx: &MtfContext) -> Option<Vec<RawSignal>> {
        push_bounded(&mut self.closes, ctx.base.close, self.lookback + 5);
        push_bounded(&mut self.volumes, ctx.base.volume, self.lookback + 5);
        if self.closes.len() <= self.lookback {
            return None;
        }

        let old = self.closes[self.closes.len() - 1 - self.lookback];
        if old <= 0.0 {
            return None;
        }
        let roc = (ctx.base.close - old) / old;
        if roc.abs() < self.roc_threshold {
            return None;
        }

        // Expanding participation: latest volume above the window mean.
        let vol_mean = self.volumes.iter().sum::<f64>() / self.volumes.len() as f64;
        if ctx.base.volume <= vol_mean {
            return None;
        }

        let side = if roc > 0.0 { Side::Long } else { Side::Short };
        let score = (roc.abs() / self.roc_threshold * 0.5).clamp(0.5, 1.0);
        Some(vec![RawSignal::new(side, score, "1m")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::testutil::{context_from_series, context_of, make_candle};

    #[test]
    fn ema_crossover_fires_on_cross_only() {
        let mut sensor = EmaCrossover::new();
        let mut fired = Vec::new();

        // Descend, then reverse hard: exactly one LONG cross expected.
        for i in 0..40 {
            let price = 100.0 - i as f64 * 0.2;
            if let Some(signals) = sensor.calculate(&context_from_series("BTCUSDT", i, price, 1.0)) {
                fired.extend(signals);
            }
        }
        for i in 40..80 {
            let price = 92.0 + (i - 40) as f64 * 0.5;
            if let Some(signals) = sensor.calculate(&context_from_series("BTCUSDT", i, price, 1.0)) {
                fired.extend(signals);
            }
        }

        let longs: Vec<_> = fired.iter().filter(|s| s.side == Side::Long).collect();
        assert_eq!(longs.len(), 1, "exactly one bullish cross expected");
    }

    #[test]
    fn rsi_reversion_longs_oversold() {
        let mut sensor = RsiReversion::new();
        let mut out = None;
        for i in 0..30 {
            out = sensor.calculate(&context_from_series("BTCUSDT", i, 100.0 - i as f64, 1.0));
        }
        let signals = out.expect("monotonic fall should be oversold");
        assert_eq!(signals[0].side, Side::Long);
        assert!(signals[0].score >= 0.5);
    }

    #[test]
    fn pinbar_long_on_rejected_low() {
        let mut sensor = PinbarReversal::new();
        // Open 100, low 95, close 99.8: long lower wick, close near high.
        let candle = make_candle(0, 100.0, 100.2, 95.0, 99.9, 10.0);
        let signals = sensor.calculate(&context_of(candle, 1)).expect("pin bar should fire");
        assert_eq!(signals[0].side, Side::Long);
    }

    #[test]
    fn volume_spike_needs_history_and_multiple() {
        let mut sensor = VolumeSpike::new();
        for i in 0..25 {
            assert!(sensor
                .calculate(&context_from_series("BTCUSDT", i, 100.0, 10.0))
                .is_none());
        }
        // 3x average with a bullish body.
        let candle = make_candle(25 * 60, 100.0, 101.0, 100.0, 101.0, 40.0);
        let signals = sensor.calculate(&context_of(candle, 26)).expect("spike should fire");
        assert_eq!(signals[0].side, Side::Long);
    }

    #[test]
    fn momentum_burst_detects_fast_move() {
        let mut sensor = MomentumBurst::new();
        for i in 0..6 {
            sensor.calculate(&context_from_series("BTCUSDT", i, 100.0, 10.0));
        }
        let candle = make_candle(7 * 60, 100.4, 101.0, 100.3, 101.0, 20.0);
        let signals = sensor.calculate(&context_of(candle, 8)).expect("burst should fire");
        assert_eq!(signals[0].side, Side::Long);
    }
}
