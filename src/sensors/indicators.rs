// =============================================================================
// Indicator arithmetic shared by the sensor implementations
// =============================================================================

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values, then folded over the remainder.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    for price in &values[period..] {
        ema = (price - ema) * multiplier + ema;
    }
    Some(ema)
}

/// Wilder-smoothed RSI over closes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in closes[..period + 1].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Population standard deviation of the last `period` values.
pub fn stddev(values: &[f64], period: usize) -> Option<f64> {
    let mean = sma(values, period)?;
    let window = &values[values.len() - period..];
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    Some(variance.sqrt())
}

/// Rescaled-range Hurst exponent estimate over the whole slice.
///
/// Splits the series into halves repeatedly and regresses log(R/S) against
/// log(n). Values > 0.5 suggest persistence, < 0.5 mean reversion.
pub fn hurst_exponent(values: &[f64]) -> Option<f64> {
    if values.len() < 32 {
        return None;
    }

    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut n = values.len();
    while n >= 8 {
        let chunks = values.len() / n;
        let mut rs_sum = 0.0;
        let mut rs_count = 0;
        for chunk in values.chunks(n).take(chunks) {
            if let Some(rs) = rescaled_range(chunk) {
                rs_sum += rs;
                rs_count += 1;
            }
        }
        if rs_count > 0 {
            points.push(((n as f64).ln(), (rs_sum / rs_count as f64).ln()));
        }
        n /= 2;
    }

    if points.len() < 2 {
        return None;
    }

    // Least-squares slope of log(R/S) on log(n).
    let count = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let denom = count * sum_xx - sum_x * sum_x;
    if denom.abs() < 1e-12 {
        return None;
    }
    Some((count * sum_xy - sum_x * sum_y) / denom)
}

fn rescaled_range(chunk: &[f64]) -> Option<f64> {
    if chunk.len() < 2 {
        return None;
    }
    let mean = chunk.iter().sum::<f64>() / chunk.len() as f64;
    let deviations: Vec<f64> = chunk.iter().map(|v| v - mean).collect();

    let mut cumulative = 0.0;
    let mut min_dev = f64::MAX;
    let mut max_dev = f64::MIN;
    for d in &deviations {
        cumulative += d;
        min_dev = min_dev.min(cumulative);
        max_dev = max_dev.max(cumulative);
    }

    let range = max_dev - min_dev;
    let std = (deviations.iter().map(|d| d * d).sum::<f64>() / chunk.len() as f64).sqrt();
    if std < 1e-12 {
        return None;
    }
    Some(range / std)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_of_constant_series() {
        let values = vec![5.0; 10];
        assert!((sma(&values, 5).unwrap() - 5.0).abs() < 1e-9);
        assert!(sma(&values, 11).is_none());
    }

    #[test]
    fn ema_tracks_recent_values_more() {
        let mut values = vec![10.0; 20];
        values.extend(vec![20.0; 5]);
        let e = ema(&values, 10).unwrap();
        let s = sma(&values, 25).unwrap();
        assert!(e > s, "EMA should weight the recent jump more than the SMA");
    }

    #[test]
    fn rsi_extremes() {
        // Monotonic rise: RSI ~ 100.
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert!(rsi(&rising, 14).unwrap() > 90.0);

        // Monotonic fall: RSI ~ 0.
        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&falling, 14).unwrap() < 10.0);
    }

    #[test]
    fn stddev_zero_for_constant() {
        let values = vec![3.0; 25];
        assert!(stddev(&values, 20).unwrap() < 1e-12);
    }

    #[test]
    fn hurst_high_for_trending_series() {
        let trending: Vec<f64> = (0..128).map(|i| i as f64).collect();
        let h = hurst_exponent(&trending).unwrap();
        assert!(h > 0.7, "pure trend should look persistent, got {h}");
    }

    #[test]
    fn hurst_low_for_alternating_series() {
        let alternating: Vec<f64> = (0..128).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let h = hurst_exponent(&alternating).unwrap();
        assert!(h < 0.5, "alternating series should look anti-persistent, got {h}");
    }
}
