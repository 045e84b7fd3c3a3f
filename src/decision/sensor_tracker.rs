// =============================================================================
// Sensor Tracker — rolling performance memory per sensor
// =============================================================================
//
// Tracks every sensor's trade outcomes and distills them into a composite
// quality score (the weight used in consensus) and a half-Kelly bet fraction.
// State is persisted as JSON via atomic writes and survives restarts;
// save -> load -> save is a fixed point.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::types::epoch_now;

/// Recent-performance windows.
const SHORT_WINDOW: usize = 50;
const MEDIUM_WINDOW: usize = 200;

/// Minimum trades before the stats are trusted over the neutral prior.
const MIN_TRADES_FOR_SCORING: u64 = 10;

/// Updates between automatic persistence flushes.
const SAVE_EVERY_UPDATES: u32 = 5;

/// Performance statistics for a single sensor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SensorStats {
    pub sensor_id: String,
    pub total_trades: u64,
    pub total_wins: u64,
    pub total_losses: u64,
    pub gross_profit: f64,
    pub gross_loss: f64,

    /// 1 = win, 0 = loss; bounded to the medium window.
    pub recent_trades: VecDeque<u8>,
    pub recent_pnls: VecDeque<f64>,

    pub win_rate_short: f64,
    pub win_rate_medium: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub profit_factor: f64,

    /// Positive while winning, negative while losing.
    pub current_streak: i64,
    /// Epoch seconds of the last winning trade (0 = never).
    pub last_win_time: f64,
    pub last_updated: f64,
}

impl SensorStats {
    fn new(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            ..Default::default()
        }
    }

    fn recalculate(&mut self) {
        if self.total_trades == 0 {
            return;
        }

        if self.recent_trades.len() >= SHORT_WINDOW {
            let wins: u64 = self
                .recent_trades
                .iter()
                .rev()
                .take(SHORT_WINDOW)
                .map(|w| *w as u64)
                .sum();
            self.win_rate_short = wins as f64 / SHORT_WINDOW as f64;
        } else {
            self.win_rate_short = self.total_wins as f64 / self.total_trades as f64;
        }

        self.win_rate_medium = if self.recent_trades.is_empty() {
            0.0
        } else {
            self.recent_trades.iter().map(|w| *w as u64).sum::<u64>() as f64 / self.recent_trades.len() as f64
        };

        if self.total_wins > 0 {
            self.avg_win = self.gross_profit / self.total_wins as f64;
        }
        if self.total_losses > 0 {
            self.avg_loss = self.gross_loss / self.total_losses as f64;
        }

        let loss_rate = self.total_losses as f64 / self.total_trades as f64;
        self.expectancy = self.win_rate_medium * self.avg_win - loss_rate * self.avg_loss;

        self.profit_factor = if self.gross_loss > 0.0 {
            self.gross_profit / self.gross_loss
        } else if self.gross_profit > 0.0 {
            self.gross_profit
        } else {
            0.0
        };
    }
}

/// Tracks performance metrics for every sensor and persists them to disk.
pub struct SensorTracker {
    sensors: RwLock<BTreeMap<String, SensorStats>>,
    path: PathBuf,
    updates_since_save: AtomicU32,
}

impl SensorTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sensors = match Self::load_from(&path) {
            Ok(map) => {
                info!(path = %path.display(), sensors = map.len(), "sensor stats loaded");
                map
            }
            Err(e) => {
                if path.exists() {
                    error!(path = %path.display(), error = %e, "failed to load sensor stats, starting fresh");
                } else {
                    info!(path = %path.display(), "no existing sensor stats, starting fresh");
                }
                BTreeMap::new()
            }
        };

        Self {
            sensors: RwLock::new(sensors),
            path,
            updates_since_save: AtomicU32::new(0),
        }
    }

    fn load_from(path: &PathBuf) -> Result<BTreeMap<String, SensorStats>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sensor stats from {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse sensor stats JSON")
    }

    /// Update a sensor's statistics after a trade closes. Flushes to disk on
    /// every Nth update.
    pub fn update(&self, sensor_id: &str, pnl: f64, won: bool) {
        {
            let mut sensors = self.sensors.write();
            let stats = sensors
                .entry(sensor_id.to_string())
                .or_insert_with(|| SensorStats::new(sensor_id));

            stats.total_trades += 1;
            if won {
                stats.total_wins += 1;
                stats.gross_profit += pnl;
                stats.current_streak = if stats.current_streak > 0 { stats.current_streak + 1 } else { 1 };
                stats.last_win_time = epoch_now();
            } else {
                stats.total_losses += 1;
                stats.gross_loss += pnl.abs();
                stats.current_streak = if stats.current_streak < 0 { stats.current_streak - 1 } else { -1 };
            }

            stats.recent_trades.push_back(if won { 1 } else { 0 });
            stats.recent_pnls.push_back(pnl);
            while stats.recent_trades.len() > MEDIUM_WINDOW {
                stats.recent_trades.pop_front();
                stats.recent_pnls.pop_front();
            }

            stats.recalculate();
            stats.last_updated = epoch_now();

            debug!(
                sensor = sensor_id,
                trades = stats.total_trades,
                wr = format!("{:.2}", stats.win_rate_short),
                expectancy = format!("{:.4}", stats.expectancy),
                "sensor stats updated"
            );
        }

        if self.updates_since_save.fetch_add(1, Ordering::Relaxed) + 1 >= SAVE_EVERY_UPDATES {
            self.updates_since_save.store(0, Ordering::Relaxed);
            if let Err(e) = self.save() {
                error!(error = %e, "failed to persist sensor stats");
            }
        }
    }

    /// Composite quality score in [0, 1]; 0.5 is neutral.
    ///
    /// Weights: expectancy 40%, profit factor 25%, streak 20%, short win rate
    /// 10%, time decay 5%. Sensors with fewer than 10 trades score neutral.
    pub fn score(&self, sensor_id: &str) -> f64 {
        let sensors = self.sensors.read();
        let stats = match sensors.get(sensor_id) {
            Some(s) if s.total_trades >= MIN_TRADES_FOR_SCORING => s,
            _ => return 0.5,
        };

        let expectancy_norm = (0.5 + stats.expectancy * 25.0).clamp(0.0, 1.0);

        let pf_norm = if stats.profit_factor >= 1.0 {
            0.5 + ((stats.profit_factor - 1.0) / 2.0).min(0.5)
        } else {
            stats.profit_factor * 0.5
        };

        let streak_norm = if stats.current_streak > 0 {
            0.5 + (stats.current_streak as f64 / 5.0).min(0.5)
        } else if stats.current_streak < 0 {
            0.5 - (stats.current_streak.unsigned_abs() as f64 / 3.0).min(0.5)
        } else {
            0.5
        };

        let time_decay = if stats.last_win_time > 0.0 {
            let days = ((epoch_now() - stats.last_win_time) / 86_400.0).min(30.0);
            0.95f64.powf(days)
        } else {
            0.5
        };

        let score = expectancy_norm * 0.40
            + pf_norm * 0.25
            + streak_norm * 0.20
            + stats.win_rate_short * 0.10
            + time_decay * 0.05;

        score.clamp(0.0, 1.0)
    }

    /// Half-Kelly bet fraction, clamped to [0.01, max_fraction].
    pub fn kelly_fraction(&self, sensor_id: &str, max_fraction: f64) -> f64 {
        let sensors = self.sensors.read();
        let stats = match sensors.get(sensor_id) {
            Some(s) if s.total_trades >= MIN_TRADES_FOR_SCORING => s,
            _ => return 0.01,
        };

        if stats.avg_loss <= 0.0 {
            // No losses yet: refuse to extrapolate confidence.
            return 0.01;
        }

        let win_rate = stats.total_wins as f64 / stats.total_trades as f64;
        let ratio = stats.avg_win / stats.avg_loss;
        if ratio <= 0.0 {
            return 0.01;
        }

        let kelly = win_rate - (1.0 - win_rate) / ratio;
        (kelly * 0.5).clamp(0.01, max_fraction)
    }

    pub fn stats_of(&self, sensor_id: &str) -> Option<SensorStats> {
        self.sensors.read().get(sensor_id).cloned()
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.read().len()
    }

    /// Persist all stats atomically.
    pub fn save(&self) -> Result<()> {
        let snapshot = self.sensors.read().clone();
        crate::persist::atomic_write_json(&self.path, &snapshot)?;
        debug!(path = %self.path.display(), sensors = snapshot.len(), "sensor stats saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vega-tracker-{}-{}.json", tag, std::process::id()))
    }

    fn tracker(tag: &str) -> SensorTracker {
        let path = temp_path(tag);
        let _ = std::fs::remove_file(&path);
        SensorTracker::new(path)
    }

    #[test]
    fn neutral_score_below_minimum_trades() {
        let t = tracker("neutral");
        assert!((t.score("EmaCrossover") - 0.5).abs() < f64::EPSILON);
        for _ in 0..5 {
            t.update("EmaCrossover", 1.0, true);
        }
        assert!((t.score("EmaCrossover") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn winning_sensor_scores_above_neutral() {
        let t = tracker("winner");
        for _ in 0..20 {
            t.update("Winner", 2.0, true);
        }
        for _ in 0..5 {
            t.update("Winner", -1.0, false);
        }
        assert!(t.score("Winner") > 0.6, "score = {}", t.score("Winner"));
    }

    #[test]
    fn losing_sensor_scores_below_neutral() {
        let t = tracker("loser");
        for _ in 0..5 {
            t.update("Loser", 1.0, true);
        }
        for _ in 0..20 {
            t.update("Loser", -2.0, false);
        }
        assert!(t.score("Loser") < 0.4, "score = {}", t.score("Loser"));
    }

    #[test]
    fn streak_tracks_sign_and_extension() {
        let t = tracker("streak");
        t.update("S", 1.0, true);
        t.update("S", 1.0, true);
        assert_eq!(t.stats_of("S").unwrap().current_streak, 2);
        t.update("S", -1.0, false);
        assert_eq!(t.stats_of("S").unwrap().current_streak, -1);
        t.update("S", -1.0, false);
        assert_eq!(t.stats_of("S").unwrap().current_streak, -2);
        t.update("S", 1.0, true);
        assert_eq!(t.stats_of("S").unwrap().current_streak, 1);
    }

    #[test]
    fn profit_factor_with_zero_losses_is_gross_profit() {
        let t = tracker("pf");
        for _ in 0..3 {
            t.update("P", 2.0, true);
        }
        let stats = t.stats_of("P").unwrap();
        assert!((stats.profit_factor - 6.0).abs() < 1e-9);
    }

    #[test]
    fn recent_windows_are_bounded() {
        let t = tracker("bounded");
        for i in 0..250 {
            t.update("B", 1.0, i % 2 == 0);
        }
        let stats = t.stats_of("B").unwrap();
        assert_eq!(stats.recent_trades.len(), MEDIUM_WINDOW);
        assert_eq!(stats.recent_pnls.len(), MEDIUM_WINDOW);
    }

    #[test]
    fn kelly_is_half_kelly_clamped() {
        let t = tracker("kelly");
        // 15 wins of +2, 5 losses of -1: WR = 0.75, R = 2.
        for _ in 0..15 {
            t.update("K", 2.0, true);
        }
        for _ in 0..5 {
            t.update("K", -1.0, false);
        }
        // kelly = 0.75 - 0.25/2 = 0.625, half = 0.3125, clamped to max.
        assert!((t.kelly_fraction("K", 0.10) - 0.10).abs() < 1e-9);
        assert!((t.kelly_fraction("K", 0.50) - 0.3125).abs() < 1e-9);
        // Unknown sensor bets the minimum.
        assert!((t.kelly_fraction("Unknown", 0.10) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn save_load_save_is_fixed_point() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let t = SensorTracker::new(path.clone());
        for i in 0..12 {
            t.update("RsiReversion", if i % 3 == 0 { -1.0 } else { 1.5 }, i % 3 != 0);
        }
        t.save().unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        let reloaded = SensorTracker::new(path.clone());
        assert_eq!(reloaded.sensor_count(), 1);
        reloaded.save().unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second, "save -> load -> save must be a fixed point");
        let _ = std::fs::remove_file(&path);
    }
}
