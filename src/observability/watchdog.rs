// =============================================================================
// Watchdog — heartbeat registry for long-lived tasks
// =============================================================================
//
// Tasks register with a name and a timeout and heartbeat on every iteration.
// A heartbeat older than the task's timeout marks the system as silently
// stalled; the monitor loop escalates to a connector hard reset (rate-limited
// to one reset per cooldown window).
//
// `ShutdownGuard` is the last line of defence during the emergency sweep: a
// plain thread that hard-exits the process if cleanup stops making progress.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::binance::BinanceConnector;

struct TaskHealth {
    timeout: Duration,
    last_beat: Instant,
}

pub struct Watchdog {
    tasks: RwLock<HashMap<String, TaskHealth>>,
    last_reset: RwLock<Option<Instant>>,
}

/// Minimum gap between two watchdog-triggered hard resets.
const RESET_COOLDOWN: Duration = Duration::from_secs(120);

impl Watchdog {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            last_reset: RwLock::new(None),
        }
    }

    pub fn register(&self, name: &str, timeout: Duration) {
        self.tasks.write().insert(
            name.to_string(),
            TaskHealth {
                timeout,
                last_beat: Instant::now(),
            },
        );
    }

    pub fn heartbeat(&self, name: &str) {
        if let Some(task) = self.tasks.write().get_mut(name) {
            task.last_beat = Instant::now();
        }
    }

    pub fn unregister(&self, name: &str) {
        self.tasks.write().remove(name);
    }

    /// Names of tasks whose heartbeat age exceeds their timeout.
    pub fn stalled_tasks(&self) -> Vec<String> {
        self.tasks
            .read()
            .iter()
            .filter(|(_, health)| health.last_beat.elapsed() > health.timeout)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Monitor loop: check heartbeats every 5s; a stall escalates to a
    /// connector hard reset, at most once per cooldown window.
    pub async fn run(self: Arc<Self>, connector: Arc<BinanceConnector>, mut shutdown: watch::Receiver<bool>) {
        info!("watchdog monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("watchdog monitor stopping");
                        return;
                    }
                }
            }

            let stalled = self.stalled_tasks();
            if stalled.is_empty() {
                continue;
            }

            warn!(tasks = ?stalled, "heartbeat stall detected");

            let can_reset = {
                let last = self.last_reset.read();
                last.map(|t| t.elapsed() >= RESET_COOLDOWN).unwrap_or(true)
            };
            if !can_reset {
                continue;
            }
            *self.last_reset.write() = Some(Instant::now());

            error!(tasks = ?stalled, "silent stall, triggering connector hard reset");
            if let Err(e) = connector.hard_reset().await {
                error!(error = %e, "watchdog hard reset failed");
            } else {
                // Fresh start for every registered task.
                let mut tasks = self.tasks.write();
                for health in tasks.values_mut() {
                    health.last_beat = Instant::now();
                }
            }
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-based guard for the shutdown sweep: if no heartbeat arrives within
/// the timeout, the process hard-exits. This cannot rely on the async runtime
/// because the stall being guarded against may BE the runtime.
pub struct ShutdownGuard {
    last_beat_ms: Arc<AtomicU64>,
    disarmed: Arc<AtomicBool>,
}

impl ShutdownGuard {
    pub fn arm(timeout: Duration) -> Self {
        let last_beat_ms = Arc::new(AtomicU64::new(now_ms()));
        let disarmed = Arc::new(AtomicBool::new(false));

        let beat = last_beat_ms.clone();
        let off = disarmed.clone();
        std::thread::Builder::new()
            .name("shutdown-guard".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(1));
                if off.load(Ordering::SeqCst) {
                    return;
                }
                let age_ms = now_ms().saturating_sub(beat.load(Ordering::SeqCst));
                if age_ms > timeout.as_millis() as u64 {
                    eprintln!("shutdown sweep made no progress for {age_ms}ms, hard exit");
                    std::process::exit(1);
                }
            })
            .expect("failed to spawn shutdown guard");

        Self {
            last_beat_ms,
            disarmed,
        }
    }

    pub fn heartbeat(&self) {
        self.last_beat_ms.store(now_ms(), Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.disarmed.store(true, Ordering::SeqCst);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_keeps_task_fresh() {
        let wd = Watchdog::new();
        wd.register("probe", Duration::from_millis(50));
        assert!(wd.stalled_tasks().is_empty());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(wd.stalled_tasks(), vec!["probe".to_string()]);

        wd.heartbeat("probe");
        assert!(wd.stalled_tasks().is_empty());
    }

    #[test]
    fn unregister_removes_task() {
        let wd = Watchdog::new();
        wd.register("probe", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        wd.unregister("probe");
        assert!(wd.stalled_tasks().is_empty());
    }

    #[test]
    fn guard_survives_with_heartbeats_and_disarms() {
        // Short window, but keep beating: must not exit the process.
        let guard = ShutdownGuard::arm(Duration::from_millis(200));
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(50));
            guard.heartbeat();
        }
        guard.disarm();
    }
}
