// =============================================================================
// Sensor Pool — actor-model worker threads
// =============================================================================
//
// CPU-bound sensor arithmetic runs on W dedicated worker threads so it can
// never stall the async main loop. Sensor constructors are distributed
// round-robin; each worker lazily instantiates a fresh sensor set the first
// time a symbol appears, which keeps per-symbol state fully isolated.
//
// Transport is typed mpsc messages in both directions. Workers stop on a
// `Stop` sentinel and are individually respawnable: a send failure replaces
// the dead worker with a fresh one built from the same constructor slice.
//
// The async consumer polls the shared output channel at 10ms and enforces the
// per-(symbol, sensor) cooldown before signals reach the aggregator.
// =============================================================================

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, RawSignal, SignalEvent};
use crate::market_data::{BarAggregator, MtfContext};
use crate::runtime_config::RuntimeConfig;
use crate::sensors::{SensorCtor, SensorFamily};

enum WorkerInput {
    Candle(Arc<MtfContext>),
    Stop,
}

struct WorkerOutput {
    sensor_id: &'static str,
    family: SensorFamily,
    symbol: String,
    bar_index: u64,
    signals: Vec<RawSignal>,
}

struct WorkerHandle {
    id: usize,
    tx: mpsc::Sender<WorkerInput>,
    thread: Option<thread::JoinHandle<()>>,
    ctors: Vec<(&'static str, SensorCtor)>,
}

pub struct SensorPool {
    workers: Vec<WorkerHandle>,
    output_rx: mpsc::Receiver<WorkerOutput>,
    output_tx: mpsc::Sender<WorkerOutput>,
    aggregators: HashMap<String, BarAggregator>,
    cooldown_bars: u64,
    last_fired: HashMap<(String, &'static str), u64>,
    bus: EventBus,
}

impl SensorPool {
    /// Worker count: three quarters of the cores, at least two.
    pub fn worker_count() -> usize {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        ((cores * 3) / 4).max(2)
    }

    pub fn new(config: &RuntimeConfig, bus: EventBus) -> Self {
        let enabled = crate::sensors::enabled_registry(config);
        let worker_count = Self::worker_count().min(enabled.len().max(1));

        // Round-robin distribution of sensor constructors.
        let mut chunks: Vec<Vec<(&'static str, SensorCtor)>> = vec![Vec::new(); worker_count];
        for (i, ctor) in enabled.iter().enumerate() {
            chunks[i % worker_count].push(*ctor);
        }

        let (output_tx, output_rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(worker_count);
        for (id, ctors) in chunks.into_iter().enumerate() {
            if ctors.is_empty() {
                continue;
            }
            workers.push(spawn_worker(id, ctors, output_tx.clone()));
        }

        info!(
            workers = workers.len(),
            sensors = enabled.len(),
            "sensor pool spawned"
        );

        Self {
            workers,
            output_rx,
            output_tx,
            aggregators: HashMap::new(),
            cooldown_bars: config.cooldown_bars,
            last_fired: HashMap::new(),
            bus,
        }
    }

    /// Main pool loop: fan candles out to workers, drain worker signals back
    /// onto the bus. Runs until shutdown flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut candles = self.bus.candles.subscribe();
        let mut poll = tokio::time::interval(Duration::from_millis(10));
        info!("sensor pool consumer started");

        loop {
            tokio::select! {
                candle = candles.recv() => match candle {
                    Ok(candle) => self.dispatch_candle(candle),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "sensor pool lagged behind candle stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = poll.tick() => self.drain_outputs(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop();
        info!("sensor pool stopped");
    }

    fn dispatch_candle(&mut self, candle: Arc<crate::market_data::FootprintCandle>) {
        let symbol = candle.symbol.clone();
        let aggregator = self.aggregators.entry(symbol).or_default();
        let ctx = Arc::new(aggregator.on_candle(candle));

        for i in 0..self.workers.len() {
            if self.workers[i].tx.send(WorkerInput::Candle(ctx.clone())).is_err() {
                // Dead worker: replace it with a fresh instance of the same
                // sensor slice and retry once.
                error!(worker = self.workers[i].id, "sensor worker died, respawning");
                let id = self.workers[i].id;
                let ctors = self.workers[i].ctors.clone();
                self.workers[i] = spawn_worker(id, ctors, self.output_tx.clone());
                let _ = self.workers[i].tx.send(WorkerInput::Candle(ctx.clone()));
            }
        }
    }

    fn drain_outputs(&mut self) {
        while let Ok(out) = self.output_rx.try_recv() {
            let key = (out.symbol.clone(), out.sensor_id);
            if let Some(last) = self.last_fired.get(&key) {
                if out.bar_index.saturating_sub(*last) < self.cooldown_bars {
                    debug!(
                        symbol = %out.symbol,
                        sensor = out.sensor_id,
                        "signal suppressed by cooldown"
                    );
                    continue;
                }
            }
            self.last_fired.insert(key, out.bar_index);

            for signal in out.signals {
                info!(
                    symbol = %out.symbol,
                    sensor = out.sensor_id,
                    side = %signal.side,
                    tf = signal.timeframe,
                    "signal detected"
                );
                let _ = self.bus.signals.send(SignalEvent {
                    symbol: out.symbol.clone(),
                    sensor_id: out.sensor_id,
                    family: out.family,
                    signal,
                });
            }
        }
    }

    /// Send STOP sentinels and join all workers.
    pub fn stop(&mut self) {
        info!("stopping sensor workers");
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerInput::Stop);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    error!(worker = worker.id, "sensor worker panicked during shutdown");
                }
            }
        }
    }
}

fn spawn_worker(
    id: usize,
    ctors: Vec<(&'static str, SensorCtor)>,
    output_tx: mpsc::Sender<WorkerOutput>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel::<WorkerInput>();
    let thread_ctors = ctors.clone();

    let thread = thread::Builder::new()
        .name(format!("sensor-worker-{id}"))
        .spawn(move || worker_main(id, thread_ctors, rx, output_tx))
        .expect("failed to spawn sensor worker thread");

    WorkerHandle {
        id,
        tx,
        thread: Some(thread),
        ctors,
    }
}

fn worker_main(
    id: usize,
    ctors: Vec<(&'static str, SensorCtor)>,
    rx: mpsc::Receiver<WorkerInput>,
    output_tx: mpsc::Sender<WorkerOutput>,
) {
    debug!(worker = id, sensors = ctors.len(), "sensor worker started");

    // symbol -> instantiated sensor set. Lazy creation isolates symbol state.
    let mut sensors: HashMap<String, Vec<(&'static str, SensorFamily, Box<dyn crate::sensors::Sensor>)>> =
        HashMap::new();

    while let Ok(input) = rx.recv() {
        let ctx = match input {
            WorkerInput::Candle(ctx) => ctx,
            WorkerInput::Stop => break,
        };

        let set = sensors.entry(ctx.symbol.clone()).or_insert_with(|| {
            debug!(worker = id, symbol = %ctx.symbol, "instantiating sensors for symbol");
            ctors
                .iter()
                .map(|(name, ctor)| {
                    let sensor = ctor();
                    (*name, sensor.family(), sensor)
                })
                .collect()
        });

        for (name, family, sensor) in set.iter_mut() {
            if let Some(signals) = sensor.calculate(&ctx) {
                if output_tx
                    .send(WorkerOutput {
                        sensor_id: name,
                        family: *family,
                        symbol: ctx.symbol.clone(),
                        bar_index: ctx.bar_index,
                        signals,
                    })
                    .is_err()
                {
                    // Consumer gone: the session is shutting down.
                    return;
                }
            }
        }
    }

    debug!(worker = id, "sensor worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Tick, TickSide};

    fn pool_config() -> RuntimeConfig {
        RuntimeConfig {
            cooldown_bars: 5,
            ..Default::default()
        }
    }

    #[test]
    fn worker_count_floor() {
        assert!(SensorPool::worker_count() >= 2);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_signals() {
        let bus = EventBus::new();
        let mut pool = SensorPool::new(&pool_config(), bus.clone());
        let mut rx = bus.signals.subscribe();

        // Inject two outputs for the same (symbol, sensor) one bar apart.
        for bar in [10u64, 11u64] {
            pool.output_tx
                .send(WorkerOutput {
                    sensor_id: "EmaCrossover",
                    family: SensorFamily::Technical,
                    symbol: "BTCUSDT".into(),
                    bar_index: bar,
                    signals: vec![RawSignal::new(crate::types::Side::Long, 1.0, "1m")],
                })
                .unwrap();
        }
        pool.drain_outputs();

        assert!(rx.try_recv().is_ok(), "first signal passes");
        assert!(rx.try_recv().is_err(), "second signal inside cooldown is dropped");

        // Five bars later the sensor may fire again.
        pool.output_tx
            .send(WorkerOutput {
                sensor_id: "EmaCrossover",
                family: SensorFamily::Technical,
                symbol: "BTCUSDT".into(),
                bar_index: 15,
                signals: vec![RawSignal::new(crate::types::Side::Long, 1.0, "1m")],
            })
            .unwrap();
        pool.drain_outputs();
        assert!(rx.try_recv().is_ok(), "signal after cooldown passes");

        pool.stop();
    }

    #[tokio::test]
    async fn cooldowns_are_per_symbol() {
        let bus = EventBus::new();
        let mut pool = SensorPool::new(&pool_config(), bus.clone());
        let mut rx = bus.signals.subscribe();

        for symbol in ["BTCUSDT", "ETHUSDT"] {
            pool.output_tx
                .send(WorkerOutput {
                    sensor_id: "RsiReversion",
                    family: SensorFamily::Technical,
                    symbol: symbol.into(),
                    bar_index: 3,
                    signals: vec![RawSignal::new(crate::types::Side::Short, 0.8, "1m")],
                })
                .unwrap();
        }
        pool.drain_outputs();

        assert_eq!(rx.try_recv().unwrap().symbol, "BTCUSDT");
        assert_eq!(rx.try_recv().unwrap().symbol, "ETHUSDT");
        pool.stop();
    }

    #[tokio::test]
    async fn end_to_end_candle_to_signal() {
        let bus = EventBus::new();
        let mut pool = SensorPool::new(&pool_config(), bus.clone());
        let mut rx = bus.signals.subscribe();

        // Feed a steep monotonic fall: RsiReversion must eventually go LONG.
        for i in 0..40u64 {
            let candle = Arc::new({
                let mut c = crate::sensors::testutil::make_candle(
                    i * 60,
                    100.0 - i as f64,
                    100.5 - i as f64,
                    99.0 - i as f64,
                    100.0 - i as f64,
                    10.0,
                );
                c.symbol = "BTCUSDT".into();
                c
            });
            pool.dispatch_candle(candle);
        }

        // Give workers time to grind, then drain.
        let mut got_long = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pool.drain_outputs();
            while let Ok(ev) = rx.try_recv() {
                if ev.sensor_id == "RsiReversion" && ev.signal.side == crate::types::Side::Long {
                    got_long = true;
                }
            }
            if got_long {
                break;
            }
        }
        assert!(got_long, "falling series should produce an oversold LONG");
        pool.stop();
    }

    #[test]
    fn tick_type_is_plain_data() {
        // Worker transport carries plain data records only.
        fn assert_send<T: Send + 'static>() {}
        assert_send::<Tick>();
        assert_send::<Arc<MtfContext>>();
        let _ = TickSide::Unknown;
    }
}
