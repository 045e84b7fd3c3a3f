pub mod aggregator;
pub mod player;
pub mod sensor_tracker;

pub use aggregator::SignalAggregator;
pub use player::AdaptivePlayer;
pub use sensor_tracker::SensorTracker;
