pub mod bar_aggregator;
pub mod candle_maker;
pub mod stream_manager;

pub use bar_aggregator::{BarAggregator, MtfContext, Timeframe};
pub use candle_maker::{CandleMaker, FootprintCandle};
pub use stream_manager::StreamManager;
