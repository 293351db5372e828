// Layer 3 - detectors and aggregators over the synchronized state

pub mod digest;
pub mod liquidation_filter;
pub mod trade_aggregator;
pub mod wall_tracker;

pub use digest::DigestScheduler;
pub use liquidation_filter::{LiquidationFilter, LiquidationStats};
pub use trade_aggregator::{MinuteBucket, TradeAggregator, TradeAggregatorStats};
pub use wall_tracker::{WallKey, WallTracker, WallTrackerStats};
