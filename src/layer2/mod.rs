// Layer 2 - synchronized book state and snapshot anchoring

pub mod orderbook;
pub mod parser;
pub mod snapshots;

pub use orderbook::{
    ApplyOutcome, BookMetrics, BookStats, BookStatus, MarketBook, RecoveryState, WallView,
};
pub use parser::{
    parse_depth_snapshot, parse_depth_update, parse_liquidation, parse_trade, route_stream,
    DepthSnapshot, DepthUpdate, ParseError, StreamEnvelope, StreamRoute,
};
pub use snapshots::{run_maintenance_loop, SnapshotCoordinator};
