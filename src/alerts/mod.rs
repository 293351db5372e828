// Alerts - formatting, routing and the outbound sink

pub mod format;
pub mod router;
pub mod sink;

pub use router::{AlertRequest, AlertRouter, RouterStats};
pub use sink::{AlertSink, ChannelHandle, SinkError, TelegramSink};
