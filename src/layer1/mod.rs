// Layer 1 - transport: exchange WebSocket streams and REST anchors

pub mod rest_client;
pub mod ws_manager;

pub use rest_client::{DepthRestClient, RestError};
pub use ws_manager::{ConnStatus, StreamConsumer, WsManager};
