// Core Module - foundational types, configuration, logging

pub mod config;
pub mod logger;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{AlertConfig, ConfigError, ExchangeConfig, Settings, SinkConfig, StoreConfig, Thresholds};
pub use logger::setup_logging;
pub use types::*;
