// Configuration Management for wallwatch
// JSON config file + environment overrides for secrets; validated at startup

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::{AlertKind, Market};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Bot token for the messaging sink. Secret; env `SINK_TOKEN`.
    pub sink_token: String,
    /// Fallback chat for system messages and unresolved channels.
    pub admin_user: i64,
    /// Forum group that namespaces all alert channels.
    pub forum_group: i64,
    /// channel_key -> forum thread id. Resolved to handles at startup;
    /// unknown keys referenced by the router are fatal.
    pub topics: HashMap<String, i64>,
    pub parse_mode: String,
    /// Pause between consecutive sink sends within a flush.
    pub send_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sink_token: String::new(),
            admin_user: 0,
            forum_group: 0,
            topics: HashMap::new(),
            parse_mode: "HTML".to_string(),
            send_delay_ms: 500,
            call_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub futures_ws_url: String,
    pub spot_ws_url: String,
    pub futures_depth_url: String,
    pub spot_depth_url: String,
    /// Optional HTTP or SOCKS5 proxy for the exchange endpoints.
    pub proxy_url: Option<String>,

    pub rest_timeout_secs: u64,
    pub rest_attempts: u32,
    pub ws_reconnect_delay_secs: u64,
    pub ws_reconnect_max_delay_secs: u64,
    pub ws_silence_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            futures_ws_url: "wss://fstream.binance.com/stream?streams=btcusdt@depth@100ms/btcusdt@aggTrade/!forceOrder@arr".to_string(),
            spot_ws_url: "wss://stream.binance.com/stream?streams=btcusdt@depth@100ms/btcusdt@aggTrade".to_string(),
            futures_depth_url: "https://fapi.binance.com/fapi/v1/depth?symbol=BTCUSDT&limit=1000".to_string(),
            spot_depth_url: "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=1000".to_string(),
            proxy_url: None,
            rest_timeout_secs: 20,
            rest_attempts: 3,
            ws_reconnect_delay_secs: 5,
            ws_reconnect_max_delay_secs: 300,
            ws_silence_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    // Walls
    pub wall_threshold_usd: f64,
    pub wall_alert_usd: f64,
    pub wall_cancel_alert_usd: f64,
    pub confirmed_wall_threshold_usd: f64,
    pub confirmed_wall_max_distance_pct: f64,
    pub confirmed_wall_delay_sec: i64,
    pub spoof_window_secs: i64,
    pub spoof_warn_count: usize,

    // Trades
    pub large_trade_spot_usd: f64,
    pub large_trade_futures_usd: f64,
    pub mega_trade_usd: f64,

    // Liquidations
    pub liq_alert_usd: f64,
    pub mega_liq_alert_usd: f64,

    // Flow anomalies
    pub cvd_spike_usd: f64,
    pub imbalance_alert_threshold: f64,

    // Book maintenance
    pub prune_distance_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            wall_threshold_usd: 500_000.0,
            wall_alert_usd: 2_000_000.0,
            wall_cancel_alert_usd: 1_000_000.0,
            confirmed_wall_threshold_usd: 5_000_000.0,
            confirmed_wall_max_distance_pct: 2.0,
            confirmed_wall_delay_sec: 60,
            spoof_window_secs: 3600,
            spoof_warn_count: 2,
            large_trade_spot_usd: 100_000.0,
            large_trade_futures_usd: 500_000.0,
            mega_trade_usd: 2_000_000.0,
            liq_alert_usd: 1_000_000.0,
            mega_liq_alert_usd: 5_000_000.0,
            cvd_spike_usd: 5_000_000.0,
            imbalance_alert_threshold: 0.4,
            prune_distance_pct: 0.5,
        }
    }
}

impl Thresholds {
    pub fn large_trade_usd(&self, market: Market) -> f64 {
        match market {
            Market::Spot => self.large_trade_spot_usd,
            Market::Futures => self.large_trade_futures_usd,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Micro-batch flush deadline measured from the first queued request.
    pub batch_wait_ms: u64,
    /// Queue length beyond which a batch flushes without waiting.
    pub batch_threshold: usize,
    /// Per-(kind, topic) queue capacity; oldest dropped beyond this.
    pub queue_capacity: usize,

    // Per-kind cooldowns (seconds) keyed by fingerprint
    pub wall_new_cooldown_sec: u64,
    pub wall_gone_cooldown_sec: u64,
    pub confirmed_wall_cooldown_sec: u64,
    pub large_trade_cooldown_sec: u64,
    pub liquidation_cooldown_sec: u64,
    pub cvd_spike_cooldown_sec: u64,
    pub imbalance_cooldown_sec: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            batch_wait_ms: 300,
            batch_threshold: 3,
            queue_capacity: 1_000,
            wall_new_cooldown_sec: 30,
            wall_gone_cooldown_sec: 30,
            confirmed_wall_cooldown_sec: 60,
            large_trade_cooldown_sec: 10,
            liquidation_cooldown_sec: 10,
            cvd_spike_cooldown_sec: 300,
            imbalance_cooldown_sec: 300,
        }
    }
}

impl AlertConfig {
    pub fn cooldown_secs(&self, kind: AlertKind) -> u64 {
        match kind {
            AlertKind::WallNew => self.wall_new_cooldown_sec,
            AlertKind::WallGone => self.wall_gone_cooldown_sec,
            AlertKind::ConfirmedWall | AlertKind::ConfirmedWallGone => {
                self.confirmed_wall_cooldown_sec
            }
            AlertKind::LargeTrade | AlertKind::MegaTrade => self.large_trade_cooldown_sec,
            AlertKind::Liquidation | AlertKind::MegaLiquidation => self.liquidation_cooldown_sec,
            AlertKind::CvdSpike => self.cvd_spike_cooldown_sec,
            AlertKind::Imbalance => self.imbalance_cooldown_sec,
            AlertKind::Digest | AlertKind::System => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    /// How far back bucket rows are summed to rebuild CVD at cold start.
    pub cvd_recovery_horizon_min: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "wallwatch.db".to_string(),
            cvd_recovery_horizon_min: 1440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sink: SinkConfig,
    pub exchange: ExchangeConfig,
    pub thresholds: Thresholds,
    pub alerts: AlertConfig,
    pub store: StoreConfig,
    pub digest_periods_min: Vec<i64>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            exchange: ExchangeConfig::default(),
            thresholds: Thresholds::default(),
            alerts: AlertConfig::default(),
            store: StoreConfig::default(),
            digest_periods_min: vec![15, 30, 60],
            log_level: "INFO".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then JSON file (if present), then env
    /// overrides for secrets and the most commonly tuned thresholds.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                settings = serde_json::from_str(&content)?;
                info!(path = path, "Configuration loaded");
            } else {
                warn!(path = path, "Config file not found, using defaults");
            }
        }

        settings.load_from_env();
        Ok(settings)
    }

    fn load_from_env(&mut self) {
        if let Ok(token) = std::env::var("SINK_TOKEN") {
            self.sink.sink_token = token;
        }
        if let Ok(v) = std::env::var("ADMIN_USER") {
            if let Ok(id) = v.parse() {
                self.sink.admin_user = id;
            }
        }
        if let Ok(v) = std::env::var("FORUM_GROUP") {
            if let Ok(id) = v.parse() {
                self.sink.forum_group = id;
            }
        }
        if let Ok(v) = std::env::var("PROXY_URL") {
            if !v.is_empty() {
                self.exchange.proxy_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("WALL_THRESHOLD_USD") {
            if let Ok(t) = v.parse() {
                self.thresholds.wall_threshold_usd = t;
            }
        }
        if let Ok(v) = std::env::var("LARGE_TRADE_THRESHOLD_USD") {
            if let Ok(t) = v.parse() {
                self.thresholds.large_trade_spot_usd = t;
            }
        }
    }

    /// Startup validation. Failures here abort the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.sink.sink_token.is_empty() {
            errors.push("sink_token is required (env SINK_TOKEN)".to_string());
        }
        if self.sink.admin_user == 0 {
            errors.push("admin_user is required (env ADMIN_USER)".to_string());
        }
        if self.sink.forum_group == 0 {
            errors.push("forum_group is required (env FORUM_GROUP)".to_string());
        }
        if self.thresholds.wall_threshold_usd <= 0.0 {
            errors.push("wall_threshold_usd must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.thresholds.prune_distance_pct) {
            errors.push("prune_distance_pct must be within [0, 1]".to_string());
        }
        for p in &self.digest_periods_min {
            if *p <= 0 || 60 % *p != 0 {
                errors.push(format!("digest period {}m is not aligned to the hour", p));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    /// The full finite set of channel keys the router may address. All of
    /// them must resolve to a sink handle at startup.
    pub fn channel_keys(&self) -> Vec<String> {
        let mut keys = vec![
            "mega_events".to_string(),
            "liquidations".to_string(),
            "cvd_spikes".to_string(),
            "imbalance".to_string(),
        ];
        for market in Market::ALL {
            keys.push(format!("confirmed_walls_{}", market));
            for side in ["bid", "ask"] {
                keys.push(format!("walls_{}_{}", market, side));
            }
            for side in ["buy", "sell"] {
                keys.push(format!("large_trades_{}_{}", market, side));
            }
        }
        for p in &self.digest_periods_min {
            keys.push(format!("digest_{}m", p));
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let s = Settings::default();
        assert_eq!(s.thresholds.wall_threshold_usd, 500_000.0);
        assert_eq!(s.thresholds.wall_alert_usd, 2_000_000.0);
        assert_eq!(s.thresholds.wall_cancel_alert_usd, 1_000_000.0);
        assert_eq!(s.thresholds.confirmed_wall_threshold_usd, 5_000_000.0);
        assert_eq!(s.thresholds.confirmed_wall_max_distance_pct, 2.0);
        assert_eq!(s.thresholds.confirmed_wall_delay_sec, 60);
        assert_eq!(s.thresholds.large_trade_usd(Market::Spot), 100_000.0);
        assert_eq!(s.thresholds.large_trade_usd(Market::Futures), 500_000.0);
        assert_eq!(s.exchange.rest_timeout_secs, 20);
        assert_eq!(s.exchange.ws_silence_timeout_secs, 30);
        assert_eq!(s.alerts.batch_wait_ms, 300);
        assert_eq!(s.alerts.batch_threshold, 3);
    }

    #[test]
    fn test_cooldown_table() {
        let a = AlertConfig::default();
        assert_eq!(a.cooldown_secs(AlertKind::WallNew), 30);
        assert_eq!(a.cooldown_secs(AlertKind::WallGone), 30);
        assert_eq!(a.cooldown_secs(AlertKind::LargeTrade), 10);
        assert_eq!(a.cooldown_secs(AlertKind::ConfirmedWall), 60);
        assert_eq!(a.cooldown_secs(AlertKind::System), 0);
    }

    #[test]
    fn test_validation_requires_sink() {
        let s = Settings::default();
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sink.sink_token = "token".to_string();
        s.sink.admin_user = 42;
        s.sink.forum_group = -100;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_channel_keys_enumeration() {
        let s = Settings::default();
        let keys = s.channel_keys();
        assert!(keys.contains(&"walls_futures_bid".to_string()));
        assert!(keys.contains(&"walls_spot_ask".to_string()));
        assert!(keys.contains(&"confirmed_walls_futures".to_string()));
        assert!(keys.contains(&"large_trades_spot_buy".to_string()));
        assert!(keys.contains(&"digest_15m".to_string()));
        assert!(keys.contains(&"mega_events".to_string()));
    }

    #[test]
    fn test_misaligned_digest_period_rejected() {
        let mut s = Settings::default();
        s.sink.sink_token = "t".to_string();
        s.sink.admin_user = 1;
        s.sink.forum_group = 1;
        s.digest_periods_min = vec![45];
        assert!(s.validate().is_err());
    }
}
