// Alert Router - de-duplication, cooldowns, micro-batching, sink dispatch
// Destination = topic_key override if present, else static route per kind.
// Requests accumulate per (kind, topic) and flush at the batch deadline or
// queue-length trigger; delivery retries transient sink errors.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::alerts::sink::{AlertSink, ChannelHandle, SinkError};
use crate::core::config::{AlertConfig, ConfigError, Settings};
use crate::core::types::{now_ms, AlertKind};
use crate::store::Store;

/// Delivery retry schedule for transient sink errors.
const RETRY_DELAYS_SECS: [u64; 2] = [1, 2];
const MAX_SEND_ATTEMPTS: usize = 3;

/// Flush loop poll interval; batch deadlines are checked on this cadence.
const FLUSH_POLL_MS: u64 = 50;

/// One alert produced somewhere in the pipeline.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub kind: AlertKind,
    /// Overrides the static route (kinds that split by market/side).
    pub topic_key: Option<String>,
    /// De-dup identity within the kind's cooldown window.
    pub fingerprint: String,
    pub text: String,
    pub produced_at: Instant,
}

impl AlertRequest {
    pub fn new(
        kind: AlertKind,
        topic_key: Option<String>,
        fingerprint: String,
        text: String,
    ) -> Self {
        Self {
            kind,
            topic_key,
            fingerprint,
            text,
            produced_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub accepted: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_disabled: u64,
    pub dropped_unroutable: u64,
    pub dropped_overflow: u64,
    pub batches_merged: u64,
    pub sent: u64,
    pub send_failures: u64,
}

struct RouterState {
    last_sent: HashMap<String, Instant>,
    queues: HashMap<(AlertKind, String), VecDeque<AlertRequest>>,
    stats: RouterStats,
}

pub struct AlertRouter {
    sink: Arc<dyn AlertSink>,
    store: Arc<Store>,
    channels: HashMap<String, ChannelHandle>,
    admin: ChannelHandle,
    parse_mode: String,
    alert_cfg: AlertConfig,
    state: Mutex<RouterState>,
}

impl AlertRouter {
    /// Resolve every addressable channel key at startup. A key with no
    /// configured sink destination is fatal.
    pub fn new(
        settings: &Settings,
        sink: Arc<dyn AlertSink>,
        store: Arc<Store>,
    ) -> Result<Self, ConfigError> {
        let admin = ChannelHandle {
            chat_id: settings.sink.admin_user,
            thread_id: None,
        };

        let mut channels = HashMap::new();
        channels.insert("system".to_string(), admin.clone());

        let mut missing = Vec::new();
        for key in settings.channel_keys() {
            match settings.sink.topics.get(&key) {
                Some(thread_id) => {
                    channels.insert(
                        key,
                        ChannelHandle {
                            chat_id: settings.sink.forum_group,
                            thread_id: Some(*thread_id),
                        },
                    );
                }
                None => missing.push(key),
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::Validation(format!(
                "unresolved alert channels: {}",
                missing.join(", ")
            )));
        }

        info!(channels = channels.len(), "alert router channels resolved");
        Ok(Self {
            sink,
            store,
            channels,
            admin,
            parse_mode: settings.sink.parse_mode.clone(),
            alert_cfg: settings.alerts.clone(),
            state: Mutex::new(RouterState {
                last_sent: HashMap::new(),
                queues: HashMap::new(),
                stats: RouterStats::default(),
            }),
        })
    }

    fn static_route(kind: AlertKind) -> Option<&'static str> {
        match kind {
            AlertKind::MegaTrade | AlertKind::MegaLiquidation => Some("mega_events"),
            AlertKind::Liquidation => Some("liquidations"),
            AlertKind::CvdSpike => Some("cvd_spikes"),
            AlertKind::Imbalance => Some("imbalance"),
            AlertKind::System => Some("system"),
            // Wall, trade and digest producers always set a topic_key.
            _ => None,
        }
    }

    /// Accept one request: notification settings, cooldown, routing, queue.
    pub async fn enqueue(&self, request: AlertRequest) {
        match self.store.notification_enabled(request.kind).await {
            Ok(false) => {
                self.state.lock().stats.suppressed_disabled += 1;
                return;
            }
            Ok(true) => {}
            Err(e) => {
                // Settings unavailable: alerts stay enabled
                warn!(error = %e, "notification settings unavailable");
            }
        }

        let channel_key = match request
            .topic_key
            .clone()
            .or_else(|| Self::static_route(request.kind).map(str::to_string))
        {
            Some(key) => key,
            None => {
                let mut state = self.state.lock();
                state.stats.dropped_unroutable += 1;
                error!(kind = %request.kind, "alert without topic or static route dropped");
                return;
            }
        };

        let text = request.text.clone();
        let kind = request.kind;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let cooldown = Duration::from_secs(self.alert_cfg.cooldown_secs(kind));
            if !cooldown.is_zero() {
                if let Some(last) = state.last_sent.get(&request.fingerprint) {
                    if last.elapsed() < cooldown {
                        state.stats.suppressed_cooldown += 1;
                        return;
                    }
                }
            }
            state
                .last_sent
                .insert(request.fingerprint.clone(), Instant::now());

            let queue = state
                .queues
                .entry((kind, channel_key))
                .or_insert_with(VecDeque::new);
            if queue.len() >= self.alert_cfg.queue_capacity {
                queue.pop_front();
                state.stats.dropped_overflow += 1;
            }
            queue.push_back(request);
            state.stats.accepted += 1;
        }

        if let Err(e) = self.store.insert_alert_log(kind, &text).await {
            warn!(error = %e, "alert log write failed");
        }
    }

    /// System-channel convenience used by connection lifecycle notices.
    pub async fn system_notice(&self, fingerprint: &str, text: String) {
        self.enqueue(AlertRequest::new(
            AlertKind::System,
            None,
            fingerprint.to_string(),
            text,
        ))
        .await;
    }

    /// Background flusher: checks batch deadlines every poll tick.
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(FLUSH_POLL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.flush_once(false).await;
        }
    }

    /// Flush queues whose deadline or length trigger fired. With `force`
    /// everything pending is delivered (shutdown path).
    pub async fn flush_once(&self, force: bool) {
        let batch_wait = Duration::from_millis(self.alert_cfg.batch_wait_ms);
        let mut due: Vec<(AlertKind, String, Vec<AlertRequest>)> = Vec::new();
        {
            let mut state = self.state.lock();
            let keys: Vec<(AlertKind, String)> = state.queues.keys().cloned().collect();
            for key in keys {
                let queue = match state.queues.get_mut(&key) {
                    Some(q) => q,
                    None => continue,
                };
                if queue.is_empty() {
                    state.queues.remove(&key);
                    continue;
                }
                let deadline_hit = queue
                    .front()
                    .map(|r| r.produced_at.elapsed() >= batch_wait)
                    .unwrap_or(false);
                let length_hit = queue.len() > self.alert_cfg.batch_threshold;
                if force || deadline_hit || length_hit {
                    let drained: Vec<AlertRequest> = queue.drain(..).collect();
                    state.queues.remove(&key);
                    due.push((key.0, key.1, drained));
                }
            }
        }

        for (kind, channel_key, batch) in due {
            self.deliver_batch(kind, &channel_key, batch).await;
        }
    }

    async fn deliver_batch(&self, kind: AlertKind, channel_key: &str, batch: Vec<AlertRequest>) {
        if batch.is_empty() {
            return;
        }
        let text = if batch.len() > 1 {
            self.state.lock().stats.batches_merged += 1;
            let mut combined = format!("\u{26a1} {} events ({})\n\n", batch.len(), kind);
            combined.push_str(
                &batch
                    .iter()
                    .take(10)
                    .map(|r| r.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\u{2014}\u{2014}\u{2014}\n"),
            );
            if batch.len() > 10 {
                combined.push_str(&format!("\n\n...and {} more", batch.len() - 10));
            }
            combined
        } else {
            batch[0].text.clone()
        };

        self.deliver(channel_key, &text).await;
    }

    async fn deliver(&self, channel_key: &str, text: &str) {
        let channel = match self.channels.get(channel_key) {
            Some(c) => c.clone(),
            None => {
                warn!(channel_key = channel_key, "unknown channel at delivery, using admin");
                self.admin.clone()
            }
        };

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match self.sink.send(&channel, text, &self.parse_mode).await {
                Ok(()) => {
                    self.state.lock().stats.sent += 1;
                    return;
                }
                Err(SinkError::Permanent(e)) => {
                    self.state.lock().stats.send_failures += 1;
                    error!(channel_key = channel_key, error = %e, "permanent sink failure, dropped");
                    return;
                }
                Err(SinkError::Transient(e)) => {
                    debug!(
                        channel_key = channel_key,
                        attempt = attempt,
                        error = %e,
                        "transient sink failure"
                    );
                    if attempt < MAX_SEND_ATTEMPTS {
                        let delay = RETRY_DELAYS_SECS
                            .get(attempt - 1)
                            .copied()
                            .unwrap_or(4);
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        }
        self.state.lock().stats.send_failures += 1;
        error!(channel_key = channel_key, "alert dropped after retries");
    }

    pub fn stats(&self) -> RouterStats {
        self.state.lock().stats
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.len()).sum()
    }
}

/// Digest topic key for a period.
pub fn digest_topic(period_min: i64) -> String {
    format!("digest_{}m", period_min)
}

/// Topic keys for alert kinds that split by (market, side).
pub fn wall_topic(market: crate::core::types::Market, side: crate::core::types::BookSide) -> String {
    format!("walls_{}_{}", market, side)
}

pub fn confirmed_wall_topic(market: crate::core::types::Market) -> String {
    format!("confirmed_walls_{}", market)
}

pub fn trade_topic(market: crate::core::types::Market, side: crate::core::types::TradeSide) -> String {
    format!("large_trades_{}_{}", market, side.as_str())
}

/// Timestamp trailer line shared by alert bodies.
pub fn stamp_line() -> String {
    format!("\u{1f552} {} UTC", crate::alerts::format::format_time_utc(now_ms()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BookSide, Market, TradeSide};
    use async_trait::async_trait;

    struct RecordingSink {
        sent: Mutex<Vec<(ChannelHandle, String)>>,
        transient_failures: Mutex<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                transient_failures: Mutex::new(0),
            }
        }

        fn failing(n: usize) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                transient_failures: Mutex::new(n),
            }
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(
            &self,
            channel: &ChannelHandle,
            text: &str,
            _parse_mode: &str,
        ) -> Result<(), SinkError> {
            {
                let mut failures = self.transient_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SinkError::Transient("flaky".to_string()));
                }
            }
            self.sent.lock().push((channel.clone(), text.to_string()));
            Ok(())
        }
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.sink.sink_token = "token".to_string();
        settings.sink.admin_user = 1;
        settings.sink.forum_group = -100;
        for (i, key) in settings.channel_keys().into_iter().enumerate() {
            settings.sink.topics.insert(key, 1000 + i as i64);
        }
        settings
    }

    async fn test_router(sink: Arc<RecordingSink>) -> Arc<AlertRouter> {
        let store = Arc::new(Store::in_memory().await.unwrap());
        Arc::new(AlertRouter::new(&test_settings(), sink, store).unwrap())
    }

    fn wall_request(fingerprint: &str, topic: &str, text: &str) -> AlertRequest {
        AlertRequest::new(
            AlertKind::WallNew,
            Some(topic.to_string()),
            fingerprint.to_string(),
            text.to_string(),
        )
    }

    #[tokio::test]
    async fn test_unresolved_channel_is_fatal() {
        let mut settings = test_settings();
        settings.sink.topics.remove("walls_futures_bid");
        let store = Arc::new(Store::in_memory().await.unwrap());
        let result = AlertRouter::new(&settings, Arc::new(RecordingSink::new()), store);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_duplicate_fingerprint() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone()).await;

        router
            .enqueue(wall_request("wall_new:futures:bid:50000", "walls_futures_bid", "first"))
            .await;
        router
            .enqueue(wall_request("wall_new:futures:bid:50000", "walls_futures_bid", "second"))
            .await;

        assert_eq!(router.pending(), 1);
        assert_eq!(router.stats().suppressed_cooldown, 1);

        router.flush_once(true).await;
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "first");
    }

    #[tokio::test]
    async fn test_batching_coalesces_same_topic() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone()).await;

        for i in 0..4 {
            router
                .enqueue(wall_request(
                    &format!("wall_new:spot:ask:5000{}", i),
                    "walls_spot_ask",
                    &format!("wall {}", i),
                ))
                .await;
        }

        // 4 > batch_threshold(3), flushes without waiting for the deadline
        router.flush_once(false).await;
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1, "batch should merge into a single message");
        assert!(sent[0].1.contains("4 events"));
        assert!(sent[0].1.contains("wall 0"));
        assert!(sent[0].1.contains("wall 3"));
    }

    #[tokio::test]
    async fn test_deadline_flush_and_separate_later_message() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone()).await;

        router
            .enqueue(wall_request("f1", "walls_spot_ask", "early"))
            .await;
        // Deadline not reached yet: nothing flushes
        router.flush_once(false).await;
        assert_eq!(sink.sent.lock().len(), 0);

        tokio::time::sleep(Duration::from_millis(350)).await;
        router.flush_once(false).await;
        assert_eq!(sink.sent.lock().len(), 1);

        // A later request becomes its own message
        router
            .enqueue(wall_request("f2", "walls_spot_ask", "late"))
            .await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        router.flush_once(false).await;
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, "late");
    }

    #[tokio::test]
    async fn test_ordering_within_queue() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone()).await;

        router.enqueue(wall_request("a", "walls_spot_ask", "one")).await;
        router.enqueue(wall_request("b", "walls_spot_ask", "two")).await;
        router.flush_once(true).await;

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        let text = &sent[0].1;
        assert!(text.find("one").unwrap() < text.find("two").unwrap());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(RecordingSink::failing(2));
        let router = test_router(sink.clone()).await;
        tokio::time::pause();

        router.enqueue(wall_request("f", "walls_spot_ask", "retry me")).await;
        router.flush_once(true).await;

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1, "third attempt should succeed");
        assert_eq!(router.stats().sent, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_message() {
        let sink = Arc::new(RecordingSink::failing(5));
        let router = test_router(sink.clone()).await;
        tokio::time::pause();

        router.enqueue(wall_request("f", "walls_spot_ask", "doomed")).await;
        router.flush_once(true).await;

        assert_eq!(sink.sent.lock().len(), 0);
        assert!(router.stats().send_failures >= 1);
    }

    #[tokio::test]
    async fn test_static_route_for_liquidation() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone()).await;

        router
            .enqueue(AlertRequest::new(
                AlertKind::Liquidation,
                None,
                "liq:long".to_string(),
                "liq alert".to_string(),
            ))
            .await;
        router.flush_once(true).await;
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_kind_suppressed() {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(Store::in_memory().await.unwrap());
        store.set_notification(AlertKind::WallNew, false).await.unwrap();
        let router =
            Arc::new(AlertRouter::new(&test_settings(), sink.clone(), store).unwrap());

        router.enqueue(wall_request("f", "walls_spot_ask", "muted")).await;
        router.flush_once(true).await;
        assert_eq!(sink.sent.lock().len(), 0);
        assert_eq!(router.stats().suppressed_disabled, 1);
    }

    #[test]
    fn test_topic_builders() {
        assert_eq!(wall_topic(Market::Futures, BookSide::Bid), "walls_futures_bid");
        assert_eq!(confirmed_wall_topic(Market::Spot), "confirmed_walls_spot");
        assert_eq!(trade_topic(Market::Spot, TradeSide::Buy), "large_trades_spot_buy");
        assert_eq!(digest_topic(15), "digest_15m");
    }
}
