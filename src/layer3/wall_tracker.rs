// Wall Tracker - registry and lifecycle of large resting orders
// Consumes wall changes from the books, persists wall records, promotes
// long-lived near-mid walls to confirmed, and emits user-facing alerts

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::alerts::format::{format_duration, format_pct, format_price, format_usd};
use crate::alerts::router::{
    confirmed_wall_topic, stamp_line, wall_topic, AlertRequest, AlertRouter,
};
use crate::core::config::Thresholds;
use crate::core::types::{
    now_ms, AlertKind, BookSide, GoneReason, Market, WallChange,
};
use crate::layer2::orderbook::MarketBook;
use crate::store::{Store, StoreError, WallOpen};

/// Appearance timestamps kept per key for the spoof heuristic.
const SPOOF_LOG_CAP: usize = 16;

const CONFIRM_POLL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WallKey {
    pub market: Market,
    pub side: BookSide,
    pub price: String,
}

#[derive(Debug, Clone)]
struct WallRecord {
    quantity: f64,
    notional_usd: f64,
    peak_notional_usd: f64,
    detected_at_ms: i64,
    first_seen_mid: f64,
    /// Crossed the alert threshold once; never re-alerts within a lifetime.
    alerted: bool,
    confirmed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallTrackerStats {
    pub changes_processed: u64,
    pub walls_created: u64,
    pub walls_removed: u64,
    pub alerts_new: u64,
    pub alerts_gone: u64,
    pub alerts_confirmed: u64,
    pub spoof_flags: u64,
}

pub struct WallTracker {
    thresholds: Thresholds,
    store: Arc<Store>,
    router: Arc<AlertRouter>,
    registry: RwLock<HashMap<WallKey, WallRecord>>,
    spoof_log: RwLock<HashMap<WallKey, VecDeque<i64>>>,
    stats: RwLock<WallTrackerStats>,
}

enum SeenOutcome {
    Created,
    Updated { peak_grew: bool },
}

impl WallTracker {
    pub fn new(thresholds: Thresholds, store: Arc<Store>, router: Arc<AlertRouter>) -> Self {
        Self {
            thresholds,
            store,
            router,
            registry: RwLock::new(HashMap::new()),
            spoof_log: RwLock::new(HashMap::new()),
            stats: RwLock::new(WallTrackerStats::default()),
        }
    }

    /// Rehydrate currently-open walls at cold start. Recovered walls above
    /// the alert threshold count as already alerted.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let stored = self.store.active_walls().await?;
        let count = stored.len();
        let mut registry = self.registry.write();
        for wall in stored {
            registry.insert(
                WallKey {
                    market: wall.market,
                    side: wall.side,
                    price: wall.price,
                },
                WallRecord {
                    quantity: wall.size_btc,
                    notional_usd: wall.size_usd,
                    peak_notional_usd: wall.peak_size_usd,
                    detected_at_ms: wall.detected_at_ms,
                    first_seen_mid: wall.price_at_detection,
                    alerted: wall.size_usd >= self.thresholds.wall_alert_usd,
                    confirmed: wall.confirmed_at_ms.is_some(),
                },
            );
        }
        drop(registry);
        info!(count = count, "recovered active walls");
        Ok(count)
    }

    /// Process the wall changes one applied diff batch produced.
    pub async fn on_book_changes(&self, market: Market, changes: Vec<WallChange>) {
        for change in changes {
            self.stats.write().changes_processed += 1;
            match change {
                WallChange::Seen {
                    side,
                    price,
                    quantity,
                    notional_usd,
                    mid,
                } => {
                    self.on_seen(market, side, price.as_str(), quantity, notional_usd, mid)
                        .await;
                }
                WallChange::Gone {
                    side,
                    price,
                    reason,
                    mid,
                    ..
                } => {
                    self.on_gone(market, side, price.as_str(), reason, mid).await;
                }
            }
        }
    }

    async fn on_seen(
        &self,
        market: Market,
        side: BookSide,
        price_str: &str,
        quantity: f64,
        notional_usd: f64,
        mid: f64,
    ) {
        let key = WallKey {
            market,
            side,
            price: price_str.to_string(),
        };
        let now = now_ms();

        let (outcome, detected_at_ms, should_alert) = {
            let mut registry = self.registry.write();
            match registry.get_mut(&key) {
                None => {
                    // Candidate -> Active on the same event; the candidate
                    // stage only pins the mid seen at first observation.
                    let should_alert = notional_usd >= self.thresholds.wall_alert_usd;
                    registry.insert(
                        key.clone(),
                        WallRecord {
                            quantity,
                            notional_usd,
                            peak_notional_usd: notional_usd,
                            detected_at_ms: now,
                            first_seen_mid: mid,
                            alerted: should_alert,
                            confirmed: false,
                        },
                    );
                    (SeenOutcome::Created, now, should_alert)
                }
                Some(record) => {
                    record.quantity = quantity;
                    record.notional_usd = notional_usd;
                    let peak_grew = notional_usd > record.peak_notional_usd;
                    if peak_grew {
                        record.peak_notional_usd = notional_usd;
                    }
                    let should_alert =
                        notional_usd >= self.thresholds.wall_alert_usd && !record.alerted;
                    if should_alert {
                        record.alerted = true;
                    }
                    (
                        SeenOutcome::Updated { peak_grew },
                        record.detected_at_ms,
                        should_alert,
                    )
                }
            }
        };

        match outcome {
            SeenOutcome::Created => {
                self.stats.write().walls_created += 1;
                self.note_appearance(&key, now);
                let price = price_str.parse::<f64>().unwrap_or(0.0);
                let distance_pct = if mid > 0.0 {
                    (price - mid) / mid * 100.0
                } else {
                    0.0
                };
                if let Err(e) = self
                    .store
                    .wall_opened(&WallOpen {
                        market,
                        side,
                        price: price_str,
                        detected_at_ms: now,
                        size_btc: quantity,
                        size_usd: notional_usd,
                        price_at_detection: mid,
                        distance_pct,
                    })
                    .await
                {
                    warn!(error = %e, "wall-opened write failed");
                }
                debug!(
                    market = %market,
                    side = %side,
                    price = price_str,
                    notional_usd = notional_usd,
                    "wall registered"
                );
            }
            SeenOutcome::Updated { peak_grew } => {
                if peak_grew {
                    if let Err(e) = self
                        .store
                        .wall_updated(market, side, price_str, detected_at_ms, quantity, notional_usd)
                        .await
                    {
                        warn!(error = %e, "wall-updated write failed");
                    }
                }
            }
        }

        if should_alert {
            self.send_new_wall_alert(&key, detected_at_ms, notional_usd, mid)
                .await;
        }
    }

    async fn on_gone(
        &self,
        market: Market,
        side: BookSide,
        price_str: &str,
        reason: GoneReason,
        mid: f64,
    ) {
        let key = WallKey {
            market,
            side,
            price: price_str.to_string(),
        };
        let now = now_ms();

        // The record (and with it the age) is captured atomically with the
        // registry deletion; nothing reads the registry afterwards.
        let record = match self.registry.write().remove(&key) {
            Some(r) => r,
            None => return,
        };
        let age_secs = (now - record.detected_at_ms).max(0) / 1000;
        self.stats.write().walls_removed += 1;

        if let Err(e) = self
            .store
            .wall_closed(
                market,
                side,
                price_str,
                record.detected_at_ms,
                reason.as_str(),
                mid,
                now,
            )
            .await
        {
            warn!(error = %e, "wall-closed write failed");
        }

        if record.confirmed {
            self.stats.write().alerts_gone += 1;
            let text = format!(
                "\u{1f3f0} CONFIRMED WALL REMOVED \u{2014} {} {}\n\
                 \u{1f4b0} {} @ {}\n\
                 \u{23f1} stood {}\n\
                 \u{1f4ca} {}\n{}",
                title_market(market),
                side.as_str().to_uppercase(),
                format_usd(record.notional_usd),
                format_price(key.price.parse().unwrap_or(0.0)),
                format_duration(age_secs),
                gone_reason_label(reason),
                stamp_line(),
            );
            self.router
                .enqueue(AlertRequest::new(
                    AlertKind::ConfirmedWallGone,
                    Some(confirmed_wall_topic(market)),
                    format!(
                        "confirmed_wall_gone:{}:{}:{}:{}",
                        market, side, key.price, record.detected_at_ms
                    ),
                    text,
                ))
                .await;
        }

        if record.notional_usd >= self.thresholds.wall_cancel_alert_usd {
            self.stats.write().alerts_gone += 1;
            let text = format!(
                "\u{1f4a5} WALL REMOVED \u{2014} {} {}\n\
                 \u{1f4b0} {} @ {}\n\
                 \u{1f4ca} {}\n\
                 \u{23f1} stood {}\n{}",
                title_market(market),
                side.as_str().to_uppercase(),
                format_usd(record.notional_usd),
                format_price(key.price.parse().unwrap_or(0.0)),
                gone_reason_label(reason),
                format_duration(age_secs),
                stamp_line(),
            );
            self.router
                .enqueue(AlertRequest::new(
                    AlertKind::WallGone,
                    Some(wall_topic(market, side)),
                    format!(
                        "wall_gone:{}:{}:{}:{}",
                        market, side, key.price, record.detected_at_ms
                    ),
                    text,
                ))
                .await;
        }
    }

    async fn send_new_wall_alert(
        &self,
        key: &WallKey,
        detected_at_ms: i64,
        notional_usd: f64,
        mid: f64,
    ) {
        let price = key.price.parse::<f64>().unwrap_or(0.0);
        let distance_pct = if mid > 0.0 {
            (price - mid) / mid * 100.0
        } else {
            0.0
        };

        let appearances = self.spoof_count(key, now_ms());
        let spoof_line = if appearances >= self.thresholds.spoof_warn_count {
            self.stats.write().spoof_flags += 1;
            format!(
                "\u{26a0} {} appearance at this level within {}\n",
                ordinal(appearances),
                format_duration(self.thresholds.spoof_window_secs),
            )
        } else {
            String::new()
        };

        self.stats.write().alerts_new += 1;
        let text = format!(
            "\u{1f9f1} NEW WALL \u{2014} {} {}\n\
             \u{1f4b0} {} @ {}\n\
             \u{1f4cf} {} from mid\n{}{}",
            title_market(key.market),
            key.side.as_str().to_uppercase(),
            format_usd(notional_usd),
            format_price(price),
            signed_pct(distance_pct),
            spoof_line,
            stamp_line(),
        );
        self.router
            .enqueue(AlertRequest::new(
                AlertKind::WallNew,
                Some(wall_topic(key.market, key.side)),
                // detected_at scopes the fingerprint to one wall lifetime:
                // the cooldown dedups re-crossings of the alert threshold,
                // never a genuine reappearance (which must alert again,
                // carrying the spoof warning)
                format!(
                    "wall_new:{}:{}:{}:{}",
                    key.market, key.side, key.price, detected_at_ms
                ),
                text,
            ))
            .await;
    }

    // ========================================================================
    // Spoof heuristic
    // ========================================================================

    /// Record an appearance for a key; bounded, lazily evicted.
    fn note_appearance(&self, key: &WallKey, now: i64) {
        let mut log = self.spoof_log.write();
        let entries = log.entry(key.clone()).or_default();
        let cutoff = now - self.thresholds.spoof_window_secs * 1000;
        while entries.front().is_some_and(|t| *t < cutoff) {
            entries.pop_front();
        }
        if entries.len() >= SPOOF_LOG_CAP {
            entries.pop_front();
        }
        entries.push_back(now);
    }

    /// Appearances within the window, evicting stale entries.
    fn spoof_count(&self, key: &WallKey, now: i64) -> usize {
        let mut log = self.spoof_log.write();
        let Some(entries) = log.get_mut(key) else {
            return 0;
        };
        let cutoff = now - self.thresholds.spoof_window_secs * 1000;
        while entries.front().is_some_and(|t| *t < cutoff) {
            entries.pop_front();
        }
        entries.len()
    }

    // ========================================================================
    // Confirmed walls
    // ========================================================================

    /// One pass of the 10s confirmed-wall check. Iterates a materialized
    /// key set and re-looks-up each key around the suspension points;
    /// promotion is monotonic until the wall goes.
    pub async fn check_confirmations(&self, books: &HashMap<Market, Arc<MarketBook>>) {
        let candidates: Vec<(WallKey, i64)> = {
            let registry = self.registry.read();
            registry
                .iter()
                .filter(|(_, r)| !r.confirmed)
                .map(|(k, r)| (k.clone(), r.detected_at_ms))
                .collect()
        };

        let now = now_ms();
        for (key, detected_at_ms) in candidates {
            let age_secs = (now - detected_at_ms) / 1000;
            if age_secs < self.thresholds.confirmed_wall_delay_sec {
                continue;
            }
            let Some(book) = books.get(&key.market) else {
                continue;
            };
            let Some(view) = book.wall_view(key.side, &key.price) else {
                continue;
            };
            if view.notional_usd < self.thresholds.confirmed_wall_threshold_usd {
                continue;
            }
            // Magnitude filter; the stored value stays signed.
            if view.distance_pct.abs() > self.thresholds.confirmed_wall_max_distance_pct {
                continue;
            }

            let promoted = {
                let mut registry = self.registry.write();
                match registry.get_mut(&key) {
                    Some(record) if !record.confirmed => {
                        record.confirmed = true;
                        record.notional_usd = view.notional_usd;
                        Some(record.detected_at_ms)
                    }
                    _ => None,
                }
            };
            let Some(detected_at_ms) = promoted else {
                continue;
            };

            if let Err(e) = self
                .store
                .wall_confirmed(key.market, key.side, &key.price, detected_at_ms, now)
                .await
            {
                warn!(error = %e, "wall-confirmed write failed");
            }

            self.stats.write().alerts_confirmed += 1;
            let side_label = match key.side {
                BookSide::Bid => "BID (support)",
                BookSide::Ask => "ASK (resistance)",
            };
            let text = format!(
                "\u{1f3f0} CONFIRMED WALL \u{2014} {} {}\n\
                 \u{1f4b0} {} @ {}\n\
                 \u{1f4cf} {} {} mid\n\
                 \u{23f1} standing {}\n{}",
                title_market(key.market),
                side_label,
                format_usd(view.notional_usd),
                format_price(key.price.parse().unwrap_or(0.0)),
                format_pct(view.distance_pct.abs()),
                if view.distance_pct < 0.0 { "below" } else { "above" },
                format_duration(age_secs),
                stamp_line(),
            );
            self.router
                .enqueue(AlertRequest::new(
                    AlertKind::ConfirmedWall,
                    Some(confirmed_wall_topic(key.market)),
                    format!(
                        "confirmed_wall:{}:{}:{}:{}",
                        key.market, key.side, key.price, detected_at_ms
                    ),
                    text,
                ))
                .await;
        }
    }

    pub async fn run_confirmed_loop(
        self: Arc<Self>,
        books: HashMap<Market, Arc<MarketBook>>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(CONFIRM_POLL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.check_confirmations(&books).await;
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn active_count(&self, market: Market) -> usize {
        self.registry
            .read()
            .keys()
            .filter(|k| k.market == market)
            .count()
    }

    pub fn is_confirmed(&self, market: Market, side: BookSide, price: &str) -> bool {
        self.registry
            .read()
            .get(&WallKey {
                market,
                side,
                price: price.to_string(),
            })
            .map(|r| r.confirmed)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> WallTrackerStats {
        *self.stats.read()
    }
}

fn title_market(market: Market) -> &'static str {
    match market {
        Market::Spot => "Spot",
        Market::Futures => "Futures",
    }
}

fn gone_reason_label(reason: GoneReason) -> &'static str {
    match reason {
        GoneReason::Cancelled => "cancelled",
        GoneReason::Filled => "filled (price reached)",
        GoneReason::Partial => "partially filled",
    }
}

fn signed_pct(value: f64) -> String {
    format!("{}{:.2}%", if value >= 0.0 { "+" } else { "" }, value)
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, 11) | (2, 12) | (3, 13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::sink::MemorySink;
    use crate::core::config::Settings;
    use crate::core::types::PriceKey;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.sink.sink_token = "t".to_string();
        settings.sink.admin_user = 1;
        settings.sink.forum_group = -100;
        for (i, key) in settings.channel_keys().into_iter().enumerate() {
            settings.sink.topics.insert(key, 1000 + i as i64);
        }
        settings
    }

    async fn fixture() -> (Arc<WallTracker>, Arc<MemorySink>, Arc<AlertRouter>, Arc<Store>) {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(Store::in_memory().await.unwrap());
        let router =
            Arc::new(AlertRouter::new(&test_settings(), sink.clone(), store.clone()).unwrap());
        let tracker = Arc::new(WallTracker::new(
            Thresholds::default(),
            store.clone(),
            router.clone(),
        ));
        (tracker, sink, router, store)
    }

    fn seen(side: BookSide, price: &str, qty: f64, mid: f64) -> WallChange {
        let key = PriceKey::parse(price).unwrap();
        let notional = key.value() * qty;
        WallChange::Seen {
            side,
            price: key,
            quantity: qty,
            notional_usd: notional,
            mid,
        }
    }

    fn gone(side: BookSide, price: &str, reason: GoneReason, mid: f64) -> WallChange {
        WallChange::Gone {
            side,
            price: PriceKey::parse(price).unwrap(),
            reason,
            last_quantity: 0.0,
            prev_notional_usd: 0.0,
            mid,
        }
    }

    #[tokio::test]
    async fn test_new_wall_alert_over_threshold() {
        let (tracker, sink, router, store) = fixture().await;

        // $2.5M bid at 50000, mid 50500 -> distance about -0.99%
        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 50.0, 50_500.0)],
            )
            .await;
        router.flush_once(true).await;

        let texts = sink.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("NEW WALL"));
        assert!(texts[0].contains("$2.5M"));
        assert!(texts[0].contains("-0.99%"));

        // persisted as active
        assert_eq!(store.active_walls().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_small_wall_is_tracked_but_silent() {
        let (tracker, sink, router, store) = fixture().await;

        // $750K: above the detection threshold, below the alert threshold
        tracker
            .on_book_changes(
                Market::Spot,
                vec![seen(BookSide::Ask, "50000.00", 15.0, 49_900.0)],
            )
            .await;
        router.flush_once(true).await;

        assert!(sink.texts().is_empty());
        assert_eq!(store.active_walls().await.unwrap().len(), 1);
        assert_eq!(tracker.active_count(Market::Spot), 1);
    }

    #[tokio::test]
    async fn test_alert_fires_once_when_wall_grows_past_threshold() {
        let (tracker, sink, router, _) = fixture().await;

        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 20.0, 50_100.0)], // $1M
            )
            .await;
        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 50.0, 50_100.0)], // $2.5M
            )
            .await;
        // shrink below and grow back: still no second alert
        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 30.0, 50_100.0)],
            )
            .await;
        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 60.0, 50_100.0)],
            )
            .await;
        router.flush_once(true).await;

        let texts = sink.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(tracker.stats().alerts_new, 1);
    }

    #[tokio::test]
    async fn test_gone_alert_carries_age_and_reason() {
        let (tracker, sink, router, store) = fixture().await;

        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 50.0, 50_500.0)],
            )
            .await;
        tracker
            .on_book_changes(
                Market::Futures,
                vec![gone(BookSide::Bid, "50000.00", GoneReason::Filled, 50_000.0)],
            )
            .await;
        router.flush_once(true).await;

        let texts = sink.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].contains("WALL REMOVED"));
        assert!(texts[1].contains("filled"));
        assert!(store.active_walls().await.unwrap().is_empty());
        assert_eq!(tracker.active_count(Market::Futures), 0);
    }

    #[tokio::test]
    async fn test_spoof_warning_on_reappearance() {
        // Default cooldowns throughout: the reappearance is a new wall
        // lifetime with its own fingerprint, so the 30s wall_new cooldown
        // must not swallow its alert
        let (tracker, sink, router, _) = fixture().await;

        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 50.0, 50_500.0)],
            )
            .await;
        router.flush_once(true).await;

        tracker
            .on_book_changes(
                Market::Futures,
                vec![gone(BookSide::Bid, "50000.00", GoneReason::Cancelled, 50_500.0)],
            )
            .await;
        router.flush_once(true).await;

        // distinct detected_at for the second lifetime
        tokio::time::sleep(Duration::from_millis(5)).await;

        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 50.0, 50_500.0)],
            )
            .await;
        router.flush_once(true).await;

        let texts = sink.texts();
        let new_alerts: Vec<&String> = texts.iter().filter(|t| t.contains("NEW WALL")).collect();
        assert_eq!(
            new_alerts.len(),
            2,
            "reappearance must alert again under default cooldowns: {:?}",
            texts
        );
        assert!(!new_alerts[0].contains("appearance at this level"));
        assert!(
            new_alerts[1].contains("2nd appearance at this level"),
            "second alert must carry the spoof warning: {}",
            new_alerts[1]
        );
        assert_eq!(tracker.stats().spoof_flags, 1);
    }

    #[tokio::test]
    async fn test_recovery_from_store() {
        let (tracker, _, router, store) = fixture().await;

        tracker
            .on_book_changes(
                Market::Futures,
                vec![seen(BookSide::Bid, "50000.00", 50.0, 50_500.0)],
            )
            .await;
        router.flush_once(true).await;

        // a fresh tracker over the same store sees the wall again
        let tracker2 = WallTracker::new(Thresholds::default(), store.clone(), router.clone());
        let recovered = tracker2.recover().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(tracker2.active_count(Market::Futures), 1);
    }

    #[test]
    fn test_ordinal() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(22), "22nd");
    }
}
