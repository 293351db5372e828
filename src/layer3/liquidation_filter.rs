// Liquidation Filter - forceOrder stream handling
// Filters by symbol, persists every matching event, alerts above the
// notional threshold with a mega variant routed to the mega channel

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::alerts::format::{format_price, format_usd};
use crate::alerts::router::{stamp_line, AlertRequest, AlertRouter};
use crate::core::config::Thresholds;
use crate::core::types::{AlertKind, LiqSide, LiquidationEvent};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct LiquidationStats {
    pub processed: u64,
    pub skipped_symbol: u64,
    pub alerts: u64,
    pub mega_alerts: u64,
}

pub struct LiquidationFilter {
    symbol: String,
    thresholds: Thresholds,
    store: Arc<Store>,
    router: Arc<AlertRouter>,
    stats: Mutex<LiquidationStats>,
}

impl LiquidationFilter {
    pub fn new(
        symbol: &str,
        thresholds: Thresholds,
        store: Arc<Store>,
        router: Arc<AlertRouter>,
    ) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            thresholds,
            store,
            router,
            stats: Mutex::new(LiquidationStats::default()),
        }
    }

    pub async fn on_liquidation(&self, event: &LiquidationEvent) {
        if event.symbol != self.symbol {
            self.stats.lock().skipped_symbol += 1;
            return;
        }
        self.stats.lock().processed += 1;

        if let Err(e) = self.store.insert_liquidation(event).await {
            warn!(error = %e, "liquidation write failed");
        }

        if event.notional_usd < self.thresholds.liq_alert_usd {
            return;
        }

        let mega = event.notional_usd >= self.thresholds.mega_liq_alert_usd;
        let kind = if mega {
            self.stats.lock().mega_alerts += 1;
            AlertKind::MegaLiquidation
        } else {
            self.stats.lock().alerts += 1;
            AlertKind::Liquidation
        };

        // Forced SELL wipes longs (red), forced BUY wipes shorts (green)
        let arrow = match event.side {
            LiqSide::Long => "\u{1f534}",
            LiqSide::Short => "\u{1f7e2}",
        };
        let text = format!(
            "\u{1f480} {}LIQUIDATION \u{2014} Futures\n{} {} {} @ {}\n{}",
            if mega { "MEGA " } else { "" },
            arrow,
            event.side.as_str().to_uppercase(),
            format_usd(event.notional_usd),
            format_price(event.price),
            stamp_line(),
        );
        self.router
            .enqueue(AlertRequest::new(
                kind,
                None,
                format!("{}:futures:{}", kind, event.side.as_str()),
                text,
            ))
            .await;
    }

    pub fn stats(&self) -> LiquidationStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::sink::MemorySink;
    use crate::core::config::Settings;

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

    async fn fixture() -> (LiquidationFilter, Arc<MemorySink>, Arc<AlertRouter>, Arc<Store>) {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(Store::in_memory().await.unwrap());
        let router =
            Arc::new(AlertRouter::new(&test_settings(), sink.clone(), store.clone()).unwrap());
        let filter = LiquidationFilter::new(
            "BTCUSDT",
            Thresholds::default(),
            store.clone(),
            router.clone(),
        );
        (filter, sink, router, store)
    }

    fn liq(symbol: &str, side: LiqSide, notional: f64) -> LiquidationEvent {
        LiquidationEvent {
            symbol: symbol.to_string(),
            side,
            price: 50_000.0,
            quantity: notional / 50_000.0,
            notional_usd: notional,
            order_type: "LIMIT".to_string(),
            timestamp_ms: crate::core::types::now_ms(),
        }
    }

    #[tokio::test]
    async fn test_other_symbols_ignored() {
        let (filter, sink, router, _store) = fixture().await;
        filter.on_liquidation(&liq("ETHUSDT", LiqSide::Long, 5_000_000.0)).await;
        router.flush_once(true).await;

        assert!(sink.texts().is_empty());
        assert_eq!(filter.stats().skipped_symbol, 1);
        assert_eq!(filter.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_small_liquidation_persisted_but_silent() {
        let (filter, sink, router, _) = fixture().await;
        filter.on_liquidation(&liq("BTCUSDT", LiqSide::Long, 200_000.0)).await;
        router.flush_once(true).await;

        assert!(sink.texts().is_empty());
        assert_eq!(filter.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_alert_above_threshold() {
        let (filter, sink, router, _) = fixture().await;
        filter.on_liquidation(&liq("BTCUSDT", LiqSide::Long, 1_500_000.0)).await;
        router.flush_once(true).await;

        let texts = sink.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("LIQUIDATION"));
        assert!(!texts[0].contains("MEGA"));
        assert!(texts[0].contains("LONG"));
    }

    #[tokio::test]
    async fn test_mega_variant() {
        let (filter, sink, router, _) = fixture().await;
        filter.on_liquidation(&liq("BTCUSDT", LiqSide::Short, 6_000_000.0)).await;
        router.flush_once(true).await;

        let texts = sink.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("MEGA LIQUIDATION"));
        assert_eq!(filter.stats().mega_alerts, 1);
    }
}
