// Digest - periodic summary reports on clock-aligned boundaries
// A single 30s task checks whether the current minute closes any enabled
// period and renders a summary of the preceding window from the store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::alerts::format::{delta_arrow, format_price, format_usd};
use crate::alerts::router::{digest_topic, AlertRequest, AlertRouter};
use crate::core::config::Thresholds;
use crate::core::types::{now_ms, AlertKind};
use crate::store::{Store, StoreError, SummaryRow};

const DIGEST_POLL_SECS: u64 = 30;

pub struct DigestScheduler {
    periods_min: Vec<i64>,
    thresholds: Thresholds,
    store: Arc<Store>,
    router: Arc<AlertRouter>,
}

impl DigestScheduler {
    pub fn new(
        periods_min: Vec<i64>,
        thresholds: Thresholds,
        store: Arc<Store>,
        router: Arc<AlertRouter>,
    ) -> Self {
        Self {
            periods_min,
            thresholds,
            store,
            router,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let now_sec = now_ms() / 1000;
        let mut last_run: HashMap<i64, i64> = self
            .periods_min
            .iter()
            .map(|&mins| {
                let secs = mins * 60;
                (mins, now_sec / secs * secs)
            })
            .collect();

        let mut interval = tokio::time::interval(Duration::from_secs(DIGEST_POLL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now_sec = now_ms() / 1000;

            for &mins in &self.periods_min {
                let secs = mins * 60;
                let boundary = now_sec / secs * secs;
                if boundary <= last_run[&mins] {
                    continue;
                }

                let cutoff_sec = boundary - secs;
                match self.build(mins, cutoff_sec).await {
                    Ok(text) => {
                        let topic = digest_topic(mins);
                        self.router
                            .enqueue(AlertRequest::new(
                                AlertKind::Digest,
                                Some(topic.clone()),
                                format!("digest:{}m:{}", mins, boundary),
                                text,
                            ))
                            .await;
                        info!(period_min = mins, topic = %topic, "digest emitted");
                    }
                    Err(e) => error!(period_min = mins, error = %e, "digest build failed"),
                }
                last_run.insert(mins, boundary);
            }
        }
    }

    /// Render one digest for the window starting at `cutoff_sec`.
    pub async fn build(&self, period_min: i64, cutoff_sec: i64) -> Result<String, StoreError> {
        let cutoff_ms = cutoff_sec * 1000;
        let mut lines = vec![format!("\u{1f4ca} {}m digest", period_min), String::new()];

        if let Some((start, end)) = self.store.price_range(cutoff_sec).await? {
            let change_pct = if start > 0.0 {
                (end - start) / start * 100.0
            } else {
                0.0
            };
            lines.push(format!(
                "\u{1f4b0} BTC: {} \u{2192} {} ({}{:.2}%)",
                format_price(start),
                format_price(end),
                if change_pct >= 0.0 { "+" } else { "" },
                change_pct
            ));
            lines.push(String::new());
        }

        let trades = self
            .store
            .trades_summary(
                cutoff_ms,
                self.thresholds.large_trade_spot_usd,
                self.thresholds.large_trade_futures_usd,
            )
            .await?;
        push_summary_section(&mut lines, "\u{1f40b} Large trades", &trades);

        let walls = self
            .store
            .walls_summary(
                cutoff_ms,
                self.thresholds.wall_threshold_usd,
                self.thresholds.wall_alert_usd,
            )
            .await?;
        push_summary_section(&mut lines, "\u{1f9f1} New walls", &walls);

        let cvd = self.store.cvd_summary(cutoff_sec).await?;
        if cvd.is_empty() {
            lines.push("\u{1f4c8} CVD: no data".to_string());
        } else {
            lines.push("\u{1f4c8} CVD over the period:".to_string());
            for (market, delta) in cvd {
                lines.push(format!(
                    "  {}: {} {}{}",
                    title_case(&market),
                    delta_arrow(delta),
                    if delta >= 0.0 { "+" } else { "-" },
                    format_usd(delta)
                ));
            }
        }
        lines.push(String::new());

        let imbalance = self.store.latest_imbalance().await?;
        if !imbalance.is_empty() {
            lines.push("\u{2696} Imbalance (\u{00b1}1%):".to_string());
            for (market, imb) in imbalance {
                let bid_pct = ((1.0 + imb) / 2.0 * 100.0).round() as i64;
                lines.push(format!(
                    "  {}: BID {}% / ASK {}%",
                    title_case(&market),
                    bid_pct,
                    100 - bid_pct
                ));
            }
        }

        Ok(lines.join("\n"))
    }
}

fn push_summary_section(lines: &mut Vec<String>, header: &str, rows: &[SummaryRow]) {
    if rows.is_empty() {
        lines.push(format!("{}: none", header));
        lines.push(String::new());
        return;
    }
    lines.push(format!("{}:", header));
    let mut total_count = 0i64;
    let mut total_usd = 0.0f64;
    for row in rows {
        lines.push(format!(
            "  {} {}: {} for {}",
            title_case(&row.market),
            row.side.to_uppercase(),
            row.count,
            format_usd(row.total_usd)
        ));
        total_count += row.count;
        total_usd += row.total_usd;
    }
    lines.push(format!("  Total: {} for {}", total_count, format_usd(total_usd)));
    lines.push(String::new());
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::sink::MemorySink;
    use crate::core::config::Settings;
    use crate::core::types::{Market, TradeSide};
    use crate::core::types::TradeEvent;

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

    #[tokio::test]
    async fn test_digest_renders_sections() {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(Store::in_memory().await.unwrap());
        let router =
            Arc::new(AlertRouter::new(&test_settings(), sink, store.clone()).unwrap());

        let trade = TradeEvent {
            market: Market::Futures,
            side: TradeSide::Buy,
            price: 50_000.0,
            quantity: 12.0,
            notional_usd: 600_000.0,
            is_buyer_maker: false,
            timestamp_ms: now_ms(),
        };
        store.insert_large_trade(&trade).await.unwrap();

        let digest = DigestScheduler::new(
            vec![15, 30, 60],
            crate::core::config::Thresholds::default(),
            store,
            router,
        );
        let text = digest.build(15, 0).await.unwrap();
        assert!(text.contains("15m digest"));
        assert!(text.contains("Large trades"));
        assert!(text.contains("Futures BUY: 1"));
        assert!(text.contains("New walls: none"));
    }

    #[test]
    fn test_boundary_arithmetic() {
        // 12:44:30 is inside the 12:30 window; the 12:45 boundary has not
        // been reached, and at 12:45:10 it has
        let secs_1230 = (12 * 60 + 30) * 60;
        let t1 = (12 * 60 + 44) * 60 + 30;
        let t2 = (12 * 60 + 45) * 60 + 10;
        let period = 15 * 60;
        assert_eq!(t1 / period * period, secs_1230);
        assert_eq!(t2 / period * period, secs_1230 + period);
    }
}
