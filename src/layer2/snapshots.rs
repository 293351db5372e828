// Snapshot Coordinator - REST anchoring and drift protection
// Cold start, hourly invalidate-before-fetch refresh, 5s recovery loop,
// and the 60s book maintenance pass (prune + metrics + flow anomaly alerts)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::format::format_usd;
use crate::alerts::router::{stamp_line, AlertRequest, AlertRouter};
use crate::core::config::Thresholds;
use crate::core::types::{minute_epoch, now_ms, AlertKind, Market};
use crate::layer1::rest_client::{DepthRestClient, RestError};
use crate::layer2::orderbook::MarketBook;
use crate::layer3::wall_tracker::WallTracker;
use crate::store::Store;

const RECOVERY_POLL_SECS: u64 = 5;
const RECOVERY_TOLERANCE_SECS: u64 = 10;
const REFRESH_INTERVAL_SECS: u64 = 3600;
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Window for the CVD spike check.
const CVD_SPIKE_WINDOW_SECS: i64 = 300;

pub struct SnapshotCoordinator {
    books: HashMap<Market, Arc<MarketBook>>,
    rest: Arc<DepthRestClient>,
    walls: Arc<WallTracker>,
}

impl SnapshotCoordinator {
    pub fn new(
        books: HashMap<Market, Arc<MarketBook>>,
        rest: Arc<DepthRestClient>,
        walls: Arc<WallTracker>,
    ) -> Self {
        Self { books, rest, walls }
    }

    /// Anchor every book once at startup.
    pub async fn cold_start(&self) {
        for market in Market::ALL {
            if let Err(e) = self.anchor(market).await {
                error!(market = %market, error = %e, "cold-start anchor failed, recovery loop will retry");
            }
        }
    }

    /// Invalidate strictly before the fetch: diffs arriving while the REST
    /// call is in flight are buffered and replayed by `apply_snapshot`.
    pub async fn anchor(&self, market: Market) -> Result<(), RestError> {
        let Some(book) = self.books.get(&market) else {
            return Ok(());
        };
        book.invalidate();
        let snapshot = self.rest.fetch_depth(market).await?;
        let changes = book.apply_snapshot(&snapshot);
        self.walls.on_book_changes(market, changes).await;
        info!(market = %market, "book re-anchored");
        Ok(())
    }

    /// Hourly drift protection.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(REFRESH_INTERVAL_SECS)).await;
            for market in Market::ALL {
                if let Err(e) = self.anchor(market).await {
                    error!(market = %market, error = %e, "periodic refresh failed, book stays invalid");
                }
                // spread the two REST calls apart
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// Bounds worst-case desync downtime: re-anchor out of schedule when a
    /// book reported a sequencing violation or has been not-ready too long.
    pub async fn run_recovery_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(RECOVERY_POLL_SECS)).await;
            for market in Market::ALL {
                let Some(book) = self.books.get(&market) else {
                    continue;
                };
                let state = book.recovery_state();
                let stuck = !state.ready
                    && state
                        .not_ready_for
                        .is_some_and(|d| d > Duration::from_secs(RECOVERY_TOLERANCE_SECS));
                if state.violated || stuck {
                    warn!(
                        market = %market,
                        violated = state.violated,
                        "book out of sync, fetching recovery snapshot"
                    );
                    if let Err(e) = self.anchor(market).await {
                        error!(market = %market, error = %e, "recovery snapshot failed");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// WS (re)connects request an out-of-schedule anchor over this channel.
    pub async fn run_resync_listener(self: Arc<Self>, mut rx: mpsc::Receiver<Market>) {
        while let Some(market) = rx.recv().await {
            if let Err(e) = self.anchor(market).await {
                error!(market = %market, error = %e, "resync anchor failed, recovery loop will retry");
            }
        }
    }
}

/// 60s maintenance pass: prune distant levels, persist per-minute book
/// metrics, and fire the imbalance / CVD-spike anomaly alerts.
pub async fn run_maintenance_loop(
    books: HashMap<Market, Arc<MarketBook>>,
    store: Arc<Store>,
    router: Arc<AlertRouter>,
    thresholds: Thresholds,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the immediate first tick would snapshot empty books
    interval.tick().await;

    loop {
        interval.tick().await;
        let minute = minute_epoch(now_ms());

        for market in Market::ALL {
            let Some(book) = books.get(&market) else {
                continue;
            };
            book.prune_distant_levels();

            let Some(metrics) = book.metrics() else {
                continue;
            };
            if let Err(e) = store.insert_ob_snapshot(market, minute, &metrics).await {
                warn!(market = %market, error = %e, "metrics snapshot write failed");
            }

            // band index 2 = +/-1%
            let imbalance = metrics.imbalance[2];
            if imbalance.abs() > thresholds.imbalance_alert_threshold {
                let bid_pct = ((1.0 + imbalance) / 2.0 * 100.0).round() as i64;
                let dominant = if imbalance > 0.0 { "BID" } else { "ASK" };
                let text = format!(
                    "\u{2696} IMBALANCE \u{2014} {}\n{} heavy: BID {}% / ASK {}% (\u{00b1}1%)\n{}",
                    market_title(market),
                    dominant,
                    bid_pct,
                    100 - bid_pct,
                    stamp_line(),
                );
                router
                    .enqueue(AlertRequest::new(
                        AlertKind::Imbalance,
                        None,
                        format!("imbalance:{}:{}", market, dominant.to_lowercase()),
                        text,
                    ))
                    .await;
            }

            let since = minute - CVD_SPIKE_WINDOW_SECS;
            match store.delta_sum_since(market, since).await {
                Ok(delta) if delta.abs() > thresholds.cvd_spike_usd => {
                    let (direction, who) = if delta > 0.0 {
                        ("buy", "buyers")
                    } else {
                        ("sell", "sellers")
                    };
                    let text = format!(
                        "\u{1f4ca} CVD SPIKE \u{2014} {}\n{}{} in 5m ({})\n{}",
                        market_title(market),
                        if delta > 0.0 { "+" } else { "-" },
                        format_usd(delta),
                        who,
                        stamp_line(),
                    );
                    router
                        .enqueue(AlertRequest::new(
                            AlertKind::CvdSpike,
                            None,
                            format!("cvd_spike:{}:{}", market, direction),
                            text,
                        ))
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(market = %market, error = %e, "CVD spike query failed"),
            }
        }
    }
}

fn market_title(market: Market) -> &'static str {
    match market {
        Market::Spot => "Spot",
        Market::Futures => "Futures",
    }
}
