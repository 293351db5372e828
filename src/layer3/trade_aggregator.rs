// Trade Aggregator - 1-minute buckets, CVD and large-trade classification
// BUY means the taker was the buyer. CVD is the running sum of bucket
// deltas since process start, rehydrated from the store at cold start.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alerts::format::{format_price, format_usd};
use crate::alerts::router::{stamp_line, trade_topic, AlertRequest, AlertRouter};
use crate::core::config::Thresholds;
use crate::core::types::{minute_epoch, now_ms, AlertKind, Market, TradeEvent, TradeSide};
use crate::store::{BucketRow, Store, StoreError};

/// In-memory accumulator for one minute of trades.
#[derive(Debug, Clone, Default)]
pub struct MinuteBucket {
    pub buy_volume_usd: f64,
    pub sell_volume_usd: f64,
    pub buy_count: i64,
    pub sell_count: i64,
    pub max_trade_usd: f64,
    pub vwap_num: f64,
    pub vwap_den: f64,
}

impl MinuteBucket {
    fn add(&mut self, trade: &TradeEvent) {
        match trade.side {
            TradeSide::Buy => {
                self.buy_volume_usd += trade.notional_usd;
                self.buy_count += 1;
            }
            TradeSide::Sell => {
                self.sell_volume_usd += trade.notional_usd;
                self.sell_count += 1;
            }
        }
        if trade.notional_usd > self.max_trade_usd {
            self.max_trade_usd = trade.notional_usd;
        }
        self.vwap_num += trade.price * trade.quantity;
        self.vwap_den += trade.quantity;
    }

    pub fn delta_usd(&self) -> f64 {
        self.buy_volume_usd - self.sell_volume_usd
    }

    pub fn vwap(&self) -> f64 {
        if self.vwap_den > 0.0 {
            self.vwap_num / self.vwap_den
        } else {
            0.0
        }
    }

    pub fn trade_count(&self) -> i64 {
        self.buy_count + self.sell_count
    }

    fn is_empty(&self) -> bool {
        self.trade_count() == 0
    }
}

struct AggState {
    current_minute: i64,
    bucket: MinuteBucket,
    cvd_usd: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TradeAggregatorStats {
    pub trades_processed: u64,
    pub large_trades: u64,
    pub mega_trades: u64,
    pub buckets_flushed: u64,
}

pub struct TradeAggregator {
    pub market: Market,
    thresholds: Thresholds,
    store: Arc<Store>,
    router: Arc<AlertRouter>,
    state: Mutex<AggState>,
    stats: Mutex<TradeAggregatorStats>,
}

impl TradeAggregator {
    pub fn new(
        market: Market,
        thresholds: Thresholds,
        store: Arc<Store>,
        router: Arc<AlertRouter>,
    ) -> Self {
        Self {
            market,
            thresholds,
            store,
            router,
            state: Mutex::new(AggState {
                current_minute: minute_epoch(now_ms()),
                bucket: MinuteBucket::default(),
                cvd_usd: 0.0,
            }),
            stats: Mutex::new(TradeAggregatorStats::default()),
        }
    }

    /// Rebuild CVD from the bucket table over the configured horizon.
    pub async fn recover_cvd(&self, horizon_min: i64) -> Result<(), StoreError> {
        let since = minute_epoch(now_ms()) - horizon_min * 60;
        let cvd = self.store.delta_sum_since(self.market, since).await?;
        self.state.lock().cvd_usd = cvd;
        info!(market = %self.market, cvd_usd = cvd, "CVD recovered");
        Ok(())
    }

    pub fn cvd_usd(&self) -> f64 {
        self.state.lock().cvd_usd
    }

    /// Process one classified trade: bucket rollover, accumulation, and
    /// large/mega alerting.
    pub async fn on_trade(&self, trade: &TradeEvent) {
        self.stats.lock().trades_processed += 1;

        let minute = minute_epoch(trade.timestamp_ms);
        let completed = {
            let mut state = self.state.lock();
            let completed = if minute > state.current_minute && !state.bucket.is_empty() {
                let bucket = std::mem::take(&mut state.bucket);
                let bucket_minute = state.current_minute;
                state.cvd_usd += bucket.delta_usd();
                Some((bucket_minute, bucket, state.cvd_usd))
            } else {
                None
            };
            if minute > state.current_minute {
                state.current_minute = minute;
            }
            state.bucket.add(trade);
            completed
        };

        if let Some((bucket_minute, bucket, cvd)) = completed {
            self.persist_bucket(bucket_minute, &bucket, cvd).await;
        }

        if trade.notional_usd >= self.thresholds.large_trade_usd(trade.market) {
            if let Err(e) = self.store.insert_large_trade(trade).await {
                warn!(market = %self.market, error = %e, "large-trade write failed");
            }
            self.send_trade_alert(trade).await;
        }
    }

    /// Minute flusher: persist the completed bucket once the wall clock has
    /// moved past it even when no trade arrives to trigger the rollover.
    pub async fn flush_completed(&self) {
        let now_minute = minute_epoch(now_ms());
        let completed = {
            let mut state = self.state.lock();
            if state.current_minute < now_minute && !state.bucket.is_empty() {
                let bucket = std::mem::take(&mut state.bucket);
                let bucket_minute = state.current_minute;
                state.cvd_usd += bucket.delta_usd();
                state.current_minute = now_minute;
                Some((bucket_minute, bucket, state.cvd_usd))
            } else {
                None
            }
        };
        if let Some((bucket_minute, bucket, cvd)) = completed {
            self.persist_bucket(bucket_minute, &bucket, cvd).await;
        }
    }

    /// Shutdown: persist whatever the current minute has accumulated.
    pub async fn flush_now(&self) {
        let completed = {
            let mut state = self.state.lock();
            if state.bucket.is_empty() {
                None
            } else {
                let bucket = std::mem::take(&mut state.bucket);
                let bucket_minute = state.current_minute;
                state.cvd_usd += bucket.delta_usd();
                Some((bucket_minute, bucket, state.cvd_usd))
            }
        };
        if let Some((bucket_minute, bucket, cvd)) = completed {
            self.persist_bucket(bucket_minute, &bucket, cvd).await;
        }
    }

    async fn persist_bucket(&self, bucket_minute: i64, bucket: &MinuteBucket, cvd: f64) {
        self.stats.lock().buckets_flushed += 1;
        let row = BucketRow {
            buy_volume_usd: bucket.buy_volume_usd,
            sell_volume_usd: bucket.sell_volume_usd,
            buy_count: bucket.buy_count,
            sell_count: bucket.sell_count,
            delta_usd: bucket.delta_usd(),
            cvd_usd: cvd,
            max_trade_usd: bucket.max_trade_usd,
            vwap: bucket.vwap(),
        };
        if let Err(e) = self
            .store
            .upsert_trade_bucket(self.market, bucket_minute, &row)
            .await
        {
            warn!(market = %self.market, error = %e, "bucket write failed");
        } else {
            debug!(
                market = %self.market,
                minute = bucket_minute,
                trades = bucket.trade_count(),
                delta_usd = row.delta_usd,
                "bucket flushed"
            );
        }
    }

    async fn send_trade_alert(&self, trade: &TradeEvent) {
        let mega = trade.notional_usd >= self.thresholds.mega_trade_usd;
        let (kind, topic, label, emoji) = if mega {
            self.stats.lock().mega_trades += 1;
            (AlertKind::MegaTrade, None, "MEGA TRADE", "\u{1f6a8}")
        } else {
            self.stats.lock().large_trades += 1;
            (
                AlertKind::LargeTrade,
                Some(trade_topic(trade.market, trade.side)),
                "LARGE TRADE",
                "\u{1f40b}",
            )
        };

        let arrow = match trade.side {
            TradeSide::Buy => "\u{1f7e2}",
            TradeSide::Sell => "\u{1f534}",
        };
        let text = format!(
            "{} {} \u{2014} {}\n{} {} {} @ {}\n{}",
            emoji,
            label,
            match trade.market {
                Market::Spot => "Spot",
                Market::Futures => "Futures",
            },
            arrow,
            trade.side,
            format_usd(trade.notional_usd),
            format_price(trade.price),
            stamp_line(),
        );
        self.router
            .enqueue(AlertRequest::new(
                kind,
                topic,
                format!("{}:{}:{}", kind, trade.market, trade.side.as_str()),
                text,
            ))
            .await;
    }

    pub fn stats(&self) -> TradeAggregatorStats {
        *self.stats.lock()
    }
}
