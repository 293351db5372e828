// Store - SQLite persistence via sqlx
// Write-through contract: idempotent wall rows keyed by
// (market, side, price, detected_at), append-only trade/liquidation/alert
// logs, upserted minute aggregates. Prices stored as TEXT, timestamps as
// integer epoch milliseconds (bucket keys are minute-start epoch seconds).

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::{
    AlertKind, BookSide, LiquidationEvent, Market, TradeEvent,
};
use crate::layer2::orderbook::BookMetrics;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ============================================================================
// Row types
// ============================================================================

/// New wall row (status 'active').
#[derive(Debug, Clone)]
pub struct WallOpen<'a> {
    pub market: Market,
    pub side: BookSide,
    pub price: &'a str,
    pub detected_at_ms: i64,
    pub size_btc: f64,
    pub size_usd: f64,
    pub price_at_detection: f64,
    pub distance_pct: f64,
}

/// Active wall recovered at cold start.
#[derive(Debug, Clone)]
pub struct StoredWall {
    pub market: Market,
    pub side: BookSide,
    pub price: String,
    pub detected_at_ms: i64,
    pub size_btc: f64,
    pub size_usd: f64,
    pub peak_size_usd: f64,
    pub price_at_detection: f64,
    pub distance_pct: f64,
    pub confirmed_at_ms: Option<i64>,
}

/// Completed 1-minute trade bucket.
#[derive(Debug, Clone)]
pub struct BucketRow {
    pub buy_volume_usd: f64,
    pub sell_volume_usd: f64,
    pub buy_count: i64,
    pub sell_count: i64,
    pub delta_usd: f64,
    pub cvd_usd: f64,
    pub max_trade_usd: f64,
    pub vwap: f64,
}

/// (market, side) aggregation row for digests.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub market: String,
    pub side: String,
    pub count: i64,
    pub total_usd: f64,
}

// ============================================================================
// Store
// ============================================================================

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the on-disk database and ensure schema.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(path = path, "Store initialized");
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS orderbook_walls (
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                size_btc REAL NOT NULL,
                size_usd REAL NOT NULL,
                peak_size_usd REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                ended_at INTEGER,
                lifetime_ms INTEGER,
                end_reason TEXT,
                price_at_detection REAL,
                price_at_end REAL,
                distance_pct REAL,
                confirmed_at INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (market, side, price, detected_at)
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_walls_status ON orderbook_walls(status)",
            "CREATE INDEX IF NOT EXISTS idx_walls_detected ON orderbook_walls(detected_at)",
            r#"CREATE TABLE IF NOT EXISTS large_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                quantity_btc REAL NOT NULL,
                quantity_usd REAL NOT NULL,
                is_maker_buy INTEGER NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_lt_timestamp ON large_trades(timestamp)",
            r#"CREATE TABLE IF NOT EXISTS liquidations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                quantity_btc REAL NOT NULL,
                quantity_usd REAL NOT NULL,
                order_type TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_liq_timestamp ON liquidations(timestamp)",
            r#"CREATE TABLE IF NOT EXISTS trade_aggregates_1m (
                minute_epoch INTEGER NOT NULL,
                market TEXT NOT NULL,
                buy_volume_usd REAL NOT NULL DEFAULT 0,
                sell_volume_usd REAL NOT NULL DEFAULT 0,
                buy_count INTEGER NOT NULL DEFAULT 0,
                sell_count INTEGER NOT NULL DEFAULT 0,
                delta_usd REAL NOT NULL DEFAULT 0,
                cvd_usd REAL NOT NULL DEFAULT 0,
                max_trade_usd REAL NOT NULL DEFAULT 0,
                vwap REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (minute_epoch, market)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS ob_snapshots_1m (
                minute_epoch INTEGER NOT NULL,
                market TEXT NOT NULL,
                mid_price REAL NOT NULL,
                spread_pct REAL NOT NULL,
                bid_depth_01pct REAL, bid_depth_05pct REAL, bid_depth_1pct REAL,
                bid_depth_2pct REAL, bid_depth_5pct REAL,
                ask_depth_01pct REAL, ask_depth_05pct REAL, ask_depth_1pct REAL,
                ask_depth_2pct REAL, ask_depth_5pct REAL,
                imbalance_01pct REAL, imbalance_05pct REAL, imbalance_1pct REAL,
                imbalance_2pct REAL, imbalance_5pct REAL,
                wall_count_bid INTEGER DEFAULT 0,
                wall_count_ask INTEGER DEFAULT 0,
                PRIMARY KEY (minute_epoch, market)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS alerts_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                alert_type TEXT NOT NULL,
                description TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_alerts_type ON alerts_log(alert_type, timestamp)",
            r#"CREATE TABLE IF NOT EXISTS notification_settings (
                alert_type TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            )"#,
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        for kind in AlertKind::ALL {
            sqlx::query(
                "INSERT OR IGNORE INTO notification_settings (alert_type, enabled, updated_at) VALUES (?, 1, 0)",
            )
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Walls
    // ========================================================================

    pub async fn wall_opened(&self, wall: &WallOpen<'_>) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO orderbook_walls
               (market, side, price, detected_at, size_btc, size_usd, peak_size_usd,
                status, price_at_detection, distance_pct, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)
               ON CONFLICT (market, side, price, detected_at) DO UPDATE SET
                 size_btc = excluded.size_btc,
                 size_usd = excluded.size_usd,
                 peak_size_usd = MAX(orderbook_walls.peak_size_usd, excluded.size_usd),
                 updated_at = excluded.updated_at"#,
        )
        .bind(wall.market.as_str())
        .bind(wall.side.as_str())
        .bind(wall.price)
        .bind(wall.detected_at_ms)
        .bind(wall.size_btc)
        .bind(wall.size_usd)
        .bind(wall.size_usd)
        .bind(wall.price_at_detection)
        .bind(wall.distance_pct)
        .bind(crate::core::types::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn wall_updated(
        &self,
        market: Market,
        side: BookSide,
        price: &str,
        detected_at_ms: i64,
        size_btc: f64,
        size_usd: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE orderbook_walls SET
                 size_btc = ?, size_usd = ?,
                 peak_size_usd = MAX(peak_size_usd, ?),
                 updated_at = ?
               WHERE market = ? AND side = ? AND price = ? AND detected_at = ?"#,
        )
        .bind(size_btc)
        .bind(size_usd)
        .bind(size_usd)
        .bind(crate::core::types::now_ms())
        .bind(market.as_str())
        .bind(side.as_str())
        .bind(price)
        .bind(detected_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn wall_confirmed(
        &self,
        market: Market,
        side: BookSide,
        price: &str,
        detected_at_ms: i64,
        confirmed_at_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE orderbook_walls SET confirmed_at = ?, updated_at = ?
               WHERE market = ? AND side = ? AND price = ? AND detected_at = ?"#,
        )
        .bind(confirmed_at_ms)
        .bind(crate::core::types::now_ms())
        .bind(market.as_str())
        .bind(side.as_str())
        .bind(price)
        .bind(detected_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn wall_closed(
        &self,
        market: Market,
        side: BookSide,
        price: &str,
        detected_at_ms: i64,
        end_reason: &str,
        price_at_end: f64,
        ended_at_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE orderbook_walls SET
                 status = ?, end_reason = ?, ended_at = ?,
                 lifetime_ms = ? - detected_at,
                 price_at_end = ?, updated_at = ?
               WHERE market = ? AND side = ? AND price = ? AND detected_at = ?"#,
        )
        .bind(end_reason)
        .bind(end_reason)
        .bind(ended_at_ms)
        .bind(ended_at_ms)
        .bind(price_at_end)
        .bind(crate::core::types::now_ms())
        .bind(market.as_str())
        .bind(side.as_str())
        .bind(price)
        .bind(detected_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Walls still open at shutdown cannot be classified later.
    pub async fn mark_walls_unknown(&self, now_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE orderbook_walls SET
                 status = 'unknown', ended_at = ?,
                 lifetime_ms = ? - detected_at, updated_at = ?
               WHERE status = 'active'"#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn active_walls(&self) -> Result<Vec<StoredWall>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT market, side, price, detected_at, size_btc, size_usd,
                      peak_size_usd, price_at_detection, distance_pct, confirmed_at
               FROM orderbook_walls WHERE status = 'active'"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut walls = Vec::with_capacity(rows.len());
        for row in rows {
            let market_str: String = row.get("market");
            let side_str: String = row.get("side");
            let (market, side) = match (Market::from_str(&market_str), BookSide::from_str(&side_str)) {
                (Ok(m), Ok(s)) => (m, s),
                _ => {
                    warn!(market = %market_str, side = %side_str, "skipping malformed wall row");
                    continue;
                }
            };
            walls.push(StoredWall {
                market,
                side,
                price: row.get("price"),
                detected_at_ms: row.get("detected_at"),
                size_btc: row.get("size_btc"),
                size_usd: row.get("size_usd"),
                peak_size_usd: row.get("peak_size_usd"),
                price_at_detection: row.get::<Option<f64>, _>("price_at_detection").unwrap_or(0.0),
                distance_pct: row.get::<Option<f64>, _>("distance_pct").unwrap_or(0.0),
                confirmed_at_ms: row.get("confirmed_at"),
            });
        }
        Ok(walls)
    }

    // ========================================================================
    // Trades / liquidations
    // ========================================================================

    pub async fn insert_large_trade(&self, trade: &TradeEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO large_trades
               (timestamp, market, side, price, quantity_btc, quantity_usd, is_maker_buy)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(trade.timestamp_ms)
        .bind(trade.market.as_str())
        .bind(trade.side.as_str())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.notional_usd)
        .bind(trade.is_buyer_maker as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_liquidation(&self, liq: &LiquidationEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO liquidations
               (timestamp, side, price, quantity_btc, quantity_usd, order_type)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(liq.timestamp_ms)
        .bind(liq.side.as_str())
        .bind(liq.price)
        .bind(liq.quantity)
        .bind(liq.notional_usd)
        .bind(&liq.order_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Minute aggregates
    // ========================================================================

    pub async fn upsert_trade_bucket(
        &self,
        market: Market,
        minute_epoch: i64,
        bucket: &BucketRow,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO trade_aggregates_1m
               (minute_epoch, market, buy_volume_usd, sell_volume_usd, buy_count,
                sell_count, delta_usd, cvd_usd, max_trade_usd, vwap)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(minute_epoch)
        .bind(market.as_str())
        .bind(bucket.buy_volume_usd)
        .bind(bucket.sell_volume_usd)
        .bind(bucket.buy_count)
        .bind(bucket.sell_count)
        .bind(bucket.delta_usd)
        .bind(bucket.cvd_usd)
        .bind(bucket.max_trade_usd)
        .bind(bucket.vwap)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_ob_snapshot(
        &self,
        market: Market,
        minute_epoch: i64,
        m: &BookMetrics,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO ob_snapshots_1m
               (minute_epoch, market, mid_price, spread_pct,
                bid_depth_01pct, bid_depth_05pct, bid_depth_1pct, bid_depth_2pct, bid_depth_5pct,
                ask_depth_01pct, ask_depth_05pct, ask_depth_1pct, ask_depth_2pct, ask_depth_5pct,
                imbalance_01pct, imbalance_05pct, imbalance_1pct, imbalance_2pct, imbalance_5pct,
                wall_count_bid, wall_count_ask)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(minute_epoch)
        .bind(market.as_str())
        .bind(m.mid_price)
        .bind(m.spread_pct)
        .bind(m.bid_depth[0]).bind(m.bid_depth[1]).bind(m.bid_depth[2])
        .bind(m.bid_depth[3]).bind(m.bid_depth[4])
        .bind(m.ask_depth[0]).bind(m.ask_depth[1]).bind(m.ask_depth[2])
        .bind(m.ask_depth[3]).bind(m.ask_depth[4])
        .bind(m.imbalance[0]).bind(m.imbalance[1]).bind(m.imbalance[2])
        .bind(m.imbalance[3]).bind(m.imbalance[4])
        .bind(m.wall_count_bid as i64)
        .bind(m.wall_count_ask as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sum of bucket deltas since `since_epoch_sec` (CVD rehydration and
    /// spike checks).
    pub async fn delta_sum_since(
        &self,
        market: Market,
        since_epoch_sec: i64,
    ) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "SELECT SUM(delta_usd) AS total FROM trade_aggregates_1m WHERE minute_epoch >= ? AND market = ?",
        )
        .bind(since_epoch_sec)
        .bind(market.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<f64>, _>("total").unwrap_or(0.0))
    }

    // ========================================================================
    // Alerts / notification settings
    // ========================================================================

    pub async fn insert_alert_log(&self, kind: AlertKind, text: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO alerts_log (timestamp, alert_type, description) VALUES (?, ?, ?)")
            .bind(crate::core::types::now_ms())
            .bind(kind.as_str())
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Missing rows default to enabled.
    pub async fn notification_enabled(&self, kind: AlertKind) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT enabled FROM notification_settings WHERE alert_type = ?")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("enabled") != 0).unwrap_or(true))
    }

    pub async fn set_notification(&self, kind: AlertKind, enabled: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO notification_settings (alert_type, enabled, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT (alert_type) DO UPDATE SET
                 enabled = excluded.enabled, updated_at = excluded.updated_at"#,
        )
        .bind(kind.as_str())
        .bind(enabled as i64)
        .bind(crate::core::types::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Digest aggregations
    // ========================================================================

    pub async fn trades_summary(
        &self,
        cutoff_ms: i64,
        spot_min_usd: f64,
        futures_min_usd: f64,
    ) -> Result<Vec<SummaryRow>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT market, side, COUNT(*) AS cnt, SUM(quantity_usd) AS total_usd
               FROM large_trades
               WHERE timestamp >= ?
                 AND quantity_usd >= CASE WHEN market = 'futures' THEN ? ELSE ? END
               GROUP BY market, side ORDER BY market, side"#,
        )
        .bind(cutoff_ms)
        .bind(futures_min_usd)
        .bind(spot_min_usd)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SummaryRow {
                market: r.get("market"),
                side: r.get("side"),
                count: r.get("cnt"),
                total_usd: r.get::<Option<f64>, _>("total_usd").unwrap_or(0.0),
            })
            .collect())
    }

    pub async fn walls_summary(
        &self,
        cutoff_ms: i64,
        spot_min_usd: f64,
        futures_min_usd: f64,
    ) -> Result<Vec<SummaryRow>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT market, side, COUNT(*) AS cnt, SUM(size_usd) AS total_usd
               FROM orderbook_walls
               WHERE detected_at >= ?
                 AND size_usd >= CASE WHEN market = 'futures' THEN ? ELSE ? END
               GROUP BY market, side ORDER BY market, side"#,
        )
        .bind(cutoff_ms)
        .bind(futures_min_usd)
        .bind(spot_min_usd)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SummaryRow {
                market: r.get("market"),
                side: r.get("side"),
                count: r.get("cnt"),
                total_usd: r.get::<Option<f64>, _>("total_usd").unwrap_or(0.0),
            })
            .collect())
    }

    pub async fn cvd_summary(&self, cutoff_sec: i64) -> Result<Vec<(String, f64)>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT market, SUM(delta_usd) AS delta FROM trade_aggregates_1m
               WHERE minute_epoch >= ? GROUP BY market ORDER BY market"#,
        )
        .bind(cutoff_sec)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get("market"),
                    r.get::<Option<f64>, _>("delta").unwrap_or(0.0),
                )
            })
            .collect())
    }

    /// Futures mid at the start of the window and the latest one.
    pub async fn price_range(&self, cutoff_sec: i64) -> Result<Option<(f64, f64)>, StoreError> {
        let start = sqlx::query(
            r#"SELECT mid_price FROM ob_snapshots_1m
               WHERE market = 'futures' AND minute_epoch >= ?
               ORDER BY minute_epoch ASC LIMIT 1"#,
        )
        .bind(cutoff_sec)
        .fetch_optional(&self.pool)
        .await?;
        let end = sqlx::query(
            r#"SELECT mid_price FROM ob_snapshots_1m
               WHERE market = 'futures'
               ORDER BY minute_epoch DESC LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(match (start, end) {
            (Some(s), Some(e)) => Some((s.get("mid_price"), e.get("mid_price"))),
            _ => None,
        })
    }

    pub async fn latest_imbalance(&self) -> Result<Vec<(String, f64)>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT market, imbalance_1pct FROM ob_snapshots_1m
               WHERE (market, minute_epoch) IN (
                 SELECT market, MAX(minute_epoch) FROM ob_snapshots_1m GROUP BY market
               )"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get("market"),
                    r.get::<Option<f64>, _>("imbalance_1pct").unwrap_or(0.0),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LiqSide, TradeSide};

    fn sample_wall() -> WallOpen<'static> {
        WallOpen {
            market: Market::Futures,
            side: BookSide::Bid,
            price: "50000.00",
            detected_at_ms: 1_700_000_000_000,
            size_btc: 50.0,
            size_usd: 2_500_000.0,
            price_at_detection: 50_500.0,
            distance_pct: -0.99,
        }
    }

    #[tokio::test]
    async fn test_wall_open_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.wall_opened(&sample_wall()).await.unwrap();
        store.wall_opened(&sample_wall()).await.unwrap();
        let walls = store.active_walls().await.unwrap();
        assert_eq!(walls.len(), 1);
        assert_eq!(walls[0].price, "50000.00");
        assert_eq!(walls[0].market, Market::Futures);
    }

    #[tokio::test]
    async fn test_wall_lifecycle_close() {
        let store = Store::in_memory().await.unwrap();
        store.wall_opened(&sample_wall()).await.unwrap();
        store
            .wall_closed(
                Market::Futures,
                BookSide::Bid,
                "50000.00",
                1_700_000_000_000,
                "filled",
                50_400.0,
                1_700_000_065_000,
            )
            .await
            .unwrap();
        assert!(store.active_walls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peak_only_grows() {
        let store = Store::in_memory().await.unwrap();
        store.wall_opened(&sample_wall()).await.unwrap();
        store
            .wall_updated(Market::Futures, BookSide::Bid, "50000.00", 1_700_000_000_000, 60.0, 3_000_000.0)
            .await
            .unwrap();
        store
            .wall_updated(Market::Futures, BookSide::Bid, "50000.00", 1_700_000_000_000, 40.0, 2_000_000.0)
            .await
            .unwrap();
        let walls = store.active_walls().await.unwrap();
        assert_eq!(walls[0].size_usd, 2_000_000.0);
        assert_eq!(walls[0].peak_size_usd, 3_000_000.0);
    }

    #[tokio::test]
    async fn test_mark_walls_unknown() {
        let store = Store::in_memory().await.unwrap();
        store.wall_opened(&sample_wall()).await.unwrap();
        let n = store.mark_walls_unknown(1_700_000_100_000).await.unwrap();
        assert_eq!(n, 1);
        assert!(store.active_walls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bucket_upsert_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let bucket = BucketRow {
            buy_volume_usd: 1000.0,
            sell_volume_usd: 400.0,
            buy_count: 3,
            sell_count: 2,
            delta_usd: 600.0,
            cvd_usd: 600.0,
            max_trade_usd: 700.0,
            vwap: 50_000.0,
        };
        store
            .upsert_trade_bucket(Market::Spot, 1_700_000_040, &bucket)
            .await
            .unwrap();
        store
            .upsert_trade_bucket(Market::Spot, 1_700_000_040, &bucket)
            .await
            .unwrap();
        let sum = store.delta_sum_since(Market::Spot, 0).await.unwrap();
        assert_eq!(sum, 600.0);
    }

    #[tokio::test]
    async fn test_cvd_tail_sums_buckets() {
        let store = Store::in_memory().await.unwrap();
        for (minute, delta) in [(100, 10.0_f64), (160, -4.0), (220, 6.0)] {
            let bucket = BucketRow {
                buy_volume_usd: delta.max(0.0),
                sell_volume_usd: (-delta).max(0.0),
                buy_count: 1,
                sell_count: 1,
                delta_usd: delta,
                cvd_usd: 0.0,
                max_trade_usd: 0.0,
                vwap: 0.0,
            };
            store
                .upsert_trade_bucket(Market::Futures, minute, &bucket)
                .await
                .unwrap();
        }
        assert_eq!(store.delta_sum_since(Market::Futures, 0).await.unwrap(), 12.0);
        assert_eq!(store.delta_sum_since(Market::Futures, 160).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_notification_settings_default_enabled() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.notification_enabled(AlertKind::WallNew).await.unwrap());
        store.set_notification(AlertKind::WallNew, false).await.unwrap();
        assert!(!store.notification_enabled(AlertKind::WallNew).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_only_logs() {
        let store = Store::in_memory().await.unwrap();
        let trade = TradeEvent {
            market: Market::Spot,
            side: TradeSide::Buy,
            price: 50_000.0,
            quantity: 3.0,
            notional_usd: 150_000.0,
            is_buyer_maker: false,
            timestamp_ms: 1_700_000_000_000,
        };
        store.insert_large_trade(&trade).await.unwrap();
        let liq = LiquidationEvent {
            symbol: "BTCUSDT".to_string(),
            side: LiqSide::Long,
            price: 50_000.0,
            quantity: 30.0,
            notional_usd: 1_500_000.0,
            order_type: "LIMIT".to_string(),
            timestamp_ms: 1_700_000_000_000,
        };
        store.insert_liquidation(&liq).await.unwrap();
        store.insert_alert_log(AlertKind::Liquidation, "test").await.unwrap();

        let summary = store
            .trades_summary(0, 100_000.0, 500_000.0)
            .await
            .unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].market, "spot");
        assert_eq!(summary[0].count, 1);
    }
}
