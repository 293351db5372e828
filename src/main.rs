// wallwatch daemon - wiring and lifecycle
// Startup: config -> store -> sink/router -> books -> trackers -> streams.
// Shutdown: stop streams, flush buckets and pending alerts within the grace
// window, mark open walls unknown, close the store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use wallwatch::alerts::format::format_duration;
use wallwatch::alerts::{AlertRouter, TelegramSink};
use wallwatch::core::config::Settings;
use wallwatch::core::logger::setup_logging;
use wallwatch::core::types::{now_ms, LiquidationEvent, Market, TradeEvent};
use wallwatch::layer1::{DepthRestClient, StreamConsumer, WsManager};
use wallwatch::layer2::orderbook::{ApplyOutcome, MarketBook};
use wallwatch::layer2::parser::DepthUpdate;
use wallwatch::layer2::snapshots::{run_maintenance_loop, SnapshotCoordinator};
use wallwatch::layer3::{DigestScheduler, LiquidationFilter, TradeAggregator, WallTracker};
use wallwatch::store::Store;

const SHUTDOWN_GRACE_SECS: u64 = 5;
const BUCKET_FLUSH_SECS: u64 = 60;

/// Fans stream events out to the books, aggregators and filters, and turns
/// connection lifecycle into system alerts and re-anchor requests.
struct Pipeline {
    books: HashMap<Market, Arc<MarketBook>>,
    walls: Arc<WallTracker>,
    aggregators: HashMap<Market, Arc<TradeAggregator>>,
    liquidations: Arc<LiquidationFilter>,
    router: Arc<AlertRouter>,
    resync_tx: mpsc::Sender<Market>,
}

#[async_trait]
impl StreamConsumer for Pipeline {
    async fn on_depth(&self, market: Market, update: DepthUpdate) {
        let Some(book) = self.books.get(&market) else {
            return;
        };
        match book.apply_diff(update) {
            ApplyOutcome::Applied(changes) => {
                if !changes.is_empty() {
                    self.walls.on_book_changes(market, changes).await;
                }
            }
            ApplyOutcome::Desynced => {
                // The recovery loop would catch this within its poll; the
                // nudge shortens the window.
                let _ = self.resync_tx.try_send(market);
            }
            ApplyOutcome::Buffered | ApplyOutcome::Dropped => {}
        }
    }

    async fn on_trade(&self, trade: TradeEvent) {
        if let Some(agg) = self.aggregators.get(&trade.market) {
            agg.on_trade(&trade).await;
        }
    }

    async fn on_liquidation(&self, event: LiquidationEvent) {
        self.liquidations.on_liquidation(&event).await;
    }

    async fn on_connected(&self, market: Market) {
        if self.resync_tx.send(market).await.is_err() {
            warn!(market = %market, "resync channel closed");
        }
    }

    async fn on_ws_down(&self, market: Market, reason: &str, down_secs: i64) {
        let text = format!(
            "\u{1f534} {} WS disconnected\n\u{1f4db} reason: {}\n\u{23f1} down {}",
            market_title(market),
            reason,
            format_duration(down_secs),
        );
        self.router
            .system_notice(&format!("ws_down:{}", market), text)
            .await;
    }

    async fn on_ws_recover(&self, market: Market, down_secs: i64) {
        let text = format!(
            "\u{2705} {} WS recovered\n\u{23f1} downtime: {}",
            market_title(market),
            format_duration(down_secs),
        );
        self.router
            .system_notice(&format!("ws_recover:{}", market), text)
            .await;
    }
}

fn market_title(market: Market) -> &'static str {
    match market {
        Market::Spot => "Spot",
        Market::Futures => "Futures",
    }
}

async fn run_bucket_flusher(aggregators: Vec<Arc<TradeAggregator>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(BUCKET_FLUSH_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        for agg in &aggregators {
            agg.flush_completed().await;
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::var("WALLWATCH_CONFIG").ok();
    let settings = match Settings::load(config_path.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    setup_logging(&settings.log_level, settings.log_json);
    if let Err(e) = settings.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    info!("=== wallwatch starting ===");

    let store = match Store::connect(&settings.store.db_path).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "store initialization failed");
            std::process::exit(1);
        }
    };

    let sink = match TelegramSink::new(&settings.sink) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "sink initialization failed");
            std::process::exit(1);
        }
    };
    // Unknown channel keys are fatal here, before any stream is opened.
    let router = match AlertRouter::new(&settings, sink, store.clone()) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "alert routing unresolvable");
            std::process::exit(1);
        }
    };

    let mut books: HashMap<Market, Arc<MarketBook>> = HashMap::new();
    for market in Market::ALL {
        books.insert(market, Arc::new(MarketBook::new(market, &settings.thresholds)));
    }

    let walls = Arc::new(WallTracker::new(
        settings.thresholds.clone(),
        store.clone(),
        router.clone(),
    ));
    match walls.recover().await {
        Ok(count) => info!(walls = count, "wall state recovered"),
        Err(e) => warn!(error = %e, "wall recovery failed, starting empty"),
    }

    let mut aggregators: HashMap<Market, Arc<TradeAggregator>> = HashMap::new();
    for market in Market::ALL {
        let agg = Arc::new(TradeAggregator::new(
            market,
            settings.thresholds.clone(),
            store.clone(),
            router.clone(),
        ));
        if let Err(e) = agg.recover_cvd(settings.store.cvd_recovery_horizon_min).await {
            warn!(market = %market, error = %e, "CVD recovery failed, starting at zero");
        }
        aggregators.insert(market, agg);
    }

    let liquidations = Arc::new(LiquidationFilter::new(
        "BTCUSDT",
        settings.thresholds.clone(),
        store.clone(),
        router.clone(),
    ));

    let rest = match DepthRestClient::new(&settings.exchange) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "REST client initialization failed");
            std::process::exit(1);
        }
    };
    let coordinator = Arc::new(SnapshotCoordinator::new(
        books.clone(),
        rest,
        walls.clone(),
    ));

    let (resync_tx, resync_rx) = mpsc::channel::<Market>(16);
    let pipeline = Arc::new(Pipeline {
        books: books.clone(),
        walls: walls.clone(),
        aggregators: aggregators.clone(),
        liquidations,
        router: router.clone(),
        resync_tx,
    });

    coordinator.cold_start().await;

    let ws = WsManager::new(settings.exchange.clone(), pipeline);
    ws.start();

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(coordinator.clone().run_resync_listener(resync_rx)));
    tasks.push(tokio::spawn(coordinator.clone().run_refresh_loop()));
    tasks.push(tokio::spawn(coordinator.clone().run_recovery_loop()));
    tasks.push(tokio::spawn(run_maintenance_loop(
        books.clone(),
        store.clone(),
        router.clone(),
        settings.thresholds.clone(),
    )));
    tasks.push(tokio::spawn(walls.clone().run_confirmed_loop(books.clone())));
    tasks.push(tokio::spawn(router.clone().run_flush_loop()));
    tasks.push(tokio::spawn(run_bucket_flusher(
        aggregators.values().cloned().collect(),
    )));
    tasks.push(tokio::spawn(
        Arc::new(DigestScheduler::new(
            settings.digest_periods_min.clone(),
            settings.thresholds.clone(),
            store.clone(),
            router.clone(),
        ))
        .run(),
    ));

    info!("all tasks started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutdown signal received");

    ws.stop();
    for task in tasks {
        task.abort();
    }

    let flush = async {
        for agg in aggregators.values() {
            agg.flush_now().await;
        }
        if let Err(e) = store.mark_walls_unknown(now_ms()).await {
            warn!(error = %e, "marking walls unknown failed");
        }
        router.flush_once(true).await;
    };
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), flush)
        .await
        .is_err()
    {
        warn!("shutdown grace period expired with work pending");
    }

    store.close().await;
    info!("=== wallwatch stopped ===");
}
