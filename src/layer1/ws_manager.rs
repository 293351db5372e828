// WebSocket Manager - one combined-stream connection per market
// Auto-reconnect with exponential backoff, per-connection silence watchdog,
// envelope routing to the depth/trade/liquidation consumers

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::{now_ms, Market};
use crate::layer2::parser::{
    parse_depth_update, parse_liquidation, parse_trade, route_stream, StreamEnvelope, StreamRoute,
};

/// A disconnect must last this long before the system alert fires.
const DOWN_ALERT_AFTER_SECS: i64 = 30;

/// Watchdog poll interval.
const WATCHDOG_POLL_SECS: u64 = 10;

/// Receives decoded events and connection lifecycle notifications.
/// Implementations fan events out to the book, aggregators and alert router.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    async fn on_depth(&self, market: Market, update: crate::layer2::parser::DepthUpdate);
    async fn on_trade(&self, trade: crate::core::types::TradeEvent);
    async fn on_liquidation(&self, event: crate::core::types::LiquidationEvent);
    /// Connection (re)established; the book for this market needs an anchor.
    async fn on_connected(&self, market: Market);
    async fn on_ws_down(&self, market: Market, reason: &str, down_secs: i64);
    async fn on_ws_recover(&self, market: Market, down_secs: i64);
}

#[derive(Debug, Clone)]
pub struct ConnStatus {
    pub market: Market,
    pub connected: bool,
    pub uptime_secs: i64,
    pub messages: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
}

struct ConnShared {
    connected: AtomicBool,
    last_message_ms: AtomicI64,
    /// 0 while up; otherwise when the current outage started.
    disconnect_since_ms: AtomicI64,
    down_alerted: AtomicBool,
    got_first_message: AtomicBool,
    uptime_start_ms: AtomicI64,
    messages: AtomicU64,
    parse_errors: AtomicU64,
    reconnects: AtomicU64,
    last_reason: Mutex<String>,
}

impl ConnShared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(0),
            disconnect_since_ms: AtomicI64::new(0),
            down_alerted: AtomicBool::new(false),
            got_first_message: AtomicBool::new(false),
            uptime_start_ms: AtomicI64::new(0),
            messages: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_reason: Mutex::new(String::new()),
        }
    }
}

/// Supervises one long-lived logical connection per market stream set.
pub struct WsManager {
    exchange: ExchangeConfig,
    consumer: Arc<dyn StreamConsumer>,
    running: Arc<AtomicBool>,
    states: HashMap<Market, Arc<ConnShared>>,
    conn_handles: Arc<Mutex<HashMap<Market, AbortHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsManager {
    pub fn new(exchange: ExchangeConfig, consumer: Arc<dyn StreamConsumer>) -> Self {
        let mut states = HashMap::new();
        for market in Market::ALL {
            states.insert(market, Arc::new(ConnShared::new()));
        }
        Self {
            exchange,
            consumer,
            running: Arc::new(AtomicBool::new(false)),
            states,
            conn_handles: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a supervisor and a silence watchdog for each market.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();

        for market in Market::ALL {
            let url = match market {
                Market::Futures => self.exchange.futures_ws_url.clone(),
                Market::Spot => self.exchange.spot_ws_url.clone(),
            };
            let shared = self.states[&market].clone();

            tasks.push(tokio::spawn(run_supervisor(
                market,
                url,
                self.exchange.clone(),
                self.consumer.clone(),
                self.running.clone(),
                shared.clone(),
                self.conn_handles.clone(),
            )));
            tasks.push(tokio::spawn(run_watchdog(
                market,
                self.exchange.ws_silence_timeout_secs,
                self.consumer.clone(),
                self.running.clone(),
                shared,
                self.conn_handles.clone(),
            )));
        }
        info!("WebSocket manager started");
    }

    /// Operator shutdown: connection tasks observing cancellation with
    /// `running == false` terminate instead of reconnecting.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for (_, handle) in self.conn_handles.lock().drain() {
            handle.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("WebSocket manager stopped");
    }

    pub fn status(&self) -> Vec<ConnStatus> {
        let now = now_ms();
        Market::ALL
            .iter()
            .map(|market| {
                let s = &self.states[market];
                let connected = s.connected.load(Ordering::SeqCst);
                let uptime_start = s.uptime_start_ms.load(Ordering::SeqCst);
                ConnStatus {
                    market: *market,
                    connected,
                    uptime_secs: if connected && uptime_start > 0 {
                        (now - uptime_start) / 1000
                    } else {
                        0
                    },
                    messages: s.messages.load(Ordering::SeqCst),
                    parse_errors: s.parse_errors.load(Ordering::SeqCst),
                    reconnects: s.reconnects.load(Ordering::SeqCst),
                }
            })
            .collect()
    }
}

/// Reconnect loop for one market. Backoff doubles 5 -> 300s, restarts at
/// the base once a connection has delivered a valid message, and resets to
/// zero when the watchdog forced the reconnect.
async fn run_supervisor(
    market: Market,
    url: String,
    exchange: ExchangeConfig,
    consumer: Arc<dyn StreamConsumer>,
    running: Arc<AtomicBool>,
    shared: Arc<ConnShared>,
    conn_handles: Arc<Mutex<HashMap<Market, AbortHandle>>>,
) {
    let base = exchange.ws_reconnect_delay_secs.max(1);
    let max = exchange.ws_reconnect_max_delay_secs.max(base);
    let mut delay = base;
    let mut first_attempt = true;

    while running.load(Ordering::SeqCst) {
        if !first_attempt {
            shared.reconnects.fetch_add(1, Ordering::SeqCst);
        }
        first_attempt = false;
        shared.got_first_message.store(false, Ordering::SeqCst);

        let conn = tokio::spawn(run_connection(
            market,
            url.clone(),
            consumer.clone(),
            shared.clone(),
        ));
        conn_handles.lock().insert(market, conn.abort_handle());
        let result = conn.await;
        conn_handles.lock().remove(&market);

        // Whatever ended the task, the manager clears `connected` before
        // deciding on reconnect.
        shared.connected.store(false, Ordering::SeqCst);
        if shared.disconnect_since_ms.load(Ordering::SeqCst) == 0 {
            shared.disconnect_since_ms.store(now_ms(), Ordering::SeqCst);
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }

        // First valid message on the last connection restarts the schedule.
        if shared.got_first_message.load(Ordering::SeqCst) {
            delay = base;
        }

        let watchdog_cancelled = matches!(&result, Err(e) if e.is_cancelled());
        if watchdog_cancelled {
            // running is still true: watchdog-induced, not shutdown.
            *shared.last_reason.lock() = "silence (no data)".to_string();
            info!(market = %market, "forced reconnect by watchdog");
            delay = base;
            continue;
        }

        info!(market = %market, delay_secs = delay, "reconnecting");
        tokio::time::sleep(Duration::from_secs(delay)).await;
        delay = (delay * 2).min(max);
    }
}

/// One connection attempt: connect, announce, route messages until the
/// stream ends or the watchdog aborts the task.
async fn run_connection(
    market: Market,
    url: String,
    consumer: Arc<dyn StreamConsumer>,
    shared: Arc<ConnShared>,
) {
    info!(market = %market, "connecting to WebSocket");
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            error!(market = %market, error = %e, "WebSocket connect failed");
            *shared.last_reason.lock() = format!("connect failed: {}", e);
            return;
        }
    };

    shared.connected.store(true, Ordering::SeqCst);
    shared.uptime_start_ms.store(now_ms(), Ordering::SeqCst);
    info!(market = %market, "WebSocket connected");

    // The book for this market needs a fresh anchor after every connect.
    consumer.on_connected(market).await;

    let (mut write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                shared.last_message_ms.store(now_ms(), Ordering::SeqCst);
                shared.messages.fetch_add(1, Ordering::SeqCst);

                if !shared.got_first_message.swap(true, Ordering::SeqCst) {
                    let since = shared.disconnect_since_ms.swap(0, Ordering::SeqCst);
                    if since > 0 {
                        shared.down_alerted.store(false, Ordering::SeqCst);
                        let down_secs = (now_ms() - since) / 1000;
                        consumer.on_ws_recover(market, down_secs).await;
                    }
                }

                dispatch(market, &text, &consumer, &shared).await;
            }
            Ok(Message::Ping(data)) => {
                shared.last_message_ms.store(now_ms(), Ordering::SeqCst);
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Pong(_)) => {
                shared.last_message_ms.store(now_ms(), Ordering::SeqCst);
            }
            Ok(Message::Close(_)) => {
                warn!(market = %market, "WebSocket closed by server");
                *shared.last_reason.lock() = "closed by server".to_string();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(market = %market, error = %e, "WebSocket error");
                *shared.last_reason.lock() = e.to_string();
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!(market = %market, "connection task finished");
}

async fn dispatch(
    market: Market,
    text: &str,
    consumer: &Arc<dyn StreamConsumer>,
    shared: &Arc<ConnShared>,
) {
    let envelope: StreamEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            shared.parse_errors.fetch_add(1, Ordering::SeqCst);
            debug!(market = %market, error = %e, "unparseable frame");
            return;
        }
    };

    let route = match route_stream(&envelope.stream) {
        Ok(r) => r,
        Err(e) => {
            shared.parse_errors.fetch_add(1, Ordering::SeqCst);
            debug!(market = %market, error = %e, "unroutable stream");
            return;
        }
    };

    match route {
        StreamRoute::Depth => match parse_depth_update(&envelope.data) {
            Ok(update) => consumer.on_depth(market, update).await,
            Err(e) => {
                shared.parse_errors.fetch_add(1, Ordering::SeqCst);
                warn!(market = %market, error = %e, "bad depth payload");
            }
        },
        StreamRoute::Trade => match parse_trade(&envelope.data, market) {
            Ok(trade) => consumer.on_trade(trade).await,
            Err(e) => {
                shared.parse_errors.fetch_add(1, Ordering::SeqCst);
                warn!(market = %market, error = %e, "bad trade payload");
            }
        },
        StreamRoute::Liquidation => match parse_liquidation(&envelope.data) {
            Ok(event) => consumer.on_liquidation(event).await,
            Err(e) => {
                shared.parse_errors.fetch_add(1, Ordering::SeqCst);
                warn!(market = %market, error = %e, "bad liquidation payload");
            }
        },
    }
}

/// Silence watchdog for one connection. Cancels the connection task after
/// `silence_timeout` without a message; the supervisor interprets the
/// cancellation (running still true) as reconnect-now. Also owns the
/// "disconnected for >= 30s" system alert.
async fn run_watchdog(
    market: Market,
    silence_timeout_secs: u64,
    consumer: Arc<dyn StreamConsumer>,
    running: Arc<AtomicBool>,
    shared: Arc<ConnShared>,
    conn_handles: Arc<Mutex<HashMap<Market, AbortHandle>>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(WATCHDOG_POLL_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let now = now_ms();

        let last = shared.last_message_ms.load(Ordering::SeqCst);
        if shared.connected.load(Ordering::SeqCst)
            && last > 0
            && now - last > (silence_timeout_secs as i64) * 1000
        {
            warn!(
                market = %market,
                silent_secs = (now - last) / 1000,
                "no data, forcing reconnect"
            );
            let handle = conn_handles.lock().remove(&market);
            if let Some(handle) = handle {
                handle.abort();
            }
        }

        let since = shared.disconnect_since_ms.load(Ordering::SeqCst);
        if !shared.connected.load(Ordering::SeqCst)
            && since > 0
            && now - since >= DOWN_ALERT_AFTER_SECS * 1000
            && !shared.down_alerted.swap(true, Ordering::SeqCst)
        {
            let reason = shared.last_reason.lock().clone();
            consumer.on_ws_down(market, &reason, (now - since) / 1000).await;
        }
    }
}
