// =============================================================================
// Binance USDT-M Futures Connector — signed REST + WebSocket streams
// =============================================================================
//
// Pure-HTTP implementation: all REST calls go through reqwest with
// HMAC-SHA256 signing, all streams through tokio-tungstenite. No SDK.
//
// SECURITY: The secret key is never logged or serialized. The API key is sent
// as the X-MBX-APIKEY header, never in query params.
//
// Responsibilities:
//   - clock sync (+ auto-resync on -1021)
//   - symbol precision metadata from exchangeInfo
//   - order routing: conditional orders (STOP_MARKET / TAKE_PROFIT_MARKET /
//     OCO) go to the algo endpoint, LIMIT/MARKET to the regular endpoint
//   - ReduceOnly sync-lag recovery (-2022 / -4118): poll positions, retry
//   - market-data WS with a batched, throttled subscription worker
//   - user-data WS with listen-key keepalive and expiry recovery
//   - hard_reset as the watchdog's panic button
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::binance::classify::ApiError;
use crate::binance::queue::BoundedQueue;
use crate::binance::rate_limit::{EndpointClass, RateLimiter};
use crate::events::{OrderBookEvent, OrderUpdate};
use crate::resilience::{ErrorHandler, RetryConfig};
use crate::types::{OrderSide, Side, Tick, TickSide, TradeMode};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW_MS: u64 = 5000;

/// Order types that must be routed to the algo endpoint.
const ALGO_ORDER_TYPES: &[&str] = &[
    "STOP_MARKET",
    "STOP",
    "TAKE_PROFIT_MARKET",
    "TAKE_PROFIT",
    "TRAILING_STOP_MARKET",
    "OCO",
];

/// Subscription batching limits (Binance rejects bursts above ~5 msg/s).
const SUBSCRIPTION_BATCH_SIZE: usize = 20;
const SUBSCRIPTION_THROTTLE: Duration = Duration::from_millis(500);

/// A WS whose last message is older than this is considered stale.
const WS_STALE_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Precision + limits metadata for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolMeta {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub price_decimals: u32,
    pub qty_decimals: u32,
}

/// 24h ticker snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerData {
    pub symbol: String,
    pub last: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub volume: f64,
    pub timestamp_ms: i64,
}

/// Best bid/ask from the bulk book-ticker endpoint.
#[derive(Debug, Clone)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

/// One kline row from `/fapi/v1/klines`.
#[derive(Debug, Clone)]
pub struct OhlcvBar {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// An open position as reported by `/fapi/v2/positionRisk`.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute position size in contracts.
    pub amount: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// A fill from `/fapi/v1/userTrades`.
#[derive(Debug, Clone)]
pub struct FillInfo {
    pub id: String,
    pub order_id: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub timestamp_ms: i64,
}

/// Normalized order response (regular or algo).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub price: f64,
    pub stop_price: f64,
    pub amount: f64,
    pub filled: f64,
    pub average: f64,
    pub order_type: String,
    pub side: String,
    pub is_algo: bool,
}

/// Extra order attributes beyond the positional arguments.
#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub client_order_id: Option<String>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub stop_price: Option<f64>,
}

/// Result of a native OCO bracket submission.
#[derive(Debug, Clone)]
pub struct OcoBracket {
    pub client_algo_id: String,
    pub exchange_tp_id: String,
    pub exchange_sl_id: String,
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct BinanceConnector {
    mode: TradeMode,
    base_url: String,
    ws_url: String,
    api_key: String,
    secret: String,
    http: reqwest::Client,

    time_offset_ms: AtomicI64,
    connected: AtomicBool,
    /// Bumped on every close; background loops from older generations exit.
    generation: AtomicU64,

    markets: RwLock<HashMap<String, SymbolMeta>>,
    tickers: RwLock<HashMap<String, TickerData>>,
    last_tickers_refresh: RwLock<Option<Instant>>,
    tickers_fetch_gate: tokio::sync::Mutex<()>,

    pub rate_limiter: RateLimiter,
    error_handler: Arc<ErrorHandler>,

    trade_queues: RwLock<HashMap<String, Arc<BoundedQueue<Tick>>>>,
    ticker_queues: RwLock<HashMap<String, Arc<BoundedQueue<TickerData>>>>,
    book_queues: RwLock<HashMap<String, Arc<BoundedQueue<OrderBookEvent>>>>,

    market_sink: tokio::sync::Mutex<Option<WsSink>>,
    active_subscriptions: Mutex<HashSet<String>>,
    sub_queue: Mutex<VecDeque<String>>,
    sub_notify: Notify,

    listen_key: RwLock<Option<String>>,
    order_updates: RwLock<Option<broadcast::Sender<OrderUpdate>>>,

    last_market_msg_ms: AtomicI64,
    last_user_msg_ms: AtomicI64,
    market_ws_alive: AtomicBool,
    user_ws_alive: AtomicBool,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BinanceConnector {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        mode: TradeMode,
        error_handler: Arc<ErrorHandler>,
    ) -> Self {
        let (base_url, ws_url) = match mode {
            TradeMode::Live => (
                "https://fapi.binance.com".to_string(),
                "wss://fstream.binance.com/ws".to_string(),
            ),
            _ => (
                "https://testnet.binancefuture.com".to_string(),
                "wss://stream.binancefuture.com/ws".to_string(),
            ),
        };

        let api_key = api_key.into();

        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            mode,
            base_url,
            ws_url,
            api_key,
            secret: secret.into(),
            http,
            time_offset_ms: AtomicI64::new(0),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            markets: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            last_tickers_refresh: RwLock::new(None),
            tickers_fetch_gate: tokio::sync::Mutex::new(()),
            rate_limiter: RateLimiter::binance(),
            error_handler,
            trade_queues: RwLock::new(HashMap::new()),
            ticker_queues: RwLock::new(HashMap::new()),
            book_queues: RwLock::new(HashMap::new()),
            market_sink: tokio::sync::Mutex::new(None),
            active_subscriptions: Mutex::new(HashSet::new()),
            sub_queue: Mutex::new(VecDeque::new()),
            sub_notify: Notify::new(),
            listen_key: RwLock::new(None),
            order_updates: RwLock::new(None),
            last_market_msg_ms: AtomicI64::new(0),
            last_user_msg_ms: AtomicI64::new(0),
            market_ws_alive: AtomicBool::new(false),
            user_ws_alive: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> TradeMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register the channel that receives normalized user-data order updates.
    pub fn set_order_update_sender(&self, tx: broadcast::Sender<OrderUpdate>) {
        *self.order_updates.write() = Some(tx);
    }

    // -------------------------------------------------------------------------
    // Signing & low-level request
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Current timestamp in exchange time (local + synced offset).
    pub fn timestamp_ms(&self) -> i64 {
        Self::local_now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// One HTTP attempt: rate-limit token, send, decode errors into ApiError.
    async fn raw_request(
        &self,
        method: &str,
        endpoint: &str,
        params: &str,
        signed: bool,
        class: EndpointClass,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.rate_limiter.acquire(class).await?;

        // The signed query carries a fresh timestamp per attempt so that a
        // retry after clock resync signs correctly.
        let query = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.base_url, endpoint, query)
        };

        let mut req = match method {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            "PUT" => self.http.put(&url),
            "DELETE" => self.http.delete(&url),
            other => bail!("unsupported HTTP method: {other}"),
        };
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{method} {endpoint} request failed"))?;

        let status = resp.status().as_u16();
        let text = resp.text().await.context("failed to read response body")?;

        if status == 200 {
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).context("failed to parse response JSON");
        }

        let (code, msg) = match serde_json::from_str::<Value>(&text) {
            Ok(body) => (
                body.get("code").and_then(Value::as_i64).unwrap_or(status as i64),
                body.get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or(&text)
                    .to_string(),
            ),
            Err(_) => (status as i64, text.clone()),
        };

        // Timestamp outside recvWindow: resync the clock so that the retry
        // layer's next attempt signs with a corrected offset.
        if code == -1021 {
            warn!("timestamp error (-1021) detected, resyncing clock");
            self.sync_time().await;
        }

        Err(anyhow::Error::new(ApiError {
            code,
            msg,
            http_status: status,
        }))
    }

    /// Request with classified retries.
    async fn request(
        &self,
        method: &'static str,
        endpoint: &'static str,
        params: String,
        signed: bool,
        class: EndpointClass,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let context = format!("binance.{endpoint}");
        self.error_handler
            .execute(
                || self.raw_request(method, endpoint, &params, signed, class, timeout),
                RetryConfig::default(),
                &context,
            )
            .await
    }

    // -------------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------------

    /// Connect: sync clock, load markets, verify one-way mode, start streams.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        info!(mode = %self.mode, "connecting to Binance futures");

        self.sync_time().await;
        if self.time_offset_ms.load(Ordering::Relaxed) == 0 {
            // sync_time logs its own failure; a zero offset right after start
            // may be legitimate, so probe once more to surface hard failures.
            let _ = self
                .raw_request("GET", "/fapi/v1/time", "", false, EndpointClass::Default, None)
                .await
                .context("exchange time endpoint unreachable")?;
        }

        let exchange_info = self
            .request(
                "GET",
                "/fapi/v1/exchangeInfo",
                String::new(),
                false,
                EndpointClass::MarketData,
                None,
            )
            .await
            .context("failed to load exchange info")?;
        self.process_markets(&exchange_info)?;
        info!(markets = self.markets.read().len(), "markets loaded");

        // One-way position mode is required for the bracket logic.
        match self
            .request(
                "GET",
                "/fapi/v1/positionSide/dual",
                String::new(),
                true,
                EndpointClass::Account,
                None,
            )
            .await
        {
            Ok(mode) => {
                if mode.get("dualSidePosition").and_then(Value::as_bool) == Some(true) {
                    info!("hedge mode detected, switching to one-way");
                    self.request(
                        "POST",
                        "/fapi/v1/positionSide/dual",
                        "dualSidePosition=false".to_string(),
                        true,
                        EndpointClass::Account,
                        None,
                    )
                    .await
                    .context("failed to switch to one-way position mode")?;
                }
            }
            Err(e) => warn!(error = %e, "position mode check failed"),
        }

        let gen = self.generation.load(Ordering::SeqCst);
        let mut tasks = self.tasks.lock();

        let me = self.clone();
        tasks.push(tokio::spawn(async move { me.run_market_stream(gen).await }));
        let me = self.clone();
        tasks.push(tokio::spawn(async move { me.run_subscription_worker(gen).await }));

        if !self.api_key.is_empty() && !self.secret.is_empty() {
            let me = self.clone();
            tasks.push(tokio::spawn(async move { me.run_user_stream(gen).await }));
            let me = self.clone();
            tasks.push(tokio::spawn(async move { me.run_listen_key_keepalive(gen).await }));
        } else {
            warn!("API keys missing, user-data stream disabled");
        }

        drop(tasks);
        self.connected.store(true, Ordering::SeqCst);
        info!("connector ready");
        Ok(())
    }

    /// Force re-synchronization of local time with the exchange server.
    pub async fn sync_time(&self) {
        let url = format!("{}/fapi/v1/time", self.base_url);
        match self.http.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(body) => {
                    if let Some(server_time) = body.get("serverTime").and_then(Value::as_i64) {
                        let offset = server_time - Self::local_now_ms();
                        let old = self.time_offset_ms.swap(offset, Ordering::Relaxed);
                        info!(old_offset_ms = old, new_offset_ms = offset, "clock synced");
                    }
                }
                Err(e) => error!(error = %e, "time sync parse failed"),
            },
            Err(e) => error!(error = %e, "time sync request failed"),
        }
    }

    /// Close all streams and background tasks. REST stays usable.
    pub async fn close(&self) {
        info!("closing connector streams");
        self.generation.fetch_add(1, Ordering::SeqCst);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(mut sink) = self.market_sink.lock().await.take() {
            let _ = sink.close().await;
        }

        self.market_ws_alive.store(false, Ordering::SeqCst);
        self.user_ws_alive.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Emergency panic button: kill everything, drain queues, reconnect.
    pub async fn hard_reset(self: &Arc<Self>) -> Result<()> {
        error!("HARD RESET triggered, emergency recovery in progress");

        self.close().await;

        self.sub_queue.lock().clear();
        for q in self.trade_queues.read().values() {
            q.clear();
        }
        for q in self.ticker_queues.read().values() {
            q.clear();
        }
        for q in self.book_queues.read().values() {
            q.clear();
        }

        tokio::time::sleep(Duration::from_secs(2)).await;

        self.connect().await.context("hard reset reconnect failed")?;
        info!("hard reset complete");
        Ok(())
    }

    /// Health check: restart any WS whose last-message age exceeds 60s.
    pub async fn ensure_websocket(self: &Arc<Self>) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let now = Self::local_now_ms();
        let market_age_s = (now - self.last_market_msg_ms.load(Ordering::Relaxed)) / 1000;
        let market_stale = self.last_market_msg_ms.load(Ordering::Relaxed) > 0 && market_age_s > WS_STALE_SECS;
        let market_closed = !self.market_ws_alive.load(Ordering::SeqCst);
        let user_closed = !self.user_ws_alive.load(Ordering::SeqCst) && !self.api_key.is_empty();

        if market_stale || market_closed || user_closed {
            warn!(
                market_stale,
                market_closed, user_closed, "WS health check failed, restarting"
            );
            self.close().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.connect().await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data (REST)
    // -------------------------------------------------------------------------

    pub async fn fetch_ohlcv(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<OhlcvBar>> {
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let klines = self
            .request("GET", "/fapi/v1/klines", params, false, EndpointClass::MarketData, None)
            .await?;

        let rows = klines.as_array().context("klines response is not an array")?;
        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = row.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            bars.push(OhlcvBar {
                timestamp_ms: arr[0].as_i64().unwrap_or(0),
                open: parse_value_f64(&arr[1])?,
                high: parse_value_f64(&arr[2])?,
                low: parse_value_f64(&arr[3])?,
                close: parse_value_f64(&arr[4])?,
                volume: parse_value_f64(&arr[5])?,
            });
        }
        Ok(bars)
    }

    /// Bulk 24h tickers (weight 1). A double-checked gate prevents a
    /// thundering herd of simultaneous refreshes.
    pub async fn fetch_tickers(&self) -> Result<HashMap<String, TickerData>> {
        let _gate = self.tickers_fetch_gate.lock().await;

        if let Some(at) = *self.last_tickers_refresh.read() {
            if at.elapsed() < Duration::from_secs(3) {
                debug!("tickers recently refreshed by another task, using cache");
                return Ok(self.tickers.read().clone());
            }
        }

        let breaker_name = "rest_market_data";
        let list = self
            .error_handler
            .execute_with_breaker(
                breaker_name,
                || {
                    self.raw_request(
                        "GET",
                        "/fapi/v1/ticker/24hr",
                        "",
                        false,
                        EndpointClass::MarketData,
                        Some(Duration::from_secs(30)),
                    )
                },
                RetryConfig::with_max_retries(1),
                "binance.ticker24hr",
            )
            .await?;

        let rows = list.as_array().context("ticker list is not an array")?;
        let mut result = HashMap::with_capacity(rows.len());
        for t in rows {
            let symbol = t.get("symbol").and_then(Value::as_str).unwrap_or("").to_string();
            if symbol.is_empty() {
                continue;
            }
            let data = TickerData {
                symbol: symbol.clone(),
                last: field_f64(t, "lastPrice"),
                bid: field_f64(t, "bidPrice"),
                ask: field_f64(t, "askPrice"),
                high: field_f64(t, "highPrice"),
                low: field_f64(t, "lowPrice"),
                volume: field_f64(t, "volume"),
                timestamp_ms: t.get("closeTime").and_then(Value::as_i64).unwrap_or_else(Self::local_now_ms),
            };
            result.insert(symbol, data);
        }

        *self.tickers.write() = result.clone();
        *self.last_tickers_refresh.write() = Some(Instant::now());
        Ok(result)
    }

    /// Single-symbol ticker with a 5s cache and WS fallback while the REST
    /// market-data breaker is open.
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<TickerData> {
        if let Some(at) = *self.last_tickers_refresh.read() {
            if at.elapsed() < Duration::from_secs(5) {
                if let Some(t) = self.tickers.read().get(symbol) {
                    return Ok(t.clone());
                }
            }
        }

        let breaker = self.error_handler.breaker("rest_market_data");
        if breaker.state() == crate::resilience::CircuitState::Open {
            if let Some(t) = self.tickers.read().get(symbol) {
                debug!(symbol, "REST market data breaker open, serving WS-cached ticker");
                return Ok(t.clone());
            }
            bail!("REST market data breaker open and {symbol} not in WS cache");
        }

        match self.fetch_tickers().await {
            Ok(all) => all
                .get(symbol)
                .cloned()
                .with_context(|| format!("{symbol} not present in bulk tickers")),
            Err(e) => {
                if let Some(t) = self.tickers.read().get(symbol) {
                    warn!(symbol, error = %e, "bulk tickers failed, serving WS-cached ticker");
                    return Ok(t.clone());
                }
                Err(e)
            }
        }
    }

    pub async fn fetch_book_tickers(&self) -> Result<HashMap<String, BookTicker>> {
        let list = self
            .request(
                "GET",
                "/fapi/v1/ticker/bookTicker",
                String::new(),
                false,
                EndpointClass::MarketData,
                Some(Duration::from_secs(15)),
            )
            .await?;

        let rows = list.as_array().context("book ticker list is not an array")?;
        let mut result = HashMap::with_capacity(rows.len());
        for t in rows {
            if let Some(sym) = t.get("symbol").and_then(Value::as_str) {
                result.insert(
                    sym.to_string(),
                    BookTicker {
                        bid: field_f64(t, "bidPrice"),
                        ask: field_f64(t, "askPrice"),
                        bid_qty: field_f64(t, "bidQty"),
                        ask_qty: field_f64(t, "askQty"),
                    },
                );
            }
        }
        Ok(result)
    }

    pub async fn fetch_order_book(&self, symbol: &str, limit: u32) -> Result<OrderBookEvent> {
        // Valid depth limits for Binance futures.
        const VALID: &[u32] = &[5, 10, 20, 50, 100, 500, 1000];
        let limit = *VALID
            .iter()
            .min_by_key(|&&v| v.abs_diff(limit))
            .unwrap_or(&50);

        let params = format!("symbol={symbol}&limit={limit}");
        let data = self
            .request(
                "GET",
                "/fapi/v1/depth",
                params,
                false,
                EndpointClass::MarketData,
                Some(Duration::from_secs(10)),
            )
            .await?;

        Ok(OrderBookEvent {
            symbol: symbol.to_string(),
            bids: parse_book_side(data.get("bids")),
            asks: parse_book_side(data.get("asks")),
            timestamp: data.get("T").and_then(Value::as_i64).unwrap_or_else(Self::local_now_ms) as f64 / 1000.0,
        })
    }

    // -------------------------------------------------------------------------
    // Account data
    // -------------------------------------------------------------------------

    pub async fn fetch_balance(&self) -> Result<Vec<crate::types::BalanceInfo>> {
        let balances = self
            .request(
                "GET",
                "/fapi/v2/balance",
                String::new(),
                true,
                EndpointClass::Account,
                None,
            )
            .await?;

        let rows = balances.as_array().context("balance response is not an array")?;
        Ok(rows
            .iter()
            .map(|b| crate::types::BalanceInfo {
                asset: b.get("asset").and_then(Value::as_str).unwrap_or("").to_string(),
                total: field_f64(b, "balance"),
                free: field_f64(b, "availableBalance"),
            })
            .collect())
    }

    /// Convenience: free USDT balance.
    pub async fn fetch_usdt_balance(&self) -> Result<f64> {
        let balances = self.fetch_balance().await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.total)
            .unwrap_or(0.0))
    }

    pub async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>> {
        let positions = self
            .request(
                "GET",
                "/fapi/v2/positionRisk",
                String::new(),
                true,
                EndpointClass::Account,
                None,
            )
            .await?;

        let rows = positions.as_array().context("positionRisk response is not an array")?;
        Ok(rows
            .iter()
            .filter_map(|p| {
                let sym = p.get("symbol").and_then(Value::as_str)?;
                if let Some(target) = symbol {
                    if sym != target {
                        return None;
                    }
                }
                let amt = field_f64(p, "positionAmt");
                if amt.abs() < 1e-12 {
                    return None;
                }
                Some(ExchangePosition {
                    symbol: sym.to_string(),
                    side: if amt > 0.0 { Side::Long } else { Side::Short },
                    amount: amt.abs(),
                    entry_price: field_f64(p, "entryPrice"),
                    unrealized_pnl: field_f64(p, "unRealizedProfit"),
                    leverage: field_f64(p, "leverage") as u32,
                })
            })
            .collect())
    }

    /// Discover symbols with open positions or orders.
    pub async fn fetch_active_symbols(&self) -> Result<Vec<String>> {
        let mut active: HashSet<String> = HashSet::new();

        match self.fetch_positions(None).await {
            Ok(positions) => active.extend(positions.into_iter().map(|p| p.symbol)),
            Err(e) => error!(error = %e, "failed to fetch positions in discovery"),
        }
        match self.fetch_open_orders(None).await {
            Ok(orders) => active.extend(orders.into_iter().map(|o| o.symbol)),
            Err(e) => error!(error = %e, "failed to fetch orders in discovery"),
        }

        Ok(active.into_iter().collect())
    }

    pub async fn fetch_my_trades(&self, symbol: &str, since_ms: Option<i64>, limit: u32) -> Result<Vec<FillInfo>> {
        let mut params = format!("symbol={symbol}&limit={limit}");
        if let Some(since) = since_ms {
            params.push_str(&format!("&startTime={since}"));
        }
        let trades = self
            .request("GET", "/fapi/v1/userTrades", params, true, EndpointClass::Account, None)
            .await?;

        let rows = trades.as_array().context("userTrades response is not an array")?;
        Ok(rows
            .iter()
            .map(|t| FillInfo {
                id: t.get("id").map(value_to_string).unwrap_or_default(),
                order_id: t.get("orderId").map(value_to_string).unwrap_or_default(),
                side: t
                    .get("side")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_lowercase(),
                price: field_f64(t, "price"),
                amount: field_f64(t, "qty"),
                fee: field_f64(t, "commission"),
                timestamp_ms: t.get("time").and_then(Value::as_i64).unwrap_or(0),
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Orders — regular + algo
    // -------------------------------------------------------------------------

    /// Fetch ALL open orders (regular + algo).
    pub async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<NormalizedOrder>> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let orders = self
            .request("GET", "/fapi/v1/openOrders", params, true, EndpointClass::Orders, None)
            .await?;

        let mut all: Vec<NormalizedOrder> = orders
            .as_array()
            .map(|rows| rows.iter().map(normalize_order).collect())
            .unwrap_or_default();

        all.extend(self.fetch_open_algo_orders(symbol).await?);
        Ok(all)
    }

    async fn fetch_open_algo_orders(&self, symbol: Option<&str>) -> Result<Vec<NormalizedOrder>> {
        // Max out the page size so no conditional order escapes visibility.
        let mut params = "limit=1000".to_string();
        if let Some(s) = symbol {
            params = format!("symbol={s}&{params}");
        }
        let response = self
            .request(
                "GET",
                "/fapi/v1/openAlgoOrders",
                params,
                true,
                EndpointClass::Orders,
                None,
            )
            .await?;

        let rows = match response.as_array() {
            Some(rows) => rows.clone(),
            None => response
                .get("orders")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(rows.iter().map(normalize_algo_order).collect())
    }

    pub async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<NormalizedOrder> {
        let params = if order_id.chars().all(|c| c.is_ascii_digit()) {
            format!("symbol={symbol}&orderId={order_id}")
        } else {
            format!("symbol={symbol}&origClientOrderId={order_id}")
        };

        match self
            .request("GET", "/fapi/v1/order", params, true, EndpointClass::Orders, None)
            .await
        {
            Ok(order) => Ok(normalize_order(&order)),
            Err(_) => self.fetch_algo_order(order_id, symbol).await,
        }
    }

    async fn fetch_algo_order(&self, algo_id: &str, symbol: &str) -> Result<NormalizedOrder> {
        let params = if algo_id.chars().all(|c| c.is_ascii_digit()) {
            format!("symbol={symbol}&algoId={algo_id}")
        } else {
            format!("symbol={symbol}&clientAlgoId={algo_id}")
        };
        let response = self
            .request("GET", "/fapi/v1/algoOrder", params, true, EndpointClass::Orders, None)
            .await?;
        Ok(normalize_algo_order(&response))
    }

    /// Create an order, routing conditional types to the algo endpoint and
    /// recovering from the ReduceOnly propagation race.
    pub async fn create_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
        order_type: &str,
        params: OrderParams,
        timeout: Option<Duration>,
    ) -> Result<NormalizedOrder> {
        let order_type = order_type.to_uppercase();
        let is_reduce = params.reduce_only || params.close_position;

        let quantity = self.amount_to_precision(symbol, amount);
        if !params.close_position && quantity.parse::<f64>().unwrap_or(0.0) <= 0.0 {
            bail!("amount {amount} rounds to zero for {symbol}");
        }

        let mut args = format!("symbol={symbol}&side={}&type={order_type}", side.as_str());

        let use_close_position = params.close_position && !matches!(order_type.as_str(), "STOP" | "TAKE_PROFIT");
        if !use_close_position {
            args.push_str(&format!("&quantity={quantity}"));
        }

        if let Some(p) = price {
            args.push_str(&format!("&price={}", self.price_to_precision(symbol, p)));
        }
        if order_type == "LIMIT" {
            args.push_str("&timeInForce=GTC");
        }
        if let Some(coid) = &params.client_order_id {
            args.push_str(&format!("&newClientOrderId={coid}"));
        }
        if params.reduce_only && !params.close_position {
            args.push_str("&reduceOnly=true");
        }
        if use_close_position {
            args.push_str("&closePosition=true");
        }

        if ALGO_ORDER_TYPES.contains(&order_type.as_str()) {
            let mut algo = format!(
                "algoType=CONDITIONAL&symbol={symbol}&side={}&type={order_type}&quantity={quantity}",
                side.as_str()
            );
            if let Some(stop) = params.stop_price {
                algo.push_str(&format!("&triggerPrice={}", self.price_to_precision(symbol, stop)));
            }
            if is_reduce {
                algo.push_str("&reduceOnly=true");
            }
            if let Some(coid) = &params.client_order_id {
                algo.push_str(&format!("&clientAlgoId={coid}"));
            }

            return match self.submit_algo_order(symbol, &algo, side, &order_type, timeout).await {
                Ok(order) => Ok(order),
                Err(e) if is_reduce && is_reduce_only_race(&e) => {
                    warn!(symbol, error = %e, "ReduceOnly algo sync lag, polling position");
                    if self.wait_for_position_sync(symbol, Duration::from_secs(3)).await? {
                        self.submit_algo_order(symbol, &algo, side, &order_type, timeout).await
                    } else {
                        Err(e)
                    }
                }
                Err(e) => Err(e),
            };
        }

        match self
            .request("POST", "/fapi/v1/order", args.clone(), true, EndpointClass::Orders, timeout)
            .await
        {
            Ok(response) => Ok(normalize_order(&response)),
            Err(e) if is_reduce && is_reduce_only_race(&e) => {
                warn!(symbol, error = %e, "ReduceOnly sync lag, polling position");
                if self.wait_for_position_sync(symbol, Duration::from_secs(3)).await? {
                    info!(symbol, "position synced, retrying order");
                    let response = self
                        .request("POST", "/fapi/v1/order", args, true, EndpointClass::Orders, timeout)
                        .await?;
                    Ok(normalize_order(&response))
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn submit_algo_order(
        &self,
        symbol: &str,
        algo_params: &str,
        side: OrderSide,
        order_type: &str,
        timeout: Option<Duration>,
    ) -> Result<NormalizedOrder> {
        debug!(symbol, order_type, "creating algo order");
        let response = self
            .request(
                "POST",
                "/fapi/v1/algoOrder",
                algo_params.to_string(),
                true,
                EndpointClass::Orders,
                timeout,
            )
            .await?;
        Ok(normalize_algo_response(&response, symbol, side, order_type))
    }

    /// Submit a native OCO bracket: TP at `tp_price`, SL triggered at
    /// `sl_trigger` (optionally a stop-limit at `sl_limit`).
    pub async fn create_native_oco(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        tp_price: f64,
        sl_trigger: f64,
        sl_limit: Option<f64>,
    ) -> Result<OcoBracket> {
        let quantity = self.amount_to_precision(symbol, amount);
        if quantity.parse::<f64>().unwrap_or(0.0) <= 0.0 {
            bail!("OCO amount {amount} rounds to zero for {symbol}");
        }

        let client_algo_id = format!("C3_OCO_{}", short_uid());
        let mut params = format!(
            "algoType=OCO&symbol={symbol}&side={}&type=OCO&quantity={quantity}&profitPrice={}&lossPrice={}&reduceOnly=true&clientAlgoId={client_algo_id}",
            side.as_str(),
            self.price_to_precision(symbol, tp_price),
            self.price_to_precision(symbol, sl_trigger),
        );
        if let Some(limit) = sl_limit {
            params.push_str(&format!("&lossLimitPrice={}", self.price_to_precision(symbol, limit)));
        }

        let submit = || {
            self.request(
                "POST",
                "/fapi/v1/algoOrder",
                params.clone(),
                true,
                EndpointClass::Orders,
                Some(Duration::from_secs(15)),
            )
        };

        let response = match submit().await {
            Ok(r) => r,
            Err(e) if is_reduce_only_race(&e) => {
                warn!(symbol, error = %e, "ReduceOnly OCO sync lag, polling position");
                if self.wait_for_position_sync(symbol, Duration::from_secs(3)).await? {
                    submit().await?
                } else {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        };

        // The bracket response may carry distinct child ids; a bare algoId
        // covers both children on older API revisions.
        let algo_id = response
            .get("algoId")
            .or_else(|| response.get("algoOrderId"))
            .map(value_to_string)
            .unwrap_or_else(|| client_algo_id.clone());
        let tp_id = response
            .get("profitOrderId")
            .map(value_to_string)
            .unwrap_or_else(|| algo_id.clone());
        let sl_id = response
            .get("lossOrderId")
            .map(value_to_string)
            .unwrap_or_else(|| algo_id.clone());

        info!(symbol, tp_id = %tp_id, sl_id = %sl_id, "native OCO bracket placed");
        Ok(OcoBracket {
            client_algo_id,
            exchange_tp_id: tp_id,
            exchange_sl_id: sl_id,
        })
    }

    /// Poll the position endpoint until a position appears (ReduceOnly race).
    async fn wait_for_position_sync(&self, symbol: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let positions = self.fetch_positions(Some(symbol)).await?;
            if positions.iter().any(|p| p.amount > 1e-8) {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        error!(symbol, "position sync timeout");
        Ok(false)
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let params = if order_id.chars().all(|c| c.is_ascii_digit()) {
            format!("symbol={symbol}&orderId={order_id}")
        } else {
            format!("symbol={symbol}&origClientOrderId={order_id}")
        };

        match self
            .request("DELETE", "/fapi/v1/order", params, true, EndpointClass::Orders, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // Unknown order on the regular endpoint: try the algo endpoint.
                let is_unknown = e
                    .downcast_ref::<ApiError>()
                    .map(|api| api.code == -2011)
                    .unwrap_or(false);
                if is_unknown {
                    self.cancel_algo_order(order_id, symbol).await
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn cancel_algo_order(&self, algo_id: &str, symbol: &str) -> Result<()> {
        let params = if algo_id.chars().all(|c| c.is_ascii_digit()) {
            format!("symbol={symbol}&algoId={algo_id}")
        } else {
            format!("symbol={symbol}&clientAlgoId={algo_id}")
        };
        self.request("DELETE", "/fapi/v1/algoOrder", params, true, EndpointClass::Orders, None)
            .await?;
        Ok(())
    }

    /// Cancel ALL open orders for a symbol: bulk regular + manual algo sweep.
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        if let Err(e) = self
            .request(
                "DELETE",
                "/fapi/v1/allOpenOrders",
                format!("symbol={symbol}"),
                true,
                EndpointClass::Orders,
                None,
            )
            .await
        {
            warn!(symbol, error = %e, "bulk cancel failed");
        }

        match self.fetch_open_algo_orders(Some(symbol)).await {
            Ok(algo_orders) => {
                if !algo_orders.is_empty() {
                    info!(symbol, count = algo_orders.len(), "cancelling remaining algo orders");
                }
                for order in algo_orders {
                    if let Err(e) = self.cancel_algo_order(&order.id, symbol).await {
                        error!(symbol, order_id = %order.id, error = %e, "failed to cancel algo order");
                    }
                }
            }
            Err(e) => error!(symbol, error = %e, "failed to sweep algo orders"),
        }
        Ok(())
    }

    /// Amend an order in-place (PUT). Regular orders only; algo TP/SL
    /// modification is cancel + recreate at the Croupier level.
    pub async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        side: OrderSide,
        quantity: Option<f64>,
        price: Option<f64>,
    ) -> Result<NormalizedOrder> {
        let mut args = format!("symbol={symbol}&side={}", side.as_str());
        if order_id.chars().all(|c| c.is_ascii_digit()) {
            args.push_str(&format!("&orderId={order_id}"));
        } else {
            args.push_str(&format!("&origClientOrderId={order_id}"));
        }
        if let Some(q) = quantity {
            args.push_str(&format!("&quantity={}", self.amount_to_precision(symbol, q)));
        }
        if let Some(p) = price {
            args.push_str(&format!("&price={}", self.price_to_precision(symbol, p)));
        }

        info!(symbol, order_id, price = ?price, "amending order");
        let response = self
            .request("PUT", "/fapi/v1/order", args, true, EndpointClass::Orders, None)
            .await?;
        Ok(normalize_order(&response))
    }

    // -------------------------------------------------------------------------
    // WebSocket subscriptions & watchers
    // -------------------------------------------------------------------------

    fn enqueue_subscription(&self, stream: String) {
        self.sub_queue.lock().push_back(stream);
        self.sub_notify.notify_one();
    }

    pub fn subscribe_trades(&self, symbol: &str) {
        let stream = format!("{}@aggTrade", symbol.to_lowercase());
        if self.active_subscriptions.lock().insert(stream.clone()) {
            self.enqueue_subscription(stream);
        }
    }

    pub fn subscribe_ticker(&self, symbol: &str) {
        let stream = format!("{}@ticker", symbol.to_lowercase());
        if self.active_subscriptions.lock().insert(stream.clone()) {
            self.enqueue_subscription(stream);
        }
    }

    pub fn subscribe_order_book(&self, symbol: &str) {
        let stream = format!("{}@depth20@100ms", symbol.to_lowercase());
        if self.active_subscriptions.lock().insert(stream.clone()) {
            self.enqueue_subscription(stream);
        }
    }

    fn trade_queue(&self, symbol: &str) -> Arc<BoundedQueue<Tick>> {
        if let Some(q) = self.trade_queues.read().get(symbol) {
            return q.clone();
        }
        self.trade_queues
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(BoundedQueue::new(100)))
            .clone()
    }

    fn ticker_queue(&self, symbol: &str) -> Arc<BoundedQueue<TickerData>> {
        if let Some(q) = self.ticker_queues.read().get(symbol) {
            return q.clone();
        }
        self.ticker_queues
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(BoundedQueue::new(10)))
            .clone()
    }

    fn book_queue(&self, symbol: &str) -> Arc<BoundedQueue<OrderBookEvent>> {
        if let Some(q) = self.book_queues.read().get(symbol) {
            return q.clone();
        }
        self.book_queues
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(BoundedQueue::new(10)))
            .clone()
    }

    /// Blocking consumer of the per-symbol ticker queue.
    pub async fn watch_ticker(&self, symbol: &str) -> Result<TickerData> {
        let stream = format!("{}@ticker", symbol.to_lowercase());
        if !self.active_subscriptions.lock().contains(&stream) {
            self.subscribe_ticker(symbol);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(self.ticker_queue(symbol).pop().await)
    }

    /// Blocking consumer of the per-symbol trade queue.
    pub async fn watch_trades(&self, symbol: &str) -> Result<Tick> {
        let stream = format!("{}@aggTrade", symbol.to_lowercase());
        if !self.active_subscriptions.lock().contains(&stream) {
            self.subscribe_trades(symbol);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(self.trade_queue(symbol).pop().await)
    }

    /// Blocking consumer of the per-symbol depth queue.
    pub async fn watch_order_book(&self, symbol: &str) -> Result<OrderBookEvent> {
        let stream = format!("{}@depth20@100ms", symbol.to_lowercase());
        if !self.active_subscriptions.lock().contains(&stream) {
            self.subscribe_order_book(symbol);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(self.book_queue(symbol).pop().await)
    }

    /// Last WS-cached price for a symbol, if any.
    pub fn cached_price(&self, symbol: &str) -> Option<f64> {
        self.tickers.read().get(symbol).map(|t| t.last).filter(|p| *p > 0.0)
    }

    // -------------------------------------------------------------------------
    // WebSocket internals
    // -------------------------------------------------------------------------

    fn touch_market(&self) {
        self.last_market_msg_ms.store(Self::local_now_ms(), Ordering::Relaxed);
    }

    async fn run_market_stream(self: Arc<Self>, gen: u64) {
        loop {
            if self.generation.load(Ordering::SeqCst) != gen {
                return;
            }

            info!(url = %self.ws_url, "connecting market data stream");
            match connect_async(&self.ws_url).await {
                Ok((ws, _resp)) => {
                    let (sink, mut read) = ws.split();
                    *self.market_sink.lock().await = Some(sink);
                    self.market_ws_alive.store(true, Ordering::SeqCst);
                    self.touch_market();
                    info!("market data stream connected");

                    // Re-queue all active streams for the throttled worker.
                    {
                        let subs: Vec<String> = self.active_subscriptions.lock().iter().cloned().collect();
                        if !subs.is_empty() {
                            info!(count = subs.len(), "re-queueing active subscriptions");
                            let mut q = self.sub_queue.lock();
                            for s in subs {
                                q.push_back(s);
                            }
                        }
                        self.sub_notify.notify_one();
                    }

                    while let Some(msg) = read.next().await {
                        if self.generation.load(Ordering::SeqCst) != gen {
                            return;
                        }
                        match msg {
                            Ok(Message::Text(text)) => {
                                self.touch_market();
                                self.handle_market_message(&text);
                            }
                            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => self.touch_market(),
                            Ok(Message::Close(_)) => {
                                warn!("market data stream closed by server");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "market stream read error");
                                break;
                            }
                        }
                    }

                    self.market_ws_alive.store(false, Ordering::SeqCst);
                    *self.market_sink.lock().await = None;
                }
                Err(e) => error!(error = %e, "market stream connection failed"),
            }

            if self.generation.load(Ordering::SeqCst) != gen {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    fn handle_market_message(&self, text: &str) {
        let data: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse market message");
                return;
            }
        };

        // SUBSCRIBE acks carry {result, id}.
        if data.get("result").is_some() && data.get("id").is_some() {
            return;
        }

        match data.get("e").and_then(Value::as_str) {
            Some("aggTrade") => self.handle_agg_trade(&data),
            Some("24hrTicker") | Some("bookTicker") => self.handle_ticker(&data),
            Some("depthUpdate") => self.handle_depth(&data),
            _ => {
                // Partial depth snapshots arrive without an "e" tag.
                if data.get("bids").is_some() && data.get("asks").is_some() {
                    self.handle_depth(&data);
                }
            }
        }
    }

    fn handle_agg_trade(&self, data: &Value) {
        let symbol = match data.get("s").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => return,
        };
        let price = field_f64(data, "p");
        let volume = field_f64(data, "q");
        let ts_ms = data.get("T").and_then(Value::as_i64).unwrap_or_else(Self::local_now_ms);
        // m == true: the buyer was the maker, so the aggressor SOLD into a bid.
        let side = if data.get("m").and_then(Value::as_bool).unwrap_or(false) {
            TickSide::Bid
        } else {
            TickSide::Ask
        };

        // Every trade print refreshes the last-price cache.
        {
            let mut tickers = self.tickers.write();
            let entry = tickers.entry(symbol.clone()).or_insert_with(|| TickerData {
                symbol: symbol.clone(),
                last: price,
                bid: 0.0,
                ask: 0.0,
                high: 0.0,
                low: 0.0,
                volume: 0.0,
                timestamp_ms: ts_ms,
            });
            entry.last = price;
            entry.timestamp_ms = ts_ms;
        }

        self.trade_queue(&symbol).push_drop_newest(Tick {
            timestamp: ts_ms as f64 / 1000.0,
            symbol,
            price,
            volume,
            side,
        });
    }

    fn handle_ticker(&self, data: &Value) {
        let symbol = match data.get("s").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => return,
        };
        let ticker = TickerData {
            symbol: symbol.clone(),
            last: field_f64(data, "c"),
            bid: field_f64(data, "b"),
            ask: field_f64(data, "a"),
            high: field_f64(data, "h"),
            low: field_f64(data, "l"),
            volume: field_f64(data, "v"),
            timestamp_ms: data.get("E").and_then(Value::as_i64).unwrap_or_else(Self::local_now_ms),
        };

        self.tickers.write().insert(symbol.clone(), ticker.clone());
        self.ticker_queue(&symbol).push_drop_oldest(ticker);
    }

    fn handle_depth(&self, data: &Value) {
        let symbol = match data.get("s").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => return,
        };
        let event = OrderBookEvent {
            symbol: symbol.clone(),
            bids: parse_book_side(data.get("b").or_else(|| data.get("bids"))),
            asks: parse_book_side(data.get("a").or_else(|| data.get("asks"))),
            timestamp: data
                .get("E")
                .and_then(Value::as_i64)
                .unwrap_or_else(Self::local_now_ms) as f64
                / 1000.0,
        };
        self.book_queue(&symbol).push_drop_oldest(event);
    }

    /// Background worker that batches and throttles SUBSCRIBE frames.
    /// Binance rejects clients that burst above ~5 messages/second.
    async fn run_subscription_worker(self: Arc<Self>, gen: u64) {
        debug!("subscription worker started");
        loop {
            if self.generation.load(Ordering::SeqCst) != gen {
                return;
            }

            // Wait for at least one queued stream.
            let first = loop {
                if let Some(s) = self.sub_queue.lock().pop_front() {
                    break s;
                }
                tokio::select! {
                    _ = self.sub_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                if self.generation.load(Ordering::SeqCst) != gen {
                    return;
                }
            };

            let mut batch = vec![first];
            {
                let mut q = self.sub_queue.lock();
                while batch.len() < SUBSCRIPTION_BATCH_SIZE {
                    match q.pop_front() {
                        Some(s) => batch.push(s),
                        None => break,
                    }
                }
            }

            let sent = {
                let mut sink_guard = self.market_sink.lock().await;
                match sink_guard.as_mut() {
                    Some(sink) => {
                        let frame = json!({
                            "method": "SUBSCRIBE",
                            "params": batch.clone(),
                            "id": Self::local_now_ms(),
                        });
                        debug!(count = batch.len(), "batch subscribing");
                        sink.send(Message::Text(frame.to_string())).await.is_ok()
                    }
                    None => false,
                }
            };

            if sent {
                tokio::time::sleep(SUBSCRIPTION_THROTTLE).await;
            } else {
                warn!(count = batch.len(), "market WS unavailable, re-queueing streams");
                {
                    let mut q = self.sub_queue.lock();
                    for s in batch {
                        q.push_back(s);
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // User data stream
    // -------------------------------------------------------------------------

    async fn create_listen_key(&self) -> Result<String> {
        let response = self
            .request(
                "POST",
                "/fapi/v1/listenKey",
                String::new(),
                true,
                EndpointClass::Account,
                None,
            )
            .await?;
        response
            .get("listenKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("listenKey missing from response")
    }

    async fn run_listen_key_keepalive(self: Arc<Self>, gen: u64) {
        loop {
            tokio::time::sleep(Duration::from_secs(30 * 60)).await;
            if self.generation.load(Ordering::SeqCst) != gen {
                return;
            }
            match self
                .request(
                    "PUT",
                    "/fapi/v1/listenKey",
                    String::new(),
                    true,
                    EndpointClass::Account,
                    None,
                )
                .await
            {
                Ok(_) => debug!("listen key refreshed"),
                Err(e) => error!(error = %e, "listen key keepalive failed"),
            }
        }
    }

    async fn run_user_stream(self: Arc<Self>, gen: u64) {
        loop {
            if self.generation.load(Ordering::SeqCst) != gen {
                return;
            }

            let key = match self.create_listen_key().await {
                Ok(k) => k,
                Err(e) => {
                    error!(error = %e, "failed to create listen key");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            *self.listen_key.write() = Some(key.clone());

            let url = format!("{}/{}", self.ws_url, key);
            info!("connecting user data stream");
            match connect_async(&url).await {
                Ok((ws, _resp)) => {
                    self.user_ws_alive.store(true, Ordering::SeqCst);
                    self.last_user_msg_ms.store(Self::local_now_ms(), Ordering::Relaxed);
                    info!("user data stream connected");
                    let (_sink, mut read) = ws.split();

                    while let Some(msg) = read.next().await {
                        if self.generation.load(Ordering::SeqCst) != gen {
                            return;
                        }
                        match msg {
                            Ok(Message::Text(text)) => {
                                self.last_user_msg_ms.store(Self::local_now_ms(), Ordering::Relaxed);
                                if self.handle_user_message(&text) == UserStreamAction::Reconnect {
                                    warn!("listen key expired, reconnecting user stream");
                                    break;
                                }
                            }
                            Ok(Message::Close(_)) => {
                                warn!("user data stream closed by server");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "user stream read error");
                                break;
                            }
                        }
                    }
                    self.user_ws_alive.store(false, Ordering::SeqCst);
                }
                Err(e) => error!(error = %e, "user stream connection failed"),
            }

            if self.generation.load(Ordering::SeqCst) != gen {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    fn handle_user_message(&self, text: &str) -> UserStreamAction {
        let data: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse user message");
                return UserStreamAction::Continue;
            }
        };

        match data.get("e").and_then(Value::as_str) {
            Some("ORDER_TRADE_UPDATE") => {
                if let Some(o) = data.get("o") {
                    let update = OrderUpdate {
                        order_id: o.get("i").map(value_to_string).unwrap_or_default(),
                        client_order_id: o.get("c").and_then(Value::as_str).unwrap_or("").to_string(),
                        symbol: o.get("s").and_then(Value::as_str).unwrap_or("").to_string(),
                        status: normalize_status(o.get("X").and_then(Value::as_str).unwrap_or("")),
                        side: o.get("S").and_then(Value::as_str).unwrap_or("").to_lowercase(),
                        order_type: o.get("o").and_then(Value::as_str).unwrap_or("").to_lowercase(),
                        price: field_f64(o, "p"),
                        amount: field_f64(o, "q"),
                        filled: field_f64(o, "z"),
                        average: field_f64(o, "ap"),
                        is_algo: false,
                    };
                    self.emit_order_update(update);
                }
            }
            Some("STRATEGY_UPDATE") => {
                if let Some(su) = data.get("su") {
                    let status = su.get("ss").and_then(Value::as_str).unwrap_or("");
                    if matches!(status, "EXECUTED" | "CANCELLED") {
                        let algo_id = su.get("si").map(value_to_string).unwrap_or_default();
                        let client_id = su.get("ci").and_then(Value::as_str).unwrap_or("").to_string();
                        let update = OrderUpdate {
                            order_id: if client_id.is_empty() { algo_id } else { client_id.clone() },
                            client_order_id: client_id,
                            symbol: su.get("s").and_then(Value::as_str).unwrap_or("").to_string(),
                            status: if status == "EXECUTED" { "closed" } else { "canceled" }.to_string(),
                            side: String::new(),
                            order_type: String::new(),
                            price: 0.0,
                            amount: 0.0,
                            filled: 0.0,
                            average: field_f64(su, "ap"),
                            is_algo: true,
                        };
                        self.emit_order_update(update);
                    }
                }
            }
            Some("listenKeyExpired") => return UserStreamAction::Reconnect,
            _ => {}
        }
        UserStreamAction::Continue
    }

    fn emit_order_update(&self, update: OrderUpdate) {
        debug!(
            order_id = %update.order_id,
            client_id = %update.client_order_id,
            status = %update.status,
            "order update"
        );
        if let Some(tx) = self.order_updates.read().as_ref() {
            let _ = tx.send(update);
        }
    }

    // -------------------------------------------------------------------------
    // Symbol normalization & precision
    // -------------------------------------------------------------------------

    /// "BTC/USDT:USDT" -> "BTCUSDT"
    pub fn normalize_symbol(symbol: &str) -> String {
        symbol.replace('/', "").replace(":USDT", "")
    }

    /// "BTCUSDT" -> "BTC/USDT:USDT"
    pub fn denormalize_symbol(symbol: &str) -> String {
        if let Some(base) = symbol.strip_suffix("USDT") {
            format!("{base}/USDT:USDT")
        } else {
            format!("{symbol}/USDT:USDT")
        }
    }

    fn process_markets(&self, info: &Value) -> Result<()> {
        let symbols = info
            .get("symbols")
            .and_then(Value::as_array)
            .context("exchangeInfo missing symbols")?;

        let mut markets = self.markets.write();
        for s in symbols {
            let symbol = match s.get("symbol").and_then(Value::as_str) {
                Some(sym) => sym.to_string(),
                None => continue,
            };

            let mut tick_size = 0.01;
            let mut step_size = 0.001;
            let mut min_notional = 5.0;
            let mut price_decimals = 2;
            let mut qty_decimals = 3;

            if let Some(filters) = s.get("filters").and_then(Value::as_array) {
                for f in filters {
                    match f.get("filterType").and_then(Value::as_str) {
                        Some("PRICE_FILTER") => {
                            if let Some(ts) = f.get("tickSize").and_then(Value::as_str) {
                                tick_size = ts.parse().unwrap_or(tick_size);
                                price_decimals = decimals_of(ts);
                            }
                        }
                        Some("LOT_SIZE") => {
                            if let Some(ss) = f.get("stepSize").and_then(Value::as_str) {
                                step_size = ss.parse().unwrap_or(step_size);
                                qty_decimals = decimals_of(ss);
                            }
                        }
                        Some("MIN_NOTIONAL") => {
                            min_notional = f
                                .get("notional")
                                .map(|v| match v {
                                    Value::String(s) => s.parse().unwrap_or(min_notional),
                                    Value::Number(n) => n.as_f64().unwrap_or(min_notional),
                                    _ => min_notional,
                                })
                                .unwrap_or(min_notional);
                        }
                        _ => {}
                    }
                }
            }

            markets.insert(
                symbol,
                SymbolMeta {
                    tick_size,
                    step_size,
                    min_notional,
                    price_decimals,
                    qty_decimals,
                },
            );
        }
        Ok(())
    }

    pub fn symbol_meta(&self, symbol: &str) -> Option<SymbolMeta> {
        self.markets.read().get(symbol).cloned()
    }

    pub fn min_notional(&self, symbol: &str) -> f64 {
        self.markets.read().get(symbol).map(|m| m.min_notional).unwrap_or(5.0)
    }

    /// Round a price HALF-UP to the symbol's tick size; fixed-decimal string.
    pub fn price_to_precision(&self, symbol: &str, price: f64) -> String {
        match self.markets.read().get(symbol) {
            Some(meta) => {
                let ticks = (price / meta.tick_size).round();
                let rounded = ticks * meta.tick_size;
                format!("{:.*}", meta.price_decimals as usize, rounded)
            }
            None => price.to_string(),
        }
    }

    /// Round an amount DOWN (floor) to the symbol's step size; fixed-decimal
    /// string. Flooring prevents "quantity exceeds precision" rejections.
    pub fn amount_to_precision(&self, symbol: &str, amount: f64) -> String {
        match self.markets.read().get(symbol) {
            Some(meta) => {
                // Nudge by an epsilon so 0.3/0.1 == 2.9999999 floors to 3.
                let steps = (amount / meta.step_size + 1e-9).floor();
                let rounded = steps * meta.step_size;
                format!("{:.*}", meta.qty_decimals as usize, rounded)
            }
            None => amount.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_test_market(&self, symbol: &str, meta: SymbolMeta) {
        self.markets.write().insert(symbol.to_string(), meta);
    }
}

impl std::fmt::Debug for BinanceConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceConnector")
            .field("mode", &self.mode)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(PartialEq)]
enum UserStreamAction {
    Continue,
    Reconnect,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn field_f64(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_value_f64(value: &Value) -> Result<f64> {
    match value {
        Value::String(s) => s.parse().with_context(|| format!("failed to parse '{s}' as f64")),
        Value::Number(n) => n.as_f64().context("number is not a valid f64"),
        other => bail!("expected string or number, got: {other}"),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_book_side(value: Option<&Value>) -> Vec<(f64, f64)> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let arr = row.as_array()?;
                    Some((parse_value_f64(arr.first()?).ok()?, parse_value_f64(arr.get(1)?).ok()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Number of fractional digits in a filter size string ("0.00100000" -> 3).
fn decimals_of(size: &str) -> u32 {
    match size.split('.').nth(1) {
        Some(frac) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

fn normalize_status(status: &str) -> String {
    match status.to_uppercase().as_str() {
        "NEW" | "PARTIALLY_FILLED" => "open",
        "FILLED" => "closed",
        "CANCELED" | "CANCELLED" => "canceled",
        "EXPIRED" => "expired",
        "REJECTED" => "rejected",
        other => return other.to_lowercase(),
    }
    .to_string()
}

fn normalize_order(o: &Value) -> NormalizedOrder {
    NormalizedOrder {
        id: o.get("orderId").map(value_to_string).unwrap_or_default(),
        client_order_id: o.get("clientOrderId").and_then(Value::as_str).unwrap_or("").to_string(),
        symbol: o.get("symbol").and_then(Value::as_str).unwrap_or("").to_string(),
        status: normalize_status(o.get("status").and_then(Value::as_str).unwrap_or("")),
        price: field_f64(o, "price"),
        stop_price: field_f64(o, "stopPrice"),
        amount: field_f64(o, "origQty"),
        filled: field_f64(o, "executedQty"),
        average: field_f64(o, "avgPrice"),
        order_type: o.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase(),
        side: o.get("side").and_then(Value::as_str).unwrap_or("").to_lowercase(),
        is_algo: false,
    }
}

fn normalize_algo_order(o: &Value) -> NormalizedOrder {
    let id = o
        .get("clientAlgoId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| o.get("algoId").map(value_to_string).unwrap_or_default());

    NormalizedOrder {
        id,
        client_order_id: o.get("clientAlgoId").and_then(Value::as_str).unwrap_or("").to_string(),
        symbol: o.get("symbol").and_then(Value::as_str).unwrap_or("").to_string(),
        status: o.get("algoStatus").and_then(Value::as_str).unwrap_or("open").to_lowercase(),
        price: field_f64(o, "triggerPrice"),
        stop_price: field_f64(o, "triggerPrice"),
        amount: field_f64(o, "quantity"),
        filled: 0.0,
        average: 0.0,
        order_type: o.get("orderType").and_then(Value::as_str).unwrap_or("").to_lowercase(),
        side: o.get("side").and_then(Value::as_str).unwrap_or("").to_lowercase(),
        is_algo: true,
    }
}

fn normalize_algo_response(response: &Value, symbol: &str, side: OrderSide, order_type: &str) -> NormalizedOrder {
    let id = response
        .get("clientAlgoId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| response.get("algoOrderId").map(value_to_string))
        .or_else(|| response.get("algoId").map(value_to_string))
        .unwrap_or_else(|| format!("ALGO_{}", BinanceConnector::local_now_ms()));

    NormalizedOrder {
        id: id.clone(),
        client_order_id: response.get("clientAlgoId").and_then(Value::as_str).unwrap_or("").to_string(),
        symbol: response
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or(symbol)
            .to_string(),
        status: "open".to_string(),
        price: field_f64(response, "triggerPrice"),
        stop_price: field_f64(response, "triggerPrice"),
        amount: field_f64(response, "quantity"),
        filled: 0.0,
        average: 0.0,
        order_type: order_type.to_lowercase(),
        side: side.as_str().to_lowercase(),
        is_algo: true,
    }
}

/// ReduceOnly rejected because the position had not propagated yet.
fn is_reduce_only_race(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .map(|api| matches!(api.code, -2022 | -4118 | -4164))
        .unwrap_or(false)
}

fn short_uid() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connector() -> BinanceConnector {
        let handler = Arc::new(ErrorHandler::new());
        let conn = BinanceConnector::new("key", "secret", TradeMode::Demo, handler);
        conn.insert_test_market(
            "BTCUSDT",
            SymbolMeta {
                tick_size: 0.10,
                step_size: 0.001,
                min_notional: 5.0,
                price_decimals: 1,
                qty_decimals: 3,
            },
        );
        conn
    }

    #[test]
    fn symbol_roundtrip() {
        for unified in ["BTC/USDT:USDT", "ETH/USDT:USDT", "1000PEPE/USDT:USDT"] {
            let native = BinanceConnector::normalize_symbol(unified);
            assert_eq!(BinanceConnector::denormalize_symbol(&native), unified);
        }
        assert_eq!(BinanceConnector::normalize_symbol("BTC/USDT:USDT"), "BTCUSDT");
    }

    #[test]
    fn price_rounds_half_up_to_tick() {
        let conn = test_connector();
        assert_eq!(conn.price_to_precision("BTCUSDT", 37000.04), "37000.0");
        assert_eq!(conn.price_to_precision("BTCUSDT", 37000.05), "37000.1");
        assert_eq!(conn.price_to_precision("BTCUSDT", 37000.16), "37000.2");
    }

    #[test]
    fn amount_floors_to_step() {
        let conn = test_connector();
        assert_eq!(conn.amount_to_precision("BTCUSDT", 0.0019), "0.001");
        assert_eq!(conn.amount_to_precision("BTCUSDT", 0.001), "0.001");
        assert_eq!(conn.amount_to_precision("BTCUSDT", 0.0009), "0.000");
    }

    #[test]
    fn floored_amount_times_step_decimals_is_integer() {
        let conn = test_connector();
        for raw in [0.0123456, 1.999999, 0.3333333] {
            let formatted: f64 = conn.amount_to_precision("BTCUSDT", raw).parse().unwrap();
            let scaled = formatted * 10f64.powi(3);
            assert!(
                (scaled - scaled.round()).abs() < 1e-6,
                "amount {formatted} not aligned to step decimals"
            );
        }
    }

    #[test]
    fn signature_is_deterministic_hmac() {
        let conn = test_connector();
        let sig = conn.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, conn.sign("symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, conn.sign("symbol=BTCUSDT&side=SELL"));
    }

    #[test]
    fn decimals_parse_from_filter_strings() {
        assert_eq!(decimals_of("0.00100000"), 3);
        assert_eq!(decimals_of("0.10000000"), 1);
        assert_eq!(decimals_of("1.00000000"), 0);
        assert_eq!(decimals_of("1"), 0);
    }

    #[test]
    fn order_status_normalization() {
        assert_eq!(normalize_status("NEW"), "open");
        assert_eq!(normalize_status("PARTIALLY_FILLED"), "open");
        assert_eq!(normalize_status("FILLED"), "closed");
        assert_eq!(normalize_status("CANCELED"), "canceled");
        assert_eq!(normalize_status("REJECTED"), "rejected");
    }

    #[test]
    fn normalize_regular_order_payload() {
        let payload = json!({
            "orderId": 123456,
            "clientOrderId": "C3_ENTRY_abcdef123456",
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "price": "0",
            "stopPrice": "0",
            "origQty": "0.010",
            "executedQty": "0.010",
            "avgPrice": "37001.20",
            "type": "MARKET",
            "side": "BUY"
        });
        let order = normalize_order(&payload);
        assert_eq!(order.id, "123456");
        assert_eq!(order.client_order_id, "C3_ENTRY_abcdef123456");
        assert_eq!(order.status, "closed");
        assert!((order.average - 37001.20).abs() < 1e-9);
        assert!(!order.is_algo);
    }

    #[test]
    fn normalize_algo_order_prefers_client_id() {
        let payload = json!({
            "algoId": 777,
            "clientAlgoId": "C3_STOP_aaaabbbbcccc",
            "symbol": "BTCUSDT",
            "algoStatus": "WORKING",
            "triggerPrice": "36500.0",
            "quantity": "0.010",
            "orderType": "STOP_MARKET",
            "side": "SELL"
        });
        let order = normalize_algo_order(&payload);
        assert_eq!(order.id, "C3_STOP_aaaabbbbcccc");
        assert!(order.is_algo);
        assert!((order.stop_price - 36500.0).abs() < 1e-9);
    }

    #[test]
    fn reduce_only_race_detection() {
        for code in [-2022, -4118, -4164] {
            let err = anyhow::Error::new(ApiError {
                code,
                msg: "ReduceOnly rejected".into(),
                http_status: 400,
            });
            assert!(is_reduce_only_race(&err), "code {code}");
        }
        let other = anyhow::Error::new(ApiError {
            code: -1111,
            msg: "precision".into(),
            http_status: 400,
        });
        assert!(!is_reduce_only_race(&other));
    }

    #[test]
    fn agg_trade_side_mapping() {
        let conn = test_connector();
        // m=true: buyer is maker => aggressive sell => BID.
        conn.handle_agg_trade(&json!({
            "e": "aggTrade", "s": "BTCUSDT", "p": "37000.5", "q": "0.2",
            "T": 1700000000000i64, "m": true
        }));
        let queue = conn.trade_queue("BTCUSDT");
        let tick = futures_util::FutureExt::now_or_never(queue.pop()).expect("tick queued");
        assert_eq!(tick.side, TickSide::Bid);
        assert!((tick.price - 37000.5).abs() < 1e-9);
        assert!((tick.timestamp - 1700000000.0).abs() < 1e-6);
        assert_eq!(conn.cached_price("BTCUSDT"), Some(37000.5));
    }

    #[test]
    fn subscription_dedup_and_queueing() {
        let conn = test_connector();
        conn.subscribe_trades("BTCUSDT");
        conn.subscribe_trades("BTCUSDT");
        conn.subscribe_ticker("BTCUSDT");
        assert_eq!(conn.sub_queue.lock().len(), 2);
        assert!(conn.active_subscriptions.lock().contains("btcusdt@aggTrade"));
    }
}
