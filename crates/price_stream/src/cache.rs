//! Streaming quote cache with keep-alive and reconnection.
//!
//! One upstream connection at a time. A read task per connection writes
//! quotes into the cache; a single supervisor task, spawned by `start()`,
//! sends pings and reconnects when the read task reports a disconnect.

use crate::error::{Error, Result};
use crate::quote::Quote;
use crate::subscription::SubscriptionSet;
use crate::traits::PriceStream;
use async_trait::async_trait;
use common::{connect, is_benign_close, ConnectConfig, WsSink, WsSource};
use dashmap::DashMap;
use external_services::price_source::{build_subscription_message, parse_quote_update, WS_URL};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Configuration for the streaming cache.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upstream websocket endpoint.
    pub url: String,
    /// Sent as `X-API-Key` on the upgrade request.
    pub api_key: String,
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Delay before reconnecting after a disconnect.
    pub reconnect_delay: Duration,
    /// Delay before retrying a failed reconnect.
    pub retry_delay: Duration,
    /// TCP connect timeout per resolved address.
    pub connect_timeout: Duration,
    /// Label for log lines.
    pub label: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: WS_URL.to_string(),
            api_key: String::new(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            label: "price_stream".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Write half plus the connection generation it belongs to.
struct Writer {
    sink: Option<WsSink>,
    generation: u64,
}

pub struct StreamingPriceCache {
    config: StreamConfig,
    quotes: DashMap<String, Quote>,
    subscriptions: SubscriptionSet,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Writer>,
    generation: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl StreamingPriceCache {
    /// `subscriptions` is resubscribed in full after every reconnect.
    pub fn new(config: StreamConfig, subscriptions: SubscriptionSet) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            quotes: DashMap::new(),
            subscriptions,
            state: Mutex::new(ConnectionState::Disconnected),
            writer: tokio::sync::Mutex::new(Writer {
                sink: None,
                generation: 0,
            }),
            generation: AtomicU64::new(0),
            reader: Mutex::new(None),
            supervisor: Mutex::new(None),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Receiver that flips to `true` when the cache is closed.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn the supervisor and make the first connection attempt.
    ///
    /// A failed first attempt is handed to the supervisor, so the cache
    /// reconnects on its own. Only the first call has any effect.
    pub async fn start(self: &Arc<Self>) {
        let rx = self
            .reconnect_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            warn!("[{}] start() called more than once", self.config.label);
            return;
        };

        let this = Arc::clone(self);
        let shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move { this.supervise(rx, shutdown).await });
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if let Err(e) = self.connect_and_resubscribe().await {
            warn!(
                "[{}] Initial connect failed, serving from pull API until reconnect: {}",
                self.config.label, e
            );
            self.request_reconnect();
        }
    }

    /// Open a fresh connection and start its read task.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.set_state(ConnectionState::Connecting);
        info!("[{}] Connecting to {}", self.config.label, self.config.url);

        let connect_config = ConnectConfig {
            url: self.config.url.clone(),
            headers: vec![("X-API-Key".to_string(), self.config.api_key.clone())],
            connect_timeout: self.config.connect_timeout,
            label: self.config.label.clone(),
        };
        let ws = match connect(&connect_config).await {
            Ok(ws) => ws,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        let (sink, source) = ws.split();

        let mut writer = self.writer.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            // close() ran during the handshake
            drop((sink, source));
            self.set_state(ConnectionState::Disconnected);
            return Err(Error::Closed);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        writer.sink = Some(sink);
        writer.generation = generation;
        self.set_state(ConnectionState::Connected);
        gauge!("price_stream_connected").set(1.0);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.read_loop(source, generation).await });
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        drop(writer);

        info!("[{}] Connected (generation {})", self.config.label, generation);
        Ok(())
    }

    async fn connect_and_resubscribe(self: &Arc<Self>) -> Result<()> {
        self.connect().await?;
        let codes = self.subscriptions.codes();
        if !codes.is_empty() {
            info!("[{}] Resubscribing {} pairs", self.config.label, codes.len());
            self.send_subscribe(&codes).await?;
        }
        Ok(())
    }

    /// Send a subscribe request. A no-op when disconnected.
    pub async fn send_subscribe(&self, codes: &[String]) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }
        let msg = build_subscription_message(codes)?;

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.sink.as_mut() else {
            debug!(
                "[{}] Not connected, subscribe for {} pairs deferred to reconnect",
                self.config.label,
                codes.len()
            );
            return Ok(());
        };

        debug!("[{}] Subscribing to {} pairs", self.config.label, codes.len());
        if let Err(e) = sink.send(Message::Text(msg)).await {
            warn!("[{}] Subscribe send failed: {}", self.config.label, e);
            self.drop_connection(&mut writer);
            return Err(e.into());
        }
        Ok(())
    }

    /// Latest cached quote for `code`.
    pub fn get(&self, code: &str) -> Option<Quote> {
        self.quotes.get(code).map(|q| q.value().clone())
    }

    pub fn insert(&self, quote: Quote) {
        self.quotes.insert(quote.code.clone(), quote);
    }

    pub fn remove(&self, codes: &[String]) {
        for code in codes {
            self.quotes.remove(code);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn cache_len(&self) -> usize {
        self.quotes.len()
    }

    /// Stop all tasks and release the connection. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        gauge!("price_stream_connected").set(0.0);
        info!("[{}] Closed", self.config.label);
    }

    /// Wait for the supervisor task to exit. Returns at once if `start()` never ran.
    pub async fn join(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("[{}] Supervisor ended abnormally: {}", self.config.label, e);
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Signal the supervisor. Coalesces with a pending signal.
    fn request_reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.reconnect_tx.try_send(());
    }

    /// Tear down the current connection after a failure. Caller holds the writer lock.
    fn drop_connection(&self, writer: &mut Writer) {
        writer.sink = None;
        self.set_state(ConnectionState::Disconnected);
        gauge!("price_stream_connected").set(0.0);
        self.request_reconnect();
    }

    fn handle_text(&self, text: &str) {
        let Some(update) = parse_quote_update(text) else {
            debug!("[{}] Skipping non-quote message", self.config.label);
            return;
        };
        let quote = Quote::from(update);
        self.quotes.insert(quote.code.clone(), quote);
        counter!("price_stream_quotes_total").increment(1);
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource, generation: u64) {
        let mut shutdown = self.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        debug!("[{}] Received close frame: {:?}", self.config.label, frame);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping, pong and binary frames carry no quotes
                    }
                    Some(Err(e)) => {
                        if is_benign_close(&e) {
                            debug!("[{}] Connection closed: {}", self.config.label, e);
                        } else {
                            warn!("[{}] WebSocket read error: {}", self.config.label, e);
                        }
                        break;
                    }
                    None => {
                        debug!("[{}] WebSocket stream ended", self.config.label);
                        break;
                    }
                },
            }
        }

        let mut writer = self.writer.lock().await;
        if writer.generation == generation && writer.sink.is_some() {
            self.drop_connection(&mut writer);
        }
    }

    async fn ping(&self) {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.sink.as_mut() else {
            return;
        };
        debug!("[{}] Sending ping", self.config.label);
        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
            warn!("[{}] Ping failed: {}", self.config.label, e);
            self.drop_connection(&mut writer);
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut reconnect_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }
        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.reset();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ping_interval.tick() => self.ping().await,
                Some(()) = reconnect_rx.recv() => {
                    counter!("price_stream_reconnects_total").increment(1);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.reconnect_delay) => {}
                    }

                    let result = tokio::select! {
                        _ = shutdown.changed() => break,
                        result = self.connect_and_resubscribe() => result,
                    };
                    match result {
                        Ok(()) => info!("[{}] Reconnected", self.config.label),
                        Err(Error::Closed) => break,
                        Err(e) => {
                            warn!("[{}] Reconnect failed: {}", self.config.label, e);
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = sleep(self.config.retry_delay) => {}
                            }
                            self.request_reconnect();
                        }
                    }
                }
            }
        }
        debug!("[{}] Supervisor stopped", self.config.label);
    }
}

#[async_trait]
impl PriceStream for StreamingPriceCache {
    async fn subscribe(&self, codes: &[String]) -> Result<()> {
        self.send_subscribe(codes).await
    }

    fn get_cached(&self, code: &str) -> Option<Quote> {
        self.get(code)
    }

    fn evict(&self, codes: &[String]) {
        self.remove(codes);
    }
}
