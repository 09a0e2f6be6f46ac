//! WebSocket WRP transport: maintains a WebSocket session,
//! encodes/decodes WRP MessagePack over binary frames, exposes outbound
//! send and inbound listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::Uri;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wrp_core::device::DeviceId;
use wrp_core::events::{ConnectEvent, DisconnectEvent, HeartbeatEvent, HeartbeatKind, IpMode, MessageEvent};
use wrp_core::message::WrpMessage;
use wrp_core::transport::{HeaderDecorator, MessageDecorator, NoopDecorator, SendError, Transport, UrlFetchError, UrlFetcher};
use wrp_core::{Clock, EventBus, RetryPolicy};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WsIpMode {
    V4,
    V6,
}

impl WsIpMode {
    fn toggled(self) -> Self {
        match self {
            WsIpMode::V4 => WsIpMode::V6,
            WsIpMode::V6 => WsIpMode::V4,
        }
    }

    fn to_core(self) -> IpMode {
        match self {
            WsIpMode::V4 => IpMode::V4,
            WsIpMode::V6 => IpMode::V6,
        }
    }
}

pub struct WsTransportConfig {
    pub device_id: DeviceId,
    pub url_fetcher: Arc<dyn UrlFetcher>,
    pub url_fetch_timeout: Duration,
    pub credentials_decorator: Arc<dyn HeaderDecorator>,
    pub metadata_decorator: Arc<dyn HeaderDecorator>,
    pub per_message_metadata_decorator: Option<Arc<dyn MessageDecorator>>,
    pub max_message_bytes: usize,
    pub inactivity_timeout: Duration,
    pub ping_write_timeout: Duration,
    pub send_timeout: Duration,
    pub additional_headers: HashMap<String, String>,
    pub allow_v4: bool,
    pub allow_v6: bool,
    pub retry_policy_factory: Arc<dyn Fn() -> RetryPolicy + Send + Sync>,
    pub once: bool,
}

impl WsTransportConfig {
    fn initial_ip_mode(&self) -> WsIpMode {
        if self.allow_v4 {
            WsIpMode::V4
        } else {
            WsIpMode::V6
        }
    }

    fn next_ip_mode(&self, current: WsIpMode) -> WsIpMode {
        if self.allow_v4 && self.allow_v6 {
            current.toggled()
        } else {
            current
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error("url fetch failed: {0}")]
    UrlFetch(#[from] UrlFetchError),
    #[error("credentials decoration failed: {0}")]
    Credentials(String),
    #[error("handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("endpoint url was not a valid websocket uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("failed to build handshake request: {0}")]
    RequestBuild(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// A WebSocket-backed [`Transport`] implementing the reconnect state
/// machine `Stopped → Connecting → Connected → Closing → (Stopped |
/// Waiting) → Connecting`.
pub struct WsTransport<C: Clock = wrp_core::clock::SystemClock> {
    config: WsTransportConfig,
    clock: C,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    running: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    write_half: AsyncMutex<Option<WsSink>>,
    self_weak: once_cell::sync::OnceCell<std::sync::Weak<Self>>,
}

impl WsTransport<wrp_core::clock::SystemClock> {
    pub fn new(config: WsTransportConfig, events: Arc<EventBus>) -> Arc<Self> {
        Self::with_clock(config, events, wrp_core::clock::SystemClock)
    }
}

impl<C: Clock> WsTransport<C> {
    pub fn with_clock(config: WsTransportConfig, events: Arc<EventBus>, clock: C) -> Arc<Self> {
        let this = Arc::new(Self {
            config,
            clock,
            events,
            cancel: CancellationToken::new(),
            running: tokio::sync::Mutex::new(None),
            write_half: AsyncMutex::new(None),
            self_weak: once_cell::sync::OnceCell::new(),
        });
        let _ = this.self_weak.set(Arc::downgrade(&this));
        this
    }

    async fn dial(&self, mode: WsIpMode) -> Result<WsStream, DialError> {
        let url = self.config.url_fetcher.fetch(self.config.url_fetch_timeout).await?;
        let uri: Uri = url.parse()?;

        let mut headers = self.config.additional_headers.clone();
        headers.insert("X-Webpa-Device-Name".to_string(), self.config.device_id.to_string());
        if let Err(e) = self.config.credentials_decorator.decorate(&mut headers).await {
            return Err(DialError::Credentials(e));
        }
        let _ = self.config.metadata_decorator.decorate(&mut headers).await;

        let mut request = http::Request::builder().uri(uri).method("GET");
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request.body(()).map_err(|e| DialError::RequestBuild(e.to_string()))?;

        let ws_config = WebSocketConfig::default().max_message_size(Some(self.config.max_message_bytes));
        let (stream, _response) = tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;
        let _ = mode;
        Ok(stream)
    }

    /// Background loop: dial, run the connected session until it ends, then
    /// back off and retry unless `once` or cancelled.
    async fn run(self: Arc<Self>) {
        let mut mode = self.config.initial_ip_mode();
        let mut retry = (self.config.retry_policy_factory)();
        let mut tries_since_last_connect: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let started = self.clock.now();
            match self.dial(mode).await {
                Ok(stream) => {
                    tries_since_last_connect = 0;
                    retry.reset();
                    self.events.emit_connect(ConnectEvent {
                        started,
                        at: self.clock.now(),
                        mode: mode.to_core(),
                        retrying_at: None,
                        err: None,
                        tries_since_last_connect,
                    });
                    self.run_connected(stream).await;
                    if self.config.once || self.cancel.is_cancelled() {
                        return;
                    }
                }
                Err(e) => {
                    tries_since_last_connect += 1;
                    self.events.emit_connect(ConnectEvent {
                        started,
                        at: self.clock.now(),
                        mode: mode.to_core(),
                        retrying_at: None,
                        err: Some(Arc::from(e.to_string())),
                        tries_since_last_connect,
                    });
                    if self.config.once {
                        return;
                    }
                }
            }
            mode = self.config.next_ip_mode(mode);
            let delay = retry.next();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_connected(&self, stream: WsStream) {
        let (sink, mut read) = stream.split();
        *self.write_half.lock().await = Some(sink);

        let last_activity_ms = AtomicI64::new(self.clock.now().timestamp_millis());
        let watchdog_period = if self.config.inactivity_timeout.is_zero() {
            Duration::from_secs(6)
        } else {
            self.config.inactivity_timeout / 10
        };
        let mut watchdog = tokio::time::interval(watchdog_period);

        let ping_period = if self.config.ping_write_timeout.is_zero() { None } else { Some(self.config.ping_write_timeout / 2) };
        let mut ping_timer = match ping_period {
            Some(period) if self.write_ping().await.is_ok() => Some(tokio::time::interval(period)),
            _ => None,
        };

        let disconnect_reason = loop {
            let ping_tick = async {
                match &mut ping_timer {
                    Some(timer) => {
                        timer.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Binary(bytes))) => {
                            last_activity_ms.store(self.clock.now().timestamp_millis(), Ordering::SeqCst);
                            match WrpMessage::decode(&bytes) {
                                Ok(wrp) => self.events.emit_message(MessageEvent { wrp }),
                                Err(e) => {
                                    self.close_with(CloseCode::Unsupported, "decode failed").await;
                                    break Some(Arc::from(e.to_string()));
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
                            last_activity_ms.store(self.clock.now().timestamp_millis(), Ordering::SeqCst);
                            self.events.emit_heartbeat(HeartbeatEvent { at: self.clock.now(), kind: HeartbeatKind::Ping });
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity_ms.store(self.clock.now().timestamp_millis(), Ordering::SeqCst);
                            self.events.emit_heartbeat(HeartbeatEvent { at: self.clock.now(), kind: HeartbeatKind::Pong });
                        }
                        Some(Ok(Message::Close(_))) | None => break None,
                        Some(Ok(_)) => {
                            self.close_with(CloseCode::Unsupported, "non-binary frame").await;
                            break Some(Arc::from("received non-binary frame"));
                        }
                        Some(Err(e)) => break Some(Arc::from(e.to_string())),
                    }
                }
                _ = ping_tick => {
                    if self.write_ping().await.is_err() {
                        break Some(Arc::from("ping write exceeded deadline"));
                    }
                }
                _ = watchdog.tick() => {
                    let gap_ms = self.clock.now().timestamp_millis() - last_activity_ms.load(Ordering::SeqCst);
                    if gap_ms as u128 > self.config.inactivity_timeout.as_millis() {
                        self.close_with(CloseCode::Abnormal, "inactivity timeout").await;
                        break Some(Arc::from("inactivity timeout exceeded"));
                    }
                }
            }
        };

        *self.write_half.lock().await = None;
        self.events.emit_disconnect(DisconnectEvent { at: self.clock.now(), err: disconnect_reason });
    }

    async fn write_ping(&self) -> Result<(), ()> {
        let mut guard = self.write_half.lock().await;
        let Some(sink) = guard.as_mut() else { return Err(()) };
        tokio::time::timeout(self.config.ping_write_timeout, sink.send(Message::Ping(Vec::new().into())))
            .await
            .map_err(|_| ())?
            .map_err(|_| ())
    }

    async fn close_with(&self, code: CloseCode, reason: &'static str) {
        let mut guard = self.write_half.lock().await;
        if let Some(sink) = guard.as_mut() {
            let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
        }
    }
}

#[async_trait::async_trait]
impl<C: Clock> Transport for WsTransport<C> {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn start(&self) {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self
            .self_weak
            .get()
            .and_then(|w| w.upgrade())
            .expect("WsTransport is always constructed behind an Arc via new()/with_clock()");
        *guard = Some(tokio::spawn(async move { this.run().await }));
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn handle_wrp(&self, mut message: WrpMessage) -> Result<(), SendError> {
        if message.size_bytes() > self.config.max_message_bytes {
            return Err(SendError::TooLarge);
        }
        if let Some(decorator) = &self.config.per_message_metadata_decorator {
            decorator.decorate(&mut message);
        }
        let bytes = message.encode().map_err(|e| SendError::Write(e.to_string()))?;

        let mut guard = self.write_half.lock().await;
        let sink = guard.as_mut().ok_or(SendError::Closed)?;
        tokio::time::timeout(self.config.send_timeout, sink.send(Message::Binary(bytes.to_vec().into())))
            .await
            .map_err(|_| SendError::SendTimeout)?
            .map_err(|e| SendError::Write(e.to_string()))
    }

    fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }
}
