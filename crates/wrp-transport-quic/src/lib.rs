//! HTTP/3 (QUIC) WRP transport: same outward contract as the
//! WebSocket transport, but a session is opened with a real HTTP POST over
//! QUIC and each WRP message afterwards travels on its own QUIC stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use quinn::Endpoint;
use tokio_util::sync::CancellationToken;
use wrp_core::device::DeviceId;
use wrp_core::events::{ConnectEvent, DisconnectEvent, IpMode, MessageEvent};
use wrp_core::message::WrpMessage;
use wrp_core::transport::{HeaderDecorator, MessageDecorator, NoopDecorator, SendError, Transport, UrlFetchError, UrlFetcher};
use wrp_core::{Clock, EventBus, RetryPolicy};

/// Application error code this transport closes the QUIC connection with
/// when a stream fails to decode as WRP.
const STREAM_STATE_ERROR: quinn::VarInt = quinn::VarInt::from_u32(0x0101);

#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error("failed to fetch the endpoint url: {0}")]
    UrlFetch(#[from] UrlFetchError),
    #[error("redirect probe failed: {0}")]
    RedirectProbe(String),
    #[error("redirect server rejected the session: status {0}")]
    FromRedirectServer(u16),
    #[error("failed to parse endpoint url: {0}")]
    InvalidUrl(String),
    #[error("credentials decoration failed: {0}")]
    Credentials(String),
    #[error("dns lookup failed: {0}")]
    Dns(String),
    #[error("quic endpoint setup failed: {0}")]
    EndpointSetup(String),
    #[error("quic connect failed: {0}")]
    Connect(String),
    #[error("http/3 handshake failed: {0}")]
    H3Handshake(String),
    #[error("session-open request failed: {0}")]
    SessionOpen(String),
    #[error("session-open rejected with status {0}")]
    SessionOpenStatus(u16),
}

/// Configuration mirrors [`WsTransportConfig`]'s shape, substituting IP-family alternation for the
/// redirect-probe toggle and dropping WebSocket-only ping/inactivity knobs.
pub struct QuicTransportConfig {
    pub device_id: DeviceId,
    pub url_fetcher: Arc<dyn UrlFetcher>,
    pub url_fetch_timeout: Duration,
    pub credentials_decorator: Arc<dyn HeaderDecorator>,
    pub metadata_decorator: Arc<dyn HeaderDecorator>,
    pub per_message_metadata_decorator: Option<Arc<dyn MessageDecorator>>,
    pub max_message_bytes: usize,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    pub additional_headers: HashMap<String, String>,
    pub probe_redirects: bool,
    pub http_client: reqwest::Client,
    pub retry_policy_factory: Arc<dyn Fn() -> RetryPolicy + Send + Sync>,
    pub once: bool,
}

impl QuicTransportConfig {
    pub fn new(device_id: DeviceId, url_fetcher: Arc<dyn UrlFetcher>, max_message_bytes: usize) -> Self {
        Self {
            device_id,
            url_fetcher,
            url_fetch_timeout: Duration::from_secs(10),
            credentials_decorator: Arc::new(NoopDecorator),
            metadata_decorator: Arc::new(NoopDecorator),
            per_message_metadata_decorator: None,
            max_message_bytes,
            send_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            additional_headers: HashMap::new(),
            probe_redirects: true,
            http_client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("default reqwest client builds"),
            retry_policy_factory: Arc::new(|| RetryPolicy::with_defaults(Duration::from_secs(1), Duration::from_millis(341_333))),
            once: false,
        }
    }
}

/// An open HTTP/3 session: the `quinn::Connection` kept alive for per-message
/// streams.
struct Session {
    quinn_conn: quinn::Connection,
    #[allow(dead_code)]
    send_request: SendRequest<OpenStreams, Bytes>,
}

/// A QUIC/HTTP-3-backed [`Transport`].
pub struct QuicTransport<C: Clock = wrp_core::clock::SystemClock> {
    config: QuicTransportConfig,
    clock: C,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    running: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    session: tokio::sync::Mutex<Option<Session>>,
    self_weak: once_cell::sync::OnceCell<std::sync::Weak<Self>>,
}

impl QuicTransport<wrp_core::clock::SystemClock> {
    pub fn new(config: QuicTransportConfig, events: Arc<EventBus>) -> Arc<Self> {
        Self::with_clock(config, events, wrp_core::clock::SystemClock)
    }
}

impl<C: Clock> QuicTransport<C> {
    pub fn with_clock(config: QuicTransportConfig, events: Arc<EventBus>, clock: C) -> Arc<Self> {
        let this = Arc::new(Self {
            config,
            clock,
            events,
            cancel: CancellationToken::new(),
            running: tokio::sync::Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
            self_weak: once_cell::sync::OnceCell::new(),
        });
        let _ = this.self_weak.set(Arc::downgrade(&this));
        this
    }

    /// Resolves the dial target, optionally probing for a redirect first.
    async fn resolve_dial_target(&self) -> Result<String, DialError> {
        let fetched = self.config.url_fetcher.fetch(self.config.url_fetch_timeout).await?;
        if !self.config.probe_redirects {
            return Ok(fetched);
        }
        let resp = self
            .config
            .http_client
            .post(&fetched)
            .header("content-type", "application/msgpack")
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| DialError::RedirectProbe(e.to_string()))?;
        let status = resp.status();
        if status.is_redirection() {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| DialError::RedirectProbe("3xx response missing Location".to_string()))?;
            Ok(location.to_string())
        } else if status.is_client_error() || status.is_server_error() {
            Err(DialError::FromRedirectServer(status.as_u16()))
        } else {
            Ok(fetched)
        }
    }

    async fn dial(&self) -> Result<(Session, IpMode), DialError> {
        let target = self.resolve_dial_target().await?;
        let uri: http::Uri = target.parse().map_err(|e: http::uri::InvalidUri| DialError::InvalidUrl(e.to_string()))?;
        let host = uri.host().ok_or_else(|| DialError::InvalidUrl("missing host".to_string()))?.to_string();
        let port = uri.port_u16().unwrap_or(443);
        let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| DialError::Dns(e.to_string()))?
            .next()
            .ok_or_else(|| DialError::Dns("lookup returned no addresses".to_string()))?;
        let mode = if addr.is_ipv4() { IpMode::V4 } else { IpMode::V6 };

        let mut headers = self.config.additional_headers.clone();
        headers.insert("x-webpa-device-name".to_string(), self.config.device_id.to_string());
        self.config
            .credentials_decorator
            .decorate(&mut headers)
            .await
            .map_err(DialError::Credentials)?;
        let _ = self.config.metadata_decorator.decorate(&mut headers).await;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls_config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h3".to_vec()];
        let quic_client_config =
            quinn::crypto::rustls::QuicClientConfig::try_from(tls_config).map_err(|e| DialError::EndpointSetup(e.to_string()))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(|e| DialError::EndpointSetup(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint.connect(addr, &host).map_err(|e| DialError::Connect(e.to_string()))?;
        let quinn_conn = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| DialError::Connect("connect timed out".to_string()))?
            .map_err(|e| DialError::Connect(e.to_string()))?;

        let h3_conn = h3_quinn::Connection::new(quinn_conn.clone());
        let (mut driver, mut send_request) = h3::client::new(h3_conn).await.map_err(|e| DialError::H3Handshake(e.to_string()))?;
        tokio::spawn(async move {
            let _ = driver.wait_idle().await;
        });

        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header("content-type", "application/msgpack")
            .body(())
            .map_err(|e| DialError::SessionOpen(e.to_string()))?;
        let mut stream = send_request.send_request(req).await.map_err(|e| DialError::SessionOpen(e.to_string()))?;
        stream.finish().await.map_err(|e| DialError::SessionOpen(e.to_string()))?;
        let resp = stream.recv_response().await.map_err(|e| DialError::SessionOpen(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DialError::SessionOpenStatus(resp.status().as_u16()));
        }
        // Drain the response body; EOF is the success case.
        while stream.recv_data().await.map_err(|e| DialError::SessionOpen(e.to_string()))?.is_some() {}

        Ok((Session { quinn_conn, send_request }, mode))
    }

    async fn accept_loop(&self, quinn_conn: quinn::Connection) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = quinn_conn.accept_uni() => {
                    match accepted {
                        Ok(mut recv) => {
                            let max = self.config.max_message_bytes;
                            match recv.read_to_end(max).await {
                                Ok(bytes) => {
                                    if !self.handle_inbound_bytes(&quinn_conn, &bytes).await {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(error = %err, "failed reading inbound quic stream");
                                    self.close_on_decode_failure(&quinn_conn, "stream read failed").await;
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            self.events.emit_disconnect(DisconnectEvent {
                                at: self.clock.now(),
                                err: Some(Arc::from(err.to_string())),
                            });
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns `false` if the connection was closed as a result of a decode
    /// failure, so the caller's accept loop should stop.
    async fn handle_inbound_bytes(&self, quinn_conn: &quinn::Connection, bytes: &[u8]) -> bool {
        match WrpMessage::decode(bytes) {
            Ok(wrp) => {
                self.events.emit_message(MessageEvent { wrp });
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode inbound wrp message over quic");
                self.close_on_decode_failure(quinn_conn, "decode failed").await;
                false
            }
        }
    }

    async fn close_on_decode_failure(&self, quinn_conn: &quinn::Connection, reason: &'static str) {
        quinn_conn.close(STREAM_STATE_ERROR, reason.as_bytes());
        self.events.emit_disconnect(DisconnectEvent {
            at: self.clock.now(),
            err: Some(Arc::from(reason)),
        });
        *self.session.lock().await = None;
    }

    async fn run(&self) {
        let mut retry = (self.config.retry_policy_factory)();
        let mut tries_since_last_connect: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let started = self.clock.now();
            match self.dial().await {
                Ok((session, mode)) => {
                    tries_since_last_connect = 0;
                    retry.reset();
                    self.events.emit_connect(ConnectEvent {
                        started,
                        at: self.clock.now(),
                        mode,
                        retrying_at: None,
                        err: None,
                        tries_since_last_connect,
                    });
                    let quinn_conn = session.quinn_conn.clone();
                    *self.session.lock().await = Some(session);
                    self.accept_loop(quinn_conn).await;
                    *self.session.lock().await = None;
                    if self.config.once || self.cancel.is_cancelled() {
                        return;
                    }
                }
                Err(err) => {
                    tries_since_last_connect += 1;
                    tracing::warn!(error = %err, "quic dial failed");
                    self.events.emit_connect(ConnectEvent {
                        started,
                        at: self.clock.now(),
                        mode: IpMode::V4,
                        retrying_at: None,
                        err: Some(Arc::from(err.to_string())),
                        tries_since_last_connect,
                    });
                    if self.config.once {
                        return;
                    }
                }
            }
            let delay = retry.next();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl<C: Clock> Transport for QuicTransport<C> {
    fn name(&self) -> &str {
        "quic"
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
            .expect("QuicTransport is always constructed behind an Arc via new()/with_clock()");
        *guard = Some(tokio::spawn(async move { this.run().await }));
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.session.lock().await = None;
    }

    async fn handle_wrp(&self, mut message: WrpMessage) -> Result<(), SendError> {
        if message.size_bytes() > self.config.max_message_bytes {
            return Err(SendError::TooLarge);
        }
        if let Some(decorator) = &self.config.per_message_metadata_decorator {
            decorator.decorate(&mut message);
        }
        let encoded = message.encode().map_err(|e| SendError::Write(e.to_string()))?;

        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(SendError::Closed)?;
        let send_fut = async {
            let mut stream = session.quinn_conn.open_uni().await.map_err(|e| SendError::Write(e.to_string()))?;
            stream.write_all(&encoded).await.map_err(|e| SendError::Write(e.to_string()))?;
            stream.finish().map_err(|e| SendError::Write(e.to_string()))
        };
        tokio::time::timeout(self.config.send_timeout, send_fut)
            .await
            .map_err(|_| SendError::SendTimeout)?
    }

    fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wrp_core::message::MessageType;

    struct UnreachableUrlFetcher;

    #[async_trait::async_trait]
    impl UrlFetcher for UnreachableUrlFetcher {
        async fn fetch(&self, _timeout: Duration) -> Result<String, UrlFetchError> {
            Err(UrlFetchError("not reachable in this test".to_string()))
        }
    }

    fn test_config(max_message_bytes: usize) -> QuicTransportConfig {
        let mut cfg = QuicTransportConfig::new(DeviceId::from_str("mac:112233445566").unwrap(), Arc::new(UnreachableUrlFetcher), max_message_bytes);
        cfg.probe_redirects = false;
        cfg.once = true;
        cfg
    }

    #[tokio::test]
    async fn handle_wrp_without_session_returns_closed() {
        let transport = QuicTransport::new(test_config(4096), Arc::new(EventBus::new()));
        let message = WrpMessage::new(MessageType::SimpleEvent, "mac:112233445566", "cloud");
        let err = transport.handle_wrp(message).await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn handle_wrp_rejects_oversized_message_before_touching_the_network() {
        let transport = QuicTransport::new(test_config(1), Arc::new(EventBus::new()));
        let message = WrpMessage::new(MessageType::SimpleEvent, "mac:112233445566", "cloud");
        let err = transport.handle_wrp(message).await.unwrap_err();
        assert!(matches!(err, SendError::TooLarge));
    }

    #[tokio::test]
    async fn failed_dial_emits_a_connect_event_with_an_error() {
        let events = Arc::new(EventBus::new());
        let seen_errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen_errors);
        events.on_connect(move |event: &ConnectEvent| {
            if event.err.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let transport = QuicTransport::new(test_config(4096), events);
        transport.start().await;
        transport.stop().await;

        assert_eq!(seen_errors.load(Ordering::SeqCst), 1);
    }
}
