//! Cloud Proxy: owns the WebSocket and HTTP/3 transports behind
//! a single active handle, fails over between them on sustained connect
//! failure, and fans both transports' events out through one bus.

use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use wrp_core::events::ConnectEvent;
use wrp_core::{EventBus, SendError, Transport};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    Ws,
    Quic,
}

/// Which transport to prefer at start, and the failover threshold (spec
/// §4.H: "`tries_since_last_connect > max_tries`").
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub prefer_quic: bool,
    pub max_tries: u32,
    pub ws_enabled: bool,
    pub quic_enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefer_quic: false,
            max_tries: 5,
            ws_enabled: true,
            quic_enabled: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("the preferred transport is administratively disabled and no alternative is enabled")]
    NoTransportEnabled,
}

/// Drives both transports, exposing the same [`Transport`] surface upward
/// so the agent facade cannot tell it apart from a single concrete one.
pub struct Proxy {
    ws: Arc<dyn Transport>,
    quic: Arc<dyn Transport>,
    config: ProxyConfig,
    active: Mutex<Side>,
    events: Arc<EventBus>,
    self_weak: OnceCell<Weak<Proxy>>,
}

impl Proxy {
    /// Builds a proxy over both transports. `prefer_quic` (and each side's
    /// `*_enabled` flag) decide the initial active side; if the preferred
    /// side is disabled, the other one is used instead.
    pub fn new(ws: Arc<dyn Transport>, quic: Arc<dyn Transport>, config: ProxyConfig) -> Result<Arc<Self>, ProxyError> {
        let initial = match (config.prefer_quic, config.ws_enabled, config.quic_enabled) {
            (_, false, false) => return Err(ProxyError::NoTransportEnabled),
            (true, _, true) => Side::Quic,
            (true, true, false) => Side::Ws,
            (false, true, _) => Side::Ws,
            (false, false, true) => Side::Quic,
        };

        let proxy = Arc::new(Self {
            ws,
            quic,
            config,
            active: Mutex::new(initial),
            events: Arc::new(EventBus::new()),
            self_weak: OnceCell::new(),
        });
        let _ = proxy.self_weak.set(Arc::downgrade(&proxy));
        proxy.wire_fanout();
        Ok(proxy)
    }

    fn weak_self(&self) -> Weak<Proxy> {
        self.self_weak.get().cloned().expect("self_weak set in Proxy::new before any listener fires")
    }

    fn wire_fanout(&self) {
        use wrp_core::events::{DisconnectEvent, HeartbeatEvent, MessageEvent};

        let up = Arc::clone(&self.events);
        let u = Arc::clone(&up);
        self.ws.events().on_message(move |e: &MessageEvent| u.emit_message(e.clone()));
        let u = Arc::clone(&up);
        self.ws.events().on_disconnect(move |e: &DisconnectEvent| u.emit_disconnect(e.clone()));
        let u = Arc::clone(&up);
        self.ws.events().on_heartbeat(move |e: &HeartbeatEvent| u.emit_heartbeat(e.clone()));

        let u = Arc::clone(&up);
        self.quic.events().on_message(move |e: &MessageEvent| u.emit_message(e.clone()));
        let u = Arc::clone(&up);
        self.quic.events().on_disconnect(move |e: &DisconnectEvent| u.emit_disconnect(e.clone()));
        let u = Arc::clone(&up);
        self.quic.events().on_heartbeat(move |e: &HeartbeatEvent| u.emit_heartbeat(e.clone()));

        let u = Arc::clone(&up);
        let weak = self.weak_self();
        self.ws.events().on_connect(move |e: &ConnectEvent| {
            u.emit_connect(e.clone());
            if let Some(proxy) = weak.upgrade() {
                proxy.maybe_failover(Side::Ws, e);
            }
        });
        let u = Arc::clone(&up);
        let weak = self.weak_self();
        self.quic.events().on_connect(move |e: &ConnectEvent| {
            u.emit_connect(e.clone());
            if let Some(proxy) = weak.upgrade() {
                proxy.maybe_failover(Side::Quic, e);
            }
        });
    }

    /// Fires on every connect event of either transport, regardless of
    /// which side is currently active. Only acts when
    /// the event is from the currently active side, the failure threshold
    /// is exceeded, and the other side is administratively enabled.
    fn maybe_failover(&self, side: Side, event: &ConnectEvent) {
        if event.err.is_none() || event.tries_since_last_connect <= self.config.max_tries {
            return;
        }

        let mut active = self.active.lock();
        if *active != side {
            return;
        }
        let other_enabled = match side {
            Side::Ws => self.config.quic_enabled,
            Side::Quic => self.config.ws_enabled,
        };
        if !other_enabled {
            tracing::warn!(?side, "active transport exceeded max_tries but the alternative is disabled; continuing to retry");
            return;
        }

        let other = match side {
            Side::Ws => Side::Quic,
            Side::Quic => Side::Ws,
        };
        *active = other;
        drop(active);

        tracing::info!(?side, tries = event.tries_since_last_connect, "failing over to the other transport");
        let (to_stop, to_start) = match side {
            Side::Ws => (Arc::clone(&self.ws), Arc::clone(&self.quic)),
            Side::Quic => (Arc::clone(&self.quic), Arc::clone(&self.ws)),
        };
        tokio::spawn(async move {
            to_stop.stop().await;
            to_start.start().await;
        });
    }

    fn active_transport(&self) -> Arc<dyn Transport> {
        match *self.active.lock() {
            Side::Ws => Arc::clone(&self.ws),
            Side::Quic => Arc::clone(&self.quic),
        }
    }
}

#[async_trait::async_trait]
impl Transport for Proxy {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn start(&self) {
        self.active_transport().start().await;
    }

    async fn stop(&self) {
        self.active_transport().stop().await;
    }

    async fn handle_wrp(&self, message: wrp_core::WrpMessage) -> Result<(), SendError> {
        self.active_transport().handle_wrp(message).await
    }

    fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;
    use wrp_core::{MessageType, WrpMessage};

    struct FakeTransport {
        name: &'static str,
        events: Arc<EventBus>,
        start_count: Arc<AtomicUsize>,
        stop_count: Arc<AtomicUsize>,
        handled: Arc<AsyncMutex<Vec<WrpMessage>>>,
    }

    impl FakeTransport {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                events: Arc::new(EventBus::new()),
                start_count: Arc::new(AtomicUsize::new(0)),
                stop_count: Arc::new(AtomicUsize::new(0)),
                handled: Arc::new(AsyncMutex::new(Vec::new())),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self) {
            self.start_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn stop(&self) {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn handle_wrp(&self, message: WrpMessage) -> Result<(), SendError> {
            self.handled.lock().await.push(message);
            Ok(())
        }

        fn events(&self) -> Arc<EventBus> {
            Arc::clone(&self.events)
        }
    }

    fn connect_event(err: Option<&str>, tries: u32) -> ConnectEvent {
        ConnectEvent {
            started: chrono::Utc::now(),
            at: chrono::Utc::now(),
            mode: wrp_core::events::IpMode::V4,
            retrying_at: None,
            err: err.map(Arc::from),
            tries_since_last_connect: tries,
        }
    }

    #[tokio::test]
    async fn prefers_quic_when_configured_and_both_enabled() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(
            ws.clone(),
            quic.clone(),
            ProxyConfig { prefer_quic: true, ..Default::default() },
        )
        .unwrap();

        proxy.start().await;

        assert_eq!(quic.start_count.load(Ordering::SeqCst), 1);
        assert_eq!(ws.start_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_to_the_enabled_side_when_preferred_is_disabled() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(
            ws.clone(),
            quic.clone(),
            ProxyConfig { prefer_quic: true, quic_enabled: false, ..Default::default() },
        )
        .unwrap();

        proxy.start().await;

        assert_eq!(ws.start_count.load(Ordering::SeqCst), 1);
        assert_eq!(quic.start_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_construction_when_both_sides_disabled() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let err = Proxy::new(ws, quic, ProxyConfig { ws_enabled: false, quic_enabled: false, ..Default::default() }).unwrap_err();
        assert!(matches!(err, ProxyError::NoTransportEnabled));
    }

    #[tokio::test]
    async fn handle_wrp_forwards_to_the_active_transport() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(ws.clone(), quic.clone(), ProxyConfig::default()).unwrap();

        let msg = WrpMessage::new(MessageType::SimpleEvent, "mac:112233445566", "cloud");
        proxy.handle_wrp(msg).await.unwrap();

        assert_eq!(ws.handled.lock().await.len(), 1);
        assert_eq!(quic.handled.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn failover_swaps_active_side_and_stops_start_the_other() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(ws.clone(), quic.clone(), ProxyConfig { max_tries: 3, ..Default::default() }).unwrap();

        ws.events.emit_connect(connect_event(Some("boom"), 4));

        // failover spawns a task; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(ws.stop_count.load(Ordering::SeqCst), 1);
        assert_eq!(quic.start_count.load(Ordering::SeqCst), 1);

        let msg = WrpMessage::new(MessageType::SimpleEvent, "mac:112233445566", "cloud");
        proxy.handle_wrp(msg).await.unwrap();
        assert_eq!(quic.handled.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failover_does_not_fire_below_the_try_threshold() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(ws.clone(), quic.clone(), ProxyConfig { max_tries: 10, ..Default::default() }).unwrap();

        ws.events.emit_connect(connect_event(Some("boom"), 2));
        tokio::task::yield_now().await;

        assert_eq!(quic.start_count.load(Ordering::SeqCst), 0);
        let msg = WrpMessage::new(MessageType::SimpleEvent, "mac:112233445566", "cloud");
        proxy.handle_wrp(msg).await.unwrap();
        assert_eq!(ws.handled.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failover_does_not_fire_when_the_alternative_is_disabled() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(ws.clone(), quic.clone(), ProxyConfig { max_tries: 1, quic_enabled: false, ..Default::default() }).unwrap();

        ws.events.emit_connect(connect_event(Some("boom"), 5));
        tokio::task::yield_now().await;

        assert_eq!(quic.start_count.load(Ordering::SeqCst), 0);
        let msg = WrpMessage::new(MessageType::SimpleEvent, "mac:112233445566", "cloud");
        proxy.handle_wrp(msg).await.unwrap();
        assert_eq!(ws.handled.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn message_events_from_either_side_fan_out_upward() {
        let ws = FakeTransport::new("ws");
        let quic = FakeTransport::new("quic");
        let proxy = Proxy::new(ws.clone(), quic.clone(), ProxyConfig::default()).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        proxy.events().on_message(move |_: &wrp_core::events::MessageEvent| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        ws.events.emit_message(wrp_core::events::MessageEvent {
            wrp: WrpMessage::new(MessageType::SimpleEvent, "a", "b"),
        });
        quic.events.emit_message(wrp_core::events::MessageEvent {
            wrp: WrpMessage::new(MessageType::SimpleEvent, "a", "b"),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
