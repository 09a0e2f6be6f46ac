//! Typed, multi-listener event fan-out.
//!
//! Listener lists are copy-on-write (`Arc<Vec<_>>` swapped under a short
//! lock) so `visit` never holds a lock across user code — a listener is
//! free to call back into the bus (e.g. to add another listener) without
//! deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::message::WrpMessage;

/// IP family a transport dialed with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpMode {
    V4,
    V6,
}

/// Fired on every connect attempt of a transport.
#[derive(Clone, Debug)]
pub struct ConnectEvent {
    pub started: DateTime<Utc>,
    pub at: DateTime<Utc>,
    pub mode: IpMode,
    pub retrying_at: Option<DateTime<Utc>>,
    pub err: Option<Arc<str>>,
    pub tries_since_last_connect: u32,
}

/// Fired when a connection is torn down.
#[derive(Clone, Debug)]
pub struct DisconnectEvent {
    pub at: DateTime<Utc>,
    pub err: Option<Arc<str>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

#[derive(Clone, Debug)]
pub struct HeartbeatEvent {
    pub at: DateTime<Utc>,
    pub kind: HeartbeatKind,
}

/// Fired on every resolution attempt by the JWT-TXT resolver.
#[derive(Clone, Debug)]
pub struct FetchEvent {
    pub fqdn: String,
    pub server: Option<String>,
    pub found: bool,
    pub timeout: bool,
    pub prior_expiration: Option<DateTime<Utc>>,
    pub expiration: Option<DateTime<Utc>>,
    pub temporary_err: bool,
    pub endpoint: Option<String>,
    pub payload: Option<String>,
    pub err: Option<Arc<str>>,
}

/// Fired on every fetch attempt by the credentials service. A
/// distinct shape from the resolver's [`FetchEvent`], since the two services
/// fetch different things under the same "Fetch" vocabulary word.
#[derive(Clone, Debug)]
pub struct CredentialFetchEvent {
    pub origin: CredentialOrigin,
    pub at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub uuid: uuid::Uuid,
    pub status_code: Option<u16>,
    pub retry_in: std::time::Duration,
    pub expiration: Option<DateTime<Utc>>,
    pub err: Option<Arc<str>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialOrigin {
    Network,
    Filesystem,
}

/// Fired on every `Decorate` call by the credentials service.
#[derive(Clone, Debug)]
pub struct DecorateEvent {
    pub expiration: Option<DateTime<Utc>>,
    pub err: Option<Arc<str>>,
}

/// One inbound/outbound WRP carried across the bus.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub wrp: WrpMessage,
}

/// The event kinds a listener can subscribe to.
pub enum ListenerKind {
    Connect,
    Disconnect,
    Heartbeat,
    Fetch,
    CredentialFetch,
    Decorate,
    Message,
}

/// A callback invoked synchronously on the producer's calling context.
/// Listeners must not mutate the producer.
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<F, E> Listener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self)(event)
    }
}

/// A handle that cancels a listener registration when dropped or when
/// `cancel()` is called explicitly. Cancel is idempotent.
pub struct Cancel {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Cancel {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct Slot<E> {
    id: u64,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    listener: Arc<dyn Listener<E>>,
}

struct Channel<E> {
    slots: Mutex<Arc<Vec<Slot<E>>>>,
}

impl<E> Default for Channel<E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Arc::new(Vec::new())),
        }
    }
}

impl<E> Channel<E> {
    fn add(&self, listener: Arc<dyn Listener<E>>, next_id: &AtomicU64) -> Cancel {
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let slot = Slot {
            id,
            cancelled: Arc::clone(&cancelled),
            listener,
        };
        let mut guard = self.slots.lock();
        let mut next: Vec<Slot<E>> = (**guard).iter().map(Slot::clone_slot).collect();
        next.push(slot);
        *guard = Arc::new(next);
        Cancel { cancelled }
    }

    fn visit(&self, event: &E) {
        let snapshot = Arc::clone(&self.slots.lock());
        let mut any_cancelled = false;
        for slot in snapshot.iter() {
            if slot.cancelled.load(Ordering::SeqCst) {
                any_cancelled = true;
                continue;
            }
            slot.listener.on_event(event);
        }
        if any_cancelled {
            self.sweep();
        }
    }

    fn sweep(&self) {
        let mut guard = self.slots.lock();
        let retained: Vec<Slot<E>> = (**guard)
            .iter()
            .filter(|s| !s.cancelled.load(Ordering::SeqCst))
            .map(Slot::clone_slot)
            .collect();
        *guard = Arc::new(retained);
    }
}

impl<E> Slot<E> {
    fn clone_slot(&self) -> Slot<E> {
        Slot {
            id: self.id,
            cancelled: Arc::clone(&self.cancelled),
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Fan-out hub for the five lifecycle event kinds. There is no ordering
/// guarantee across kinds; within one kind, listeners observe
/// events in the order the producing component emitted them.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    connect: Channel<ConnectEvent>,
    disconnect: Channel<DisconnectEvent>,
    heartbeat: Channel<HeartbeatEvent>,
    fetch: Channel<FetchEvent>,
    credential_fetch: Channel<CredentialFetchEvent>,
    decorate: Channel<DecorateEvent>,
    message: Channel<MessageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&self, listener: impl Listener<ConnectEvent> + 'static) -> Cancel {
        self.connect.add(Arc::new(listener), &self.next_id)
    }

    pub fn on_disconnect(&self, listener: impl Listener<DisconnectEvent> + 'static) -> Cancel {
        self.disconnect.add(Arc::new(listener), &self.next_id)
    }

    pub fn on_heartbeat(&self, listener: impl Listener<HeartbeatEvent> + 'static) -> Cancel {
        self.heartbeat.add(Arc::new(listener), &self.next_id)
    }

    pub fn on_fetch(&self, listener: impl Listener<FetchEvent> + 'static) -> Cancel {
        self.fetch.add(Arc::new(listener), &self.next_id)
    }

    pub fn on_credential_fetch(&self, listener: impl Listener<CredentialFetchEvent> + 'static) -> Cancel {
        self.credential_fetch.add(Arc::new(listener), &self.next_id)
    }

    pub fn on_decorate(&self, listener: impl Listener<DecorateEvent> + 'static) -> Cancel {
        self.decorate.add(Arc::new(listener), &self.next_id)
    }

    pub fn on_message(&self, listener: impl Listener<MessageEvent> + 'static) -> Cancel {
        self.message.add(Arc::new(listener), &self.next_id)
    }

    pub fn emit_connect(&self, event: ConnectEvent) {
        self.connect.visit(&event);
    }

    pub fn emit_disconnect(&self, event: DisconnectEvent) {
        self.disconnect.visit(&event);
    }

    pub fn emit_heartbeat(&self, event: HeartbeatEvent) {
        self.heartbeat.visit(&event);
    }

    pub fn emit_fetch(&self, event: FetchEvent) {
        self.fetch.visit(&event);
    }

    pub fn emit_credential_fetch(&self, event: CredentialFetchEvent) {
        self.credential_fetch.visit(&event);
    }

    pub fn emit_decorate(&self, event: DecorateEvent) {
        self.decorate.visit(&event);
    }

    pub fn emit_message(&self, event: MessageEvent) {
        self.message.visit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn visit_invokes_every_listener_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        bus.on_connect(move |_: &ConnectEvent| o1.lock().push(1));
        let o2 = Arc::clone(&order);
        bus.on_connect(move |_: &ConnectEvent| o2.lock().push(2));

        bus.emit_connect(ConnectEvent {
            started: Utc::now(),
            at: Utc::now(),
            mode: IpMode::V4,
            retrying_at: None,
            err: None,
            tries_since_last_connect: 0,
        });

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn cancel_is_idempotent_and_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let cancel = bus.on_disconnect(move |_: &DisconnectEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_disconnect(DisconnectEvent { at: Utc::now(), err: None });
        cancel.cancel();
        cancel.cancel();
        bus.emit_disconnect(DisconnectEvent { at: Utc::now(), err: None });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_register_another_listener_without_deadlock() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_outer = Arc::clone(&fired);
        bus.on_heartbeat(move |_: &HeartbeatEvent| {
            let fired_inner = Arc::clone(&fired_outer);
            inner.on_heartbeat(move |_: &HeartbeatEvent| {
                fired_inner.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.emit_heartbeat(HeartbeatEvent { at: Utc::now(), kind: HeartbeatKind::Ping });
        bus.emit_heartbeat(HeartbeatEvent { at: Utc::now(), kind: HeartbeatKind::Pong });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
