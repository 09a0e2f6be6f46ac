//! Shared model for the Cloud Connectivity Core: the WRP message type and its
//! MessagePack codec, device identity, the event bus, the retry policy, the
//! metadata ("convey") provider and an injectable clock.
//!
//! Downstream crates (`wrp-resolver`, `wrp-credentials`, `wrp-transport-ws`,
//! `wrp-transport-quic`, `wrp-qos`, `wrp-router`, `wrp-proxy`) depend on this
//! crate but never on each other's internals — it is the only shared
//! vocabulary between them.

pub mod clock;
pub mod device;
pub mod events;
pub mod loglevel;
pub mod message;
pub mod metadata;
pub mod retry;
pub mod transport;

pub use clock::Clock;
pub use device::DeviceId;
pub use events::{
    ConnectEvent, CredentialFetchEvent, CredentialOrigin, DecorateEvent, DisconnectEvent, EventBus, FetchEvent, HeartbeatEvent,
    IpMode, Listener, ListenerKind, MessageEvent,
};
pub use loglevel::{LogLevel, LogLevelController, UnknownLogLevel};
pub use message::{MessageType, WrpMessage};
pub use metadata::{MetadataError, MetadataProvider};
pub use retry::RetryPolicy;
pub use transport::{HeaderDecorator, IpFamily, MessageDecorator, NoopDecorator, SendError, Transport, UrlFetchError, UrlFetcher};
