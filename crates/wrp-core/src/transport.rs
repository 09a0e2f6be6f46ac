//! The uniform transport interface the Cloud Proxy drives both concrete
//! transports through: `start`/`stop`/`name`/listener
//! registration/`handle_wrp`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::WrpMessage;
use crate::EventBus;

/// Decorates outbound handshake headers, e.g. credentials or metadata.
/// Shared between both concrete transports so neither depends on
/// `wrp-credentials` or `wrp-core::metadata` directly.
#[async_trait::async_trait]
pub trait HeaderDecorator: Send + Sync {
    async fn decorate(&self, headers: &mut HashMap<String, String>) -> Result<(), String>;
}

/// Optionally copies handshake metadata into a message's own `metadata` map
/// before it is sent.
pub trait MessageDecorator: Send + Sync {
    fn decorate(&self, message: &mut WrpMessage);
}

pub struct NoopDecorator;

#[async_trait::async_trait]
impl HeaderDecorator for NoopDecorator {
    async fn decorate(&self, _headers: &mut HashMap<String, String>) -> Result<(), String> {
        Ok(())
    }
}

/// The IP family a transport is permitted or currently bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Failure taxonomy for outbound sends.
#[derive(Debug, thiserror::Error, Clone)]
pub enum SendError {
    #[error("no connection is currently active")]
    Closed,
    #[error("message exceeds the configured maximum size")]
    TooLarge,
    #[error("send did not complete within the configured deadline")]
    SendTimeout,
    #[error("transport write failed: {0}")]
    Write(String),
}

/// Resolves the endpoint URL to dial, e.g. the JWT-TXT resolver or a static
/// URL. Async so a resolver can do its own I/O.
#[async_trait::async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, timeout: std::time::Duration) -> Result<String, UrlFetchError>;
}

#[derive(Debug, thiserror::Error, Clone)]
#[error("url fetch failed: {0}")]
pub struct UrlFetchError(pub String);

/// The behavior the Cloud Proxy depends on: `Start`, `Stop`,
/// `Name`, `HandleWrp`. Listener registration happens through the shared
/// [`EventBus`] each transport is constructed with, rather than per-method
/// generics, so this trait stays object-safe for the Proxy's trait-object
/// storage.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self);
    async fn stop(&self);
    async fn handle_wrp(&self, message: WrpMessage) -> Result<(), SendError>;
    fn events(&self) -> Arc<EventBus>;
}
