//! WRP message model and MessagePack wire codec.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The tagged sum of WRP message kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AuthReq,
    SimpleRequestResponse,
    SimpleEvent,
    Create,
    Retrieve,
    Update,
    Delete,
    Unknown,
    ServiceAlive,
    ServiceRegistration,
}

impl MessageType {
    /// Whether this kind carries a `transaction_uuid` and expects exactly
    /// one response.
    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            MessageType::SimpleRequestResponse
                | MessageType::Create
                | MessageType::Retrieve
                | MessageType::Update
                | MessageType::Delete
        )
    }
}

/// A single WRP message. Encodes to/decodes from MessagePack.
///
/// `partner_ids` is an ordered multi-value field; `metadata` and `headers`
/// are plain string maps; `payload` is opaque bytes (e.g. a JSON CRUD body).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WrpMessage {
    #[serde(rename = "msg_type")]
    pub message_type: Option<MessageType>,
    pub source: String,
    pub destination: String,
    pub transaction_uuid: Option<Uuid>,
    pub content_type: Option<String>,
    pub status: Option<i64>,
    #[serde(default)]
    pub partner_ids: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
    pub path: Option<String>,
    /// Numeric QoS marker in `0..=99`, bucketed by `wrp-qos`.
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Optional trace-correlation string, observability-only.
    pub spans: Option<String>,
}

fn default_qos() -> u8 {
    25
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode WRP message as MessagePack: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode WRP message from MessagePack: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl WrpMessage {
    pub fn new(message_type: MessageType, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type),
            source: source.into(),
            destination: destination.into(),
            qos: default_qos(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Builds a response by swapping source/destination, copying the
    /// transaction id, and stamping the given status (used by the
    /// missing-destination and auth-filter handlers of §4.K).
    pub fn make_response(&self, status: i64, content_type: &str, payload: Vec<u8>) -> WrpMessage {
        WrpMessage {
            message_type: self.message_type,
            source: self.destination.clone(),
            destination: self.source.clone(),
            transaction_uuid: self.transaction_uuid,
            content_type: Some(content_type.to_string()),
            status: Some(status),
            partner_ids: self.partner_ids.clone(),
            qos: self.qos,
            payload,
            ..Default::default()
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.encode().map(|b| b.len()).unwrap_or(0)
    }
}
