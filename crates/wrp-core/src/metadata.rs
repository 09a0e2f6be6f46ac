//! Metadata ("convey") provider.
//!
//! Produces the set of permitted metadata fields from live suppliers,
//! serializes them as JSON for the `X-Webpa-Convey` handshake header, and
//! can optionally copy the same fields into a WRP message's `metadata` map
//! for clouds that cannot read the handshake header.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::WrpMessage;

/// The permitted field names. Anything else is a configuration
/// error, caught at `MetadataProvider::build`.
pub const PERMITTED_FIELDS: &[&str] = &[
    "fw-name",
    "hw-model",
    "hw-manufacturer",
    "hw-serial-number",
    "hw-last-reboot-reason",
    "webpa-protocol",
    "boot-time",
    "boot-time-retry-wait",
    "webpa-interface-used",
    "interfaces-available",
];

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata field {0:?} is not one of the permitted convey fields")]
    UnknownField(String),
    #[error("failed to serialize convey header: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A live supplier of one field's current value. Most fields are static for
/// the process lifetime (`fw-name`); `interfaces-available` is dynamic,
/// derived from the host's live interface list.
pub trait FieldSource: Send + Sync {
    fn value(&self) -> Option<String>;
}

struct StaticField(String);

impl FieldSource for StaticField {
    fn value(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

impl<F> FieldSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn value(&self) -> Option<String> {
        (self)()
    }
}

/// Describes one live network interface as seen by the host.
#[derive(Clone, Debug)]
pub struct NetworkInterface {
    pub name: String,
    pub running: bool,
}

pub struct MetadataProviderBuilder {
    fields: HashMap<String, Arc<dyn FieldSource>>,
    interfaces: Option<Arc<dyn Fn() -> Vec<NetworkInterface> + Send + Sync>>,
    interface_allow_list: Vec<String>,
}

impl Default for MetadataProviderBuilder {
    fn default() -> Self {
        Self {
            fields: HashMap::new(),
            interfaces: None,
            interface_allow_list: Vec::new(),
        }
    }
}

impl MetadataProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a static or dynamic value for a permitted field name.
    /// Unknown field names fail at `build()`.
    pub fn with_field(mut self, name: impl Into<String>, source: impl FieldSource + 'static) -> Self {
        self.fields.insert(name.into(), Arc::new(source));
        self
    }

    pub fn with_static(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(name, StaticField(value.into()))
    }

    /// Registers the live interface lister and the administrator-configured
    /// allow-list used to derive `interfaces-available`.
    pub fn with_interfaces(
        mut self,
        lister: impl Fn() -> Vec<NetworkInterface> + Send + Sync + 'static,
        allow_list: Vec<String>,
    ) -> Self {
        self.interfaces = Some(Arc::new(lister));
        self.interface_allow_list = allow_list;
        self
    }

    pub fn build(self) -> Result<MetadataProvider, MetadataError> {
        for name in self.fields.keys() {
            if !PERMITTED_FIELDS.contains(&name.as_str()) {
                return Err(MetadataError::UnknownField(name.clone()));
            }
        }
        Ok(MetadataProvider {
            fields: self.fields,
            interfaces: self.interfaces,
            interface_allow_list: self.interface_allow_list,
        })
    }
}

/// Produces the convey map and decorates handshake headers / WRP messages.
pub struct MetadataProvider {
    fields: HashMap<String, Arc<dyn FieldSource>>,
    interfaces: Option<Arc<dyn Fn() -> Vec<NetworkInterface> + Send + Sync>>,
    interface_allow_list: Vec<String>,
}

impl MetadataProvider {
    pub fn builder() -> MetadataProviderBuilder {
        MetadataProviderBuilder::new()
    }

    /// Snapshot of every configured field's current value, plus
    /// `interfaces-available` if an interface lister was configured.
    pub fn snapshot(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (name, source) in &self.fields {
            if let Some(value) = source.value() {
                map.insert(name.clone(), value);
            }
        }
        if let Some(lister) = &self.interfaces {
            let available: Vec<String> = lister()
                .into_iter()
                .filter(|iface| iface.running)
                .filter(|iface| self.interface_allow_list.iter().any(|allowed| allowed == &iface.name))
                .map(|iface| iface.name)
                .collect();
            map.insert("interfaces-available".to_string(), available.join(","));
        }
        map
    }

    /// Serializes the snapshot as JSON for the `X-Webpa-Convey` header.
    pub fn convey_header(&self) -> Result<String, MetadataError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn decorate_headers(&self, headers: &mut HashMap<String, String>) -> Result<(), MetadataError> {
        headers.insert("X-Webpa-Convey".to_string(), self.convey_header()?);
        Ok(())
    }

    /// Copies the same fields into the message's `metadata` map — the
    /// explicit workaround for clouds that cannot read the handshake header.
    pub fn decorate_message(&self, message: &mut WrpMessage) {
        for (key, value) in self.snapshot() {
            message.metadata.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_field_name_is_rejected_at_build() {
        let err = MetadataProvider::builder()
            .with_static("not-a-real-field", "x")
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnknownField(_)));
    }

    #[test]
    fn convey_header_contains_configured_fields() {
        let provider = MetadataProvider::builder()
            .with_static("fw-name", "1.2.3")
            .with_static("hw-model", "widget")
            .build()
            .unwrap();
        let header = provider.convey_header().unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&header).unwrap();
        assert_eq!(parsed.get("fw-name").unwrap(), "1.2.3");
        assert_eq!(parsed.get("hw-model").unwrap(), "widget");
    }

    #[test]
    fn interfaces_available_is_filtered_by_running_and_allow_list() {
        let provider = MetadataProvider::builder()
            .with_interfaces(
                || {
                    vec![
                        NetworkInterface { name: "eth0".into(), running: true },
                        NetworkInterface { name: "eth1".into(), running: false },
                        NetworkInterface { name: "wlan0".into(), running: true },
                    ]
                },
                vec!["eth0".to_string()],
            )
            .build()
            .unwrap();
        let snapshot = provider.snapshot();
        assert_eq!(snapshot.get("interfaces-available").unwrap(), "eth0");
    }

    #[test]
    fn decorate_message_copies_fields_into_metadata() {
        let provider = MetadataProvider::builder().with_static("fw-name", "9.9.9").build().unwrap();
        let mut msg = WrpMessage::new(crate::message::MessageType::SimpleEvent, "a", "b");
        provider.decorate_message(&mut msg);
        assert_eq!(msg.metadata.get("fw-name").unwrap(), "9.9.9");
    }
}
