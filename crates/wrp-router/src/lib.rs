//! Destination-addressed PubSub router and the WRP handler
//! pipeline installed between a transport and the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use wrp_core::message::{MessageType, WrpMessage};
use wrp_core::{DeviceId, LogLevel, LogLevelController};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("publish did not complete within the configured timeout")]
    Timeout,
    #[error("no egress handler is registered")]
    NoEgress,
}

/// Handles one `self`-addressed service's messages and optionally returns a
/// response to route back out.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, message: WrpMessage) -> Option<WrpMessage>;
}

/// Handles messages not addressed to `self`.
#[async_trait::async_trait]
pub trait EgressHandler: Send + Sync {
    async fn handle(&self, message: WrpMessage);
}

/// Cancels a subscription. Idempotent, mirrors [`wrp_core::events::Cancel`].
pub struct Cancel {
    cancelled: Arc<AtomicBool>,
}

impl Cancel {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct ServiceSlot {
    cancelled: Arc<AtomicBool>,
    handler: Arc<dyn ServiceHandler>,
}

enum Destination {
    SelfService { service: String, path: Option<String> },
    Remote,
}

fn resolve(self_id: &DeviceId, destination: &str) -> Destination {
    let prefix = format!("{self_id}/");
    match destination.strip_prefix(prefix.as_str()) {
        Some(rest) => {
            let mut parts = rest.splitn(2, '/');
            let service = parts.next().unwrap_or("").to_string();
            let path = parts.next().map(|s| s.to_string());
            Destination::SelfService { service, path }
        }
        None => Destination::Remote,
    }
}

fn status_payload(status: i64, message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "statusCode": status, "message": message })).unwrap_or_default()
}

/// Maps destinations to handlers and dispatches inbound/outbound WRP
/// messages between them.
pub struct Router {
    self_id: DeviceId,
    services: RwLock<HashMap<String, ServiceSlot>>,
    egress: RwLock<Option<(Arc<AtomicBool>, Arc<dyn EgressHandler>)>>,
}

impl Router {
    pub fn new(self_id: DeviceId) -> Self {
        Self {
            self_id,
            services: RwLock::new(HashMap::new()),
            egress: RwLock::new(None),
        }
    }

    pub fn subscribe_service(&self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Cancel {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.services.write().insert(
            name.into(),
            ServiceSlot {
                cancelled: Arc::clone(&cancelled),
                handler,
            },
        );
        Cancel { cancelled }
    }

    pub fn subscribe_egress(&self, handler: Arc<dyn EgressHandler>) -> Cancel {
        let cancelled = Arc::new(AtomicBool::new(false));
        *self.egress.write() = Some((Arc::clone(&cancelled), handler));
        Cancel { cancelled }
    }

    /// Dispatches `message`, returning [`RouterError::Timeout`] if it does
    /// not complete within `publish_timeout`.
    pub async fn publish(&self, message: WrpMessage, publish_timeout: Duration) -> Result<(), RouterError> {
        tokio::time::timeout(publish_timeout, self.publish_inner(message))
            .await
            .map_err(|_| RouterError::Timeout)?
    }

    async fn publish_inner(&self, message: WrpMessage) -> Result<(), RouterError> {
        match resolve(&self.self_id, &message.destination) {
            Destination::SelfService { service, path } => {
                let matched = {
                    let guard = self.services.read();
                    guard
                        .get(&service)
                        .filter(|slot| !slot.cancelled.load(Ordering::SeqCst))
                        .map(|slot| Arc::clone(&slot.handler))
                };
                match matched {
                    Some(handler) => {
                        let mut routed = message.clone();
                        if routed.path.is_none() {
                            routed.path = path;
                        }
                        if let Some(response) = handler.handle(routed).await {
                            self.egress(response).await?;
                        }
                        Ok(())
                    }
                    None => {
                        let response = message.make_response(404, "application/json", status_payload(404, "no subscriber for destination"));
                        self.egress(response).await
                    }
                }
            }
            Destination::Remote => self.egress(message).await,
        }
    }

    async fn egress(&self, message: WrpMessage) -> Result<(), RouterError> {
        let handler = {
            let guard = self.egress.read();
            guard
                .as_ref()
                .filter(|(cancelled, _)| !cancelled.load(Ordering::SeqCst))
                .map(|(_, handler)| Arc::clone(handler))
        };
        match handler {
            Some(handler) => {
                handler.handle(message).await;
                Ok(())
            }
            None => Err(RouterError::NoEgress),
        }
    }
}

/// The auth-filter step installed ahead of the router. Messages
/// failing the partner-id check are either turned into a 403 (transactional
/// kinds) and routed back out, or silently dropped (fire-and-forget kinds,
/// which have no response channel to fail on).
pub struct AuthFilter {
    required_partner_id: Option<Arc<str>>,
}

impl AuthFilter {
    pub fn new(required_partner_id: Option<Arc<str>>) -> Self {
        Self { required_partner_id }
    }

    /// Returns `Some(response)` when the message should be rejected and a
    /// response synthesized, `None` when it passed (or was silently
    /// dropped — check `tracing` output to distinguish the two).
    pub fn check(&self, message: &WrpMessage) -> AuthOutcome {
        let Some(required) = &self.required_partner_id else {
            return AuthOutcome::Allowed;
        };
        let authorized = message.partner_ids.iter().any(|p| p.as_str() == required.as_ref());
        if authorized {
            return AuthOutcome::Allowed;
        }
        if message.message_type.map(MessageType::is_transactional).unwrap_or(false) {
            AuthOutcome::Rejected(message.make_response(403, "application/json", status_payload(403, "partner id not authorized")))
        } else {
            AuthOutcome::Dropped
        }
    }
}

pub enum AuthOutcome {
    Allowed,
    Rejected(WrpMessage),
    Dropped,
}

/// Wires the auth filter in front of a [`Router`] so transports can hand it
/// every inbound message directly.
pub struct Pipeline {
    router: Arc<Router>,
    auth: AuthFilter,
}

impl Pipeline {
    pub fn new(router: Arc<Router>, required_partner_id: Option<Arc<str>>) -> Self {
        Self {
            router,
            auth: AuthFilter::new(required_partner_id),
        }
    }

    pub async fn handle_inbound(&self, message: WrpMessage, publish_timeout: Duration) {
        match self.auth.check(&message) {
            AuthOutcome::Allowed => {
                if let Err(err) = self.router.publish(message, publish_timeout).await {
                    tracing::warn!(error = %err, "failed to publish inbound message");
                }
            }
            AuthOutcome::Rejected(response) => {
                if let Err(err) = self.router.publish(response, publish_timeout).await {
                    tracing::warn!(error = %err, "failed to publish auth-rejection response");
                }
            }
            AuthOutcome::Dropped => {
                tracing::warn!("dropped unauthorized non-transactional message");
            }
        }
    }
}

#[derive(Deserialize)]
struct LogLevelRequest {
    loglevel: String,
    #[serde(default)]
    duration: Option<DurationField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationField {
    Seconds(u64),
    Text(String),
}

fn parse_duration_field(field: &DurationField) -> Option<Duration> {
    match field {
        DurationField::Seconds(secs) => Some(Duration::from_secs(*secs)),
        DurationField::Text(text) => parse_duration_text(text),
    }
}

/// Parses a simple `<number><unit>` duration string (`ns|us|ms|s|m|h`), the
/// shape `loglevel` bodies carry theirs in. Returns `None` on anything else
/// so the caller falls back to the 30-minute default.
fn parse_duration_text(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split_at = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = text.split_at(split_at);
    let value: f64 = number.parse().ok()?;
    let seconds = match unit {
        "ns" => value / 1_000_000_000.0,
        "us" => value / 1_000_000.0,
        "ms" => value / 1_000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        _ => return None,
    };
    if seconds < 0.0 || !seconds.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// CRUD handler for `self/loglevel`: applies a temporary level
/// override for the request's duration (default 30 minutes), then reverts.
pub struct LogLevelCrudHandler {
    controller: Arc<dyn LogLevelController>,
    default_duration: Duration,
    pending_revert: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LogLevelCrudHandler {
    pub fn new(controller: Arc<dyn LogLevelController>) -> Self {
        Self {
            controller,
            default_duration: Duration::from_secs(30 * 60),
            pending_revert: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl ServiceHandler for LogLevelCrudHandler {
    async fn handle(&self, message: WrpMessage) -> Option<WrpMessage> {
        if message.path.as_deref() != Some("loglevel") {
            return Some(message.make_response(400, "application/json", status_payload(400, "unknown path")));
        }
        if message.message_type != Some(MessageType::Update) {
            return Some(message.make_response(400, "application/json", status_payload(400, "only update is supported for loglevel")));
        }
        let Ok(body) = serde_json::from_slice::<LogLevelRequest>(&message.payload) else {
            return Some(message.make_response(400, "application/json", status_payload(400, "malformed loglevel payload")));
        };
        let Ok(level) = body.loglevel.parse::<LogLevel>() else {
            return Some(message.make_response(400, "application/json", status_payload(400, "unsupported loglevel")));
        };
        let duration = body.duration.as_ref().and_then(parse_duration_field).unwrap_or(self.default_duration);

        let original = self.controller.current_level();
        if let Err(err) = self.controller.set_level(level) {
            return Some(message.make_response(500, "application/json", status_payload(500, &err)));
        }

        let controller = Arc::clone(&self.controller);
        let mut guard = self.pending_revert.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = controller.set_level(original);
        }));

        Some(message.make_response(200, "application/json", status_payload(200, "loglevel updated")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::str::FromStr;
    use uuid::Uuid;

    fn self_id() -> DeviceId {
        DeviceId::from_str("mac:112233445566").unwrap()
    }

    struct RecordingEgress {
        sent: Arc<SyncMutex<Vec<WrpMessage>>>,
    }

    #[async_trait::async_trait]
    impl EgressHandler for RecordingEgress {
        async fn handle(&self, message: WrpMessage) {
            self.sent.lock().push(message);
        }
    }

    struct EchoService;

    #[async_trait::async_trait]
    impl ServiceHandler for EchoService {
        async fn handle(&self, message: WrpMessage) -> Option<WrpMessage> {
            Some(message.make_response(200, "application/json", b"{}".to_vec()))
        }
    }

    struct HangingService;

    #[async_trait::async_trait]
    impl ServiceHandler for HangingService {
        async fn handle(&self, _message: WrpMessage) -> Option<WrpMessage> {
            std::future::pending::<()>().await;
            None
        }
    }

    fn remote_message(destination: &str) -> WrpMessage {
        let mut msg = WrpMessage::new(MessageType::SimpleRequestResponse, "dns:cloud.example.com", destination);
        msg.transaction_uuid = Some(Uuid::new_v4());
        msg
    }

    #[tokio::test]
    async fn remote_destination_goes_to_egress() {
        let router = Router::new(self_id());
        let sent = Arc::new(SyncMutex::new(Vec::new()));
        router.subscribe_egress(Arc::new(RecordingEgress { sent: Arc::clone(&sent) }));

        router.publish(remote_message("dns:other-device.example.com/foo"), Duration::from_secs(1)).await.unwrap();

        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn self_destination_with_subscriber_routes_response_to_egress() {
        let router = Router::new(self_id());
        let sent = Arc::new(SyncMutex::new(Vec::new()));
        router.subscribe_egress(Arc::new(RecordingEgress { sent: Arc::clone(&sent) }));
        router.subscribe_service("echo", Arc::new(EchoService));

        router.publish(remote_message("mac:11:22:33:44:55:66/echo"), Duration::from_secs(1)).await.unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, Some(200));
    }

    #[tokio::test]
    async fn self_destination_with_no_subscriber_synthesizes_404() {
        let router = Router::new(self_id());
        let sent = Arc::new(SyncMutex::new(Vec::new()));
        router.subscribe_egress(Arc::new(RecordingEgress { sent: Arc::clone(&sent) }));

        router.publish(remote_message("mac:11:22:33:44:55:66/unknown"), Duration::from_secs(1)).await.unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, Some(404));
    }

    #[tokio::test]
    async fn publish_without_egress_surfaces_no_egress_error() {
        let router = Router::new(self_id());
        let err = router.publish(remote_message("dns:other.example.com/x"), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RouterError::NoEgress));
    }

    #[tokio::test]
    async fn publish_times_out_against_a_hanging_handler() {
        let router = Router::new(self_id());
        router.subscribe_egress(Arc::new(RecordingEgress { sent: Arc::new(SyncMutex::new(Vec::new())) }));
        router.subscribe_service("stuck", Arc::new(HangingService));

        let err = router
            .publish(remote_message("mac:11:22:33:44:55:66/stuck"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Timeout));
    }

    #[tokio::test]
    async fn cancelled_subscription_behaves_like_no_subscriber() {
        let router = Router::new(self_id());
        let sent = Arc::new(SyncMutex::new(Vec::new()));
        router.subscribe_egress(Arc::new(RecordingEgress { sent: Arc::clone(&sent) }));
        let cancel = router.subscribe_service("echo", Arc::new(EchoService));
        cancel.cancel();

        router.publish(remote_message("mac:11:22:33:44:55:66/echo"), Duration::from_secs(1)).await.unwrap();

        assert_eq!(sent.lock()[0].status, Some(404));
    }

    #[test]
    fn auth_filter_allows_matching_partner_id() {
        let filter = AuthFilter::new(Some(Arc::from("acme")));
        let mut msg = remote_message("dns:x/y");
        msg.partner_ids = vec!["acme".to_string()];
        assert!(matches!(filter.check(&msg), AuthOutcome::Allowed));
    }

    #[test]
    fn auth_filter_rejects_transactional_without_matching_partner_id() {
        let filter = AuthFilter::new(Some(Arc::from("acme")));
        let msg = remote_message("dns:x/y");
        assert!(matches!(filter.check(&msg), AuthOutcome::Rejected(_)));
    }

    #[test]
    fn auth_filter_drops_non_transactional_without_matching_partner_id() {
        let filter = AuthFilter::new(Some(Arc::from("acme")));
        let msg = WrpMessage::new(MessageType::SimpleEvent, "dns:x", "dns:y");
        assert!(matches!(filter.check(&msg), AuthOutcome::Dropped));
    }

    #[test]
    fn duration_text_parses_common_suffixes() {
        assert_eq!(parse_duration_text("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_text("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_text("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration_text("garbage"), None);
    }

    struct FakeLevelController {
        level: SyncMutex<LogLevel>,
    }

    impl LogLevelController for FakeLevelController {
        fn set_level(&self, level: LogLevel) -> Result<(), String> {
            *self.level.lock() = level;
            Ok(())
        }

        fn current_level(&self) -> LogLevel {
            *self.level.lock()
        }
    }

    fn loglevel_request(loglevel: &str, path: Option<&str>, duration: Option<&str>) -> WrpMessage {
        let mut msg = WrpMessage::new(MessageType::Update, "dns:cloud.example.com", "mac:11:22:33:44:55:66/self");
        msg.path = path.map(|p| p.to_string());
        let mut body = serde_json::json!({ "loglevel": loglevel });
        if let Some(d) = duration {
            body["duration"] = serde_json::Value::String(d.to_string());
        }
        msg.payload = serde_json::to_vec(&body).unwrap();
        msg
    }

    #[tokio::test(start_paused = true)]
    async fn loglevel_change_reverts_after_duration() {
        let controller = Arc::new(FakeLevelController { level: SyncMutex::new(LogLevel::Info) });
        let handler = LogLevelCrudHandler::new(Arc::clone(&controller) as Arc<dyn LogLevelController>);

        let response = handler.handle(loglevel_request("debug", Some("loglevel"), Some("10s"))).await.unwrap();
        assert_eq!(response.status, Some(200));
        assert_eq!(controller.current_level(), LogLevel::Debug);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.current_level(), LogLevel::Info);
    }

    #[tokio::test]
    async fn loglevel_rejects_unknown_path() {
        let controller = Arc::new(FakeLevelController { level: SyncMutex::new(LogLevel::Info) });
        let handler = LogLevelCrudHandler::new(controller);
        let response = handler.handle(loglevel_request("debug", Some("other"), None)).await.unwrap();
        assert_eq!(response.status, Some(400));
    }

    #[tokio::test]
    async fn loglevel_rejects_unsupported_level() {
        let controller = Arc::new(FakeLevelController { level: SyncMutex::new(LogLevel::Info) });
        let handler = LogLevelCrudHandler::new(controller);
        let response = handler.handle(loglevel_request("trace", Some("loglevel"), None)).await.unwrap();
        assert_eq!(response.status, Some(400));
    }

    #[tokio::test]
    async fn loglevel_falls_back_to_default_duration_on_unparsable_value() {
        let controller = Arc::new(FakeLevelController { level: SyncMutex::new(LogLevel::Info) });
        let handler = LogLevelCrudHandler::new(Arc::clone(&controller) as Arc<dyn LogLevelController>);
        let response = handler.handle(loglevel_request("warn", Some("loglevel"), Some("not-a-duration"))).await.unwrap();
        assert_eq!(response.status, Some(200));
        assert_eq!(controller.current_level(), LogLevel::Warn);
    }

    #[tokio::test(start_paused = true)]
    async fn loglevel_update_through_the_full_inbound_pipeline_reverts_after_duration() {
        let router = Arc::new(Router::new(self_id()));
        let sent = Arc::new(SyncMutex::new(Vec::new()));
        router.subscribe_egress(Arc::new(RecordingEgress { sent: Arc::clone(&sent) }));

        let controller = Arc::new(FakeLevelController { level: SyncMutex::new(LogLevel::Info) });
        router.subscribe_service("self", Arc::new(LogLevelCrudHandler::new(Arc::clone(&controller) as Arc<dyn LogLevelController>)));

        let pipeline = Pipeline::new(Arc::clone(&router), None);
        let request = loglevel_request("debug", Some("loglevel"), Some("2s"));
        let source = request.source.clone();
        pipeline.handle_inbound(request, Duration::from_secs(1)).await;

        assert_eq!(controller.current_level(), LogLevel::Debug);
        let sent_so_far = sent.lock();
        assert_eq!(sent_so_far.len(), 1);
        assert_eq!(sent_so_far[0].status, Some(200));
        assert_eq!(sent_so_far[0].content_type.as_deref(), Some("application/json"));
        assert_eq!(sent_so_far[0].destination, source);
        drop(sent_so_far);

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.current_level(), LogLevel::Info);
    }
}
