//! Agent facade: a typed builder composing the Event Bus,
//! Credentials Service, JWT-TXT Resolver, Metadata Provider, both
//! transports behind the Cloud Proxy, the QoS Queue, and the PubSub Router
//! with its handler pipeline installed, into a single `Agent` handle.
//!
//! No configuration-file format, CLI surface, or dependency-injection
//! framework is introduced here — construction is explicit constructor
//! composition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wrp_core::{Clock, DeviceId, EventBus, HeaderDecorator, LogLevelController, MessageDecorator, MetadataProvider, Transport, WrpMessage};
use wrp_credentials::{CredentialsConfig, CredentialsService};
use wrp_proxy::{Proxy, ProxyConfig, ProxyError};
use wrp_qos::{QosConfig, QosError, QosQueue};
use wrp_resolver::{ConfigError as ResolverConfigError, DnsTxtResolver, EndpointResolver, ResolverConfig};
use wrp_router::{AuthFilter, EgressHandler, LogLevelCrudHandler, Pipeline, Router, ServiceHandler};
use wrp_transport_quic::QuicTransportConfig;
use wrp_transport_ws::WsTransportConfig;

pub use wrp_router::RouterError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),
    #[error(transparent)]
    Resolver(#[from] ResolverConfigError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

struct ResolverUrlFetcher<C: Clock> {
    resolver: Arc<EndpointResolver<C>>,
}

#[async_trait::async_trait]
impl<C: Clock> wrp_core::UrlFetcher for ResolverUrlFetcher<C> {
    async fn fetch(&self, timeout: Duration) -> Result<String, wrp_core::UrlFetchError> {
        tokio::time::timeout(timeout, self.resolver.endpoint())
            .await
            .map_err(|_| wrp_core::UrlFetchError("endpoint resolution timed out".to_string()))?
            .map_err(|e| wrp_core::UrlFetchError(e.to_string()))
    }
}

struct StaticUrlFetcher(String);

#[async_trait::async_trait]
impl wrp_core::UrlFetcher for StaticUrlFetcher {
    async fn fetch(&self, _timeout: Duration) -> Result<String, wrp_core::UrlFetchError> {
        Ok(self.0.clone())
    }
}

struct CredentialsHeaderDecorator<C: Clock> {
    credentials: Arc<CredentialsService<C>>,
}

#[async_trait::async_trait]
impl<C: Clock> HeaderDecorator for CredentialsHeaderDecorator<C> {
    async fn decorate(&self, headers: &mut HashMap<String, String>) -> Result<(), String> {
        self.credentials.decorate(headers).await.map_err(|e| e.to_string())
    }
}

struct MetadataHeaderDecorator {
    metadata: Arc<MetadataProvider>,
}

#[async_trait::async_trait]
impl HeaderDecorator for MetadataHeaderDecorator {
    async fn decorate(&self, headers: &mut HashMap<String, String>) -> Result<(), String> {
        self.metadata.decorate_headers(headers).map_err(|e| e.to_string())
    }
}

struct MetadataMessageDecorator {
    metadata: Arc<MetadataProvider>,
}

impl MessageDecorator for MetadataMessageDecorator {
    fn decorate(&self, message: &mut WrpMessage) {
        self.metadata.decorate_message(message);
    }
}

/// Bridges `wrp-qos` into the router pipeline's [`EgressHandler`] seam:
/// every non-self-addressed or synthesized-response message lands here.
struct QosEgress {
    queue: Arc<QosQueue>,
}

#[async_trait::async_trait]
impl EgressHandler for QosEgress {
    async fn handle(&self, message: WrpMessage) {
        if let Err(err) = self.queue.try_enqueue(message) {
            tracing::warn!(error = %err, "dropped outbound message at the qos queue");
        }
    }
}

/// Tuning shared by both transports (timeouts, size limits, retry shape).
/// Lets the builder avoid repeating the same six fields twice.
#[derive(Clone)]
pub struct TransportTuning {
    pub max_message_bytes: usize,
    pub url_fetch_timeout: Duration,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            max_message_bytes: 256 * 1024,
            url_fetch_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
        }
    }
}

/// Which endpoint-discovery strategy the agent should dial through.
pub enum EndpointSource {
    /// Full JWT-over-DNS-TXT resolution.
    Resolver { config: ResolverConfig, dns: Arc<dyn DnsTxtResolver> },
    /// A fixed URL, bypassing DNS — primarily useful for tests and
    /// environments with an out-of-band endpoint.
    Static(String),
}

/// Typed builder validating configuration in one pass at [`build`](AgentBuilder::build).
pub struct AgentBuilder {
    device_id: Option<DeviceId>,
    endpoint: Option<EndpointSource>,
    credentials: Option<CredentialsConfig>,
    metadata: Option<MetadataProvider>,
    tuning: TransportTuning,
    proxy: ProxyConfig,
    qos: QosConfig,
    publish_timeout: Duration,
    required_partner_id: Option<Arc<str>>,
    log_level_controller: Option<Arc<dyn LogLevelController>>,
    additional_headers: HashMap<String, String>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            device_id: None,
            endpoint: None,
            credentials: None,
            metadata: None,
            tuning: TransportTuning::default(),
            proxy: ProxyConfig::default(),
            qos: QosConfig {
                max_queue_bytes: 8 * 1024 * 1024,
                max_message_bytes: 256 * 1024,
                eviction_policy: wrp_qos::EvictionPolicy::default(),
                expiration: wrp_qos::ExpirationPolicy::default(),
            },
            publish_timeout: Duration::from_secs(5),
            required_partner_id: None,
            log_level_controller: None,
            additional_headers: HashMap::new(),
        }
    }

    pub fn device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointSource) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn credentials(mut self, config: CredentialsConfig) -> Self {
        self.credentials = Some(config);
        self
    }

    pub fn metadata(mut self, metadata: MetadataProvider) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn transport_tuning(mut self, tuning: TransportTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn proxy_config(mut self, config: ProxyConfig) -> Self {
        self.proxy = config;
        self
    }

    pub fn qos_config(mut self, config: QosConfig) -> Self {
        self.qos = config;
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn required_partner_id(mut self, partner_id: impl Into<Arc<str>>) -> Self {
        self.required_partner_id = Some(partner_id.into());
        self
    }

    /// Wires the `self/loglevel` CRUD handler against a
    /// runtime-reloadable log controller, e.g. `wrp_otel::install_with_reload`'s
    /// return value. Omitted entirely when no controller is supplied.
    pub fn log_level_controller(mut self, controller: Arc<dyn LogLevelController>) -> Self {
        self.log_level_controller = Some(controller);
        self
    }

    pub fn additional_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.additional_headers = headers;
        self
    }

    /// Validates configuration in one pass, returning every failure found
    /// rather than the first, then constructs and wires every component.
    pub fn build(self) -> Result<Arc<Agent>, Vec<AgentError>> {
        let mut errors = Vec::new();

        if self.device_id.is_none() {
            errors.push(AgentError::MissingConfig("device_id"));
        }
        if self.endpoint.is_none() {
            errors.push(AgentError::MissingConfig("endpoint"));
        }
        if self.credentials.is_none() {
            errors.push(AgentError::MissingConfig("credentials"));
        }
        if self.metadata.is_none() {
            errors.push(AgentError::MissingConfig("metadata"));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let device_id = self.device_id.unwrap();
        let credentials_config = self.credentials.unwrap();
        let metadata = Arc::new(self.metadata.unwrap());

        let url_fetcher: Arc<dyn wrp_core::UrlFetcher> = match self.endpoint.unwrap() {
            EndpointSource::Static(url) => Arc::new(StaticUrlFetcher(url)),
            EndpointSource::Resolver { config, dns } => {
                let resolver = EndpointResolver::new(config, dns).map_err(|e| vec![AgentError::Resolver(e)])?;
                Arc::new(ResolverUrlFetcher { resolver: Arc::new(resolver) })
            }
        };

        let credentials = CredentialsService::new(credentials_config);
        let credentials_events = Arc::new(EventBus::new());
        let credentials = credentials.with_events(Arc::clone(&credentials_events));

        let credentials_decorator: Arc<dyn HeaderDecorator> = Arc::new(CredentialsHeaderDecorator { credentials: Arc::clone(&credentials) });
        let metadata_header_decorator: Arc<dyn HeaderDecorator> = Arc::new(MetadataHeaderDecorator { metadata: Arc::clone(&metadata) });
        let metadata_message_decorator: Arc<dyn MessageDecorator> = Arc::new(MetadataMessageDecorator { metadata: Arc::clone(&metadata) });

        let retry_initial = self.tuning.retry_initial;
        let retry_max = self.tuning.retry_max;

        let ws_config = WsTransportConfig {
            device_id: device_id.clone(),
            url_fetcher: Arc::clone(&url_fetcher),
            url_fetch_timeout: self.tuning.url_fetch_timeout,
            credentials_decorator: Arc::clone(&credentials_decorator),
            metadata_decorator: Arc::clone(&metadata_header_decorator),
            per_message_metadata_decorator: Some(Arc::clone(&metadata_message_decorator)),
            max_message_bytes: self.tuning.max_message_bytes,
            inactivity_timeout: Duration::from_secs(90),
            ping_write_timeout: Duration::from_secs(5),
            send_timeout: self.tuning.send_timeout,
            additional_headers: self.additional_headers.clone(),
            allow_v4: true,
            allow_v6: true,
            retry_policy_factory: Arc::new(move || wrp_core::RetryPolicy::with_defaults(retry_initial, retry_max)),
            once: false,
        };
        let ws_events = Arc::new(EventBus::new());
        let ws_transport = wrp_transport_ws::WsTransport::new(ws_config, ws_events);

        let quic_config = QuicTransportConfig {
            device_id: device_id.clone(),
            url_fetcher: Arc::clone(&url_fetcher),
            url_fetch_timeout: self.tuning.url_fetch_timeout,
            credentials_decorator: Arc::clone(&credentials_decorator),
            metadata_decorator: Arc::clone(&metadata_header_decorator),
            per_message_metadata_decorator: Some(Arc::clone(&metadata_message_decorator)),
            max_message_bytes: self.tuning.max_message_bytes,
            send_timeout: self.tuning.send_timeout,
            connect_timeout: self.tuning.connect_timeout,
            additional_headers: self.additional_headers,
            probe_redirects: true,
            http_client: reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap_or_default(),
            retry_policy_factory: Arc::new(move || wrp_core::RetryPolicy::with_defaults(retry_initial, retry_max)),
            once: false,
        };
        let quic_events = Arc::new(EventBus::new());
        let quic_transport = wrp_transport_quic::QuicTransport::new(quic_config, quic_events);

        let proxy = Proxy::new(ws_transport, quic_transport, self.proxy).map_err(|e| vec![AgentError::Proxy(e)])?;

        let queue = Arc::new(QosQueue::new(self.qos));
        let router = Arc::new(Router::new(device_id.clone()));
        router.subscribe_egress(Arc::new(QosEgress { queue: Arc::clone(&queue) }));

        if let Some(controller) = self.log_level_controller.clone() {
            let handler: Arc<dyn ServiceHandler> = Arc::new(LogLevelCrudHandler::new(controller));
            router.subscribe_service("self", handler);
        }

        let pipeline = Arc::new(Pipeline::new(Arc::clone(&router), self.required_partner_id.clone()));

        let cancel = CancellationToken::new();
        let agent = Arc::new(Agent {
            device_id,
            proxy,
            router,
            queue: Arc::clone(&queue),
            credentials,
            pipeline: Arc::clone(&pipeline),
            publish_timeout: self.publish_timeout,
            cancel: cancel.clone(),
            drain_handle: tokio::sync::Mutex::new(None),
        });

        agent.wire_inbound();
        Ok(agent)
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The live, wired Cloud Connectivity Core. Construct via [`AgentBuilder`].
pub struct Agent {
    device_id: DeviceId,
    proxy: Arc<Proxy>,
    router: Arc<Router>,
    queue: Arc<QosQueue>,
    credentials: Arc<CredentialsService>,
    pipeline: Arc<Pipeline>,
    publish_timeout: Duration,
    cancel: CancellationToken,
    drain_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Agent {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn wire_inbound(self: &Arc<Self>) {
        let pipeline = Arc::clone(&self.pipeline);
        let publish_timeout = self.publish_timeout;
        self.proxy.events().on_message(move |event: &wrp_core::events::MessageEvent| {
            let pipeline = Arc::clone(&pipeline);
            let message = event.wrp.clone();
            tokio::spawn(async move { pipeline.handle_inbound(message, publish_timeout).await });
        });
    }

    /// Starts credentials, the active transport (via the Proxy), and the
    /// queue-drain loop that forwards admitted outbound messages to it.
    pub async fn start(self: &Arc<Self>) {
        self.credentials.start();
        self.proxy.start().await;

        let mut guard = self.drain_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let proxy = Arc::clone(&self.proxy);
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                let cancelled = cancel.cancelled();
                match queue.dequeue(cancelled).await {
                    Some(message) => {
                        if let Err(err) = proxy.handle_wrp(message).await {
                            tracing::warn!(error = %err, "failed to hand a dequeued message to the active transport");
                        }
                    }
                    None => return,
                }
            }
        }));
    }

    /// Idempotent; stops the drain loop, the active transport, and the
    /// credentials refresh loop.
    pub async fn stop(self: &Arc<Self>) {
        self.cancel.cancel();
        let handle = self.drain_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.proxy.stop().await;
        self.credentials.stop().await;
    }

    /// Enqueues an outbound message onto the QoS queue; never
    /// blocks the caller.
    pub fn publish(&self, message: WrpMessage) -> Result<(), QosError> {
        self.queue.try_enqueue(message)
    }

    /// Registers a handler for `self`-addressed destinations under
    /// `service_name`.
    pub fn subscribe_service(&self, service_name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> wrp_router::Cancel {
        self.router.subscribe_service(service_name, handler)
    }
}
