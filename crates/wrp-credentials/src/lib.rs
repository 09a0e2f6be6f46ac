//! Bearer token fetch/refresh loop: obtains a token from a
//! credential endpoint, keeps it fresh, survives reboots via a filesystem
//! cache, and decorates outbound headers with `Authorization: Bearer <token>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use wrp_core::events::{CredentialFetchEvent, CredentialOrigin, DecorateEvent};
use wrp_core::{Clock, EventBus};

#[derive(Debug, thiserror::Error, Clone)]
pub enum DecorateError {
    #[error("no token has ever been fetched")]
    NoToken,
    #[error("the current token is expired")]
    TokenExpired,
    #[error("header map was not provided")]
    NilRequest,
}

/// Static device identity attached to every fetch request.
#[derive(Clone, Debug, Default)]
pub struct DeviceIdentity {
    pub mac_address: String,
    pub serial_number: String,
    pub hardware_model: String,
    pub hardware_manufacturer: String,
    pub firmware_name: String,
    pub protocol: String,
    pub last_reboot_reason: String,
    pub boot_retry_wait: String,
}

/// A value that may change across the service's lifetime, re-read on every
/// fetch.
pub trait DynamicField: Send + Sync {
    fn value(&self) -> String;
}

impl<F> DynamicField for F
where
    F: Fn() -> String + Send + Sync,
{
    fn value(&self) -> String {
        (self)()
    }
}

struct StaticDynamicField(String);
impl DynamicField for StaticDynamicField {
    fn value(&self) -> String {
        self.0.clone()
    }
}

/// Filesystem persistence configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub path: PathBuf,
    #[cfg(unix)]
    pub mode: u32,
}

/// The self-describing on-disk record: msgpack-encoded
/// `{token, expires_at}`, with a sibling `.sha256` integrity file.
#[derive(Serialize, Deserialize)]
struct CachedRecord {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct CredentialsConfig {
    pub credential_url: String,
    pub http_client: reqwest::Client,
    pub identity: DeviceIdentity,
    pub partner_id: Arc<dyn DynamicField>,
    pub last_reconnect_reason: Arc<dyn DynamicField>,
    pub refresh_fraction: f64,
    pub assumed_lifetime: Option<Duration>,
    pub cache: Option<CacheConfig>,
    pub required: bool,
}

impl CredentialsConfig {
    pub fn with_static_partner_id(mut self, partner_id: impl Into<String>) -> Self {
        self.partner_id = Arc::new(StaticDynamicField(partner_id.into()));
        self
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            credential_url: String::new(),
            http_client: reqwest::Client::new(),
            identity: DeviceIdentity::default(),
            partner_id: Arc::new(StaticDynamicField(String::new())),
            last_reconnect_reason: Arc::new(StaticDynamicField(String::new())),
            refresh_fraction: 0.9,
            assumed_lifetime: None,
            cache: None,
            required: true,
        }
    }
}

#[derive(Clone, Debug)]
struct TokenState {
    token: String,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

const MIN_RETRY: Duration = Duration::from_secs(1);
/// Sentinel "never expires" horizon used when neither the server nor
/// `assumed_lifetime` gives an expiry.
const ASSUMED_FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Obtains and maintains a bearer token, refreshing it proactively before
/// expiry and degrading gracefully when fetches fail.
pub struct CredentialsService<C: Clock = wrp_core::clock::SystemClock> {
    config: CredentialsConfig,
    clock: C,
    events: Mutex<Option<Arc<EventBus>>>,
    state: parking_lot::RwLock<Option<TokenState>>,
    fetched_once: Notify,
    fetched_once_fired: std::sync::atomic::AtomicBool,
    valid_signal: Notify,
    wake: Notify,
    cancel: CancellationToken,
    running: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CredentialsService<wrp_core::clock::SystemClock> {
    pub fn new(config: CredentialsConfig) -> Arc<Self> {
        Self::with_clock(config, wrp_core::clock::SystemClock)
    }
}

impl<C: Clock> CredentialsService<C> {
    pub fn with_clock(config: CredentialsConfig, clock: C) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            events: Mutex::new(None),
            state: parking_lot::RwLock::new(None),
            fetched_once: Notify::new(),
            fetched_once_fired: std::sync::atomic::AtomicBool::new(false),
            valid_signal: Notify::new(),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            running: Mutex::new(None),
        })
    }

    pub fn with_events(self: &Arc<Self>, events: Arc<EventBus>) -> Arc<Self> {
        *self.events.lock() = Some(events);
        Arc::clone(self)
    }

    /// Starts the refresh loop. Concurrent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.running.lock();
        if guard.is_some() {
            return;
        }
        if let Some(cache) = &self.config.cache {
            if let Some(state) = load_cache(cache) {
                tracing::info!(target: "wrp_credentials", "adopted cached token without contacting network");
                *self.state.write() = Some(state);
                self.valid_signal.notify_waiters();
            }
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    /// Idempotent; joins the loop task.
    pub async fn stop(self: &Arc<Self>) {
        self.cancel.cancel();
        let handle = self.running.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let outcome = self.fetch_once().await;
            self.fetched_once_fired.store(true, std::sync::atomic::Ordering::SeqCst);
            self.fetched_once.notify_waiters();

            let delay = match outcome {
                Ok(next_in) => next_in,
                Err(next_in) => next_in,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Wakes the loop to refetch immediately; clears the valid-signal until
    /// refetch succeeds.
    pub async fn mark_invalid(self: &Arc<Self>) {
        *self.state.write() = None;
        self.wake.notify_waiters();
    }

    /// Unblocks after the first fetch attempt completes or `deadline` elapses.
    pub async fn wait_until_fetched(&self, deadline: Duration) -> bool {
        if self.fetched_once_fired.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        tokio::time::timeout(deadline, self.fetched_once.notified()).await.is_ok()
    }

    /// Unblocks once a valid, non-expired token has been observed.
    pub async fn wait_until_valid(&self, deadline: Duration) -> bool {
        let now = self.clock.now();
        if self.state.read().as_ref().is_some_and(|s| s.is_valid(now)) {
            return true;
        }
        tokio::time::timeout(deadline, self.valid_signal.notified()).await.is_ok()
    }

    pub async fn credentials(&self) -> Result<(String, DateTime<Utc>), DecorateError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(DecorateError::NoToken)?;
        if !state.is_valid(self.clock.now()) {
            return Err(DecorateError::TokenExpired);
        }
        Ok((state.token.clone(), state.expires_at))
    }

    /// Sets `Authorization`. If `required=false`, always returns `Ok(())` but
    /// still fires the `Decorate` event describing the underlying condition.
    pub async fn decorate(&self, headers: &mut HashMap<String, String>) -> Result<(), DecorateError> {
        let result = self.credentials().await;
        let (expiration, err) = match &result {
            Ok((_, expires_at)) => (Some(*expires_at), None),
            Err(e) => (None, Some(Arc::from(e.to_string().as_str()))),
        };
        if let Some(events) = self.events.lock().as_ref() {
            events.emit_decorate(DecorateEvent { expiration, err });
        }
        match result {
            Ok((token, _)) => {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                Ok(())
            }
            Err(e) => {
                if self.config.required {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn fetch_once(self: &Arc<Self>) -> Result<Duration, Duration> {
        let started = self.clock.now();
        let request_uuid = uuid::Uuid::new_v4();
        let response = self
            .config
            .http_client
            .get(&self.config.credential_url)
            .header("X-Midt-Mac-Address", &self.config.identity.mac_address)
            .header("X-Midt-Serial-Number", &self.config.identity.serial_number)
            .header("X-Midt-Partner-Id", self.config.partner_id.value())
            .header("X-Midt-Hardware-Model", &self.config.identity.hardware_model)
            .header("X-Midt-Hardware-Manufacturer", &self.config.identity.hardware_manufacturer)
            .header("X-Midt-Firmware-Name", &self.config.identity.firmware_name)
            .header("X-Midt-Protocol", &self.config.identity.protocol)
            .header("X-Midt-Last-Reboot-Reason", &self.config.identity.last_reboot_reason)
            .header("X-Midt-Last-Reconnect-Reason", self.config.last_reconnect_reason.value())
            .header("X-Midt-Boot-Retry-Wait", &self.config.identity.boot_retry_wait)
            .header("X-Midt-Uuid", request_uuid.to_string())
            .send()
            .await;

        let duration = (self.clock.now() - started).to_std().unwrap_or_default();

        match response {
            Ok(resp) if resp.status().as_u16() == 200 => {
                let status_code = resp.status().as_u16();
                let expires_header = resp
                    .headers()
                    .get("Expires")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                let body = resp.text().await.unwrap_or_default();
                let now = self.clock.now();
                let expires_at = expires_header
                    .or_else(|| self.config.assumed_lifetime.map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()))
                    .unwrap_or_else(|| now + chrono::Duration::from_std(ASSUMED_FAR_FUTURE).unwrap_or_default());

                let state = TokenState { token: body, expires_at };
                *self.state.write() = Some(state.clone());
                self.valid_signal.notify_waiters();
                if let Some(cache) = &self.config.cache {
                    persist_cache(cache, &state);
                }

                let refresh_secs = self.config.refresh_fraction * (expires_at - now).num_seconds().max(0) as f64;
                let next_in = Duration::from_secs_f64(refresh_secs.max(MIN_RETRY.as_secs_f64()));

                self.emit_fetch(CredentialOrigin::Network, started, duration, request_uuid, Some(status_code), next_in, Some(expires_at), None);
                Ok(next_in)
            }
            Ok(resp) if resp.status().as_u16() == 429 => {
                let status_code = resp.status().as_u16();
                let retry_in = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(MIN_RETRY);
                self.emit_fetch(
                    CredentialOrigin::Network,
                    started,
                    duration,
                    request_uuid,
                    Some(status_code),
                    retry_in,
                    None,
                    Some(Arc::from("FetchFailed: rate limited")),
                );
                Err(retry_in)
            }
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let retry_in = MIN_RETRY;
                self.emit_fetch(
                    CredentialOrigin::Network,
                    started,
                    duration,
                    request_uuid,
                    Some(status_code),
                    retry_in,
                    None,
                    Some(Arc::from(format!("FetchFailed: status {status_code}").as_str())),
                );
                Err(retry_in)
            }
            Err(e) => {
                let retry_in = MIN_RETRY;
                self.emit_fetch(CredentialOrigin::Network, started, duration, request_uuid, None, retry_in, None, Some(Arc::from(e.to_string().as_str())));
                Err(retry_in)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_fetch(
        &self,
        origin: CredentialOrigin,
        at: DateTime<Utc>,
        duration: Duration,
        uuid: uuid::Uuid,
        status_code: Option<u16>,
        retry_in: Duration,
        expiration: Option<DateTime<Utc>>,
        err: Option<Arc<str>>,
    ) {
        if let Some(events) = self.events.lock().as_ref() {
            events.emit_credential_fetch(CredentialFetchEvent { origin, at, duration, uuid, status_code, retry_in, expiration, err });
        }
    }
}

fn load_cache(cache: &CacheConfig) -> Option<TokenState> {
    let bytes = std::fs::read(&cache.path).ok()?;
    let hash_path = cache.path.with_extension("sha256");
    let expected_hex = std::fs::read_to_string(&hash_path).ok()?;
    let actual = Sha256::digest(&bytes);
    if hex::encode(actual) != expected_hex.trim() {
        tracing::warn!(target: "wrp_credentials", "cache integrity hash mismatch; treating cache as absent");
        return None;
    }
    let record: CachedRecord = rmp_serde::from_slice(&bytes).ok()?;
    Some(TokenState { token: record.token, expires_at: record.expires_at })
}

fn persist_cache(cache: &CacheConfig, state: &TokenState) {
    let record = CachedRecord { token: state.token.clone(), expires_at: state.expires_at };
    let Ok(bytes) = rmp_serde::to_vec_named(&record) else { return };
    let digest = hex::encode(Sha256::digest(&bytes));

    let tmp_path = cache.path.with_extension("tmp");
    if write_atomic(&tmp_path, &cache.path, &bytes).is_err() {
        tracing::warn!(target: "wrp_credentials", "failed to persist credentials cache");
        return;
    }
    let hash_tmp = cache.path.with_extension("sha256.tmp");
    let hash_path = cache.path.with_extension("sha256");
    let _ = write_atomic(&hash_tmp, &hash_path, digest.as_bytes());
}

fn write_atomic(tmp_path: &std::path::Path, final_path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    {
        let mut file = std::fs::File::create(tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
        }
    }
    std::fs::rename(tmp_path, final_path)
}
