//! Remote REST endpoint abstraction and its `reqwest` implementation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::SyncSettings;
use crate::models::{ChangeRecord, EntityId, EntityType, FailureKind, SyncableEntity};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const HEALTH_PATH: &str = "/health";
const AUTH_EVENT_CAPACITY: usize = 16;
/// How long an unreachable local endpoint is skipped before it is dialed again
pub const LOCAL_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Classified failure of a remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network error, timeout, 408, 409, 429 or 5xx
    #[error("Transient remote failure: {0}")]
    Transient(String),
    /// Request rejected by the server; retrying cannot help
    #[error("Rejected by server: {0}")]
    Validation(String),
    #[error("Not found on server: {0}")]
    NotFound(String),
    /// Credentials missing or expired (401)
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized,
            404 => Self::NotFound(message),
            408 | 409 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Validation(message),
        }
    }

    /// How a change record that hit this error should be marked failed.
    ///
    /// `None` for errors that must not count as an attempt.
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transient(_) | Self::InvalidConfiguration(_) => Some(FailureKind::Transient),
            Self::Validation(_) | Self::NotFound(_) => Some(FailureKind::Validation),
            Self::Unauthorized => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::from_status(status, error.to_string());
        }
        if error.is_decode() {
            return Self::Validation(format!("invalid response body: {error}"));
        }
        Self::Transient(error.to_string())
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Credential lifecycle events emitted by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    TokenExpired,
    TokenRefreshed,
}

/// Wire representation of an entity on the sync server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub id: EntityId,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub last_modified: i64,
    #[serde(default)]
    pub origin_source: Option<String>,
    #[serde(default)]
    pub origin_timestamp: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteEntity {
    /// Outgoing version of a claimed change.
    pub fn from_change(change: &ChangeRecord, origin_source: Option<&str>) -> Self {
        Self {
            id: change.entity_id,
            payload: change.payload.clone(),
            last_modified: change.local_modified,
            origin_source: origin_source.map(ToString::to_string),
            origin_timestamp: Some(change.created_at),
            deleted: change.change_kind.is_delete(),
        }
    }

    /// Local copy of this version, already acknowledged by the server.
    pub fn into_local(self, entity_type: EntityType) -> SyncableEntity {
        SyncableEntity {
            entity_type,
            id: self.id,
            payload: self.payload,
            last_modified: self.last_modified,
            origin_source: self.origin_source,
            origin_timestamp: self.origin_timestamp,
            synced: true,
            remote_modified: Some(self.last_modified),
            is_deleted: self.deleted,
        }
    }
}

/// The sync server as seen by the engine.
///
/// Writes return the `lastModified` the server acknowledged. Writes are
/// upserts keyed by entity id, so replaying one is harmless.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Current remote version, including tombstones
    async fn get(&self, entity_type: EntityType, id: &EntityId) -> RemoteResult<Option<RemoteEntity>>;

    async fn create(&self, entity_type: EntityType, entity: &RemoteEntity) -> RemoteResult<i64>;

    async fn update(&self, entity_type: EntityType, entity: &RemoteEntity) -> RemoteResult<i64>;

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        last_modified: i64,
    ) -> RemoteResult<i64>;

    /// Versions changed strictly after `since`, oldest first
    async fn changes_since(
        &self,
        entity_type: EntityType,
        since: Option<i64>,
    ) -> RemoteResult<Vec<RemoteEntity>>;

    async fn health_check(&self) -> RemoteResult<()>;

    /// Credential events, if this transport emits them
    fn auth_events(&self) -> Option<broadcast::Receiver<AuthEvent>> {
        None
    }
}

#[derive(Debug, Clone)]
struct BaseUrl {
    url: String,
    timeout: Duration,
}

/// HTTP transport with local-preferred, remote-fallback endpoint selection.
///
/// A local endpoint that fails at the network level is skipped for
/// `local_retry_after`, or until a health check finds it up again.
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    local: Option<BaseUrl>,
    remote: Option<BaseUrl>,
    local_down_since: Arc<Mutex<Option<Instant>>>,
    local_retry_after: Duration,
    token: Arc<Mutex<Option<String>>>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(
        local_base_url: Option<String>,
        remote_base_url: Option<String>,
        local_timeout: Duration,
        remote_timeout: Duration,
    ) -> RemoteResult<Self> {
        let local = normalize_base_url(local_base_url, "local_base_url")?
            .map(|url| BaseUrl {
                url,
                timeout: local_timeout,
            });
        let remote = normalize_base_url(remote_base_url, "remote_base_url")?
            .map(|url| BaseUrl {
                url,
                timeout: remote_timeout,
            });
        if local.is_none() && remote.is_none() {
            return Err(RemoteError::InvalidConfiguration(
                "no sync endpoint configured".to_string(),
            ));
        }

        let (auth_tx, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            local,
            remote,
            local_down_since: Arc::new(Mutex::new(None)),
            local_retry_after: LOCAL_RETRY_AFTER,
            token: Arc::new(Mutex::new(None)),
            auth_tx,
        })
    }

    pub fn from_settings(settings: &SyncSettings) -> RemoteResult<Self> {
        Self::new(
            settings.local_base_url.clone(),
            settings.remote_base_url.clone(),
            settings.local_timeout(),
            settings.remote_timeout(),
        )
    }

    #[must_use]
    pub fn with_local_retry_after(mut self, retry_after: Duration) -> Self {
        self.local_retry_after = retry_after;
        self
    }

    /// Whether the local endpoint is configured and currently dialed.
    pub fn is_local_available(&self) -> bool {
        self.local.is_some() && self.local_usable()
    }

    fn local_usable(&self) -> bool {
        self.local_down_since
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .map_or(true, |since| since.elapsed() >= self.local_retry_after)
    }

    fn set_local_available(&self, available: bool) {
        if let Ok(mut guard) = self.local_down_since.lock() {
            *guard = if available { None } else { Some(Instant::now()) };
        }
    }

    /// Install a fresh bearer token and announce it to subscribers.
    pub fn set_token(&self, token: Option<String>) {
        let token = normalize_text_option(token);
        let refreshed = token.is_some();
        if let Ok(mut guard) = self.token.lock() {
            *guard = token;
        }
        if refreshed {
            // No subscribers is fine
            let _ = self.auth_tx.send(AuthEvent::TokenRefreshed);
        }
    }

    pub(crate) fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }

    fn candidates(&self) -> Vec<&BaseUrl> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(local) = &self.local {
            if self.local_usable() {
                candidates.push(local);
            }
        }
        if let Some(remote) = &self.remote {
            candidates.push(remote);
        }
        candidates
    }

    async fn send<F>(&self, build: F) -> RemoteResult<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.dispatch(build, "application/json", false).await
    }

    /// Open a long-lived `text/event-stream` response at `path`.
    ///
    /// Falls back from local to remote like every other call; the endpoint
    /// timeout covers the response headers only.
    pub(crate) async fn open_event_stream(&self, path: &str) -> RemoteResult<reqwest::Response> {
        self.dispatch(
            |client, base| client.get(format!("{base}{path}")),
            "text/event-stream",
            true,
        )
        .await
    }

    /// Send a request to the first reachable base URL.
    ///
    /// Only network-level failures fall through to the next candidate; any
    /// HTTP response is final.
    async fn dispatch<F>(
        &self,
        build: F,
        accept: &'static str,
        streaming: bool,
    ) -> RemoteResult<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.token();
        let mut last_error = None;

        for base in self.candidates() {
            let is_local = self.local.as_ref().is_some_and(|local| local.url == base.url);
            let mut request =
                build(&self.client, &base.url).header(reqwest::header::ACCEPT, accept);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let sent = if streaming {
                match tokio::time::timeout(base.timeout, request.send()).await {
                    Ok(sent) => sent.map_err(RemoteError::from),
                    Err(_) => Err(RemoteError::Transient(format!(
                        "timed out connecting to {}",
                        base.url
                    ))),
                }
            } else {
                request.timeout(base.timeout).send().await.map_err(RemoteError::from)
            };

            match sent {
                Ok(response) => {
                    if is_local {
                        self.set_local_available(true);
                    }
                    return self.check_status(response).await;
                }
                Err(error) => {
                    if is_local {
                        tracing::warn!("Local endpoint {} unreachable: {}", base.url, error);
                        self.set_local_available(false);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RemoteError::Transient("no reachable sync endpoint".to_string())
        }))
    }

    async fn check_status(&self, response: reqwest::Response) -> RemoteResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            let _ = self.auth_tx.send(AuthEvent::TokenExpired);
            return Err(RemoteError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status, parse_api_error(status, &body)))
    }

    async fn write(
        &self,
        entity_type: EntityType,
        entity: &RemoteEntity,
        create: bool,
    ) -> RemoteResult<i64> {
        let response = self
            .send(|client, base| {
                if create {
                    client
                        .post(format!("{base}/{}", entity_type.resource_path()))
                        .json(entity)
                } else {
                    client
                        .put(format!("{base}/{}/{}", entity_type.resource_path(), entity.id))
                        .json(entity)
                }
            })
            .await?;
        acknowledged(response, entity.last_modified).await
    }
}

/// Read the acknowledged `lastModified`, defaulting to what was sent.
async fn acknowledged(response: reqwest::Response, sent: i64) -> RemoteResult<i64> {
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Ok(sent);
    }
    let stored: RemoteEntity = serde_json::from_str(&body)
        .map_err(|error| RemoteError::Validation(format!("invalid acknowledgement: {error}")))?;
    Ok(stored.last_modified)
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn get(&self, entity_type: EntityType, id: &EntityId) -> RemoteResult<Option<RemoteEntity>> {
        match self
            .send(|client, base| {
                client.get(format!("{base}/{}/{id}", entity_type.resource_path()))
            })
            .await
        {
            Ok(response) => Ok(Some(response.json::<RemoteEntity>().await?)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn create(&self, entity_type: EntityType, entity: &RemoteEntity) -> RemoteResult<i64> {
        self.write(entity_type, entity, true).await
    }

    async fn update(&self, entity_type: EntityType, entity: &RemoteEntity) -> RemoteResult<i64> {
        self.write(entity_type, entity, false).await
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        last_modified: i64,
    ) -> RemoteResult<i64> {
        let result = self
            .send(|client, base| {
                client
                    .delete(format!("{base}/{}/{id}", entity_type.resource_path()))
                    .query(&[("lastModified", last_modified)])
            })
            .await;
        match result {
            Ok(response) => acknowledged(response, last_modified).await,
            // Already gone
            Err(RemoteError::NotFound(_)) => Ok(last_modified),
            Err(error) => Err(error),
        }
    }

    async fn changes_since(
        &self,
        entity_type: EntityType,
        since: Option<i64>,
    ) -> RemoteResult<Vec<RemoteEntity>> {
        let response = self
            .send(|client, base| {
                client
                    .get(format!("{base}/{}/changes", entity_type.resource_path()))
                    .query(&[("since", since.unwrap_or(0))])
            })
            .await?;
        let mut changes = response.json::<Vec<RemoteEntity>>().await?;
        changes.sort_by_key(|entity| entity.last_modified);
        Ok(changes)
    }

    async fn health_check(&self) -> RemoteResult<()> {
        if let Some(local) = &self.local {
            let probe = self
                .client
                .get(format!("{}{HEALTH_PATH}", local.url))
                .timeout(local.timeout)
                .send()
                .await;
            let healthy = probe.is_ok_and(|response| response.status().is_success());
            self.set_local_available(healthy);
            if healthy {
                return Ok(());
            }
        }

        match &self.remote {
            Some(_) => self
                .send(|client, base| client.get(format!("{base}{HEALTH_PATH}")))
                .await
                .map(|_| ()),
            None => Err(RemoteError::Transient(
                "local endpoint unreachable".to_string(),
            )),
        }
    }

    fn auth_events(&self) -> Option<broadcast::Receiver<AuthEvent>> {
        Some(self.auth_tx.subscribe())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Human-readable API error ending in `(status)`.
pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP ({})", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: Option<String>, field: &str) -> RemoteResult<Option<String>> {
    let Some(url) = normalize_text_option(raw) else {
        return Ok(None);
    };
    if is_http_url(&url) {
        Ok(Some(url.trim_end_matches('/').to_string()))
    } else {
        Err(RemoteError::InvalidConfiguration(format!(
            "{field} must include http:// or https://"
        )))
    }
}
