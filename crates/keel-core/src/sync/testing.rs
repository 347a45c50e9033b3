//! In-memory remote and realtime doubles for sync tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;

use super::realtime::{ChangeNotification, NotificationStream, RealtimeSource};
use super::remote::{AuthEvent, RemoteEndpoint, RemoteEntity, RemoteError, RemoteResult};
use crate::models::{EntityId, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// Server double: upserts keyed by `(type, id)`, `lastModified` taken from
/// the client as the real server does.
pub struct MemoryRemote {
    entities: Mutex<HashMap<(EntityType, EntityId), RemoteEntity>>,
    writes: Mutex<Vec<(WriteKind, EntityType, EntityId)>>,
    scripted_failures: Mutex<VecDeque<RemoteError>>,
    offline: AtomicBool,
    unauthorized: AtomicBool,
    calls: AtomicUsize,
    latency: Mutex<Duration>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            unauthorized: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            auth_tx: broadcast::channel(16).0,
        }
    }

    /// Fail the next `count` writes with `error`.
    pub fn fail_next_writes(&self, count: usize, error: RemoteError) {
        let mut failures = self.scripted_failures.lock().unwrap();
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Delay every `get` by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject every call with 401 until the token is refreshed.
    pub fn expire_token(&self) {
        self.unauthorized.store(true, Ordering::SeqCst);
        let _ = self.auth_tx.send(AuthEvent::TokenExpired);
    }

    pub fn refresh_token(&self) {
        self.unauthorized.store(false, Ordering::SeqCst);
        let _ = self.auth_tx.send(AuthEvent::TokenRefreshed);
    }

    /// Store a version as if another device had pushed it.
    pub fn put_remote(&self, entity_type: EntityType, entity: RemoteEntity) {
        self.entities
            .lock()
            .unwrap()
            .insert((entity_type, entity.id), entity);
    }

    /// Drop an entity without leaving a tombstone, as a server purge does.
    pub fn remove_remote(&self, entity_type: EntityType, id: &EntityId) {
        self.entities.lock().unwrap().remove(&(entity_type, *id));
    }

    pub fn entity(&self, entity_type: EntityType, id: &EntityId) -> Option<RemoteEntity> {
        self.entities
            .lock()
            .unwrap()
            .get(&(entity_type, *id))
            .cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().unwrap().len()
    }

    pub fn writes(&self) -> Vec<(WriteKind, EntityType, EntityId)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(RemoteError::Unauthorized);
        }
        Ok(())
    }

    fn write(
        &self,
        kind: WriteKind,
        entity_type: EntityType,
        entity: RemoteEntity,
    ) -> RemoteResult<i64> {
        self.check_reachable()?;
        if let Some(error) = self.scripted_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let acknowledged = entity.last_modified;
        self.writes
            .lock()
            .unwrap()
            .push((kind, entity_type, entity.id));
        self.put_remote(entity_type, entity);
        Ok(acknowledged)
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryRemote {
    async fn get(
        &self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> RemoteResult<Option<RemoteEntity>> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_reachable()?;
        Ok(self.entity(entity_type, id))
    }

    async fn create(&self, entity_type: EntityType, entity: &RemoteEntity) -> RemoteResult<i64> {
        self.write(WriteKind::Create, entity_type, entity.clone())
    }

    async fn update(&self, entity_type: EntityType, entity: &RemoteEntity) -> RemoteResult<i64> {
        self.write(WriteKind::Update, entity_type, entity.clone())
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        last_modified: i64,
    ) -> RemoteResult<i64> {
        let mut tombstone = self.entity(entity_type, id).unwrap_or(RemoteEntity {
            id: *id,
            payload: serde_json::Value::Null,
            last_modified,
            origin_source: None,
            origin_timestamp: None,
            deleted: true,
        });
        tombstone.last_modified = last_modified;
        tombstone.deleted = true;
        self.write(WriteKind::Delete, entity_type, tombstone)
    }

    async fn changes_since(
        &self,
        entity_type: EntityType,
        since: Option<i64>,
    ) -> RemoteResult<Vec<RemoteEntity>> {
        self.check_reachable()?;
        let mut changed: Vec<RemoteEntity> = self
            .entities
            .lock()
            .unwrap()
            .iter()
            .filter(|((kind, _), entity)| {
                *kind == entity_type && since.map_or(true, |since| entity.last_modified > since)
            })
            .map(|(_, entity)| entity.clone())
            .collect();
        changed.sort_by_key(|entity| entity.last_modified);
        Ok(changed)
    }

    async fn health_check(&self) -> RemoteResult<()> {
        self.check_reachable()
    }

    fn auth_events(&self) -> Option<broadcast::Receiver<AuthEvent>> {
        Some(self.auth_tx.subscribe())
    }
}

/// Realtime source that refuses the first connects, then relays `notify`.
pub struct ScriptedRealtime {
    refusals: AtomicUsize,
    attempts: AtomicUsize,
    tx: broadcast::Sender<String>,
}

impl ScriptedRealtime {
    pub fn failing_first(refusals: usize) -> Self {
        Self {
            refusals: AtomicUsize::new(refusals),
            attempts: AtomicUsize::new(0),
            tx: broadcast::channel(16).0,
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn notify(&self, data: &str) {
        let _ = self.tx.send(data.to_string());
    }
}

#[async_trait]
impl RealtimeSource for ScriptedRealtime {
    async fn connect(&self) -> RemoteResult<NotificationStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }

        let rx = self.tx.subscribe();
        let notifications = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(data) => return Some((Ok(ChangeNotification::parse(&data)), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(notifications)
    }
}
