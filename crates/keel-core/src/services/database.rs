//! Shared database service wrapper used by the sync engine and clients.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::db::{
    ChangeLog, ConflictRepository, Database, EntityRepository, SqliteChangeLog,
    SqliteConflictRepository, SqliteEntityRepository,
};
use crate::models::{
    ChangeId, ChangeKind, ChangeRecord, EntityId, EntityType, FailureKind, NewChange,
    NewSyncConflict, OfflineStatus, Resolution, SyncConflict, SyncState, SyncableEntity,
};
use crate::util::unix_millis_now;
use crate::{Error, Result};

const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(3_600);

/// Counts produced by applying one pulled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulledBatch {
    pub applied: usize,
    /// Entities left alone because they still have local changes to push
    pub deferred: usize,
    /// Versions the local store already has, including echoes of our pushes
    pub skipped: usize,
}

/// Thread-safe service for store and change log operations.
///
/// Every write that touches more than one table runs in a single transaction.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    max_backoff: Duration,
    device_id: Option<String>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path)?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            max_backoff: DEFAULT_MAX_BACKOFF,
            device_id: None,
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            db_path: None,
            max_backoff: DEFAULT_MAX_BACKOFF,
            device_id: None,
        })
    }

    /// Ceiling of the retry backoff applied to transient failures.
    #[must_use]
    pub const fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Device id stamped as `origin_source` on local mutations.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn db_path(&self) -> Option<&std::path::Path> {
        self.db_path.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Apply a local mutation and append its change record atomically.
    ///
    /// `last_modified` is bumped to `max(now, previous + 1)` and the change
    /// carries the last server-acknowledged version as its baseline.
    pub async fn apply_local_change(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        change_kind: impl Into<ChangeKind>,
        payload: serde_json::Value,
    ) -> Result<(SyncableEntity, ChangeRecord)> {
        let change_kind = change_kind.into();
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;

        let entities = SqliteEntityRepository::new(&tx);
        let previous = entities.get(entity_type, &entity_id)?;
        if previous.is_none() && change_kind.is_delete() {
            return Err(Error::NotFound(format!("{entity_type} {entity_id}")));
        }

        let now = unix_millis_now();
        let last_modified = previous
            .as_ref()
            .map_or(now, |entity| now.max(entity.last_modified.saturating_add(1)));
        let remote_modified = previous.as_ref().and_then(|entity| entity.remote_modified);
        let payload = match (&change_kind, payload, previous.as_ref()) {
            (ChangeKind::Delete, serde_json::Value::Null, Some(entity)) => entity.payload.clone(),
            (_, payload, _) => payload,
        };

        let entity = SyncableEntity {
            entity_type,
            id: entity_id,
            payload: payload.clone(),
            last_modified,
            origin_source: self.device_id.clone(),
            origin_timestamp: Some(now),
            synced: false,
            remote_modified,
            is_deleted: change_kind.is_delete(),
        };
        entities.upsert(&entity)?;

        let change = SqliteChangeLog::new(&tx, self.max_backoff).record_change(
            NewChange::new(entity_type, entity_id, change_kind, payload)
                .with_local_modified(last_modified)
                .with_baseline(remote_modified),
        )?;
        tx.commit()?;
        Ok((entity, change))
    }

    /// Append a change without touching the entity store.
    pub async fn record_change(&self, change: NewChange) -> Result<ChangeRecord> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).record_change(change)
    }

    pub async fn get_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<SyncableEntity>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).get(entity_type, entity_id)
    }

    pub async fn list_entities(
        &self,
        entity_type: EntityType,
        limit: usize,
    ) -> Result<Vec<SyncableEntity>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).list(entity_type, limit)
    }

    /// Claim the next eligible change of a type as of `now` (Unix ms).
    pub async fn claim_next(
        &self,
        entity_type: EntityType,
        now: i64,
    ) -> Result<Option<ChangeRecord>> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).claim_next_at(entity_type, now)
    }

    /// Mark a pushed change synced and record the server's acknowledgement.
    pub async fn complete_push(&self, change: &ChangeRecord, remote_modified: i64) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        SqliteChangeLog::new(&tx, self.max_backoff).mark_synced(&change.id)?;
        SqliteEntityRepository::new(&tx).mark_acknowledged(
            change.entity_type,
            &change.entity_id,
            change.local_modified,
            remote_modified,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Settle a change whose version lost a tie to the remote one.
    ///
    /// The remote version replaces the local entity if no newer local edit exists.
    pub async fn accept_remote(
        &self,
        change: &ChangeRecord,
        remote: &SyncableEntity,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        SqliteChangeLog::new(&tx, self.max_backoff).mark_synced(&change.id)?;
        let entities = SqliteEntityRepository::new(&tx);
        let current = entities.get(change.entity_type, &change.entity_id)?;
        let superseded = match current {
            Some(entity) => entity.last_modified <= change.local_modified,
            None => true,
        };
        if superseded {
            entities.upsert(remote)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        id: &ChangeId,
        kind: FailureKind,
        error: &str,
    ) -> Result<ChangeRecord> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).mark_failed_with(id, kind, error)
    }

    /// Return an in-flight change to `Pending` without counting an attempt.
    pub async fn release(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).release(id)
    }

    /// Park a change behind a new conflict, reusing an open conflict for the entity.
    pub async fn park_conflict(
        &self,
        change: &ChangeRecord,
        conflict: &NewSyncConflict,
    ) -> Result<SyncConflict> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let conflicts = SqliteConflictRepository::new(&tx);
        let stored = match conflicts.find_unresolved(change.entity_type, &change.entity_id)? {
            Some(existing) => existing,
            None => conflicts.insert(conflict)?,
        };
        SqliteChangeLog::new(&tx, self.max_backoff).mark_failed_with(
            &change.id,
            FailureKind::Conflict,
            &format!("conflict {} with remote version", stored.id),
        )?;
        tx.commit()?;
        Ok(stored)
    }

    /// Apply a pulled batch and advance the watermark in one transaction.
    ///
    /// Entities with unsettled local changes are deferred: the watermark
    /// stops just below the oldest deferred version so the next pull fetches
    /// it again once the local change settles.
    pub async fn apply_pulled_batch(
        &self,
        entity_type: EntityType,
        remotes: &[SyncableEntity],
        watermark: Option<i64>,
    ) -> Result<PulledBatch> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let entities = SqliteEntityRepository::new(&tx);
        let change_log = SqliteChangeLog::new(&tx, self.max_backoff);

        let mut batch = PulledBatch::default();
        let mut oldest_deferred: Option<i64> = None;
        for remote in remotes {
            if change_log.has_unsettled(entity_type, &remote.id)? {
                batch.deferred += 1;
                oldest_deferred = Some(
                    oldest_deferred.map_or(remote.last_modified, |oldest| {
                        oldest.min(remote.last_modified)
                    }),
                );
                continue;
            }
            let local = entities.get(entity_type, &remote.id)?;
            if local.is_some_and(|local| local.last_modified >= remote.last_modified) {
                batch.skipped += 1;
                continue;
            }
            entities.upsert(remote)?;
            batch.applied += 1;
        }

        let watermark = match (watermark, oldest_deferred) {
            (Some(watermark), Some(oldest)) => Some(watermark.min(oldest - 1)),
            (watermark, _) => watermark,
        };
        if let Some(watermark) = watermark {
            entities.set_watermark(entity_type, watermark)?;
        }
        tx.commit()?;
        Ok(batch)
    }

    pub async fn watermark(&self, entity_type: EntityType) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).watermark(entity_type)
    }

    /// Record the caller's decision for a conflict.
    ///
    /// `UseLocal` re-queues the current local version against the remote
    /// version seen at detection; `UseRemote` overwrites the local entity.
    /// Either way the entity's parked records are discarded.
    pub async fn resolve_conflict(
        &self,
        conflict_id: i64,
        resolution: Resolution,
    ) -> Result<(SyncConflict, Option<ChangeRecord>)> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let conflict = SqliteConflictRepository::new(&tx).resolve(conflict_id, resolution)?;
        let change_log = SqliteChangeLog::new(&tx, self.max_backoff);
        let entities = SqliteEntityRepository::new(&tx);

        let discarded = change_log.discard_entity(conflict.entity_type, &conflict.entity_id)?;
        let local = entities.get(conflict.entity_type, &conflict.entity_id)?;
        let now = unix_millis_now();

        let requeued = match resolution {
            Resolution::UseLocal => {
                let entity = local.unwrap_or_else(|| SyncableEntity {
                    entity_type: conflict.entity_type,
                    id: conflict.entity_id,
                    payload: conflict.local_version.clone(),
                    last_modified: conflict.local_modified,
                    origin_source: self.device_id.clone(),
                    origin_timestamp: Some(now),
                    synced: false,
                    remote_modified: None,
                    is_deleted: false,
                });
                // Gone from the server entirely: push as a fresh create
                let hard_deleted =
                    conflict.remote_version.is_null() && conflict.remote_modified.is_none();
                let baseline = if hard_deleted {
                    None
                } else {
                    entity.remote_modified.max(conflict.remote_modified)
                };
                let entity = SyncableEntity {
                    last_modified: now.max(entity.last_modified.saturating_add(1)),
                    synced: false,
                    remote_modified: baseline,
                    ..entity
                };
                entities.upsert(&entity)?;

                let kind = if entity.is_deleted {
                    ChangeKind::Delete
                } else {
                    ChangeKind::Update
                };
                let change = change_log.record_change(
                    NewChange::new(entity.entity_type, entity.id, kind, entity.payload.clone())
                        .with_local_modified(entity.last_modified)
                        .with_baseline(baseline),
                )?;
                Some(change)
            }
            Resolution::UseRemote => {
                let remote_deleted = conflict.remote_version.is_null();
                let payload = if remote_deleted {
                    local
                        .as_ref()
                        .map_or(serde_json::Value::Null, |entity| entity.payload.clone())
                } else {
                    conflict.remote_version.clone()
                };
                let remote_modified = conflict.remote_modified.unwrap_or(now);
                entities.upsert(&SyncableEntity {
                    entity_type: conflict.entity_type,
                    id: conflict.entity_id,
                    payload,
                    last_modified: remote_modified,
                    origin_source: local.and_then(|entity| entity.origin_source),
                    origin_timestamp: Some(now),
                    synced: true,
                    remote_modified: Some(remote_modified),
                    is_deleted: remote_deleted,
                })?;
                None
            }
            Resolution::Unresolved => None,
        };
        tx.commit()?;

        tracing::info!(
            "Resolved conflict {} for {} {} as {} ({} parked change(s) discarded)",
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            resolution.as_str(),
            discarded
        );
        Ok((conflict, requeued))
    }

    pub async fn get_conflict(&self, id: i64) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).get(id)
    }

    pub async fn list_unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list_unresolved()
    }

    /// List conflicts newest-first, resolved or not.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list_recent(limit)
    }

    pub async fn get_change(&self, id: &ChangeId) -> Result<Option<ChangeRecord>> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).get(id)
    }

    pub async fn list_changes(&self, state: SyncState, limit: usize) -> Result<Vec<ChangeRecord>> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).list_by_state(state, limit)
    }

    pub async fn list_entity_changes(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Vec<ChangeRecord>> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff)
            .list_for_entity(entity_type, entity_id)
    }

    /// Re-arm a failed change after the user fixed the data.
    pub async fn retry_change(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).retry(id)
    }

    /// Drop a change that is not in flight.
    pub async fn discard_change(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).discard(id)
    }

    /// Reset changes left in flight by a previous process.
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).recover_in_flight()
    }

    /// Delete synced changes older than the retention window.
    pub async fn purge_synced(&self, retention: Duration) -> Result<usize> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_millis_now().saturating_sub(retention_ms);
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).purge_synced(cutoff)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).pending_count()
    }

    /// `Pending` changes of a type left after a push.
    pub async fn waiting_count(&self, entity_type: EntityType) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteChangeLog::new(db.connection(), self.max_backoff).waiting_count(entity_type)
    }

    /// Snapshot of unsynced work for status displays.
    pub async fn offline_status(
        &self,
        is_offline: bool,
        auth_required: bool,
    ) -> Result<OfflineStatus> {
        let db = self.db.lock().await;
        let change_log = SqliteChangeLog::new(db.connection(), self.max_backoff);
        let conflicts = SqliteConflictRepository::new(db.connection());
        Ok(OfflineStatus {
            is_offline,
            pending_count: change_log.pending_count()?,
            failed_count: change_log.failed_count()?,
            needs_attention_count: change_log.needs_attention_count()?,
            oldest_pending_at: change_log.oldest_pending()?,
            auth_required,
            unresolved_conflicts: conflicts.list_unresolved()?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn service() -> DatabaseService {
        DatabaseService::open_in_memory()
            .unwrap()
            .with_device_id("device-a")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_change_writes_entity_and_log_together() {
        let service = service();
        let id = EntityId::new();

        let (entity, change) = service
            .apply_local_change(EntityType::Boat, id, ChangeKind::Create, json!({ "name": "B1" }))
            .await
            .unwrap();

        assert_eq!(entity.origin_source.as_deref(), Some("device-a"));
        assert!(!entity.synced);
        assert_eq!(change.local_modified, entity.last_modified);
        assert_eq!(change.base_modified, None);
        assert_eq!(service.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_modified_strictly_increases() {
        let service = service();
        let id = EntityId::new();

        let mut previous = 0;
        for index in 0..5 {
            let (entity, _) = service
                .apply_local_change(EntityType::Note, id, ChangeKind::Update, json!({ "i": index }))
                .await
                .unwrap();
            assert!(entity.last_modified > previous);
            previous = entity.last_modified;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_unknown_entity_is_rejected() {
        let service = service();
        let result = service
            .apply_local_change(
                EntityType::Boat,
                EntityId::new(),
                ChangeKind::Delete,
                serde_json::Value::Null,
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_push_acknowledges_entity() {
        let service = service();
        let id = EntityId::new();
        let (entity, _) = service
            .apply_local_change(EntityType::Boat, id, ChangeKind::Create, json!({}))
            .await
            .unwrap();

        let claimed = service
            .claim_next(EntityType::Boat, unix_millis_now())
            .await
            .unwrap()
            .unwrap();
        service
            .complete_push(&claimed, entity.last_modified)
            .await
            .unwrap();

        let stored = service.get_entity(EntityType::Boat, &id).await.unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.remote_modified, Some(entity.last_modified));

        // Next edit uses the acknowledged version as its baseline
        let (_, change) = service
            .apply_local_change(EntityType::Boat, id, ChangeKind::Update, json!({ "v": 2 }))
            .await
            .unwrap();
        assert_eq!(change.base_modified, Some(entity.last_modified));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pulled_batch_defers_and_skips() {
        let service = service();
        let dirty = EntityId::new();
        service
            .apply_local_change(EntityType::Note, dirty, ChangeKind::Create, json!({}))
            .await
            .unwrap();

        let remote = |id: EntityId, last_modified: i64| SyncableEntity {
            entity_type: EntityType::Note,
            id,
            payload: json!({ "body": "remote" }),
            last_modified,
            origin_source: Some("device-b".to_string()),
            origin_timestamp: Some(last_modified),
            synced: true,
            remote_modified: Some(last_modified),
            is_deleted: false,
        };
        let fresh = EntityId::new();
        let batch = service
            .apply_pulled_batch(
                EntityType::Note,
                &[remote(dirty, 5), remote(fresh, 7)],
                Some(7),
            )
            .await
            .unwrap();

        assert_eq!(
            batch,
            PulledBatch {
                applied: 1,
                deferred: 1,
                skipped: 0
            }
        );
        // Held just below the deferred version
        assert_eq!(service.watermark(EntityType::Note).await.unwrap(), Some(4));

        let again = service
            .apply_pulled_batch(EntityType::Note, &[remote(fresh, 7)], Some(7))
            .await
            .unwrap();
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_status_counts_work() {
        let service = service();
        service
            .apply_local_change(EntityType::Boat, EntityId::new(), ChangeKind::Create, json!({}))
            .await
            .unwrap();

        let status = service.offline_status(true, false).await.unwrap();
        assert!(status.is_offline);
        assert_eq!(status.pending_count, 1);
        assert!(status.oldest_pending_at.is_some());
        assert_eq!(status.unresolved_conflicts, 0);
    }
}
