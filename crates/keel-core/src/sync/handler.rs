//! Push/pull logic shared by every entity type.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use super::conflict::{ConflictDecision, ConflictDetector};
use super::remote::{RemoteEndpoint, RemoteEntity, RemoteError};
use crate::models::{
    ChangeId, ChangeKind, ChangeRecord, EntityId, EntityType, FailureKind, NewSyncConflict,
    SyncConflict,
};
use crate::services::DatabaseService;
use crate::Result;

/// Pulls re-read this far below the watermark.
///
/// `lastModified` is stamped by the writing device's clock, so another device
/// running behind ours can land a version just under our watermark. Versions
/// already held locally come back as skips. Skew beyond this window is not
/// covered; that needs a server-assigned change sequence.
pub const CLOCK_SKEW_ALLOWANCE_MS: i64 = 5 * 60 * 1000;

/// One change or pull that did not go through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub entity_type: EntityType,
    pub entity_id: Option<EntityId>,
    pub change_id: Option<ChangeId>,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushResult {
    pub pushed: usize,
    pub failed: usize,
    /// Changes dropped because the remote version won a tie
    pub superseded: usize,
    /// Changes still pending after the push, e.g. waiting for a parent
    pub deferred: usize,
    pub conflicts: Vec<SyncConflict>,
    pub failures: Vec<SyncFailure>,
    pub auth_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullResult {
    pub applied: usize,
    /// Remote versions left for later because the entity has local changes
    pub deferred: usize,
    /// Versions already present locally, including echoes of our own pushes
    pub skipped: usize,
    pub failure: Option<SyncFailure>,
    pub auth_required: bool,
}

enum PushOutcome {
    Pushed,
    Superseded,
    Conflict(SyncConflict),
    Failed(SyncFailure),
    AuthRequired,
}

/// Moves changes of one entity type between the local store and the server.
#[derive(Clone)]
pub struct SyncHandler {
    entity_type: EntityType,
    store: DatabaseService,
    remote: Arc<dyn RemoteEndpoint>,
    detector: ConflictDetector,
    push_concurrency: usize,
}

impl SyncHandler {
    pub fn new(
        entity_type: EntityType,
        store: DatabaseService,
        remote: Arc<dyn RemoteEndpoint>,
        detector: ConflictDetector,
        push_concurrency: usize,
    ) -> Self {
        Self {
            entity_type,
            store,
            remote,
            detector,
            push_concurrency: push_concurrency.max(1),
        }
    }

    pub const fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Push every change claimable as of `now`.
    ///
    /// Batches hold distinct entities, so their pushes run concurrently.
    /// Stops early when the server asks for re-authentication.
    pub async fn push_pending(&self, now: i64) -> Result<PushResult> {
        let mut result = PushResult::default();

        loop {
            let mut batch = Vec::with_capacity(self.push_concurrency);
            while batch.len() < self.push_concurrency {
                match self.store.claim_next(self.entity_type, now).await? {
                    Some(change) => batch.push(change),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let outcomes = join_all(batch.into_iter().map(|change| self.push_one(change))).await;
            for outcome in outcomes {
                match outcome? {
                    PushOutcome::Pushed => result.pushed += 1,
                    PushOutcome::Superseded => result.superseded += 1,
                    PushOutcome::Conflict(conflict) => result.conflicts.push(conflict),
                    PushOutcome::Failed(failure) => {
                        result.failed += 1;
                        result.failures.push(failure);
                    }
                    PushOutcome::AuthRequired => result.auth_required = true,
                }
            }
            if result.auth_required {
                break;
            }
        }

        result.deferred = self.store.waiting_count(self.entity_type).await?;
        if result.pushed + result.failed + result.conflicts.len() > 0 {
            tracing::debug!(
                "Pushed {} {} change(s): {} failed, {} conflict(s), {} deferred",
                result.pushed,
                self.entity_type,
                result.failed,
                result.conflicts.len(),
                result.deferred
            );
        }
        Ok(result)
    }

    async fn push_one(&self, change: ChangeRecord) -> Result<PushOutcome> {
        let remote = match self.remote.get(self.entity_type, &change.entity_id).await {
            Ok(remote) => remote,
            Err(error) => return self.fail(&change, error).await,
        };
        let entity = self
            .store
            .get_entity(self.entity_type, &change.entity_id)
            .await?;
        let baseline = ConflictDetector::effective_baseline(&change, entity.as_ref());

        match self.detector.decide(&change, baseline, remote.as_ref()) {
            ConflictDecision::Clean => {}
            ConflictDecision::AcceptRemote => {
                let Some(remote) = remote else {
                    return Ok(PushOutcome::Superseded);
                };
                tracing::debug!(
                    "Remote version of {} {} wins the tie; dropping change {}",
                    self.entity_type,
                    change.entity_id,
                    change.id
                );
                self.store
                    .accept_remote(&change, &remote.into_local(self.entity_type))
                    .await?;
                return Ok(PushOutcome::Superseded);
            }
            ConflictDecision::Conflict => {
                let conflict = NewSyncConflict {
                    entity_type: self.entity_type,
                    entity_id: change.entity_id,
                    local_version: change.payload.clone(),
                    // Null stands for "absent or deleted remotely"
                    remote_version: remote
                        .as_ref()
                        .filter(|remote| !remote.deleted)
                        .map_or(serde_json::Value::Null, |remote| remote.payload.clone()),
                    local_modified: change.local_modified,
                    remote_modified: remote.as_ref().map(|remote| remote.last_modified),
                };
                let stored = self.store.park_conflict(&change, &conflict).await?;
                tracing::warn!(
                    "Conflict {} on {} {}: local {} vs remote {:?} (baseline {:?})",
                    stored.id,
                    self.entity_type,
                    change.entity_id,
                    change.local_modified,
                    conflict.remote_modified,
                    baseline
                );
                return Ok(PushOutcome::Conflict(stored));
            }
        }

        let outgoing = RemoteEntity::from_change(&change, self.store.device_id());
        let exists_remotely = remote.as_ref().is_some_and(|remote| !remote.deleted);
        let acknowledged = match (&change.change_kind, exists_remotely) {
            (ChangeKind::Delete, false) => Ok(change.local_modified),
            (ChangeKind::Delete, true) => {
                self.remote
                    .delete(self.entity_type, &change.entity_id, change.local_modified)
                    .await
            }
            (_, false) => self.remote.create(self.entity_type, &outgoing).await,
            (_, true) => self.remote.update(self.entity_type, &outgoing).await,
        };

        match acknowledged {
            Ok(remote_modified) => {
                self.store.complete_push(&change, remote_modified).await?;
                Ok(PushOutcome::Pushed)
            }
            Err(error) => self.fail(&change, error).await,
        }
    }

    async fn fail(&self, change: &ChangeRecord, error: RemoteError) -> Result<PushOutcome> {
        let Some(kind) = error.failure_kind() else {
            self.store.release(&change.id).await?;
            tracing::warn!(
                "Authentication required while pushing {} {}",
                self.entity_type,
                change.entity_id
            );
            return Ok(PushOutcome::AuthRequired);
        };

        let message = error.to_string();
        let failed = self.store.mark_failed(&change.id, kind, &message).await?;
        tracing::warn!(
            "Push of {} {} failed (attempt {}): {}",
            self.entity_type,
            change.entity_id,
            failed.attempt_count,
            message
        );
        Ok(PushOutcome::Failed(SyncFailure {
            entity_type: self.entity_type,
            entity_id: Some(change.entity_id),
            change_id: Some(change.id),
            kind,
            message,
        }))
    }

    /// Pull remote changes since the stored watermark.
    pub async fn pull_remote_changes(&self) -> Result<PullResult> {
        let since = self
            .store
            .watermark(self.entity_type)
            .await?
            .map(|watermark| watermark.saturating_sub(CLOCK_SKEW_ALLOWANCE_MS));
        let remotes = match self.remote.changes_since(self.entity_type, since).await {
            Ok(remotes) => remotes,
            Err(RemoteError::Unauthorized) => {
                return Ok(PullResult {
                    auth_required: true,
                    ..PullResult::default()
                });
            }
            Err(error) => {
                tracing::warn!("Pull of {} failed: {}", self.entity_type, error);
                return Ok(PullResult {
                    failure: Some(SyncFailure {
                        entity_type: self.entity_type,
                        entity_id: None,
                        change_id: None,
                        kind: error.failure_kind().unwrap_or(FailureKind::Transient),
                        message: error.to_string(),
                    }),
                    ..PullResult::default()
                });
            }
        };

        let watermark = remotes.iter().map(|remote| remote.last_modified).max();
        let locals: Vec<_> = remotes
            .into_iter()
            .map(|remote| remote.into_local(self.entity_type))
            .collect();
        let batch = self
            .store
            .apply_pulled_batch(self.entity_type, &locals, watermark)
            .await?;

        if batch.applied + batch.deferred > 0 {
            tracing::debug!(
                "Pulled {} {}: {} applied, {} deferred, {} skipped",
                locals.len(),
                self.entity_type,
                batch.applied,
                batch.deferred,
                batch.skipped
            );
        }
        Ok(PullResult {
            applied: batch.applied,
            deferred: batch.deferred,
            skipped: batch.skipped,
            failure: None,
            auth_required: false,
        })
    }
}
