//! Durable change log of local mutations awaiting sync

#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss)] // SQLite stores integers as i64

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    ChangeId, ChangeKind, ChangeRecord, EntityId, EntityType, FailureKind, NewChange, ParentRef,
    SyncState,
};
use crate::sync::backoff::retry_delay;
use crate::util::unix_millis_now;

const CHANGE_COLUMNS: &str = "id, seq, entity_type, entity_id, change_kind, payload, created_at,
     sync_state, attempt_count, last_attempt_at, last_error, failure_kind, next_attempt_at,
     local_modified, base_modified, parent_type, parent_id";

/// A record still needs pushing when it is pending, in flight, or failed for
/// any reason other than validation.
const UNSETTLED: &str =
    "(sync_state IN ('pending', 'syncing') OR (sync_state = 'failed' AND failure_kind != 'validation'))";

/// Trait for change log operations
pub trait ChangeLog {
    /// Append a pending change with no baseline
    fn record(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        change_kind: ChangeKind,
        payload: serde_json::Value,
    ) -> Result<ChangeRecord>;

    /// Append a pending change
    fn record_change(&self, change: NewChange) -> Result<ChangeRecord>;

    /// Atomically move the next eligible record of a type to `Syncing`
    fn claim_next(&self, entity_type: EntityType) -> Result<Option<ChangeRecord>>;

    /// `claim_next` evaluated as of the given instant (Unix ms)
    fn claim_next_at(&self, entity_type: EntityType, now: i64) -> Result<Option<ChangeRecord>>;

    /// `Syncing` -> `Synced`
    fn mark_synced(&self, id: &ChangeId) -> Result<()>;

    /// `Syncing` -> `Failed` (transient, retried with backoff)
    fn mark_failed(&self, id: &ChangeId, error: &str) -> Result<ChangeRecord>;

    /// `Syncing` -> `Failed` with an explicit failure kind
    fn mark_failed_with(
        &self,
        id: &ChangeId,
        kind: FailureKind,
        error: &str,
    ) -> Result<ChangeRecord>;

    /// `Syncing` -> `Pending` without counting an attempt
    fn release(&self, id: &ChangeId) -> Result<()>;

    /// Re-arm a failed record as `Pending`
    fn retry(&self, id: &ChangeId) -> Result<()>;

    /// Drop a record that is not in flight
    fn discard(&self, id: &ChangeId) -> Result<()>;

    /// Drop every unsynced record of an entity that is not in flight
    fn discard_entity(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<usize>;

    /// Reset records left `Syncing` by a crashed process back to `Pending`
    fn recover_in_flight(&self) -> Result<usize>;

    /// Delete `Synced` records created before the cutoff (Unix ms)
    fn purge_synced(&self, older_than: i64) -> Result<usize>;

    fn get(&self, id: &ChangeId) -> Result<Option<ChangeRecord>>;

    /// Records for one entity in creation order
    fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Vec<ChangeRecord>>;

    /// Records in a given state, oldest first
    fn list_by_state(&self, state: SyncState, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Whether the entity still has a change that needs pushing
    fn has_unsettled(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<bool>;

    fn pending_count(&self) -> Result<usize>;

    /// `Pending` records of one type, i.e. not yet claimable or not yet claimed
    fn waiting_count(&self, entity_type: EntityType) -> Result<usize>;

    /// Failed records, retryable or not
    fn failed_count(&self) -> Result<usize>;

    /// Failed records that need user attention
    fn needs_attention_count(&self) -> Result<usize>;

    /// Creation timestamp of the oldest unsynced record
    fn oldest_pending(&self) -> Result<Option<i64>>;
}

/// `SQLite` implementation of `ChangeLog`
pub struct SqliteChangeLog<'a> {
    conn: &'a Connection,
    max_backoff: Duration,
}

impl<'a> SqliteChangeLog<'a> {
    /// Create a change log over the given connection
    pub const fn new(conn: &'a Connection, max_backoff: Duration) -> Self {
        Self { conn, max_backoff }
    }

    fn parse_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeRecord> {
        let id: String = row.get(0)?;
        let entity_type: String = row.get(2)?;
        let entity_id: String = row.get(3)?;
        let change_kind: String = row.get(4)?;
        let payload: String = row.get(5)?;
        let sync_state: String = row.get(7)?;
        let failure_kind: Option<String> = row.get(11)?;
        let parent_type: Option<String> = row.get(15)?;
        let parent_id: Option<String> = row.get(16)?;

        let parent = match (parent_type, parent_id) {
            (Some(parent_type), Some(parent_id)) => Some(ParentRef {
                entity_type: parse_column(15, &parent_type)?,
                entity_id: parse_column(16, &parent_id)?,
            }),
            _ => None,
        };

        Ok(ChangeRecord {
            id: parse_column(0, &id)?,
            seq: row.get(1)?,
            entity_type: parse_column(2, &entity_type)?,
            entity_id: parse_column(3, &entity_id)?,
            change_kind: ChangeKind::from(change_kind),
            payload: serde_json::from_str(&payload).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(error),
                )
            })?,
            created_at: row.get(6)?,
            sync_state: parse_column(7, &sync_state)?,
            attempt_count: row.get::<_, i64>(8)?.max(0) as u32,
            last_attempt_at: row.get(9)?,
            last_error: row.get(10)?,
            failure_kind: failure_kind
                .map(|kind| parse_column(11, &kind))
                .transpose()?,
            next_attempt_at: row.get(12)?,
            local_modified: row.get(13)?,
            base_modified: row.get(14)?,
            parent,
        })
    }

    fn require(&self, id: &ChangeId) -> Result<ChangeRecord> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("change {id}")))
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

/// Parse a text column through `FromStr`, reporting failures as conversion errors.
pub(crate) fn parse_column<T>(index: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|error: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            error.to_string().into(),
        )
    })
}

impl ChangeLog for SqliteChangeLog<'_> {
    fn record(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        change_kind: ChangeKind,
        payload: serde_json::Value,
    ) -> Result<ChangeRecord> {
        self.record_change(NewChange::new(entity_type, *entity_id, change_kind, payload))
    }

    fn record_change(&self, change: NewChange) -> Result<ChangeRecord> {
        let id = ChangeId::new();
        let payload = serde_json::to_string(&change.payload)?;
        self.conn.execute(
            "INSERT INTO change_log (
                id, entity_type, entity_id, change_kind, payload, created_at, sync_state,
                attempt_count, local_modified, base_modified, parent_type, parent_id
             ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
            params![
                id.as_str(),
                change.entity_type.as_str(),
                change.entity_id.as_str(),
                change.change_kind.as_str(),
                payload,
                unix_millis_now(),
                change.local_modified,
                change.base_modified,
                change.parent.map(|parent| parent.entity_type.as_str()),
                change.parent.map(|parent| parent.entity_id.as_str()),
            ],
        )?;

        tracing::debug!(
            "Recorded {} change {} for {} {}",
            change.change_kind,
            id,
            change.entity_type,
            change.entity_id
        );
        self.require(&id)
    }

    fn claim_next(&self, entity_type: EntityType) -> Result<Option<ChangeRecord>> {
        self.claim_next_at(entity_type, unix_millis_now())
    }

    fn claim_next_at(&self, entity_type: EntityType, now: i64) -> Result<Option<ChangeRecord>> {
        // Eligible: pending, or a transient failure whose backoff elapsed and
        // that was not already attempted at/after `now`. Blocked while the same
        // entity has a record in flight, an older unsettled record, while its
        // parent has unsettled records, or while a rejected parent has never
        // reached the server.
        let sql = format!(
            "UPDATE change_log
             SET sync_state = 'syncing'
             WHERE seq = (
                SELECT c.seq FROM change_log c
                WHERE c.entity_type = ?1
                  AND (c.sync_state = 'pending'
                       OR (c.sync_state = 'failed'
                           AND c.failure_kind = 'transient'
                           AND COALESCE(c.next_attempt_at, 0) <= ?2
                           AND COALESCE(c.last_attempt_at, 0) < ?2))
                  AND NOT EXISTS (
                      SELECT 1 FROM change_log s
                      WHERE s.entity_type = c.entity_type AND s.entity_id = c.entity_id
                        AND s.sync_state = 'syncing')
                  AND NOT EXISTS (
                      SELECT 1 FROM change_log o
                      WHERE o.entity_type = c.entity_type AND o.entity_id = c.entity_id
                        AND o.seq < c.seq AND {UNSETTLED})
                  AND (c.parent_id IS NULL OR (
                      NOT EXISTS (
                          SELECT 1 FROM change_log p
                          WHERE p.entity_type = c.parent_type AND p.entity_id = c.parent_id
                            AND {UNSETTLED})
                      AND NOT EXISTS (
                          SELECT 1 FROM change_log p
                          WHERE p.entity_type = c.parent_type AND p.entity_id = c.parent_id
                            AND p.sync_state = 'failed' AND p.failure_kind = 'validation'
                            AND NOT EXISTS (
                                SELECT 1 FROM change_log q
                                WHERE q.entity_type = p.entity_type AND q.entity_id = p.entity_id
                                  AND q.seq > p.seq AND q.sync_state = 'synced')
                            AND NOT EXISTS (
                                SELECT 1 FROM entities e
                                WHERE e.entity_type = p.entity_type AND e.id = p.entity_id
                                  AND e.remote_modified IS NOT NULL))))
                ORDER BY c.seq
                LIMIT 1
             )
             RETURNING {CHANGE_COLUMNS}"
        );

        let claimed = self
            .conn
            .query_row(&sql, params![entity_type.as_str(), now], Self::parse_change)
            .optional()?;

        if let Some(change) = claimed.as_ref() {
            tracing::debug!(
                "Claimed change {} for {} {} (attempt {})",
                change.id,
                change.entity_type,
                change.entity_id,
                change.attempt_count + 1
            );
        }
        Ok(claimed)
    }

    fn mark_synced(&self, id: &ChangeId) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE change_log
             SET sync_state = 'synced', last_error = NULL, failure_kind = NULL, next_attempt_at = NULL
             WHERE id = ? AND sync_state = 'syncing'",
            params![id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::InvalidInput(format!("change {id} is not syncing")));
        }
        Ok(())
    }

    fn mark_failed(&self, id: &ChangeId, error: &str) -> Result<ChangeRecord> {
        self.mark_failed_with(id, FailureKind::Transient, error)
    }

    fn mark_failed_with(
        &self,
        id: &ChangeId,
        kind: FailureKind,
        error: &str,
    ) -> Result<ChangeRecord> {
        let current = self.require(id)?;
        if current.sync_state != SyncState::Syncing {
            return Err(Error::InvalidInput(format!("change {id} is not syncing")));
        }

        let now = unix_millis_now();
        let attempt_count = current.attempt_count.saturating_add(1);
        let next_attempt_at = kind.is_retryable().then(|| {
            let delay = retry_delay(attempt_count, self.max_backoff);
            now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
        });

        self.conn.execute(
            "UPDATE change_log
             SET sync_state = 'failed', attempt_count = ?, last_attempt_at = ?, last_error = ?,
                 failure_kind = ?, next_attempt_at = ?
             WHERE id = ? AND sync_state = 'syncing'",
            params![
                i64::from(attempt_count),
                now,
                error,
                kind.as_str(),
                next_attempt_at,
                id.as_str()
            ],
        )?;

        tracing::debug!(
            "Change {} failed ({}, attempt {}): {}",
            id,
            kind.as_str(),
            attempt_count,
            error
        );
        self.require(id)
    }

    fn release(&self, id: &ChangeId) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE change_log SET sync_state = 'pending' WHERE id = ? AND sync_state = 'syncing'",
            params![id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::InvalidInput(format!("change {id} is not syncing")));
        }
        Ok(())
    }

    fn retry(&self, id: &ChangeId) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE change_log
             SET sync_state = 'pending', failure_kind = NULL, next_attempt_at = NULL
             WHERE id = ? AND sync_state = 'failed'",
            params![id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::InvalidInput(format!("change {id} is not failed")));
        }
        Ok(())
    }

    fn discard(&self, id: &ChangeId) -> Result<()> {
        let rows = self.conn.execute(
            "DELETE FROM change_log WHERE id = ? AND sync_state != 'syncing'",
            params![id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("discardable change {id}")));
        }
        Ok(())
    }

    fn discard_entity(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM change_log
             WHERE entity_type = ? AND entity_id = ? AND sync_state IN ('pending', 'failed')",
            params![entity_type.as_str(), entity_id.as_str()],
        )?;
        Ok(rows)
    }

    fn recover_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE change_log SET sync_state = 'pending' WHERE sync_state = 'syncing'",
            [],
        )?;
        if rows > 0 {
            tracing::warn!("Recovered {rows} change(s) left in flight by a previous run");
        }
        Ok(rows)
    }

    fn purge_synced(&self, older_than: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM change_log WHERE sync_state = 'synced' AND created_at < ?",
            params![older_than],
        )?;
        Ok(rows)
    }

    fn get(&self, id: &ChangeId) -> Result<Option<ChangeRecord>> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM change_log WHERE id = ?");
        Ok(self
            .conn
            .query_row(&sql, params![id.as_str()], Self::parse_change)
            .optional()?)
    }

    fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM change_log
             WHERE entity_type = ? AND entity_id = ?
             ORDER BY seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let changes = stmt
            .query_map(
                params![entity_type.as_str(), entity_id.as_str()],
                Self::parse_change,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn list_by_state(&self, state: SyncState, limit: usize) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM change_log
             WHERE sync_state = ?
             ORDER BY seq
             LIMIT ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let changes = stmt
            .query_map(params![state.as_str(), limit as i64], Self::parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn has_unsettled(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(
                SELECT 1 FROM change_log
                WHERE entity_type = ? AND entity_id = ? AND {UNSETTLED})"
        );
        Ok(self.conn.query_row(
            &sql,
            params![entity_type.as_str(), entity_id.as_str()],
            |row| row.get(0),
        )?)
    }

    fn pending_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM change_log WHERE sync_state IN ('pending', 'syncing')")
    }

    fn waiting_count(&self, entity_type: EntityType) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_log WHERE entity_type = ? AND sync_state = 'pending'",
            params![entity_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn failed_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM change_log WHERE sync_state = 'failed'")
    }

    fn needs_attention_count(&self) -> Result<usize> {
        self.count(
            "SELECT COUNT(*) FROM change_log
             WHERE sync_state = 'failed' AND failure_kind = 'validation'",
        )
    }

    fn oldest_pending(&self) -> Result<Option<i64>> {
        let sql = format!("SELECT MIN(created_at) FROM change_log WHERE {UNSETTLED}");
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn log(db: &Database) -> SqliteChangeLog<'_> {
        SqliteChangeLog::new(db.connection(), Duration::from_secs(3600))
    }

    #[test]
    fn test_record_is_pending() {
        let db = setup();
        let changes = log(&db);
        let boat_id = EntityId::new();

        let change = changes
            .record(
                EntityType::Boat,
                &boat_id,
                ChangeKind::Create,
                json!({ "name": "Skylark" }),
            )
            .unwrap();

        assert_eq!(change.sync_state, SyncState::Pending);
        assert_eq!(change.attempt_count, 0);
        assert_eq!(change.entity_id, boat_id);
        assert_eq!(changes.pending_count().unwrap(), 1);
        assert!(changes.oldest_pending().unwrap().is_some());
    }

    #[test]
    fn test_claim_serializes_per_entity() {
        let db = setup();
        let changes = log(&db);
        let boat_id = EntityId::new();

        let first = changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Create, json!({ "v": 1 }))
            .unwrap();
        let second = changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Update, json!({ "v": 2 }))
            .unwrap();

        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.sync_state, SyncState::Syncing);

        // Same entity already in flight
        assert!(changes.claim_next(EntityType::Boat).unwrap().is_none());

        changes.mark_synced(&first.id).unwrap();
        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[test]
    fn test_claim_allows_distinct_entities() {
        let db = setup();
        let changes = log(&db);

        changes
            .record(EntityType::Boat, &EntityId::new(), ChangeKind::Create, json!({}))
            .unwrap();
        changes
            .record(EntityType::Boat, &EntityId::new(), ChangeKind::Create, json!({}))
            .unwrap();

        assert!(changes.claim_next(EntityType::Boat).unwrap().is_some());
        assert!(changes.claim_next(EntityType::Boat).unwrap().is_some());
        assert!(changes.claim_next(EntityType::Boat).unwrap().is_none());
        assert!(changes.claim_next(EntityType::Trip).unwrap().is_none());
    }

    #[test]
    fn test_claim_waits_for_parent() {
        let db = setup();
        let changes = log(&db);
        let boat_id = EntityId::new();

        let boat = changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Create, json!({}))
            .unwrap();
        changes
            .record(
                EntityType::Trip,
                &EntityId::new(),
                ChangeKind::Create,
                json!({ "boatId": boat_id.as_str() }),
            )
            .unwrap();

        assert!(changes.claim_next(EntityType::Trip).unwrap().is_none());
        assert_eq!(changes.waiting_count(EntityType::Trip).unwrap(), 1);

        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        assert_eq!(claimed.id, boat.id);
        changes.mark_synced(&boat.id).unwrap();

        assert!(changes.claim_next(EntityType::Trip).unwrap().is_some());
    }

    #[test]
    fn test_rejected_parent_blocks_children() {
        let db = setup();
        let changes = log(&db);
        let boat_id = EntityId::new();

        changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Create, json!({}))
            .unwrap();
        let trip = changes
            .record(
                EntityType::Trip,
                &EntityId::new(),
                ChangeKind::Create,
                json!({ "boatId": boat_id.as_str() }),
            )
            .unwrap();

        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        changes
            .mark_failed_with(&claimed.id, FailureKind::Validation, "name is required")
            .unwrap();
        assert!(changes
            .claim_next_at(EntityType::Trip, i64::MAX)
            .unwrap()
            .is_none());

        // A corrected parent edit that syncs releases the child
        let fixed = changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Update, json!({ "name": "x" }))
            .unwrap();
        assert!(changes.claim_next(EntityType::Trip).unwrap().is_none());
        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        assert_eq!(claimed.id, fixed.id);
        changes.mark_synced(&fixed.id).unwrap();

        let claimed = changes.claim_next(EntityType::Trip).unwrap().unwrap();
        assert_eq!(claimed.id, trip.id);
    }

    #[test]
    fn test_mark_failed_schedules_backoff() {
        let db = setup();
        let changes = log(&db);
        let boat_id = EntityId::new();

        changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Create, json!({}))
            .unwrap();
        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        let failed = changes.mark_failed(&claimed.id, "HTTP 503").unwrap();

        assert_eq!(failed.sync_state, SyncState::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.failure_kind, Some(FailureKind::Transient));
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 503"));
        let last_attempt = failed.last_attempt_at.unwrap();
        assert_eq!(failed.next_attempt_at, Some(last_attempt + 2_000));

        // Backoff has not elapsed
        assert!(changes
            .claim_next_at(EntityType::Boat, last_attempt + 1_000)
            .unwrap()
            .is_none());
        let retried = changes
            .claim_next_at(EntityType::Boat, last_attempt + 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(retried.id, claimed.id);
        assert_eq!(retried.attempt_count, 1);
    }

    #[test]
    fn test_validation_failure_is_not_retried() {
        let db = setup();
        let changes = log(&db);
        let boat_id = EntityId::new();

        changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Create, json!({}))
            .unwrap();
        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        let failed = changes
            .mark_failed_with(&claimed.id, FailureKind::Validation, "name is required")
            .unwrap();
        assert!(failed.next_attempt_at.is_none());

        assert!(changes
            .claim_next_at(EntityType::Boat, i64::MAX)
            .unwrap()
            .is_none());
        assert_eq!(changes.needs_attention_count().unwrap(), 1);
        assert_eq!(changes.failed_count().unwrap(), 1);
        assert_eq!(changes.pending_count().unwrap(), 0);

        // A newer edit of the same entity is not blocked by it
        let newer = changes
            .record(EntityType::Boat, &boat_id, ChangeKind::Update, json!({ "name": "x" }))
            .unwrap();
        let claimed = changes.claim_next(EntityType::Boat).unwrap().unwrap();
        assert_eq!(claimed.id, newer.id);
    }

    #[test]
    fn test_terminal_transitions_require_syncing() {
        let db = setup();
        let changes = log(&db);
        let change = changes
            .record(EntityType::Note, &EntityId::new(), ChangeKind::Create, json!({}))
            .unwrap();

        assert!(changes.mark_synced(&change.id).is_err());
        assert!(changes.mark_failed(&change.id, "boom").is_err());
        assert!(changes.release(&change.id).is_err());
    }

    #[test]
    fn test_release_returns_to_pending_without_attempt() {
        let db = setup();
        let changes = log(&db);
        changes
            .record(EntityType::Note, &EntityId::new(), ChangeKind::Create, json!({}))
            .unwrap();
        let claimed = changes.claim_next(EntityType::Note).unwrap().unwrap();
        changes.release(&claimed.id).unwrap();

        let released = changes.get(&claimed.id).unwrap().unwrap();
        assert_eq!(released.sync_state, SyncState::Pending);
        assert_eq!(released.attempt_count, 0);
    }

    #[test]
    fn test_recover_in_flight_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("keel.db");
        let change_id = {
            let db = Database::open(&db_path).unwrap();
            let changes = log(&db);
            changes
                .record(EntityType::Trip, &EntityId::new(), ChangeKind::Create, json!({}))
                .unwrap();
            changes.claim_next(EntityType::Trip).unwrap().unwrap().id
        };

        let db = Database::open(&db_path).unwrap();
        let changes = log(&db);
        assert_eq!(
            changes.get(&change_id).unwrap().unwrap().sync_state,
            SyncState::Syncing
        );
        assert_eq!(changes.recover_in_flight().unwrap(), 1);
        assert_eq!(
            changes.get(&change_id).unwrap().unwrap().sync_state,
            SyncState::Pending
        );
    }

    #[test]
    fn test_purge_synced_respects_cutoff() {
        let db = setup();
        let changes = log(&db);
        let change = changes
            .record(EntityType::Photo, &EntityId::new(), ChangeKind::Create, json!({}))
            .unwrap();
        changes.claim_next(EntityType::Photo).unwrap().unwrap();
        changes.mark_synced(&change.id).unwrap();

        assert_eq!(changes.purge_synced(change.created_at).unwrap(), 0);
        assert_eq!(changes.purge_synced(change.created_at + 1).unwrap(), 1);
        assert!(changes.get(&change.id).unwrap().is_none());
    }

    #[test]
    fn test_discard_entity_skips_in_flight() {
        let db = setup();
        let changes = log(&db);
        let id = EntityId::new();
        changes
            .record(EntityType::TodoList, &id, ChangeKind::Create, json!({}))
            .unwrap();
        changes
            .record(EntityType::TodoList, &id, ChangeKind::Update, json!({}))
            .unwrap();
        changes.claim_next(EntityType::TodoList).unwrap().unwrap();

        assert_eq!(changes.discard_entity(EntityType::TodoList, &id).unwrap(), 1);
        assert_eq!(changes.list_for_entity(EntityType::TodoList, &id).unwrap().len(), 1);
    }
}
