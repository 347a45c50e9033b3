//! Local entity store and pull watermarks

use rusqlite::{params, Connection, OptionalExtension};

use super::change_log::parse_column;
use crate::error::Result;
use crate::models::{EntityId, EntityType, SyncableEntity};
use crate::util::unix_millis_now;

/// Trait for local entity storage operations
pub trait EntityRepository {
    /// Get an entity by type and id, including tombstones
    fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<SyncableEntity>>;

    /// List live entities of a type, most recently modified first
    fn list(&self, entity_type: EntityType, limit: usize) -> Result<Vec<SyncableEntity>>;

    /// Insert or replace an entity row
    fn upsert(&self, entity: &SyncableEntity) -> Result<()>;

    /// Record that the server acknowledged the version pushed at `local_modified`.
    ///
    /// The entity only becomes `synced` if no newer local edit happened since.
    fn mark_acknowledged(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_modified: i64,
        remote_modified: i64,
    ) -> Result<()>;

    /// Last pulled-since watermark of a type
    fn watermark(&self, entity_type: EntityType) -> Result<Option<i64>>;

    fn set_watermark(&self, entity_type: EntityType, since: i64) -> Result<()>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncableEntity> {
        let entity_type: String = row.get(0)?;
        let id: String = row.get(1)?;
        let payload: String = row.get(2)?;
        Ok(SyncableEntity {
            entity_type: parse_column(0, &entity_type)?,
            id: parse_column(1, &id)?,
            payload: serde_json::from_str(&payload).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(error),
                )
            })?,
            last_modified: row.get(3)?,
            origin_source: row.get(4)?,
            origin_timestamp: row.get(5)?,
            synced: row.get::<_, i32>(6)? != 0,
            remote_modified: row.get(7)?,
            is_deleted: row.get::<_, i32>(8)? != 0,
        })
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<SyncableEntity>> {
        Ok(self
            .conn
            .query_row(
                "SELECT entity_type, id, payload, last_modified, origin_source, origin_timestamp,
                        synced, remote_modified, is_deleted
                 FROM entities WHERE entity_type = ? AND id = ?",
                params![entity_type.as_str(), id.as_str()],
                Self::parse_entity,
            )
            .optional()?)
    }

    #[allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
    fn list(&self, entity_type: EntityType, limit: usize) -> Result<Vec<SyncableEntity>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, id, payload, last_modified, origin_source, origin_timestamp,
                    synced, remote_modified, is_deleted
             FROM entities
             WHERE entity_type = ? AND is_deleted = 0
             ORDER BY last_modified DESC
             LIMIT ?",
        )?;
        let entities = stmt
            .query_map(
                params![entity_type.as_str(), limit as i64],
                Self::parse_entity,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    fn upsert(&self, entity: &SyncableEntity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entities (
                entity_type, id, payload, last_modified, origin_source, origin_timestamp,
                synced, remote_modified, is_deleted
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, id) DO UPDATE SET
                payload = excluded.payload,
                last_modified = excluded.last_modified,
                origin_source = excluded.origin_source,
                origin_timestamp = excluded.origin_timestamp,
                synced = excluded.synced,
                remote_modified = excluded.remote_modified,
                is_deleted = excluded.is_deleted",
            params![
                entity.entity_type.as_str(),
                entity.id.as_str(),
                serde_json::to_string(&entity.payload)?,
                entity.last_modified,
                entity.origin_source,
                entity.origin_timestamp,
                i32::from(entity.synced),
                entity.remote_modified,
                i32::from(entity.is_deleted),
            ],
        )?;
        Ok(())
    }

    fn mark_acknowledged(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_modified: i64,
        remote_modified: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE entities
             SET remote_modified = MAX(COALESCE(remote_modified, 0), ?1),
                 synced = CASE WHEN last_modified <= ?2 THEN 1 ELSE synced END
             WHERE entity_type = ?3 AND id = ?4",
            params![
                remote_modified,
                local_modified,
                entity_type.as_str(),
                id.as_str()
            ],
        )?;
        Ok(())
    }

    fn watermark(&self, entity_type: EntityType) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT since FROM sync_watermarks WHERE entity_type = ?",
                params![entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_watermark(&self, entity_type: EntityType, since: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_watermarks (entity_type, since, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_type) DO UPDATE SET
                since = MAX(since, excluded.since),
                updated_at = excluded.updated_at",
            params![entity_type.as_str(), since, unix_millis_now()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn boat(last_modified: i64) -> SyncableEntity {
        SyncableEntity {
            entity_type: EntityType::Boat,
            id: EntityId::new(),
            payload: json!({ "name": "Skylark" }),
            last_modified,
            origin_source: Some("device-a".to_string()),
            origin_timestamp: Some(last_modified),
            synced: false,
            remote_modified: None,
            is_deleted: false,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());
        let entity = boat(10);

        repo.upsert(&entity).unwrap();
        assert_eq!(repo.get(EntityType::Boat, &entity.id).unwrap(), Some(entity.clone()));
        assert!(repo.get(EntityType::Trip, &entity.id).unwrap().is_none());

        let updated = SyncableEntity {
            payload: json!({ "name": "Skylark II" }),
            last_modified: 20,
            ..entity.clone()
        };
        repo.upsert(&updated).unwrap();
        assert_eq!(repo.get(EntityType::Boat, &entity.id).unwrap(), Some(updated));
        assert_eq!(repo.list(EntityType::Boat, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_acknowledged_ignores_stale_versions() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());
        let entity = boat(20);
        repo.upsert(&entity).unwrap();

        // Ack for an older version leaves the newer edit unsynced
        repo.mark_acknowledged(EntityType::Boat, &entity.id, 10, 10)
            .unwrap();
        let stored = repo.get(EntityType::Boat, &entity.id).unwrap().unwrap();
        assert!(!stored.synced);
        assert_eq!(stored.remote_modified, Some(10));

        repo.mark_acknowledged(EntityType::Boat, &entity.id, 20, 20)
            .unwrap();
        let stored = repo.get(EntityType::Boat, &entity.id).unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.remote_modified, Some(20));
    }

    #[test]
    fn test_watermark_only_moves_forward() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        assert_eq!(repo.watermark(EntityType::Note).unwrap(), None);
        repo.set_watermark(EntityType::Note, 100).unwrap();
        repo.set_watermark(EntityType::Note, 50).unwrap();
        assert_eq!(repo.watermark(EntityType::Note).unwrap(), Some(100));
    }
}
