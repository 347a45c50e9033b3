//! Sync conflict storage

use rusqlite::{params, Connection, OptionalExtension};

use super::change_log::parse_column;
use crate::error::{Error, Result};
use crate::models::{EntityId, EntityType, NewSyncConflict, Resolution, SyncConflict};
use crate::util::unix_millis_now;

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, local_version, remote_version,
     local_modified, remote_modified, detected_at, resolution, resolved_at";

/// Trait for sync conflict storage operations
pub trait ConflictRepository {
    fn insert(&self, conflict: &NewSyncConflict) -> Result<SyncConflict>;

    fn get(&self, id: i64) -> Result<Option<SyncConflict>>;

    /// Unresolved conflicts, oldest first
    fn list_unresolved(&self) -> Result<Vec<SyncConflict>>;

    /// Most recent conflicts of any resolution
    fn list_recent(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Unresolved conflict for an entity, if any
    fn find_unresolved(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<SyncConflict>>;

    /// Record the caller's decision. Fails if already resolved.
    fn resolve(&self, id: i64, resolution: Resolution) -> Result<SyncConflict>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        let entity_type: String = row.get(1)?;
        let entity_id: String = row.get(2)?;
        let local_version: String = row.get(3)?;
        let remote_version: String = row.get(4)?;
        let resolution: String = row.get(8)?;
        Ok(SyncConflict {
            id: row.get(0)?,
            entity_type: parse_column(1, &entity_type)?,
            entity_id: parse_column(2, &entity_id)?,
            local_version: parse_json(3, &local_version)?,
            remote_version: parse_json(4, &remote_version)?,
            local_modified: row.get(5)?,
            remote_modified: row.get(6)?,
            detected_at: row.get(7)?,
            resolution: parse_column(8, &resolution)?,
            resolved_at: row.get(9)?,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(sql)?;
        let conflicts = stmt
            .query_map(params, Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}

fn parse_json(index: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
    })
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn insert(&self, conflict: &NewSyncConflict) -> Result<SyncConflict> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (
                entity_type, entity_id, local_version, remote_version,
                local_modified, remote_modified, detected_at, resolution
             ) VALUES (?, ?, ?, ?, ?, ?, ?, 'unresolved')",
            params![
                conflict.entity_type.as_str(),
                conflict.entity_id.as_str(),
                serde_json::to_string(&conflict.local_version)?,
                serde_json::to_string(&conflict.remote_version)?,
                conflict.local_modified,
                conflict.remote_modified,
                unix_millis_now(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| Error::Database(format!("conflict {id} vanished after insert")))
    }

    fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?");
        Ok(self
            .conn
            .query_row(&sql, params![id], Self::parse_conflict)
            .optional()?)
    }

    fn list_unresolved(&self) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE resolution = 'unresolved'
             ORDER BY detected_at, id"
        );
        self.query(&sql, [])
    }

    #[allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
    fn list_recent(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             ORDER BY detected_at DESC, id DESC
             LIMIT ?"
        );
        self.query(&sql, params![limit as i64])
    }

    fn find_unresolved(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<SyncConflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE entity_type = ? AND entity_id = ? AND resolution = 'unresolved'
             ORDER BY id DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![entity_type.as_str(), entity_id.as_str()],
                Self::parse_conflict,
            )
            .optional()?)
    }

    fn resolve(&self, id: i64, resolution: Resolution) -> Result<SyncConflict> {
        if resolution == Resolution::Unresolved {
            return Err(Error::InvalidInput(
                "a conflict cannot be resolved as unresolved".to_string(),
            ));
        }

        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET resolution = ?, resolved_at = ?
             WHERE id = ? AND resolution = 'unresolved'",
            params![resolution.as_str(), unix_millis_now(), id],
        )?;
        if rows == 0 {
            return match self.get(id)? {
                Some(_) => Err(Error::InvalidInput(format!(
                    "conflict {id} is already resolved"
                ))),
                None => Err(Error::NotFound(format!("conflict {id}"))),
            };
        }

        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn new_conflict() -> NewSyncConflict {
        NewSyncConflict {
            entity_type: EntityType::MarkedLocation,
            entity_id: EntityId::new(),
            local_version: json!({ "name": "Anchorage A" }),
            remote_version: json!({ "name": "Anchorage B" }),
            local_modified: 30,
            remote_modified: Some(25),
        }
    }

    #[test]
    fn test_insert_and_list_unresolved() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());

        let conflict = repo.insert(&new_conflict()).unwrap();
        assert_eq!(conflict.resolution, Resolution::Unresolved);
        assert_eq!(conflict.remote_version["name"], "Anchorage B");

        let unresolved = repo.list_unresolved().unwrap();
        assert_eq!(unresolved, vec![conflict.clone()]);
        assert_eq!(
            repo.find_unresolved(conflict.entity_type, &conflict.entity_id)
                .unwrap(),
            Some(conflict)
        );
    }

    #[test]
    fn test_resolution_is_set_exactly_once() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let conflict = repo.insert(&new_conflict()).unwrap();

        let resolved = repo.resolve(conflict.id, Resolution::UseLocal).unwrap();
        assert_eq!(resolved.resolution, Resolution::UseLocal);
        assert!(resolved.resolved_at.is_some());

        assert!(repo.resolve(conflict.id, Resolution::UseRemote).is_err());
        assert!(repo.list_unresolved().unwrap().is_empty());
        assert!(matches!(
            repo.resolve(9_999, Resolution::UseLocal),
            Err(Error::NotFound(_))
        ));
    }
}
