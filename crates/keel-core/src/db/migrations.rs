//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, V1_ENTITIES_AND_CHANGE_LOG)?;
    }
    if version < 2 {
        migrate(conn, 2, V2_SYNC_CONFLICTS)?;
    }
    if version < 3 {
        migrate(conn, 3, V3_WATERMARKS)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn migrate(conn: &Connection, version: i32, statements: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(statements)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: local entity store and the durable change log
const V1_ENTITIES_AND_CHANGE_LOG: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS entities (
        entity_type TEXT NOT NULL,
        id TEXT NOT NULL,
        payload TEXT NOT NULL,
        last_modified INTEGER NOT NULL,
        origin_source TEXT,
        origin_timestamp INTEGER,
        synced INTEGER NOT NULL DEFAULT 0,
        remote_modified INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (entity_type, id)
    );
    CREATE INDEX IF NOT EXISTS idx_entities_modified ON entities(entity_type, last_modified DESC);

    CREATE TABLE IF NOT EXISTS change_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        change_kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        sync_state TEXT NOT NULL DEFAULT 'pending',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        last_error TEXT,
        failure_kind TEXT,
        next_attempt_at INTEGER,
        local_modified INTEGER NOT NULL,
        base_modified INTEGER,
        parent_type TEXT,
        parent_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_change_log_state ON change_log(entity_type, sync_state, seq);
    CREATE INDEX IF NOT EXISTS idx_change_log_entity ON change_log(entity_type, entity_id, seq);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_change_log_one_syncing
        ON change_log(entity_type, entity_id) WHERE sync_state = 'syncing';
";

/// Version 2: conflicts surfaced for manual resolution
const V2_SYNC_CONFLICTS: &str = "
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        local_version TEXT NOT NULL,
        remote_version TEXT NOT NULL,
        local_modified INTEGER NOT NULL,
        remote_modified INTEGER,
        detected_at INTEGER NOT NULL,
        resolution TEXT NOT NULL DEFAULT 'unresolved',
        resolved_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_type, entity_id);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolution ON sync_conflicts(resolution, detected_at DESC);
";

/// Version 3: per-entity-type pull watermarks
const V3_WATERMARKS: &str = "
    CREATE TABLE IF NOT EXISTS sync_watermarks (
        entity_type TEXT PRIMARY KEY,
        since INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
";
