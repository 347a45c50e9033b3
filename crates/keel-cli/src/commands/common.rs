use std::fmt::Write as _;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use keel_core::config::{default_config_path, API_TOKEN_ENV};
use keel_core::models::{ChangeId, ChangeRecord};
use keel_core::util::{format_timestamp_ms, unix_millis_now};
use keel_core::{
    DatabaseService, EntityId, EntityType, HttpRemote, SyncConflict, SyncSettings, SyncableEntity,
};
use serde::Serialize;

use crate::error::CliError;

const PREVIEW_CHARS: usize = 60;

/// Paths given on the command line
#[derive(Debug, Clone, Default)]
pub struct Paths {
    pub db_path: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct ChangeListItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub change_kind: String,
    pub sync_state: String,
    pub attempt_count: u32,
    pub failure_kind: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub local_modified: i64,
    pub remote_modified: Option<i64>,
    pub detected_at_iso: String,
    pub resolution: String,
    pub local_version: serde_json::Value,
    pub remote_version: serde_json::Value,
}

pub fn settings_path(paths: &Paths) -> Result<PathBuf, CliError> {
    match &paths.config {
        Some(path) => Ok(path.clone()),
        None => Ok(default_config_path()?),
    }
}

/// Resolved settings with the command-line database path applied last.
pub fn load_settings(paths: &Paths) -> Result<SyncSettings, CliError> {
    let mut settings = SyncSettings::load_or_init(&settings_path(paths)?)?;
    if let Some(db_path) = &paths.db_path {
        settings.db_path = Some(db_path.clone());
    }
    Ok(settings)
}

pub fn open_store(settings: &SyncSettings) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(settings.database_path()?)?
        .with_max_backoff(settings.max_backoff())
        .with_device_id(settings.device_id.clone()))
}

/// HTTP transport authenticated from `KEEL_API_TOKEN`.
pub fn connect_remote(settings: &SyncSettings) -> Result<HttpRemote, CliError> {
    if settings.remote_base_url.is_none() && settings.local_base_url.is_none() {
        return Err(CliError::SyncNotConfigured);
    }
    let remote = HttpRemote::from_settings(settings)?;
    remote.set_token(std::env::var(API_TOKEN_ENV).ok());
    Ok(remote)
}

pub fn parse_entity_type(value: &str) -> Result<EntityType, CliError> {
    value
        .parse::<EntityType>()
        .map_err(|_| CliError::UnknownEntityType(value.trim().to_string()))
}

pub fn parse_entity_id(value: Option<&str>) -> Result<EntityId, CliError> {
    match value.map(str::trim) {
        None | Some("") => Ok(EntityId::new()),
        Some(id) => id
            .parse::<EntityId>()
            .map_err(|_| CliError::InvalidId(id.to_string())),
    }
}

pub fn parse_change_id(value: &str) -> Result<ChangeId, CliError> {
    value
        .trim()
        .parse::<ChangeId>()
        .map_err(|_| CliError::InvalidId(value.trim().to_string()))
}

/// Parse a payload argument; deletes may omit it.
pub fn parse_payload(raw: Option<&str>, allow_empty: bool) -> Result<serde_json::Value, CliError> {
    let raw = raw.map(str::trim).filter(|raw| !raw.is_empty());
    let Some(raw) = raw else {
        return if allow_empty {
            Ok(serde_json::Value::Null)
        } else {
            Err(CliError::EmptyPayload)
        };
    };
    let payload: serde_json::Value = serde_json::from_str(raw)?;
    if !payload.is_object() {
        return Err(CliError::PayloadNotObject);
    }
    Ok(payload)
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    stdin.read_to_string(&mut input)?;
    Ok(Some(input))
}

pub fn payload_preview(payload: &serde_json::Value, max_chars: usize) -> String {
    let rendered = payload.to_string();
    let mut preview: String = rendered.chars().take(max_chars).collect();
    if rendered.chars().count() > max_chars {
        preview.push_str("...");
    }
    preview
}

pub fn format_entity_lines(entities: &[SyncableEntity]) -> Vec<String> {
    let now = unix_millis_now();
    entities
        .iter()
        .map(|entity| {
            let marker = match (entity.is_deleted, entity.synced) {
                (true, _) => "deleted",
                (false, true) => "synced",
                (false, false) => "local",
            };
            format!(
                "{}  {:<7}  {:>8}  {}",
                entity.id,
                marker,
                format_relative_time(entity.last_modified, now),
                payload_preview(&entity.payload, PREVIEW_CHARS)
            )
        })
        .collect()
}

pub fn change_to_item(change: &ChangeRecord, now_ms: i64) -> ChangeListItem {
    ChangeListItem {
        id: change.id.to_string(),
        entity_type: change.entity_type.to_string(),
        entity_id: change.entity_id.to_string(),
        change_kind: change.change_kind.to_string(),
        sync_state: change.sync_state.as_str().to_string(),
        attempt_count: change.attempt_count,
        failure_kind: change.failure_kind.map(|kind| kind.as_str().to_string()),
        last_error: change.last_error.clone(),
        created_at: change.created_at,
        relative_time: format_relative_time(change.created_at, now_ms),
    }
}

pub fn format_change_lines(changes: &[ChangeRecord]) -> Vec<String> {
    let now = unix_millis_now();
    changes
        .iter()
        .map(|change| {
            let mut line = format!(
                "{}  {:<8}  {} {}  attempts={}  {}",
                change.id,
                change.change_kind,
                change.entity_type,
                change.entity_id,
                change.attempt_count,
                format_relative_time(change.created_at, now)
            );
            if let Some(error) = &change.last_error {
                let _ = write!(line, "  error={error}");
            }
            line
        })
        .collect()
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        entity_type: conflict.entity_type.to_string(),
        entity_id: conflict.entity_id.to_string(),
        local_modified: conflict.local_modified,
        remote_modified: conflict.remote_modified,
        detected_at_iso: format_timestamp_ms(conflict.detected_at),
        resolution: conflict.resolution.as_str().to_string(),
        local_version: conflict.local_version.clone(),
        remote_version: conflict.remote_version.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "#{}  {}  {:<10}  {} {}  local={} remote={}",
                conflict.id,
                format_timestamp_ms(conflict.detected_at),
                conflict.resolution.as_str(),
                conflict.entity_type,
                conflict.entity_id,
                payload_preview(&conflict.local_version, PREVIEW_CHARS / 2),
                payload_preview(&conflict.remote_version, PREVIEW_CHARS / 2)
            )
        })
        .collect()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
