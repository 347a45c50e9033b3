//! Change log record model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::{EntityId, EntityType, ParentRef};

/// Opaque identifier of a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What kind of mutation a change record represents.
///
/// Domain-specific kinds (e.g. `schedule_change`) are pushed as updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Custom(String),
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Custom(kind) => kind,
        }
    }

    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl From<String> for ChangeKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            _ => Self::Custom(value.trim().to_string()),
        }
    }
}

impl From<&str> for ChangeKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ChangeKind> for String {
    fn from(value: ChangeKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync lifecycle of a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync state '{other}'")),
        }
    }
}

/// Why a change record ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, timeout or 5xx; retried with backoff
    Transient,
    /// Rejected by the server (4xx); needs user attention, never retried
    Validation,
    /// Parked behind an unresolved sync conflict
    Conflict,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "validation" => Ok(Self::Validation),
            "conflict" => Ok(Self::Conflict),
            other => Err(format!("unknown failure kind '{other}'")),
        }
    }
}

/// One pending local mutation awaiting sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    /// Insertion order
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub change_kind: ChangeKind,
    /// Snapshot of the entity at the time of the change
    pub payload: Value,
    /// Local creation timestamp (Unix ms)
    pub created_at: i64,
    pub sync_state: SyncState,
    pub attempt_count: u32,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub next_attempt_at: Option<i64>,
    /// Entity `last_modified` after this mutation
    pub local_modified: i64,
    /// Last server-acknowledged `last_modified` when the change was queued
    pub base_modified: Option<i64>,
    pub parent: Option<ParentRef>,
}

impl ChangeRecord {
    /// Whether this record still needs a successful push.
    #[must_use]
    pub fn is_unsettled(&self) -> bool {
        match self.sync_state {
            SyncState::Pending | SyncState::Syncing => true,
            SyncState::Failed => self.failure_kind != Some(FailureKind::Validation),
            SyncState::Synced => false,
        }
    }
}

/// Input for appending a change to the log
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub change_kind: ChangeKind,
    pub payload: Value,
    pub local_modified: i64,
    pub base_modified: Option<i64>,
    pub parent: Option<ParentRef>,
}

impl NewChange {
    /// Build a change with no baseline, stamping `local_modified` with now and
    /// deriving the parent from the payload.
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_id: EntityId,
        change_kind: impl Into<ChangeKind>,
        payload: Value,
    ) -> Self {
        let parent = entity_type.parent_of(&payload);
        Self {
            entity_type,
            entity_id,
            change_kind: change_kind.into(),
            payload,
            local_modified: crate::util::unix_millis_now(),
            base_modified: None,
            parent,
        }
    }

    #[must_use]
    pub const fn with_baseline(mut self, base_modified: Option<i64>) -> Self {
        self.base_modified = base_modified;
        self
    }

    #[must_use]
    pub const fn with_local_modified(mut self, local_modified: i64) -> Self {
        self.local_modified = local_modified;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_kind_parses_known_and_custom() {
        assert_eq!(ChangeKind::from("create"), ChangeKind::Create);
        assert_eq!(ChangeKind::from(" DELETE "), ChangeKind::Delete);
        assert_eq!(
            ChangeKind::from("schedule_change"),
            ChangeKind::Custom("schedule_change".to_string())
        );
        assert_eq!(ChangeKind::Custom("x".into()).as_str(), "x");
    }

    #[test]
    fn test_change_kind_serializes_as_plain_string() {
        let json = serde_json::to_string(&ChangeKind::Update).unwrap();
        assert_eq!(json, "\"update\"");
    }

    #[test]
    fn test_sync_state_parse() {
        for state in [
            SyncState::Pending,
            SyncState::Syncing,
            SyncState::Synced,
            SyncState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<SyncState>(), Ok(state));
        }
    }

    #[test]
    fn test_new_change_derives_parent() {
        let boat_id = EntityId::new();
        let change = NewChange::new(
            EntityType::Trip,
            EntityId::new(),
            ChangeKind::Create,
            json!({ "boatId": boat_id.as_str() }),
        );
        assert_eq!(change.parent.map(|parent| parent.entity_id), Some(boat_id));
        assert!(change.base_modified.is_none());
    }

    #[test]
    fn test_only_transient_failures_retry() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::Conflict.is_retryable());
    }
}
