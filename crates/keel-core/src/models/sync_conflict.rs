//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::entity::{EntityId, EntityType};

/// Caller's decision for a conflict. Set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Unresolved,
    UseLocal,
    UseRemote,
}

impl Resolution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::UseLocal => "use_local",
            Self::UseRemote => "use_remote",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "use_local" => Ok(Self::UseLocal),
            "use_remote" => Ok(Self::UseRemote),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

/// Local and remote versions of the same entity that both changed since the
/// last common sync point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Local snapshot that was about to be pushed
    pub local_version: Value,
    /// Remote snapshot at detection time (`null` when the remote was deleted)
    pub remote_version: Value,
    pub local_modified: i64,
    pub remote_modified: Option<i64>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub resolution: Resolution,
    pub resolved_at: Option<i64>,
}

impl SyncConflict {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution != Resolution::Unresolved
    }
}

/// Conflict about to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncConflict {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub local_version: Value,
    pub remote_version: Value,
    pub local_modified: i64,
    pub remote_modified: Option<i64>,
}
