//! Syncable entity model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a syncable entity, using UUID v7 (time-sortable).
///
/// Assigned at creation on the device so records can be created offline
/// without a server round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new unique entity ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The syncable domain kinds of the logbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Boat,
    Trip,
    CrewMember,
    GpsPoint,
    Note,
    Photo,
    TodoList,
    TodoItem,
    MaintenanceTemplate,
    MaintenanceEvent,
    MarkedLocation,
}

impl EntityType {
    /// Every entity type in dependency order: parents always precede children.
    pub const SYNC_ORDER: [Self; 11] = [
        Self::Boat,
        Self::Trip,
        Self::CrewMember,
        Self::GpsPoint,
        Self::Note,
        Self::Photo,
        Self::TodoList,
        Self::TodoItem,
        Self::MaintenanceTemplate,
        Self::MaintenanceEvent,
        Self::MarkedLocation,
    ];

    /// Stable storage/wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boat => "boat",
            Self::Trip => "trip",
            Self::CrewMember => "crew_member",
            Self::GpsPoint => "gps_point",
            Self::Note => "note",
            Self::Photo => "photo",
            Self::TodoList => "todo_list",
            Self::TodoItem => "todo_item",
            Self::MaintenanceTemplate => "maintenance_template",
            Self::MaintenanceEvent => "maintenance_event",
            Self::MarkedLocation => "marked_location",
        }
    }

    /// REST collection path segment for this type.
    #[must_use]
    pub const fn resource_path(self) -> &'static str {
        match self {
            Self::Boat => "boats",
            Self::Trip => "trips",
            Self::CrewMember => "crew-members",
            Self::GpsPoint => "gps-points",
            Self::Note => "notes",
            Self::Photo => "photos",
            Self::TodoList => "todo-lists",
            Self::TodoItem => "todo-items",
            Self::MaintenanceTemplate => "maintenance-templates",
            Self::MaintenanceEvent => "maintenance-events",
            Self::MarkedLocation => "marked-locations",
        }
    }

    /// Parent type and the payload field holding the parent's id, if any.
    #[must_use]
    pub const fn parent_link(self) -> Option<(Self, &'static str)> {
        match self {
            Self::Trip | Self::MaintenanceTemplate => Some((Self::Boat, "boatId")),
            Self::CrewMember | Self::GpsPoint | Self::Note | Self::Photo => {
                Some((Self::Trip, "tripId"))
            }
            Self::TodoItem => Some((Self::TodoList, "todoListId")),
            Self::MaintenanceEvent => Some((Self::MaintenanceTemplate, "templateId")),
            Self::Boat | Self::TodoList | Self::MarkedLocation => None,
        }
    }

    /// Resolve the parent reference carried by an entity payload.
    ///
    /// Returns `None` when the type has no parent or the payload does not
    /// name a parseable parent id.
    #[must_use]
    pub fn parent_of(self, payload: &Value) -> Option<ParentRef> {
        let (parent_type, field) = self.parent_link()?;
        let parent_id = payload.get(field)?.as_str()?.parse().ok()?;
        Some(ParentRef {
            entity_type: parent_type,
            entity_id: parent_id,
        })
    }

    /// Position of this type in [`Self::SYNC_ORDER`].
    #[must_use]
    pub fn sync_rank(self) -> usize {
        Self::SYNC_ORDER
            .iter()
            .position(|candidate| *candidate == self)
            .unwrap_or(Self::SYNC_ORDER.len())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::SYNC_ORDER
            .into_iter()
            .find(|entity_type| entity_type.as_str() == normalized)
            .ok_or_else(|| format!("unknown entity type '{s}'"))
    }
}

/// Reference to the parent entity a record depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

/// Local copy of a syncable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableEntity {
    pub entity_type: EntityType,
    pub id: EntityId,
    /// Serialized domain fields
    pub payload: Value,
    /// Authoritative for conflict comparison (Unix ms)
    pub last_modified: i64,
    /// Device that created or last touched this entity locally
    pub origin_source: Option<String>,
    pub origin_timestamp: Option<i64>,
    /// Whether this exact version has been acknowledged by the server
    pub synced: bool,
    /// Last `last_modified` the server acknowledged for this entity
    pub remote_modified: Option<i64>,
    /// Soft delete flag for sync
    pub is_deleted: bool,
}
