//! Data models for Keel

mod change;
mod entity;
mod status;
mod sync_conflict;

pub use change::{ChangeId, ChangeKind, ChangeRecord, FailureKind, NewChange, SyncState};
pub use entity::{EntityId, EntityType, ParentRef, SyncableEntity};
pub use status::{OfflineStatus, OrchestratorState, SyncPhase, SyncProgress};
pub use sync_conflict::{NewSyncConflict, Resolution, SyncConflict};
