//! Observable sync status types.

use serde::{Deserialize, Serialize};

use super::entity::EntityType;

/// Orchestrator state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Idle,
    Syncing,
    IdleWithConflicts,
}

/// What an in-progress pass is doing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Starting,
    Pushing(EntityType),
    Pulling(EntityType),
    Finished,
}

/// Ephemeral progress of a sync pass. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// 0..=100
    pub percentage: u8,
    pub message: String,
}

impl SyncProgress {
    #[must_use]
    pub fn starting() -> Self {
        Self {
            phase: SyncPhase::Starting,
            percentage: 0,
            message: "Starting sync".to_string(),
        }
    }

    /// Progress after `completed` of `total` handlers have finished.
    #[must_use]
    pub fn handler_completed(entity_type: EntityType, completed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            u8::try_from(completed.min(total) * 100 / total).unwrap_or(100)
        };
        Self {
            phase: SyncPhase::Pulling(entity_type),
            percentage,
            message: format!("Synced {entity_type} ({completed}/{total})"),
        }
    }

    #[must_use]
    pub fn finished(message: impl Into<String>) -> Self {
        Self {
            phase: SyncPhase::Finished,
            percentage: 100,
            message: message.into(),
        }
    }
}

/// Derived, read-only summary of unsynced work.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineStatus {
    pub is_offline: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    /// Validation failures that need the user to fix or discard data
    pub needs_attention_count: usize,
    pub oldest_pending_at: Option<i64>,
    pub auth_required: bool,
    pub unresolved_conflicts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_progress_percentage() {
        let progress = SyncProgress::handler_completed(EntityType::Trip, 2, 11);
        assert_eq!(progress.percentage, 18);
        let progress = SyncProgress::handler_completed(EntityType::MarkedLocation, 11, 11);
        assert_eq!(progress.percentage, 100);
        let progress = SyncProgress::handler_completed(EntityType::Boat, 0, 0);
        assert_eq!(progress.percentage, 100);
    }
}
