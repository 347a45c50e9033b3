//! Last-sync-baseline conflict detection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::remote::RemoteEntity;
use crate::models::{ChangeRecord, SyncableEntity};

/// What to do when the remote `lastModified` equals the local one but the
/// version came from another device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    /// Push the local version
    #[default]
    PreferLocal,
    /// Keep the remote version and drop the local change
    PreferRemote,
    /// Surface a conflict for the user
    Conflict,
}

impl TieBreakPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreferLocal => "prefer_local",
            Self::PreferRemote => "prefer_remote",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for TieBreakPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TieBreakPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "prefer_local" | "local" => Ok(Self::PreferLocal),
            "prefer_remote" | "remote" => Ok(Self::PreferRemote),
            "conflict" => Ok(Self::Conflict),
            other => Err(format!("unknown tie-break policy '{other}'")),
        }
    }
}

/// Outcome of comparing a claimed change with the remote version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Nothing changed remotely since the baseline; safe to overwrite
    Clean,
    /// Tie resolved in favour of the remote version
    AcceptRemote,
    /// Both sides changed since the baseline
    Conflict,
}

/// Compares local and remote versions against the last common sync point.
///
/// Never merges field by field: a version either wins whole or a conflict is
/// raised.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    policy: TieBreakPolicy,
    device_id: Option<String>,
}

impl ConflictDetector {
    pub const fn new(policy: TieBreakPolicy, device_id: Option<String>) -> Self {
        Self { policy, device_id }
    }

    pub const fn policy(&self) -> TieBreakPolicy {
        self.policy
    }

    /// Baseline for a change: the newer of the version it was queued against
    /// and whatever the server acknowledged for the entity since.
    pub fn effective_baseline(
        change: &ChangeRecord,
        entity: Option<&SyncableEntity>,
    ) -> Option<i64> {
        let acknowledged = entity.and_then(|entity| entity.remote_modified);
        change.base_modified.max(acknowledged)
    }

    pub fn decide(
        &self,
        change: &ChangeRecord,
        baseline: Option<i64>,
        remote: Option<&RemoteEntity>,
    ) -> ConflictDecision {
        let deleting = change.change_kind.is_delete();
        let Some(remote) = remote else {
            return match baseline {
                // Never seen remotely: a plain create
                None => ConflictDecision::Clean,
                // Deleting what someone else already removed
                Some(_) if deleting => ConflictDecision::Clean,
                // Removed remotely after we last synced it
                Some(_) => ConflictDecision::Conflict,
            };
        };

        if deleting && remote.deleted {
            return ConflictDecision::Clean;
        }
        if baseline.is_some_and(|baseline| remote.last_modified <= baseline) {
            return ConflictDecision::Clean;
        }
        if remote.last_modified == change.local_modified {
            if self.is_own_version(remote) {
                return ConflictDecision::Clean;
            }
            return match self.policy {
                TieBreakPolicy::PreferLocal => ConflictDecision::Clean,
                TieBreakPolicy::PreferRemote => ConflictDecision::AcceptRemote,
                TieBreakPolicy::Conflict => ConflictDecision::Conflict,
            };
        }
        ConflictDecision::Conflict
    }

    /// Echo of a push from this device whose acknowledgement was lost
    fn is_own_version(&self, remote: &RemoteEntity) -> bool {
        match (&self.device_id, &remote.origin_source) {
            (Some(device), Some(origin)) => device == origin,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeId, ChangeKind, EntityId, EntityType, SyncState};
    use serde_json::json;

    fn change(kind: ChangeKind, local_modified: i64, base_modified: Option<i64>) -> ChangeRecord {
        ChangeRecord {
            id: ChangeId::new(),
            seq: 1,
            entity_type: EntityType::MarkedLocation,
            entity_id: EntityId::new(),
            change_kind: kind,
            payload: json!({ "name": "local" }),
            created_at: local_modified,
            sync_state: SyncState::Syncing,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            failure_kind: None,
            next_attempt_at: None,
            local_modified,
            base_modified,
            parent: None,
        }
    }

    fn remote(id: EntityId, last_modified: i64, origin: &str) -> RemoteEntity {
        RemoteEntity {
            id,
            payload: json!({ "name": "remote" }),
            last_modified,
            origin_source: Some(origin.to_string()),
            origin_timestamp: Some(last_modified),
            deleted: false,
        }
    }

    fn detector(policy: TieBreakPolicy) -> ConflictDetector {
        ConflictDetector::new(policy, Some("device-a".to_string()))
    }

    #[test]
    fn remote_edit_after_baseline_conflicts() {
        // baseline T0=100, local T1=300, remote T2=200
        let local = change(ChangeKind::Update, 300, Some(100));
        let remote = remote(local.entity_id, 200, "device-b");
        assert_eq!(
            detector(TieBreakPolicy::PreferLocal).decide(&local, Some(100), Some(&remote)),
            ConflictDecision::Conflict
        );
    }

    #[test]
    fn remote_at_or_before_baseline_is_clean() {
        let local = change(ChangeKind::Update, 300, Some(100));
        for remote_modified in [50, 100] {
            let remote = remote(local.entity_id, remote_modified, "device-b");
            assert_eq!(
                detector(TieBreakPolicy::Conflict).decide(&local, Some(100), Some(&remote)),
                ConflictDecision::Clean
            );
        }
    }

    #[test]
    fn missing_remote_depends_on_baseline() {
        let detector = detector(TieBreakPolicy::PreferLocal);
        let create = change(ChangeKind::Create, 300, None);
        assert_eq!(detector.decide(&create, None, None), ConflictDecision::Clean);

        let update = change(ChangeKind::Update, 300, Some(100));
        assert_eq!(
            detector.decide(&update, Some(100), None),
            ConflictDecision::Conflict
        );

        let delete = change(ChangeKind::Delete, 300, Some(100));
        assert_eq!(detector.decide(&delete, Some(100), None), ConflictDecision::Clean);
    }

    #[test]
    fn equal_timestamps_follow_explicit_policy() {
        let local = change(ChangeKind::Update, 300, Some(100));
        let foreign = remote(local.entity_id, 300, "device-b");

        assert_eq!(
            detector(TieBreakPolicy::PreferLocal).decide(&local, Some(100), Some(&foreign)),
            ConflictDecision::Clean
        );
        assert_eq!(
            detector(TieBreakPolicy::PreferRemote).decide(&local, Some(100), Some(&foreign)),
            ConflictDecision::AcceptRemote
        );
        assert_eq!(
            detector(TieBreakPolicy::Conflict).decide(&local, Some(100), Some(&foreign)),
            ConflictDecision::Conflict
        );
    }

    #[test]
    fn own_echo_is_clean_under_any_policy() {
        // A retried push whose first attempt reached the server
        let local = change(ChangeKind::Create, 300, None);
        let echo = remote(local.entity_id, 300, "device-a");
        assert_eq!(
            detector(TieBreakPolicy::Conflict).decide(&local, None, Some(&echo)),
            ConflictDecision::Clean
        );
    }

    #[test]
    fn acknowledged_version_raises_the_baseline() {
        let local = change(ChangeKind::Update, 300, Some(100));
        let entity = SyncableEntity {
            entity_type: local.entity_type,
            id: local.entity_id,
            payload: json!({}),
            last_modified: 300,
            origin_source: None,
            origin_timestamp: None,
            synced: false,
            remote_modified: Some(250),
            is_deleted: false,
        };
        assert_eq!(
            ConflictDetector::effective_baseline(&local, Some(&entity)),
            Some(250)
        );
        assert_eq!(ConflictDetector::effective_baseline(&local, None), Some(100));
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!(
            "prefer-remote".parse::<TieBreakPolicy>(),
            Ok(TieBreakPolicy::PreferRemote)
        );
        assert_eq!("LOCAL".parse::<TieBreakPolicy>(), Ok(TieBreakPolicy::PreferLocal));
        assert!("coin_flip".parse::<TieBreakPolicy>().is_err());
    }
}
