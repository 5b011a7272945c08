//! Last-write-wins conflict resolution

use crate::models::{SyncRecord, SyncStatus};

/// Which side of a conflict was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Winner,
    /// Record to store locally
    pub resolved: SyncRecord,
}

/// Decide between a local copy and the authority's copy of the same record.
///
/// The local copy wins only if its local change is strictly newer than the
/// authority's write; it is then re-marked pending so the next push carries
/// it. Otherwise the authority's copy is taken whole, marked synced and
/// stamped with `now`. Fields are never merged.
pub fn resolve(local: &SyncRecord, remote: &SyncRecord, now: i64) -> Resolution {
    let remote_updated_at = remote.server_updated_at.unwrap_or(0);

    if local.local_updated_at > remote_updated_at {
        let mut resolved = local.clone();
        resolved.sync_status = SyncStatus::Pending;
        resolved.version = local.version.max(remote.version);
        resolved.server_updated_at = remote.server_updated_at.or(local.server_updated_at);
        return Resolution {
            winner: Winner::Local,
            resolved,
        };
    }

    let mut resolved = remote.clone();
    resolved.id = local.id.clone();
    resolved.sync_status = SyncStatus::Synced;
    resolved.local_updated_at = now;
    resolved.version = (local.version + 1).max(remote.version);
    resolved.last_error = None;
    Resolution {
        winner: Winner::Remote,
        resolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, OwnerId, RecordId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn goal(saved_cents: i64, local_updated_at: i64, server_updated_at: Option<i64>) -> SyncRecord {
        let owner: OwnerId = "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".parse().unwrap();
        let mut record = SyncRecord::new_local(
            EntityKind::Goal,
            owner,
            json!({"name": "Trip", "target_cents": 5000, "saved_cents": saved_cents})
                .as_object()
                .cloned()
                .unwrap(),
        );
        record.id = RecordId::authority("g1").unwrap();
        record.local_updated_at = local_updated_at;
        record.server_updated_at = server_updated_at;
        record
    }

    #[test]
    fn newer_local_change_wins_and_stays_pending() {
        let mut local = goal(100, 2_000, Some(1_000));
        local.version = 4;
        local.sync_status = SyncStatus::Synced;
        let mut remote = goal(900, 0, Some(1_500));
        remote.version = 6;

        let resolution = resolve(&local, &remote, 9_999);
        assert_eq!(resolution.winner, Winner::Local);
        assert_eq!(resolution.resolved.data["saved_cents"], json!(100));
        assert_eq!(resolution.resolved.sync_status, SyncStatus::Pending);
        assert_eq!(resolution.resolved.version, 6);
        assert_eq!(resolution.resolved.local_updated_at, 2_000);
    }

    #[test]
    fn equal_timestamps_go_to_the_authority() {
        let local = goal(100, 1_500, None);
        let remote = goal(900, 0, Some(1_500));

        let resolution = resolve(&local, &remote, 9_999);
        assert_eq!(resolution.winner, Winner::Remote);
        assert_eq!(resolution.resolved.data["saved_cents"], json!(900));
        assert_eq!(resolution.resolved.sync_status, SyncStatus::Synced);
        assert_eq!(resolution.resolved.local_updated_at, 9_999);
        assert_eq!(resolution.resolved.server_updated_at, Some(1_500));
    }

    #[test]
    fn remote_win_bumps_version_past_local() {
        let mut local = goal(100, 10, Some(5));
        local.version = 7;
        let mut remote = goal(900, 0, Some(50));
        remote.version = 2;

        let resolution = resolve(&local, &remote, 60);
        assert_eq!(resolution.resolved.version, 8);
    }

    #[test]
    fn missing_remote_timestamp_counts_as_oldest() {
        let local = goal(100, 1, None);
        let remote = goal(900, 0, None);
        assert_eq!(resolve(&local, &remote, 2).winner, Winner::Local);
    }
}
