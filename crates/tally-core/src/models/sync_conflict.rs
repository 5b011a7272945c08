//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::entity::EntityKind;

/// Recorded sync conflict resolved by strategy (LWW)
///
/// Only decisions where the local copy beat an incoming remote row are logged;
/// the remote-wins path is an ordinary pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_kind: EntityKind,
    /// Record involved in the conflict
    pub record_id: String,
    /// Local copy's timestamp when the conflict occurred
    pub local_updated_at: i64,
    /// Incoming row's authority timestamp that was rejected
    pub incoming_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
