//! Per-owner sync bookkeeping

use serde::{Deserialize, Serialize};

use super::entity::{EntityKind, OwnerId};

/// High-water mark of the last pull: `(updated_at, id)` of the newest row seen
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullCursor {
    /// Authority clock in Unix µs
    pub updated_at: i64,
    pub id: String,
}

impl PullCursor {
    pub fn new(updated_at: i64, id: impl Into<String>) -> Self {
        Self {
            updated_at,
            id: id.into(),
        }
    }

    /// Keep whichever cursor is further ahead
    #[must_use]
    pub fn advance(current: Option<Self>, candidate: Option<Self>) -> Option<Self> {
        match (current, candidate) {
            (Some(current), Some(candidate)) => Some(current.max(candidate)),
            (current, candidate) => current.or(candidate),
        }
    }
}

/// Sync metadata for one owner and one entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub owner_id: OwnerId,
    pub kind: EntityKind,
    /// Unix ms of the last committed sync run
    pub last_sync_at: Option<i64>,
    pub cursor: Option<PullCursor>,
}
