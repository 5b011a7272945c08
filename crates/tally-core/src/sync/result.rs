//! Outcome of a sync run

use std::collections::BTreeMap;

use thiserror::Error;

use super::state::SyncState;
use crate::models::EntityKind;

/// Why a run, a kind or a single record failed to sync
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Identity invalid: {0}")]
    IdentityInvalid(String),

    #[error("A sync is already running")]
    AlreadySyncing,

    #[error("Failed to sync {kind} {id}: {message}")]
    RecordSync {
        kind: EntityKind,
        id: String,
        message: String,
    },

    #[error("Batch write of {kind} failed for {id}: {message}")]
    BatchWrite {
        kind: EntityKind,
        id: String,
        message: String,
    },

    #[error("{kind} {id} gave up after {attempts} attempts: {message}")]
    QueueExhausted {
        kind: EntityKind,
        id: String,
        attempts: u32,
        message: String,
    },

    #[error("Pull of {kind} failed: {message}")]
    PullFailed { kind: EntityKind, message: String },

    #[error("Local store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Failures that stop a run before anything is sent
    pub const fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_) | Self::IdentityInvalid(_) | Self::AlreadySyncing
        )
    }
}

/// Per-kind tallies of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    /// Creates and updates confirmed by the authority
    pub pushed: u64,
    /// Tombstones deleted at the authority and purged
    pub deleted: u64,
    /// Tombstones of never-synced records purged locally
    pub purged: u64,
    /// Incoming rows written locally
    pub pulled: u64,
    /// Incoming rows rejected because the local copy was newer
    pub kept_local: u64,
    /// Local synced rows removed because the authority no longer has them
    pub reconciled: u64,
}

impl SyncCounts {
    pub const fn is_empty(&self) -> bool {
        self.pushed == 0
            && self.deleted == 0
            && self.purged == 0
            && self.pulled == 0
            && self.kept_local == 0
            && self.reconciled == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    /// Terminal state of the run
    pub outcome: SyncState,
    pub success: bool,
    pub synced_counts: BTreeMap<EntityKind, SyncCounts>,
    pub errors: Vec<SyncError>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncResult {
    /// Result of a run refused before it started
    pub fn blocked(error: SyncError, started_at: i64) -> Self {
        Self {
            outcome: SyncState::Blocked,
            success: false,
            synced_counts: BTreeMap::new(),
            errors: vec![error],
            started_at,
            finished_at: crate::util::now_ms(),
        }
    }

    /// Close a run that got past preflight
    pub fn finished(
        synced_counts: BTreeMap<EntityKind, SyncCounts>,
        errors: Vec<SyncError>,
        started_at: i64,
    ) -> Self {
        let outcome = if errors.is_empty() {
            SyncState::Success
        } else {
            SyncState::PartialFailure
        };
        Self {
            outcome,
            success: outcome == SyncState::Success,
            synced_counts,
            errors,
            started_at,
            finished_at: crate::util::now_ms(),
        }
    }

    pub fn counts(&self, kind: EntityKind) -> SyncCounts {
        self.synced_counts.get(&kind).copied().unwrap_or_default()
    }

    /// Sum of every kind's counts
    pub fn totals(&self) -> SyncCounts {
        self.synced_counts
            .values()
            .fold(SyncCounts::default(), |total, counts| SyncCounts {
                pushed: total.pushed + counts.pushed,
                deleted: total.deleted + counts.deleted,
                purged: total.purged + counts.purged,
                pulled: total.pulled + counts.pulled,
                kept_local: total.kept_local + counts.kept_local,
                reconciled: total.reconciled + counts.reconciled,
            })
    }
}
