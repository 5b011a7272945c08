//! Sync run states and the events broadcast while a run progresses.

use serde::{Deserialize, Serialize};

use super::result::SyncResult;

/// Lifecycle of one sync run, as observed by clients.
///
/// A run moves `Idle -> Syncing -> {Success | PartialFailure | Blocked} -> Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Success,
    /// Some records or kinds failed; everything else was applied
    PartialFailure,
    /// Preflight refused the run; nothing was sent
    Blocked,
}

impl SyncState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::PartialFailure | Self::Blocked)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    /// Sent once per run, just before the terminal state
    Completed(Box<SyncResult>),
}
