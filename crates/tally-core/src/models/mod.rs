//! Data models for Tally

mod entity;
mod ledger;
mod operation;
mod sync_conflict;
mod sync_meta;

pub use entity::{EntityKind, OwnerId, RecordId, SyncRecord, SyncStatus, TEMP_ID_PREFIX};
pub use ledger::{
    CategoryOrder, CustomCategory, Debt, EntityPayload, EntryDirection, Goal, HiddenCategory,
    LedgerEntry,
};
pub use operation::{OperationId, OperationKind, QueuedOperation};
pub use sync_conflict::SyncConflict;
pub use sync_meta::{PullCursor, SyncMeta};
