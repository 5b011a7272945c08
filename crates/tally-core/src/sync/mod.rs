//! Offline sync engine: pushes local changes to the remote authority and pulls
//! its changes back, one run at a time.

mod result;
mod service;
mod state;

pub use result::{SyncCounts, SyncError, SyncResult};
pub use service::SyncService;
pub use state::{SyncEvent, SyncState};
