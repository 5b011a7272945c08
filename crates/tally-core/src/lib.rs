//! tally-core - Core library for Tally
//!
//! Ledger models, the local libSQL store and the offline sync engine that
//! reconciles it with a remote authority. Clients write locally first; the
//! sync engine pushes queued changes and pulls remote ones when the device is
//! online and signed in.

pub mod auth;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod remote;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{EntityKind, OwnerId, RecordId, SyncRecord};
pub use services::{LedgerService, StoreService};
pub use sync::{SyncResult, SyncService};
