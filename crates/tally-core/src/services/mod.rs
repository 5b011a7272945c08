//! Async service layer shared by every client.

mod ledger;
mod store;

pub use ledger::{LedgerService, QueueStatus};
pub use store::StoreService;
