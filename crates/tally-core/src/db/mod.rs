//! Database layer for Tally

mod batch;
mod connection;
mod migrations;
mod operation_queue;
mod record_repository;
mod rows;
mod sync_meta_repository;

pub use batch::{BatchItemError, BatchResult, BatchWriter};
pub use connection::Database;
pub use operation_queue::{LibSqlOperationQueue, OperationQueue, QueueCounts};
pub use record_repository::{LibSqlRecordRepository, RecordRepository, StoreStats};
pub use sync_meta_repository::{LibSqlSyncMetaRepository, SyncMetaRepository};

use crate::error::Result;
use libsql::Connection;

/// Commit after a successful body, roll back otherwise
///
/// The caller has already issued `BEGIN TRANSACTION`.
pub(crate) async fn finish_transaction<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}
