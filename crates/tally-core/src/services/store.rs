//! Shared local store wrapper used by the ledger facade and the sync engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::SyncSettings;
use crate::db::{
    BatchResult, BatchWriter, Database, LibSqlOperationQueue, LibSqlRecordRepository,
    LibSqlSyncMetaRepository, OperationQueue, QueueCounts, RecordRepository, StoreStats,
    SyncMetaRepository,
};
use crate::models::{
    EntityKind, OperationId, OperationKind, OwnerId, QueuedOperation, RecordId, SyncConflict,
    SyncMeta, SyncRecord, SyncStatus,
};
use crate::Result;

/// Thread-safe handle to the local store. Clones share one connection.
#[derive(Clone)]
pub struct StoreService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    max_retries: u32,
}

impl StoreService {
    /// Open the store at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh store is
    /// created in its place.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local store at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            max_retries: SyncSettings::default().max_retries,
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            max_retries: SyncSettings::default().max_retries,
        })
    }

    /// Retry budget given to newly queued operations
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };

        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local store from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale store file {}", path.display());
            }
        }

        Ok(())
    }

    async fn reopen_after_corruption(&self) -> Result<bool> {
        let Some(db_path) = self.db_path.clone() else {
            return Ok(false);
        };

        tracing::warn!(
            "Detected invalid local store file; reopening at {}",
            db_path.display()
        );

        let mut db = self.db.lock().await;
        let placeholder = Database::open_in_memory().await?;
        drop(std::mem::replace(&mut *db, placeholder));

        Self::quarantine_corrupted_db_files(&db_path)?;
        *db = Database::open(&db_path).await?;
        Ok(true)
    }

    /// Write a record and queue its operation in one transaction.
    ///
    /// `Create` inserts the record; `Update` and `Delete` replace the stored
    /// row, so a delete is expected to carry a tombstoned record.
    pub async fn write_with_operation(
        &self,
        record: &SyncRecord,
        operation: OperationKind,
    ) -> Result<OperationId> {
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = async {
            let repo = LibSqlRecordRepository::new(conn);
            match operation {
                OperationKind::Create => repo.add(record).await?,
                OperationKind::Update | OperationKind::Delete => repo.update(record).await?,
            }

            let payload = match operation {
                OperationKind::Delete => None,
                _ => Some(Value::Object(record.data.clone())),
            };
            LibSqlOperationQueue::new(conn, self.max_retries)
                .enqueue(
                    record.kind,
                    &record.id,
                    operation,
                    &record.owner_id,
                    payload,
                )
                .await
        }
        .await;
        crate::db::finish_transaction(conn, result).await
    }

    /// Fetch one record, tombstones included.
    pub async fn get_record(&self, kind: EntityKind, id: &RecordId) -> Result<Option<SyncRecord>> {
        let first_attempt = {
            let db = self.db.lock().await;
            LibSqlRecordRepository::new(db.connection())
                .get(kind, id)
                .await
        };

        match first_attempt {
            Err(error) if Self::is_corrupted_db_error(&error) => {
                if self.reopen_after_corruption().await? {
                    let db = self.db.lock().await;
                    LibSqlRecordRepository::new(db.connection())
                        .get(kind, id)
                        .await
                } else {
                    Err(error)
                }
            }
            result => result,
        }
    }

    /// Live records of an owner; tombstones only when asked for.
    pub async fn list_records(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        include_deleted: bool,
    ) -> Result<Vec<SyncRecord>> {
        let first_attempt = {
            let db = self.db.lock().await;
            LibSqlRecordRepository::new(db.connection())
                .list_by_owner(kind, owner, include_deleted)
                .await
        };

        match first_attempt {
            Err(error) if Self::is_corrupted_db_error(&error) => {
                if self.reopen_after_corruption().await? {
                    let db = self.db.lock().await;
                    LibSqlRecordRepository::new(db.connection())
                        .list_by_owner(kind, owner, include_deleted)
                        .await
                } else {
                    Err(error)
                }
            }
            result => result,
        }
    }

    pub async fn list_by_status(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        status: SyncStatus,
    ) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_by_status(kind, owner, status).await
    }

    pub async fn list_tombstones(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
    ) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_tombstones(kind, owner).await
    }

    /// Records whose indexed `column` equals `value`
    pub async fn list_by_field(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        column: &str,
        value: &str,
    ) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_by_field(kind, owner, column, value).await
    }

    /// Replace a stored record without queueing anything
    pub async fn update_record(&self, record: &SyncRecord) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.update(record).await
    }

    pub async fn count_records(&self, kind: EntityKind, owner: &OwnerId) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.count_by_owner(kind, owner).await
    }

    /// Remove every record, queued operation and sync mark of an owner.
    pub async fn clear_owner(&self, owner: &OwnerId) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.clear_owner(owner).await
    }

    pub async fn has_conflicts(&self, owner: &OwnerId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.has_conflicts(owner).await
    }

    pub async fn stats(&self, owner: &OwnerId) -> Result<StoreStats> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.stats(owner).await
    }

    pub async fn promote(
        &self,
        kind: EntityKind,
        temp_id: &RecordId,
        authority_id: &RecordId,
        server_updated_at: i64,
        pushed_version: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.promote(kind, temp_id, authority_id, server_updated_at, pushed_version)
            .await
    }

    pub async fn mark_synced(
        &self,
        kind: EntityKind,
        id: &RecordId,
        server_updated_at: Option<i64>,
        pushed_version: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.mark_synced(kind, id, server_updated_at, pushed_version)
            .await
    }

    pub async fn mark_push_failed(&self, kind: EntityKind, id: &RecordId, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.mark_push_failed(kind, id, error).await
    }

    pub async fn purge(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.purge(kind, id).await
    }

    pub async fn log_conflict(&self, owner: &OwnerId, conflict: &SyncConflict) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.log_conflict(owner, conflict).await
    }

    /// Recently resolved conflicts, newest first.
    pub async fn list_conflicts(&self, owner: &OwnerId, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_conflicts(owner, limit).await
    }

    pub async fn pending_operations(&self, owner: &OwnerId) -> Result<Vec<QueuedOperation>> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.get_pending(owner).await
    }

    pub async fn exhausted_operations(&self, owner: &OwnerId) -> Result<Vec<QueuedOperation>> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.list_exhausted(owner).await
    }

    pub async fn queue_counts(&self, owner: &OwnerId) -> Result<QueueCounts> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.count(owner).await
    }

    pub async fn complete_operations(&self, kind: EntityKind, id: &RecordId) -> Result<u64> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.complete_for_entity(kind, id).await
    }

    /// Count a failed attempt; returns the operations it exhausted
    pub async fn fail_operations(
        &self,
        kind: EntityKind,
        id: &RecordId,
        error: &str,
    ) -> Result<Vec<QueuedOperation>> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.fail_for_entity(kind, id, error).await
    }

    pub async fn rekey_operations(
        &self,
        kind: EntityKind,
        old_id: &RecordId,
        new_id: &RecordId,
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.rekey_entity(kind, old_id, new_id).await
    }

    pub async fn cleanup_operations(&self, owner: &OwnerId, max_age: Duration) -> Result<u64> {
        let db = self.db.lock().await;
        let queue = LibSqlOperationQueue::new(db.connection(), self.max_retries);
        queue.cleanup_old(owner, max_age).await
    }

    pub async fn bulk_insert(&self, kind: EntityKind, records: &[SyncRecord]) -> Result<BatchResult> {
        let db = self.db.lock().await;
        BatchWriter::new(db.connection())
            .bulk_insert(kind, records)
            .await
    }

    pub async fn bulk_upsert(&self, kind: EntityKind, records: &[SyncRecord]) -> Result<BatchResult> {
        let db = self.db.lock().await;
        BatchWriter::new(db.connection())
            .bulk_upsert(kind, records)
            .await
    }

    pub async fn bulk_delete(&self, kind: EntityKind, ids: &[RecordId]) -> Result<BatchResult> {
        let db = self.db.lock().await;
        BatchWriter::new(db.connection()).bulk_delete(kind, ids).await
    }

    pub async fn load_meta(&self, owner: &OwnerId, kind: EntityKind) -> Result<SyncMeta> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncMetaRepository::new(db.connection());
        repo.load(owner, kind).await
    }

    pub async fn save_meta(&self, meta: &SyncMeta) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncMetaRepository::new(db.connection());
        repo.save(meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn owner() -> OwnerId {
        "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".parse().unwrap()
    }

    fn category(name: &str) -> SyncRecord {
        SyncRecord::new_local(
            EntityKind::Category,
            owner(),
            json!({"name": name}).as_object().cloned().unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_with_operation_stores_record_and_queue_entry() {
        let store = StoreService::open_in_memory().await.unwrap();
        let record = category("Rent");

        store
            .write_with_operation(&record, OperationKind::Create)
            .await
            .unwrap();

        let loaded = store
            .get_record(EntityKind::Category, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);

        let pending = store.pending_operations(&owner()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OperationKind::Create);
        assert_eq!(pending[0].entity_id, record.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_write_queues_nothing() {
        let store = StoreService::open_in_memory().await.unwrap();
        let record = category("Rent");
        store
            .write_with_operation(&record, OperationKind::Create)
            .await
            .unwrap();

        let error = store
            .write_with_operation(&record, OperationKind::Create)
            .await
            .unwrap_err();
        assert!(matches!(error, crate::Error::AlreadyExists(_)));
        assert_eq!(store.pending_operations(&owner()).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("tally.db");

        let store = StoreService::open_path(&db_path).await.unwrap();
        assert_eq!(store.db_path(), Some(db_path.as_path()));
        assert!(db_path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_moves_unreadable_file_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tally.db");
        std::fs::write(&db_path, vec![0x42; 8192]).unwrap();

        let store = StoreService::open_path(&db_path).await.unwrap();
        store
            .write_with_operation(&category("Rent"), OperationKind::Create)
            .await
            .unwrap();

        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("tally.db.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn detects_corrupted_db_errors() {
        assert!(StoreService::is_corrupted_db_error(&crate::Error::Database(
            "SQLite failure: file is not a database".to_string()
        )));
        assert!(!StoreService::is_corrupted_db_error(
            &crate::Error::InvalidInput("name is required".to_string())
        ));
    }

    #[test]
    fn quarantine_moves_store_and_removes_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tally.db");
        std::fs::write(&db_path, b"broken").unwrap();
        std::fs::write(tmp.path().join("tally.db-wal"), b"wal").unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"keep").unwrap();

        StoreService::quarantine_corrupted_db_files(&db_path).unwrap();

        assert!(!db_path.exists());
        assert!(!tmp.path().join("tally.db-wal").exists());
        assert!(tmp.path().join("keep.txt").exists());
    }
}
