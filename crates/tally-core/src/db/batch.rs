//! Bulk writes with per-item fallback

use libsql::params::Params;
use libsql::Connection;

use super::rows;
use crate::error::{Error, Result};
use crate::models::{EntityKind, RecordId, SyncRecord};

/// A single row the batch could not apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemError {
    pub id: String,
    pub message: String,
}

/// Outcome of a bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Rows written (or removed, for deletes)
    pub inserted: usize,
    pub failed: usize,
    /// Rows left untouched because the local copy is pending
    pub skipped: usize,
    pub errors: Vec<BatchItemError>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Insert,
    Upsert,
}

impl WriteMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Upsert => "upsert",
        }
    }

    fn sql(self, kind: EntityKind) -> String {
        match self {
            Self::Insert => rows::insert_sql(kind),
            Self::Upsert => rows::upsert_sql(kind),
        }
    }
}

/// Bulk insert/upsert/delete for one entity kind at a time
///
/// Each call first tries one atomic transaction. If anything in it fails the
/// transaction is rolled back and the rows are applied one by one, so a single
/// bad row only fails itself.
pub struct BatchWriter<'a> {
    conn: &'a Connection,
}

impl<'a> BatchWriter<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert new rows; an id collision fails that row
    pub async fn bulk_insert(
        &self,
        kind: EntityKind,
        records: &[SyncRecord],
    ) -> Result<BatchResult> {
        self.write(kind, records, WriteMode::Insert).await
    }

    /// Insert or replace rows, never touching a row that is locally pending
    pub async fn bulk_upsert(
        &self,
        kind: EntityKind,
        records: &[SyncRecord],
    ) -> Result<BatchResult> {
        self.write(kind, records, WriteMode::Upsert).await
    }

    /// Remove rows by id, never removing a row that is locally pending
    pub async fn bulk_delete(&self, kind: EntityKind, ids: &[RecordId]) -> Result<BatchResult> {
        if ids.is_empty() {
            return Ok(BatchResult::default());
        }

        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND sync_status <> 'pending'",
            kind.table()
        );

        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let atomic = self.delete_all(&sql, ids).await;
        match super::finish_transaction(self.conn, atomic).await {
            Ok(removed) => Ok(BatchResult {
                inserted: removed,
                skipped: ids.len() - removed,
                ..BatchResult::default()
            }),
            Err(e) => {
                tracing::warn!(
                    "Bulk delete of {} {kind} rows failed, applying individually: {e}",
                    ids.len()
                );
                let mut result = BatchResult::default();
                for id in ids {
                    match self.conn.execute(&sql, [id.as_str()]).await {
                        Ok(0) => result.skipped += 1,
                        Ok(_) => result.inserted += 1,
                        Err(e) => {
                            result.failed += 1;
                            result.errors.push(BatchItemError {
                                id: id.to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Ok(result)
            }
        }
    }

    async fn delete_all(&self, sql: &str, ids: &[RecordId]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.conn.execute(sql, [id.as_str()]).await? > 0 {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn write(
        &self,
        kind: EntityKind,
        records: &[SyncRecord],
        mode: WriteMode,
    ) -> Result<BatchResult> {
        if records.is_empty() {
            return Ok(BatchResult::default());
        }

        let sql = mode.sql(kind);

        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let atomic = self.write_all(kind, &sql, records).await;
        match super::finish_transaction(self.conn, atomic).await {
            Ok(written) => Ok(BatchResult {
                inserted: written,
                skipped: records.len() - written,
                ..BatchResult::default()
            }),
            Err(e) => {
                tracing::warn!(
                    "Bulk {} of {} {kind} rows failed, applying individually: {e}",
                    mode.as_str(),
                    records.len()
                );
                Ok(self.write_each(kind, &sql, records).await)
            }
        }
    }

    async fn write_all(
        &self,
        kind: EntityKind,
        sql: &str,
        records: &[SyncRecord],
    ) -> Result<usize> {
        let mut written = 0;
        for record in records {
            if self.write_one(kind, sql, record).await? > 0 {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn write_each(
        &self,
        kind: EntityKind,
        sql: &str,
        records: &[SyncRecord],
    ) -> BatchResult {
        let mut result = BatchResult::default();
        for record in records {
            match self.write_one(kind, sql, record).await {
                Ok(0) => result.skipped += 1,
                Ok(_) => result.inserted += 1,
                Err(e) => {
                    tracing::debug!("Batch row {kind} {} rejected: {e}", record.id);
                    result.failed += 1;
                    result.errors.push(BatchItemError {
                        id: record.id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        result
    }

    async fn write_one(&self, kind: EntityKind, sql: &str, record: &SyncRecord) -> Result<u64> {
        if record.kind != kind {
            return Err(Error::InvalidInput(format!(
                "{} {} does not belong in a {kind} batch",
                record.kind, record.id
            )));
        }
        record.validate()?;

        let changed = self
            .conn
            .execute(sql, Params::Positional(rows::record_values(record)?))
            .await?;
        Ok(changed)
    }
}
