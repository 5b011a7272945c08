//! Local store for syncable records

use libsql::params::Params;
use libsql::{Connection, Value};

use super::rows;
use crate::error::{Error, Result};
use crate::models::{EntityKind, OwnerId, RecordId, SyncConflict, SyncRecord, SyncStatus};

/// Store-wide counters for one owner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Records that are not tombstoned
    pub live_records: u64,
    /// Records (tombstones included) waiting to be pushed
    pub pending_sync: u64,
    pub conflicts: u64,
}

/// Trait for local record storage operations (async)
#[allow(async_fn_in_trait)]
pub trait RecordRepository {
    /// Insert a new record; fails if the id is already taken
    async fn add(&self, record: &SyncRecord) -> Result<()>;

    /// Get a record by id, tombstones included
    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<SyncRecord>>;

    /// Replace a stored record
    async fn update(&self, record: &SyncRecord) -> Result<()>;

    /// Remove a row permanently. Returns whether a row existed.
    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool>;

    /// Records in a given sync state, in queue order
    ///
    /// Records without queued operations sort by their last local change.
    async fn list_by_status(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        status: SyncStatus,
    ) -> Result<Vec<SyncRecord>>;

    /// All records of a kind for an owner
    async fn list_by_owner(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        include_deleted: bool,
    ) -> Result<Vec<SyncRecord>>;

    /// Tombstoned records still waiting to reach the authority
    async fn list_tombstones(&self, kind: EntityKind, owner: &OwnerId) -> Result<Vec<SyncRecord>>;

    /// Live records whose indexed field equals `value`
    async fn list_by_field(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        field: &str,
        value: &str,
    ) -> Result<Vec<SyncRecord>>;

    /// Number of live records of a kind
    async fn count_by_owner(&self, kind: EntityKind, owner: &OwnerId) -> Result<u64>;

    /// Drop everything the owner has locally. Returns the number of rows removed.
    async fn clear_owner(&self, owner: &OwnerId) -> Result<u64>;

    async fn has_conflicts(&self, owner: &OwnerId) -> Result<bool>;

    async fn stats(&self, owner: &OwnerId) -> Result<StoreStats>;

    /// Swap a temporary id for the authority id after a confirmed create
    ///
    /// The row becomes synced only if nothing changed it since `pushed_version`;
    /// returns whether it did. Category references in other kinds are remapped
    /// and re-queued.
    async fn promote(
        &self,
        kind: EntityKind,
        temp_id: &RecordId,
        authority_id: &RecordId,
        server_updated_at: i64,
        pushed_version: i64,
    ) -> Result<bool>;

    /// Mark a record synced if it is still at `pushed_version`
    async fn mark_synced(
        &self,
        kind: EntityKind,
        id: &RecordId,
        server_updated_at: Option<i64>,
        pushed_version: i64,
    ) -> Result<bool>;

    /// Record a failed push; the record stays pending
    async fn mark_push_failed(&self, kind: EntityKind, id: &RecordId, error: &str) -> Result<()>;

    /// Physically remove a tombstone once the authority confirmed its deletion
    async fn purge(&self, kind: EntityKind, id: &RecordId) -> Result<bool>;

    /// Append to the conflict log
    async fn log_conflict(&self, owner: &OwnerId, conflict: &SyncConflict) -> Result<()>;

    /// Most recent conflict log entries
    async fn list_conflicts(&self, owner: &OwnerId, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// libSQL implementation of `RecordRepository`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_records(
        &self,
        kind: EntityKind,
        filter: &str,
        values: Vec<Value>,
    ) -> Result<Vec<SyncRecord>> {
        let sql = rows::select_sql(kind, filter);
        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(rows::parse_record(kind, &row)?);
        }
        Ok(records)
    }

    async fn count(&self, sql: &str, values: Vec<Value>) -> Result<u64> {
        let mut rows = self.conn.query(sql, Params::Positional(values)).await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn clear_owner_tables(&self, owner: &str) -> Result<u64> {
        let mut removed = 0;
        for kind in EntityKind::SYNC_ORDER {
            removed += self
                .conn
                .execute(
                    &format!("DELETE FROM {} WHERE owner_id = ?", kind.table()),
                    [owner],
                )
                .await?;
        }
        for table in ["operation_queue", "sync_meta", "sync_conflicts"] {
            removed += self
                .conn
                .execute(&format!("DELETE FROM {table} WHERE owner_id = ?"), [owner])
                .await?;
        }
        Ok(removed)
    }

    async fn promote_rows(
        &self,
        kind: EntityKind,
        temp_id: &RecordId,
        authority_id: &RecordId,
        server_updated_at: i64,
        pushed_version: i64,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT owner_id FROM {} WHERE id = ?", kind.table()),
                [temp_id.as_str()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(Error::NotFound(format!("{kind} {temp_id}")));
        };
        let owner: String = row.get(0)?;
        drop(rows);

        let synced = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET id = ?, server_updated_at = ?, last_error = NULL,
                        sync_status = CASE WHEN version = ? THEN 'synced' ELSE sync_status END
                     WHERE id = ?",
                    kind.table()
                ),
                libsql::params![
                    authority_id.as_str(),
                    server_updated_at,
                    pushed_version,
                    temp_id.as_str()
                ],
            )
            .await?;
        let synced = synced > 0
            && self
                .get(kind, authority_id)
                .await?
                .is_some_and(|record| !record.is_pending());

        if kind != EntityKind::Category {
            return Ok(synced);
        }

        let now = crate::util::now_ms();
        for referencing in EntityKind::SYNC_ORDER
            .into_iter()
            .filter(|candidate| candidate.references_category())
        {
            let remapped = self
                .conn
                .execute(
                    &format!(
                        "UPDATE {} SET category_id = ?,
                            data = json_set(data, '$.category_id', ?),
                            sync_status = 'pending',
                            version = version + 1,
                            local_updated_at = ?
                         WHERE owner_id = ? AND category_id = ?",
                        referencing.table()
                    ),
                    libsql::params![
                        authority_id.as_str(),
                        authority_id.as_str(),
                        now,
                        owner.as_str(),
                        temp_id.as_str()
                    ],
                )
                .await?;
            if remapped > 0 {
                tracing::debug!(
                    "Remapped {remapped} {referencing} references from {temp_id} to {authority_id}"
                );
            }
        }
        Ok(synced)
    }
}

impl RecordRepository for LibSqlRecordRepository<'_> {
    async fn add(&self, record: &SyncRecord) -> Result<()> {
        record.validate()?;
        if self.get(record.kind, &record.id).await?.is_some() {
            return Err(Error::AlreadyExists(format!("{} {}", record.kind, record.id)));
        }

        self.conn
            .execute(
                &rows::insert_sql(record.kind),
                Params::Positional(rows::record_values(record)?),
            )
            .await?;
        Ok(())
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<SyncRecord>> {
        let mut records = self
            .query_records(kind, "id = ?", vec![Value::Text(id.to_string())])
            .await?;
        Ok(records.pop())
    }

    async fn update(&self, record: &SyncRecord) -> Result<()> {
        record.validate()?;
        let changed = self
            .conn
            .execute(
                &rows::update_sql(record.kind),
                Params::Positional(rows::update_values(record)?),
            )
            .await?;

        if changed == 0 {
            return Err(Error::NotFound(format!("{} {}", record.kind, record.id)));
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?", kind.table()),
                [id.as_str()],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn list_by_status(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        status: SyncStatus,
    ) -> Result<Vec<SyncRecord>> {
        // Oldest queued operation first, so pushes replay in creation order
        let table = kind.table();
        let filter = format!(
            "owner_id = ? AND sync_status = ? ORDER BY COALESCE(
                (SELECT MIN(q.timestamp) FROM operation_queue q
                 WHERE q.entity_kind = ? AND q.entity_id = {table}.id),
                local_updated_at
            ) ASC, id ASC"
        );
        self.query_records(
            kind,
            &filter,
            vec![
                Value::Text(owner.as_str()),
                Value::Text(status.as_str().to_string()),
                Value::Text(kind.as_str().to_string()),
            ],
        )
        .await
    }

    async fn list_by_owner(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        include_deleted: bool,
    ) -> Result<Vec<SyncRecord>> {
        let filter = if include_deleted {
            "owner_id = ? ORDER BY local_updated_at DESC, id ASC"
        } else {
            "owner_id = ? AND is_deleted = 0 ORDER BY local_updated_at DESC, id ASC"
        };
        self.query_records(kind, filter, vec![Value::Text(owner.as_str())])
            .await
    }

    async fn list_tombstones(&self, kind: EntityKind, owner: &OwnerId) -> Result<Vec<SyncRecord>> {
        self.query_records(
            kind,
            "owner_id = ? AND is_deleted = 1 AND sync_status = 'pending'
             ORDER BY local_updated_at ASC, id ASC",
            vec![Value::Text(owner.as_str())],
        )
        .await
    }

    async fn list_by_field(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
        field: &str,
        value: &str,
    ) -> Result<Vec<SyncRecord>> {
        // Column names cannot be bound, so only known index columns are accepted
        let Some(column) = kind.index_columns().iter().find(|column| **column == field) else {
            return Err(Error::InvalidInput(format!(
                "{field} is not an indexed field of {kind}"
            )));
        };
        self.query_records(
            kind,
            &format!("owner_id = ? AND is_deleted = 0 AND {column} = ? ORDER BY local_updated_at DESC, id ASC"),
            vec![Value::Text(owner.as_str()), Value::Text(value.to_string())],
        )
        .await
    }

    async fn count_by_owner(&self, kind: EntityKind, owner: &OwnerId) -> Result<u64> {
        self.count(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE owner_id = ? AND is_deleted = 0",
                kind.table()
            ),
            vec![Value::Text(owner.as_str())],
        )
        .await
    }

    async fn clear_owner(&self, owner: &OwnerId) -> Result<u64> {
        let owner = owner.as_str();
        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = self.clear_owner_tables(&owner).await;
        let removed = super::finish_transaction(self.conn, result).await?;

        tracing::info!("Cleared {removed} local rows for owner {owner}");
        Ok(removed)
    }

    async fn has_conflicts(&self, owner: &OwnerId) -> Result<bool> {
        for kind in EntityKind::SYNC_ORDER {
            let conflicts = self
                .count(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE owner_id = ? AND sync_status = 'conflict'",
                        kind.table()
                    ),
                    vec![Value::Text(owner.as_str())],
                )
                .await?;
            if conflicts > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn stats(&self, owner: &OwnerId) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for kind in EntityKind::SYNC_ORDER {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT
                            COALESCE(SUM(CASE WHEN is_deleted = 0 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN sync_status = 'conflict' THEN 1 ELSE 0 END), 0)
                         FROM {} WHERE owner_id = ?",
                        kind.table()
                    ),
                    [owner.as_str()],
                )
                .await?;
            if let Some(row) = rows.next().await? {
                stats.live_records += u64::try_from(row.get::<i64>(0)?).unwrap_or_default();
                stats.pending_sync += u64::try_from(row.get::<i64>(1)?).unwrap_or_default();
                stats.conflicts += u64::try_from(row.get::<i64>(2)?).unwrap_or_default();
            }
        }
        Ok(stats)
    }

    async fn promote(
        &self,
        kind: EntityKind,
        temp_id: &RecordId,
        authority_id: &RecordId,
        server_updated_at: i64,
        pushed_version: i64,
    ) -> Result<bool> {
        if authority_id.is_temporary() {
            return Err(Error::InvalidInput(format!(
                "Cannot promote {temp_id} to temporary id {authority_id}"
            )));
        }
        if temp_id == authority_id {
            return self
                .mark_synced(kind, temp_id, Some(server_updated_at), pushed_version)
                .await;
        }
        if self.get(kind, authority_id).await?.is_some() {
            return Err(Error::AlreadyExists(format!("{kind} {authority_id}")));
        }

        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = self
            .promote_rows(kind, temp_id, authority_id, server_updated_at, pushed_version)
            .await;
        super::finish_transaction(self.conn, result).await
    }

    async fn mark_synced(
        &self,
        kind: EntityKind,
        id: &RecordId,
        server_updated_at: Option<i64>,
        pushed_version: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET sync_status = 'synced',
                        server_updated_at = COALESCE(?, server_updated_at),
                        last_error = NULL
                     WHERE id = ? AND version = ?",
                    kind.table()
                ),
                libsql::params![server_updated_at, id.as_str(), pushed_version],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_push_failed(&self, kind: EntityKind, id: &RecordId, error: &str) -> Result<()> {
        self.conn
            .execute(
                &format!("UPDATE {} SET last_error = ? WHERE id = ?", kind.table()),
                [error, id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn purge(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ? AND is_deleted = 1", kind.table()),
                [id.as_str()],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn log_conflict(&self, owner: &OwnerId, conflict: &SyncConflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts
                    (entity_kind, record_id, owner_id, local_updated_at, incoming_updated_at, resolved_at, strategy)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    conflict.entity_kind.as_str(),
                    conflict.record_id.as_str(),
                    owner.as_str(),
                    conflict.local_updated_at,
                    conflict.incoming_updated_at,
                    conflict.resolved_at,
                    conflict.strategy.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_conflicts(&self, owner: &OwnerId, limit: usize) -> Result<Vec<SyncConflict>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_kind, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy
                 FROM sync_conflicts
                 WHERE owner_id = ?
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
                libsql::params![owner.as_str(), limit],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            let entity_kind: String = row.get(1)?;
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                entity_kind: entity_kind.parse()?,
                record_id: row.get(2)?,
                local_updated_at: row.get(3)?,
                incoming_updated_at: row.get(4)?,
                resolved_at: row.get(5)?,
                strategy: row.get(6)?,
            });
        }
        Ok(conflicts)
    }
}
