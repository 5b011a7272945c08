//! Operation queue repository

use std::time::Duration;

use libsql::{Connection, Row};

use crate::error::{Error, Result};
use crate::models::{EntityKind, OperationId, OperationKind, OwnerId, QueuedOperation, RecordId};

const COLUMNS: &str =
    "id, entity_kind, entity_id, operation, timestamp, owner_id, retry_count, max_retries, error, payload";

/// Queue size split by retry state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub retryable: u64,
    /// Entries whose retry budget is spent
    pub exhausted: u64,
}

/// Trait for pending operation storage (async)
#[allow(async_fn_in_trait)]
pub trait OperationQueue {
    /// Append a mutation to the log
    async fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: &RecordId,
        operation: OperationKind,
        owner: &OwnerId,
        payload: Option<serde_json::Value>,
    ) -> Result<OperationId>;

    async fn get(&self, id: &OperationId) -> Result<Option<QueuedOperation>>;

    /// Retryable operations, oldest first. Replay in this order.
    async fn get_pending(&self, owner: &OwnerId) -> Result<Vec<QueuedOperation>>;

    /// Remove an operation after confirmed success
    async fn complete(&self, id: &OperationId) -> Result<bool>;

    /// Count a failed attempt. Exhausted entries are kept, not dropped.
    async fn fail(&self, id: &OperationId, error: &str) -> Result<Option<QueuedOperation>>;

    /// Remove every operation recorded for one entity
    async fn complete_for_entity(&self, entity_kind: EntityKind, entity_id: &RecordId)
        -> Result<u64>;

    /// Count a failed attempt on every retryable operation of an entity
    ///
    /// Returns the operations that this failure exhausted.
    async fn fail_for_entity(
        &self,
        entity_kind: EntityKind,
        entity_id: &RecordId,
        error: &str,
    ) -> Result<Vec<QueuedOperation>>;

    /// Point operations recorded under a temporary id at the authority id
    async fn rekey_entity(
        &self,
        entity_kind: EntityKind,
        old_id: &RecordId,
        new_id: &RecordId,
    ) -> Result<u64>;

    async fn list_exhausted(&self, owner: &OwnerId) -> Result<Vec<QueuedOperation>>;

    async fn count(&self, owner: &OwnerId) -> Result<QueueCounts>;

    /// Prune entries that are both older than `max_age` and exhausted
    async fn cleanup_old(&self, owner: &OwnerId, max_age: Duration) -> Result<u64>;
}

/// libSQL implementation of `OperationQueue`
pub struct LibSqlOperationQueue<'a> {
    conn: &'a Connection,
    max_retries: u32,
}

impl<'a> LibSqlOperationQueue<'a> {
    /// Create a queue whose new entries get `max_retries` attempts
    pub const fn new(conn: &'a Connection, max_retries: u32) -> Self {
        Self { conn, max_retries }
    }

    async fn query(
        &self,
        filter: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<QueuedOperation>> {
        let sql = format!("SELECT {COLUMNS} FROM operation_queue WHERE {filter}");
        let mut rows = self.conn.query(&sql, params).await?;

        let mut operations = Vec::new();
        while let Some(row) = rows.next().await? {
            operations.push(Self::parse_operation(&row)?);
        }
        Ok(operations)
    }

    fn parse_operation(row: &Row) -> Result<QueuedOperation> {
        let id: String = row.get(0)?;
        let entity_kind: String = row.get(1)?;
        let entity_id: String = row.get(2)?;
        let operation: String = row.get(3)?;
        let owner_id: String = row.get(5)?;
        let payload: Option<String> = row.get(9)?;

        Ok(QueuedOperation {
            id: id
                .parse()
                .map_err(|e| Error::Database(format!("invalid operation id {id}: {e}")))?,
            entity_kind: entity_kind.parse()?,
            entity_id: entity_id.parse()?,
            operation: operation.parse()?,
            timestamp: row.get(4)?,
            owner_id: owner_id
                .parse()
                .map_err(|e| Error::Database(format!("invalid owner_id {owner_id}: {e}")))?,
            retry_count: u32::try_from(row.get::<i64>(6)?).unwrap_or(u32::MAX),
            max_retries: u32::try_from(row.get::<i64>(7)?).unwrap_or(u32::MAX),
            error: row.get(8)?,
            payload: payload.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

impl OperationQueue for LibSqlOperationQueue<'_> {
    async fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: &RecordId,
        operation: OperationKind,
        owner: &OwnerId,
        payload: Option<serde_json::Value>,
    ) -> Result<OperationId> {
        let id = OperationId::new();
        let payload = payload.map(|value| serde_json::to_string(&value)).transpose()?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO operation_queue ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, 0, ?, NULL, ?)"
                ),
                libsql::params![
                    id.as_str(),
                    entity_kind.as_str(),
                    entity_id.as_str(),
                    operation.as_str(),
                    crate::util::now_ms(),
                    owner.as_str(),
                    i64::from(self.max_retries),
                    payload
                ],
            )
            .await?;

        tracing::debug!("Queued {} of {entity_kind} {entity_id}", operation.as_str());
        Ok(id)
    }

    async fn get(&self, id: &OperationId) -> Result<Option<QueuedOperation>> {
        Ok(self.query("id = ?", [id.as_str()]).await?.pop())
    }

    async fn get_pending(&self, owner: &OwnerId) -> Result<Vec<QueuedOperation>> {
        self.query(
            "owner_id = ? AND retry_count < max_retries ORDER BY timestamp ASC, id ASC",
            [owner.as_str()],
        )
        .await
    }

    async fn complete(&self, id: &OperationId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM operation_queue WHERE id = ?", [id.as_str()])
            .await?;
        Ok(removed > 0)
    }

    async fn fail(&self, id: &OperationId, error: &str) -> Result<Option<QueuedOperation>> {
        let changed = self
            .conn
            .execute(
                "UPDATE operation_queue SET retry_count = retry_count + 1, error = ?
                 WHERE id = ? AND retry_count < max_retries",
                libsql::params![error, id.as_str()],
            )
            .await?;

        let operation = self.get(id).await?;
        if let Some(operation) = operation
            .as_ref()
            .filter(|op| changed > 0 && op.is_exhausted())
        {
            tracing::warn!(
                "Operation {} on {} {} exhausted after {} attempts: {error}",
                operation.id,
                operation.entity_kind,
                operation.entity_id,
                operation.retry_count
            );
        }
        Ok(operation)
    }

    async fn complete_for_entity(
        &self,
        entity_kind: EntityKind,
        entity_id: &RecordId,
    ) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM operation_queue WHERE entity_kind = ? AND entity_id = ?",
                [entity_kind.as_str(), entity_id.as_str()],
            )
            .await?;
        Ok(removed)
    }

    async fn fail_for_entity(
        &self,
        entity_kind: EntityKind,
        entity_id: &RecordId,
        error: &str,
    ) -> Result<Vec<QueuedOperation>> {
        let retryable = self
            .query(
                "entity_kind = ? AND entity_id = ? AND retry_count < max_retries
                 ORDER BY timestamp ASC, id ASC",
                [entity_kind.as_str(), entity_id.as_str()],
            )
            .await?;

        let mut exhausted = Vec::new();
        for operation in retryable {
            if let Some(updated) = self.fail(&operation.id, error).await? {
                if updated.is_exhausted() {
                    exhausted.push(updated);
                }
            }
        }
        Ok(exhausted)
    }

    async fn rekey_entity(
        &self,
        entity_kind: EntityKind,
        old_id: &RecordId,
        new_id: &RecordId,
    ) -> Result<u64> {
        let changed = self
            .conn
            .execute(
                "UPDATE operation_queue SET entity_id = ? WHERE entity_kind = ? AND entity_id = ?",
                [new_id.as_str(), entity_kind.as_str(), old_id.as_str()],
            )
            .await?;
        Ok(changed)
    }

    async fn list_exhausted(&self, owner: &OwnerId) -> Result<Vec<QueuedOperation>> {
        self.query(
            "owner_id = ? AND retry_count >= max_retries ORDER BY timestamp ASC, id ASC",
            [owner.as_str()],
        )
        .await
    }

    async fn count(&self, owner: &OwnerId) -> Result<QueueCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN retry_count < max_retries THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN retry_count >= max_retries THEN 1 ELSE 0 END), 0)
                 FROM operation_queue WHERE owner_id = ?",
                [owner.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(QueueCounts::default());
        };
        Ok(QueueCounts {
            retryable: u64::try_from(row.get::<i64>(0)?).unwrap_or_default(),
            exhausted: u64::try_from(row.get::<i64>(1)?).unwrap_or_default(),
        })
    }

    async fn cleanup_old(&self, owner: &OwnerId, max_age: Duration) -> Result<u64> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = crate::util::now_ms().saturating_sub(max_age_ms);

        let removed = self
            .conn
            .execute(
                "DELETE FROM operation_queue
                 WHERE owner_id = ? AND retry_count >= max_retries AND timestamp < ?",
                libsql::params![owner.as_str(), cutoff],
            )
            .await?;

        if removed > 0 {
            tracing::info!("Pruned {removed} exhausted queue entries for owner {owner}");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn owner() -> OwnerId {
        "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".parse().unwrap()
    }

    async fn backdate(conn: &Connection, id: &OperationId, timestamp: i64) {
        conn.execute(
            "UPDATE operation_queue SET timestamp = ? WHERE id = ?",
            libsql::params![timestamp, id.as_str()],
        )
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_pending_orders_by_timestamp() {
        let db = Database::open_in_memory().await.unwrap();
        let queue = LibSqlOperationQueue::new(db.connection(), 3);

        let first_entity = RecordId::temporary();
        let second_entity = RecordId::temporary();
        let late = queue
            .enqueue(EntityKind::Entry, &first_entity, OperationKind::Create, &owner(), Some(json!({"amount_cents": 1})))
            .await
            .unwrap();
        let early = queue
            .enqueue(EntityKind::Debt, &second_entity, OperationKind::Update, &owner(), None)
            .await
            .unwrap();
        backdate(db.connection(), &late, 200).await;
        backdate(db.connection(), &early, 100).await;

        let pending = queue.get_pending(&owner()).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![early, late]);
        assert_eq!(pending[1].payload, Some(json!({"amount_cents": 1})));
        assert_eq!(pending[1].max_retries, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_keeps_exhausted_entries() {
        let db = Database::open_in_memory().await.unwrap();
        let queue = LibSqlOperationQueue::new(db.connection(), 2);

        let entity = RecordId::temporary();
        let id = queue
            .enqueue(EntityKind::Goal, &entity, OperationKind::Create, &owner(), None)
            .await
            .unwrap();

        let first = queue.fail(&id, "timeout").await.unwrap().unwrap();
        assert_eq!(first.retry_count, 1);
        assert!(!first.is_exhausted());

        let second = queue.fail(&id, "HTTP 500").await.unwrap().unwrap();
        assert!(second.is_exhausted());
        assert_eq!(second.error.as_deref(), Some("HTTP 500"));

        // Retry count stops at the budget
        let third = queue.fail(&id, "again").await.unwrap().unwrap();
        assert_eq!(third.retry_count, 2);

        assert!(queue.get_pending(&owner()).await.unwrap().is_empty());
        assert_eq!(queue.list_exhausted(&owner()).await.unwrap().len(), 1);
        assert_eq!(
            queue.count(&owner()).await.unwrap(),
            QueueCounts {
                retryable: 0,
                exhausted: 1,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entity_helpers() {
        let db = Database::open_in_memory().await.unwrap();
        let queue = LibSqlOperationQueue::new(db.connection(), 1);

        let temp = RecordId::temporary();
        queue
            .enqueue(EntityKind::Category, &temp, OperationKind::Create, &owner(), None)
            .await
            .unwrap();
        queue
            .enqueue(EntityKind::Category, &temp, OperationKind::Update, &owner(), None)
            .await
            .unwrap();

        let real = RecordId::authority("cat-9").unwrap();
        assert_eq!(
            queue
                .rekey_entity(EntityKind::Category, &temp, &real)
                .await
                .unwrap(),
            2
        );

        let exhausted = queue
            .fail_for_entity(EntityKind::Category, &real, "rejected")
            .await
            .unwrap();
        assert_eq!(exhausted.len(), 2);
        assert!(exhausted.iter().all(|op| op.entity_id == real));

        assert_eq!(
            queue
                .complete_for_entity(EntityKind::Category, &real)
                .await
                .unwrap(),
            2
        );
        assert_eq!(queue.count(&owner()).await.unwrap(), QueueCounts::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cleanup_old_only_prunes_old_exhausted_entries() {
        let db = Database::open_in_memory().await.unwrap();
        let queue = LibSqlOperationQueue::new(db.connection(), 1);
        let old = crate::util::now_ms() - 10 * 86_400_000;

        let old_exhausted = queue
            .enqueue(EntityKind::Entry, &RecordId::temporary(), OperationKind::Create, &owner(), None)
            .await
            .unwrap();
        queue.fail(&old_exhausted, "boom").await.unwrap();
        backdate(db.connection(), &old_exhausted, old).await;

        let old_retryable = queue
            .enqueue(EntityKind::Entry, &RecordId::temporary(), OperationKind::Create, &owner(), None)
            .await
            .unwrap();
        backdate(db.connection(), &old_retryable, old).await;

        let fresh_exhausted = queue
            .enqueue(EntityKind::Entry, &RecordId::temporary(), OperationKind::Create, &owner(), None)
            .await
            .unwrap();
        queue.fail(&fresh_exhausted, "boom").await.unwrap();

        let removed = queue
            .cleanup_old(&owner(), Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get(&old_exhausted).await.unwrap().is_none());
        assert!(queue.get(&old_retryable).await.unwrap().is_some());
        assert!(queue.get(&fresh_exhausted).await.unwrap().is_some());
        assert!(queue.complete(&old_retryable).await.unwrap());
    }
}
