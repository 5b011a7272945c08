//! Owner-scoped facade the clients talk to.

use serde_json::{Map, Value};

use super::StoreService;
use crate::auth::IdentityProvider;
use crate::db::{QueueCounts, StoreStats};
use crate::models::{
    EntityKind, EntityPayload, OperationKind, OwnerId, QueuedOperation, RecordId, SyncConflict,
    SyncRecord,
};
use crate::remote::RemoteAuthority;
use crate::sync::{SyncResult, SyncService};
use crate::util::now_ms;
use crate::{Error, Result};

/// Queue health for one owner
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub counts: QueueCounts,
    /// Entries that ran out of retries, oldest first
    pub exhausted: Vec<QueuedOperation>,
}

/// Local-first access to one owner's ledger.
///
/// Every write lands in the local store and the operation queue first, then
/// an immediate push is attempted. A failed push leaves the change pending for
/// the next sync run.
pub struct LedgerService<R, I> {
    owner: OwnerId,
    sync: SyncService<R, I>,
}

impl<R: RemoteAuthority, I: IdentityProvider> LedgerService<R, I> {
    pub const fn new(owner: OwnerId, sync: SyncService<R, I>) -> Self {
        Self { owner, sync }
    }

    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub const fn sync_service(&self) -> &SyncService<R, I> {
        &self.sync
    }

    const fn store(&self) -> &StoreService {
        self.sync.store()
    }

    /// Create a record and return its current id: the authority id when the
    /// immediate push went through, the temporary id otherwise.
    pub async fn add_entity(&self, kind: EntityKind, data: Map<String, Value>) -> Result<RecordId> {
        let record = SyncRecord::new_local(kind, self.owner, data);
        record.validate()?;
        self.store()
            .write_with_operation(&record, OperationKind::Create)
            .await?;
        tracing::debug!("Added {kind} {}", record.id);

        Ok(self.push_now(kind, &record.id).await)
    }

    /// Create a record from a typed payload
    pub async fn add<P: EntityPayload>(&self, payload: &P) -> Result<RecordId> {
        self.add_entity(P::KIND, payload.to_data()?).await
    }

    /// Merge `patch` into a record's data and queue the change.
    ///
    /// Keys in the patch replace existing fields. A `null` is stored as an
    /// explicit null so the authority's column is cleared on the next push.
    pub async fn update_entity(
        &self,
        kind: EntityKind,
        id: &RecordId,
        patch: Map<String, Value>,
    ) -> Result<SyncRecord> {
        if patch.is_empty() {
            return Err(Error::InvalidInput("update has no fields".to_string()));
        }

        let mut record = self.live_record(kind, id).await?;
        for (key, value) in patch {
            record.data.insert(key, value);
        }
        record.touch(now_ms());
        record.validate()?;
        self.store()
            .write_with_operation(&record, OperationKind::Update)
            .await?;

        let current = self.push_now(kind, &record.id).await;
        self.store()
            .get_record(kind, &current)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind} {current}")))
    }

    /// Tombstone a record; it disappears from reads immediately and from the
    /// authority once the deletion is pushed.
    pub async fn delete_entity(&self, kind: EntityKind, id: &RecordId) -> Result<()> {
        let mut record = self.live_record(kind, id).await?;
        record.is_deleted = true;
        record.touch(now_ms());
        self.store()
            .write_with_operation(&record, OperationKind::Delete)
            .await?;
        tracing::debug!("Deleted {kind} {id}");

        self.push_now(kind, &record.id).await;
        Ok(())
    }

    /// A live record of this owner
    pub async fn get_entity(&self, kind: EntityKind, id: &RecordId) -> Result<Option<SyncRecord>> {
        Ok(self
            .store()
            .get_record(kind, id)
            .await?
            .filter(|record| record.owner_id == self.owner && !record.is_deleted))
    }

    /// Typed read of a live record
    pub async fn get<P: EntityPayload>(&self, id: &RecordId) -> Result<Option<P>> {
        self.get_entity(P::KIND, id)
            .await?
            .map(|record| P::from_record(&record))
            .transpose()
    }

    pub async fn list_entities(&self, kind: EntityKind) -> Result<Vec<SyncRecord>> {
        self.store().list_records(kind, &self.owner, false).await
    }

    /// Live records whose indexed `column` equals `value`
    pub async fn list_by_field(
        &self,
        kind: EntityKind,
        column: &str,
        value: &str,
    ) -> Result<Vec<SyncRecord>> {
        let records = self
            .store()
            .list_by_field(kind, &self.owner, column, value)
            .await?;
        Ok(records.into_iter().filter(|record| !record.is_deleted).collect())
    }

    pub async fn trigger_sync(&self) -> SyncResult {
        self.sync.sync_all().await
    }

    /// Sync ignoring stored cursors, removing local copies of records deleted
    /// on other devices
    pub async fn trigger_full_sync(&self) -> SyncResult {
        self.sync.sync_full().await
    }

    /// Records with changes the authority has not confirmed yet
    pub async fn pending_count(&self) -> Result<u64> {
        Ok(self.stats().await?.pending_sync)
    }

    pub async fn has_conflicts(&self) -> Result<bool> {
        self.store().has_conflicts(&self.owner).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store().stats(&self.owner).await
    }

    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.store().list_conflicts(&self.owner, limit).await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            counts: self.store().queue_counts(&self.owner).await?,
            exhausted: self.store().exhausted_operations(&self.owner).await?,
        })
    }

    /// Drop exhausted queue entries older than the configured retention
    pub async fn cleanup_queue(&self) -> Result<u64> {
        let retention = self.sync.settings().queue_retention;
        let removed = self
            .store()
            .cleanup_operations(&self.owner, retention)
            .await?;
        if removed > 0 {
            tracing::info!("Removed {removed} exhausted queue entries");
        }
        Ok(removed)
    }

    /// Forget everything stored for this owner, unsynced changes included
    pub async fn logout(&self) -> Result<u64> {
        let removed = self.store().clear_owner(&self.owner).await?;
        tracing::info!("Cleared {removed} local rows for {}", self.owner);
        Ok(removed)
    }

    async fn live_record(&self, kind: EntityKind, id: &RecordId) -> Result<SyncRecord> {
        self.get_entity(kind, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }

    async fn push_now(&self, kind: EntityKind, id: &RecordId) -> RecordId {
        match self.sync.push_record(kind, id).await {
            Ok(current) => current,
            Err(error) => {
                tracing::debug!("{kind} {id} stays queued: {error}");
                id.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{AuthSession, AuthUser, FixedSession};
    use crate::config::SyncSettings;
    use crate::models::{CustomCategory, Goal, SyncStatus};
    use crate::network::NetworkStatus;
    use crate::remote::InMemoryRemote;
    use crate::util::unix_timestamp_now;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn owner() -> OwnerId {
        "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".parse().unwrap()
    }

    fn session() -> AuthSession {
        AuthSession {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: unix_timestamp_now() + 3_600,
            user: AuthUser {
                id: owner().to_string(),
                email: None,
            },
        }
    }

    async fn ledger(
        remote: &InMemoryRemote,
        network: &NetworkStatus,
    ) -> LedgerService<InMemoryRemote, FixedSession> {
        let sync = SyncService::new(
            StoreService::open_in_memory().await.unwrap(),
            remote.clone(),
            FixedSession::new(session()),
            Arc::new(network.clone()),
            SyncSettings::default(),
        );
        LedgerService::new(owner(), sync)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_add_is_queued_and_synced_later() {
        let remote = InMemoryRemote::new();
        let network = NetworkStatus::offline();
        let ledger = ledger(&remote, &network).await;

        let id = ledger
            .add_entity(EntityKind::Category, fields(json!({"name": "Rent"})))
            .await
            .unwrap();

        assert!(id.is_temporary());
        assert_eq!(ledger.pending_count().await.unwrap(), 1);
        assert_eq!(ledger.queue_status().await.unwrap().counts.retryable, 1);
        assert_eq!(remote.call_count(), 0);

        network.set_online(true);
        let result = ledger.trigger_sync().await;

        assert!(result.success);
        assert_eq!(ledger.pending_count().await.unwrap(), 0);
        assert_eq!(ledger.queue_status().await.unwrap().counts.retryable, 0);
        let stored = ledger.list_entities(EntityKind::Category).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].id.is_temporary());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_add_returns_the_authority_id() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::online()).await;

        let id = ledger
            .add(&CustomCategory {
                name: "Travel".to_string(),
                icon: None,
                color: Some("#00aaff".to_string()),
            })
            .await
            .unwrap();

        assert!(!id.is_temporary());
        let category: CustomCategory = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(category.color.as_deref(), Some("#00aaff"));
        assert!(remote.get(EntityKind::Category, id.as_str()).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_rejects_records_missing_required_fields() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::online()).await;

        let error = ledger
            .add_entity(EntityKind::Goal, fields(json!({"name": "Trip"})))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(ledger.stats().await.unwrap().live_records, 0);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_merges_the_patch_and_bumps_the_version() {
        let remote = InMemoryRemote::new();
        let network = NetworkStatus::offline();
        let ledger = ledger(&remote, &network).await;
        let id = ledger
            .add(&Goal {
                name: "Trip".to_string(),
                target_cents: 50_000,
                saved_cents: 0,
                target_date: None,
            })
            .await
            .unwrap();

        let updated = ledger
            .update_entity(EntityKind::Goal, &id, fields(json!({"saved_cents": 1_200})))
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.sync_status, SyncStatus::Pending);
        assert_eq!(updated.data["name"], json!("Trip"));
        assert_eq!(updated.data["saved_cents"], json!(1_200));

        let cleared = ledger
            .update_entity(EntityKind::Goal, &id, fields(json!({"target_cents": null})))
            .await
            .unwrap_err();
        assert!(matches!(cleared, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn null_in_a_patch_reaches_the_authority_as_null() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::online()).await;
        let id = ledger
            .add(&CustomCategory {
                name: "Travel".to_string(),
                icon: None,
                color: Some("#00aaff".to_string()),
            })
            .await
            .unwrap();

        let updated = ledger
            .update_entity(EntityKind::Category, &id, fields(json!({"color": null})))
            .await
            .unwrap();

        assert_eq!(updated.sync_status, SyncStatus::Synced);
        assert_eq!(updated.data.get("color"), Some(&Value::Null));
        let row = remote.get(EntityKind::Category, id.as_str()).unwrap();
        assert_eq!(row.data.get("color"), Some(&Value::Null));
        let category: CustomCategory = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(category.color, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_a_missing_record_is_not_found() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::offline()).await;

        let error = ledger
            .update_entity(
                EntityKind::Category,
                &RecordId::authority("missing").unwrap(),
                fields(json!({"name": "X"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_a_local_only_record_removes_it_without_remote_calls() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::offline()).await;
        let id = ledger
            .add_entity(EntityKind::Category, fields(json!({"name": "Oops"})))
            .await
            .unwrap();

        ledger.delete_entity(EntityKind::Category, &id).await.unwrap();

        assert!(ledger
            .get_entity(EntityKind::Category, &id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(ledger.stats().await.unwrap().pending_sync, 0);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_a_synced_record_reaches_the_authority() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::online()).await;
        let id = ledger
            .add_entity(EntityKind::Category, fields(json!({"name": "Rent"})))
            .await
            .unwrap();

        ledger.delete_entity(EntityKind::Category, &id).await.unwrap();

        assert!(remote.get(EntityKind::Category, id.as_str()).is_none());
        assert!(ledger
            .list_entities(EntityKind::Category)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_by_field_hides_tombstones() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::offline()).await;
        let kept = ledger
            .add_entity(EntityKind::Category, fields(json!({"name": "Food"})))
            .await
            .unwrap();
        let dropped = ledger
            .add_entity(EntityKind::Category, fields(json!({"name": "Food"})))
            .await
            .unwrap();
        ledger
            .delete_entity(EntityKind::Category, &dropped)
            .await
            .unwrap();

        let found = ledger
            .list_by_field(EntityKind::Category, "name", "Food")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, kept);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logout_clears_the_owner() {
        let remote = InMemoryRemote::new();
        let ledger = ledger(&remote, &NetworkStatus::offline()).await;
        ledger
            .add_entity(EntityKind::Category, fields(json!({"name": "Rent"})))
            .await
            .unwrap();

        assert!(ledger.logout().await.unwrap() > 0);
        assert_eq!(ledger.stats().await.unwrap().live_records, 0);
        assert_eq!(ledger.queue_status().await.unwrap().counts.retryable, 0);
        assert_eq!(ledger.cleanup_queue().await.unwrap(), 0);
        assert!(!ledger.has_conflicts().await.unwrap());
    }
}
