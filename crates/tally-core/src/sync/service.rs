//! Sync orchestration: preflight, push, tombstones, pull, reconcile, commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use super::result::{SyncCounts, SyncError, SyncResult};
use super::state::{SyncEvent, SyncState};
use crate::auth::{resolve_identity, IdentityProvider};
use crate::config::SyncSettings;
use crate::conflict::{self, Winner};
use crate::models::{
    EntityKind, OwnerId, PullCursor, RecordId, SyncConflict, SyncMeta, SyncRecord, SyncStatus,
};
use crate::network::Connectivity;
use crate::remote::{Identity, ListRequest, RemoteAuthority, RemoteRecord};
use crate::services::StoreService;
use crate::util::now_ms;

const EVENT_CAPACITY: usize = 64;
const CONFLICT_STRATEGY: &str = "last_write_wins";

/// Clears the single-flight flag when a run ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullMode {
    /// Continue from the stored cursor when there is one
    Incremental,
    /// Ignore stored cursors and reconcile every kind
    Full,
}

enum Removal {
    /// Never reached the authority; dropped locally
    Purged,
    Deleted,
}

/// Mutable tallies of one run
struct Run {
    counts: BTreeMap<EntityKind, SyncCounts>,
    errors: Vec<SyncError>,
    metas: Vec<SyncMeta>,
}

impl Run {
    fn new() -> Self {
        Self {
            counts: EntityKind::SYNC_ORDER
                .into_iter()
                .map(|kind| (kind, SyncCounts::default()))
                .collect(),
            errors: Vec::new(),
            metas: Vec::new(),
        }
    }

    fn counts(&mut self, kind: EntityKind) -> &mut SyncCounts {
        self.counts.entry(kind).or_default()
    }
}

/// Orchestrates sync between the local store and the remote authority.
///
/// At most one run is in flight per service; a second request while one runs
/// is rejected without side effects.
pub struct SyncService<R, I> {
    store: StoreService,
    remote: R,
    identity: I,
    connectivity: Arc<dyn Connectivity>,
    settings: SyncSettings,
    in_flight: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl<R: RemoteAuthority, I: IdentityProvider> SyncService<R, I> {
    pub fn new(
        store: StoreService,
        remote: R,
        identity: I,
        connectivity: Arc<dyn Connectivity>,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            remote,
            identity,
            connectivity,
            settings,
            in_flight: AtomicBool::new(false),
            events,
        }
    }

    pub const fn store(&self) -> &StoreService {
        &self.store
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    pub const fn identity_provider(&self) -> &I {
        &self.identity
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one sync, continuing each kind from its stored pull cursor
    pub async fn sync_all(&self) -> SyncResult {
        self.run(PullMode::Incremental).await
    }

    /// Run one sync that pulls every kind in full and reconciles deletions
    /// made elsewhere
    pub async fn sync_full(&self) -> SyncResult {
        self.run(PullMode::Full).await
    }

    async fn run(&self, mode: PullMode) -> SyncResult {
        let started_at = now_ms();
        let Some(guard) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("Sync requested while another run is in flight");
            return SyncResult::blocked(SyncError::AlreadySyncing, started_at);
        };
        self.publish(SyncEvent::StateChanged(SyncState::Syncing));

        let result = match self.preflight().await {
            Ok(identity) => {
                tracing::info!("Sync started for {} ({mode:?})", identity.owner_id);
                let mut run = Run::new();
                self.push_changes(&identity, &mut run).await;
                self.push_tombstones(&identity, &mut run).await;
                self.pull_changes(&identity, mode, &mut run).await;
                self.commit(&mut run).await;
                SyncResult::finished(run.counts, run.errors, started_at)
            }
            Err(error) => {
                tracing::warn!("Sync blocked: {error}");
                SyncResult::blocked(error, started_at)
            }
        };

        let totals = result.totals();
        tracing::info!(
            "Sync finished as {}: {} pushed, {} deleted, {} pulled, {} reconciled, {} errors",
            result.outcome,
            totals.pushed,
            totals.deleted + totals.purged,
            totals.pulled,
            totals.reconciled,
            result.errors.len()
        );

        self.publish(SyncEvent::Completed(Box::new(result.clone())));
        self.publish(SyncEvent::StateChanged(result.outcome));
        drop(guard);
        self.publish(SyncEvent::StateChanged(SyncState::Idle));
        result
    }

    /// Push one record right away, outside a full run.
    ///
    /// Returns the record's id after the push, which is the authority id for a
    /// record that was only local. On failure the record stays pending for the
    /// next run.
    pub async fn push_record(&self, kind: EntityKind, id: &RecordId) -> Result<RecordId, SyncError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return Err(SyncError::AlreadySyncing);
        };

        let record = self
            .store
            .get_record(kind, id)
            .await
            .map_err(|error| SyncError::Store(error.to_string()))?
            .ok_or_else(|| SyncError::RecordSync {
                kind,
                id: id.to_string(),
                message: "not in the local store".to_string(),
            })?;
        if !record.is_pending() {
            return Ok(record.id);
        }
        if record.is_deleted && record.id.is_temporary() {
            self.purge_local(&record).await?;
            return Ok(record.id);
        }

        let identity = self.preflight().await?;
        if record.owner_id != identity.owner_id {
            return Err(SyncError::IdentityInvalid(format!(
                "{kind} {id} belongs to another owner"
            )));
        }

        let outcome = if record.is_deleted {
            self.remove_tombstone(&identity, &record)
                .await
                .map(|_| record.id.clone())
        } else {
            self.push_one(&identity, &record).await
        };
        if let Err(error) = &outcome {
            tracing::debug!("Immediate push of {kind} {id} failed: {error}");
            for exhausted in self.note_failure(kind, &record.id, error).await {
                tracing::warn!("{exhausted}");
            }
        }
        outcome
    }

    fn publish(&self, event: SyncEvent) {
        // No receivers is fine
        self.events.send(event).ok();
    }

    async fn preflight(&self) -> Result<Identity, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::NetworkUnavailable(
                "device is offline".to_string(),
            ));
        }
        let session = self
            .identity
            .current_session()
            .await
            .map_err(|error| SyncError::IdentityInvalid(error.to_string()))?;
        resolve_identity(session).map_err(|error| SyncError::IdentityInvalid(error.to_string()))
    }

    async fn push_changes(&self, identity: &Identity, run: &mut Run) {
        for kind in EntityKind::SYNC_ORDER {
            let pending = match self
                .store
                .list_by_status(kind, &identity.owner_id, SyncStatus::Pending)
                .await
            {
                Ok(records) => records,
                Err(error) => {
                    run.errors.push(SyncError::Store(format!(
                        "listing pending {kind} records: {error}"
                    )));
                    continue;
                }
            };

            for record in pending.iter().filter(|record| !record.is_deleted) {
                match self.push_one(identity, record).await {
                    Ok(_) => run.counts(kind).pushed += 1,
                    Err(error) => {
                        tracing::warn!("{error}");
                        let exhausted = self.note_failure(kind, &record.id, &error).await;
                        run.errors.push(error);
                        run.errors.extend(exhausted);
                    }
                }
            }
        }
    }

    async fn push_one(&self, identity: &Identity, record: &SyncRecord) -> Result<RecordId, SyncError> {
        let kind = record.kind;
        let failed = |message: String| SyncError::RecordSync {
            kind,
            id: record.id.to_string(),
            message,
        };

        if !record.id.is_temporary() {
            let ack = self
                .remote
                .update(identity, record)
                .await
                .map_err(|error| failed(error.to_string()))?;
            let synced = self
                .store
                .mark_synced(kind, &record.id, Some(ack.updated_at), record.version)
                .await
                .map_err(|error| failed(error.to_string()))?;
            if synced {
                self.store
                    .complete_operations(kind, &record.id)
                    .await
                    .map_err(|error| failed(error.to_string()))?;
            }
            return Ok(record.id.clone());
        }

        let ack = self
            .remote
            .insert(identity, record)
            .await
            .map_err(|error| failed(error.to_string()))?;
        let authority_id =
            RecordId::authority(ack.id).map_err(|error| failed(error.to_string()))?;
        let synced = self
            .store
            .promote(
                kind,
                &record.id,
                &authority_id,
                ack.updated_at,
                record.version,
            )
            .await
            .map_err(|error| failed(error.to_string()))?;
        self.store
            .rekey_operations(kind, &record.id, &authority_id)
            .await
            .map_err(|error| failed(error.to_string()))?;
        if synced {
            self.store
                .complete_operations(kind, &authority_id)
                .await
                .map_err(|error| failed(error.to_string()))?;
        }

        tracing::debug!("Created {kind} {} as {authority_id}", record.id);
        Ok(authority_id)
    }

    /// Record a failed attempt; returns the exhaustions it caused
    async fn note_failure(
        &self,
        kind: EntityKind,
        id: &RecordId,
        error: &SyncError,
    ) -> Vec<SyncError> {
        let message = error.to_string();
        if let Err(store_error) = self.store.mark_push_failed(kind, id, &message).await {
            tracing::warn!("Could not record push failure of {kind} {id}: {store_error}");
        }

        match self.store.fail_operations(kind, id, &message).await {
            Ok(exhausted) => exhausted
                .into_iter()
                .map(|operation| SyncError::QueueExhausted {
                    kind,
                    id: id.to_string(),
                    attempts: operation.retry_count,
                    message: operation.error.unwrap_or_else(|| message.clone()),
                })
                .collect(),
            Err(store_error) => vec![SyncError::Store(format!(
                "recording failure of {kind} {id}: {store_error}"
            ))],
        }
    }

    async fn push_tombstones(&self, identity: &Identity, run: &mut Run) {
        for kind in EntityKind::SYNC_ORDER {
            let tombstones = match self.store.list_tombstones(kind, &identity.owner_id).await {
                Ok(records) => records,
                Err(error) => {
                    run.errors.push(SyncError::Store(format!(
                        "listing {kind} tombstones: {error}"
                    )));
                    continue;
                }
            };

            for record in &tombstones {
                match self.remove_tombstone(identity, record).await {
                    Ok(Removal::Purged) => run.counts(kind).purged += 1,
                    Ok(Removal::Deleted) => run.counts(kind).deleted += 1,
                    Err(error) => {
                        tracing::warn!("{error}");
                        let exhausted = self.note_failure(kind, &record.id, &error).await;
                        run.errors.push(error);
                        run.errors.extend(exhausted);
                    }
                }
            }
        }
    }

    async fn remove_tombstone(
        &self,
        identity: &Identity,
        record: &SyncRecord,
    ) -> Result<Removal, SyncError> {
        if record.id.is_temporary() {
            self.purge_local(record).await?;
            return Ok(Removal::Purged);
        }

        self.remote
            .delete(identity, record.kind, &record.id)
            .await
            .map_err(|error| SyncError::RecordSync {
                kind: record.kind,
                id: record.id.to_string(),
                message: error.to_string(),
            })?;
        self.purge_local(record).await?;
        Ok(Removal::Deleted)
    }

    async fn purge_local(&self, record: &SyncRecord) -> Result<(), SyncError> {
        let kind = record.kind;
        let failed = |message: String| SyncError::RecordSync {
            kind,
            id: record.id.to_string(),
            message,
        };
        self.store
            .purge(kind, &record.id)
            .await
            .map_err(|error| failed(error.to_string()))?;
        self.store
            .complete_operations(kind, &record.id)
            .await
            .map_err(|error| failed(error.to_string()))?;
        Ok(())
    }

    async fn pull_changes(&self, identity: &Identity, mode: PullMode, run: &mut Run) {
        for kind in EntityKind::SYNC_ORDER {
            if let Err(error) = self.pull_kind(identity, kind, mode, run).await {
                tracing::warn!("{error}");
                run.errors.push(error);
            }
        }
    }

    async fn pull_kind(
        &self,
        identity: &Identity,
        kind: EntityKind,
        mode: PullMode,
        run: &mut Run,
    ) -> Result<(), SyncError> {
        let owner = &identity.owner_id;
        let store_failed = |error: crate::Error| SyncError::Store(format!("pulling {kind}: {error}"));

        let mut meta = self.store.load_meta(owner, kind).await.map_err(store_failed)?;
        let cursor = match mode {
            PullMode::Incremental => meta.cursor.clone(),
            PullMode::Full => None,
        };
        let full = cursor.is_none();

        // Every page is fetched before anything is applied
        let rows = self
            .fetch_all(identity, kind, cursor.as_ref().map(|cursor| cursor.updated_at))
            .await?;
        let newest = rows
            .iter()
            .map(|row| PullCursor::new(row.updated_at_micros, row.id.clone()))
            .max();
        let remote_ids: HashSet<String> = rows.iter().map(|row| row.id.clone()).collect();

        let local: HashMap<String, SyncRecord> = self
            .store
            .list_records(kind, owner, true)
            .await
            .map_err(store_failed)?
            .into_iter()
            .map(|record| (record.id.to_string(), record))
            .collect();

        let now = now_ms();
        let mut clean = true;
        let mut seen = HashSet::new();
        let mut survivors = Vec::new();

        for row in rows {
            if !seen.insert(row.id.clone()) {
                continue;
            }
            let row_id = row.id.clone();
            let incoming = match row.into_local(kind, owner, now) {
                Ok(record) => record,
                Err(error) => {
                    clean = false;
                    run.errors.push(SyncError::RecordSync {
                        kind,
                        id: row_id,
                        message: error.to_string(),
                    });
                    continue;
                }
            };
            let incoming_at = incoming.server_updated_at.unwrap_or_default();

            let Some(existing) = local.get(incoming.id.as_str()) else {
                survivors.push(incoming);
                continue;
            };
            if existing.is_pending() {
                tracing::debug!("Skipping incoming {kind} {}: local edit pending", incoming.id);
                continue;
            }
            if existing
                .server_updated_at
                .is_some_and(|seen_at| seen_at >= incoming_at)
            {
                continue;
            }

            let resolution = conflict::resolve(existing, &incoming, now);
            match resolution.winner {
                Winner::Remote => survivors.push(resolution.resolved),
                Winner::Local => {
                    match self
                        .keep_local(owner, existing, &resolution.resolved, incoming_at, now)
                        .await
                    {
                        Ok(()) => run.counts(kind).kept_local += 1,
                        Err(error) => {
                            clean = false;
                            run.errors.push(error);
                        }
                    }
                }
            }
        }

        if !survivors.is_empty() {
            let batch = self
                .store
                .bulk_upsert(kind, &survivors)
                .await
                .map_err(store_failed)?;
            run.counts(kind).pulled += batch.inserted as u64;
            if !batch.is_complete() {
                clean = false;
            }
            run.errors
                .extend(batch.errors.into_iter().map(|item| SyncError::BatchWrite {
                    kind,
                    id: item.id,
                    message: item.message,
                }));
        }

        if full && clean {
            let stale: Vec<RecordId> = local
                .values()
                .filter(|record| {
                    record.sync_status == SyncStatus::Synced
                        && !record.is_deleted
                        && !record.id.is_temporary()
                        && !remote_ids.contains(record.id.as_str())
                })
                .map(|record| record.id.clone())
                .collect();
            if !stale.is_empty() {
                let batch = self
                    .store
                    .bulk_delete(kind, &stale)
                    .await
                    .map_err(store_failed)?;
                tracing::info!(
                    "Removed {} local {kind} records no longer at the authority",
                    batch.inserted
                );
                run.counts(kind).reconciled += batch.inserted as u64;
            }
        }

        // A partially applied pull is fetched again next time
        if clean {
            meta.cursor = PullCursor::advance(cursor, newest);
            run.metas.push(meta);
        }
        Ok(())
    }

    async fn fetch_all(
        &self,
        identity: &Identity,
        kind: EntityKind,
        updated_after: Option<i64>,
    ) -> Result<Vec<RemoteRecord>, SyncError> {
        let limit = self.settings.page_size.max(1);
        let page_len = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        let mut offset = 0u32;

        loop {
            let request = ListRequest {
                updated_after,
                limit,
                offset,
            };
            let page = self
                .remote
                .list(identity, kind, &request)
                .await
                .map_err(|error| SyncError::PullFailed {
                    kind,
                    message: error.to_string(),
                })?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < page_len {
                break;
            }
            offset = offset.saturating_add(limit);
        }

        tracing::debug!(
            "Fetched {} {kind} rows ({})",
            rows.len(),
            if updated_after.is_some() { "incremental" } else { "full" }
        );
        Ok(rows)
    }

    async fn keep_local(
        &self,
        owner: &OwnerId,
        existing: &SyncRecord,
        resolved: &SyncRecord,
        incoming_updated_at: i64,
        now: i64,
    ) -> Result<(), SyncError> {
        let failed = |error: crate::Error| SyncError::RecordSync {
            kind: existing.kind,
            id: existing.id.to_string(),
            message: error.to_string(),
        };
        self.store.update_record(resolved).await.map_err(failed)?;
        self.store
            .log_conflict(
                owner,
                &SyncConflict {
                    id: 0,
                    entity_kind: existing.kind,
                    record_id: existing.id.to_string(),
                    local_updated_at: existing.local_updated_at,
                    incoming_updated_at,
                    resolved_at: now,
                    strategy: CONFLICT_STRATEGY.to_string(),
                },
            )
            .await
            .map_err(failed)?;
        tracing::info!(
            "Kept local {} {} over an older authority write",
            existing.kind,
            existing.id
        );
        Ok(())
    }

    /// Stamp and save the metadata of every kind whose pull applied cleanly.
    /// Kinds with a failed pull keep their previous cursor and `last_sync_at`.
    async fn commit(&self, run: &mut Run) {
        let now = now_ms();
        for mut meta in std::mem::take(&mut run.metas) {
            meta.last_sync_at = Some(now);
            if let Err(error) = self.store.save_meta(&meta).await {
                run.errors.push(SyncError::Store(format!(
                    "saving {} sync metadata: {error}",
                    meta.kind
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSession, AuthUser, FixedSession};
    use crate::models::OperationKind;
    use crate::network::NetworkStatus;
    use crate::remote::memory::RemoteMethod;
    use crate::remote::InMemoryRemote;
    use crate::util::unix_timestamp_now;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};

    type TestService = SyncService<InMemoryRemote, FixedSession>;

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
                email: Some("me@example.com".to_string()),
            },
        }
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn service_with(
        remote: &InMemoryRemote,
        network: &NetworkStatus,
        identity: FixedSession,
        store: StoreService,
    ) -> TestService {
        SyncService::new(
            store,
            remote.clone(),
            identity,
            Arc::new(network.clone()),
            SyncSettings {
                page_size: 2,
                ..SyncSettings::default()
            },
        )
    }

    async fn service(remote: &InMemoryRemote) -> TestService {
        service_with(
            remote,
            &NetworkStatus::online(),
            FixedSession::new(session()),
            StoreService::open_in_memory().await.unwrap(),
        )
    }

    async fn create(service: &TestService, kind: EntityKind, value: Value) -> SyncRecord {
        let record = SyncRecord::new_local(kind, owner(), data(value));
        service
            .store()
            .write_with_operation(&record, OperationKind::Create)
            .await
            .unwrap();
        record
    }

    async fn edit(service: &TestService, mut record: SyncRecord, value: Value) -> SyncRecord {
        record.data = data(value);
        record.touch(now_ms());
        service
            .store()
            .write_with_operation(&record, OperationKind::Update)
            .await
            .unwrap();
        record
    }

    async fn tombstone(service: &TestService, mut record: SyncRecord) {
        record.is_deleted = true;
        record.touch(now_ms());
        service
            .store()
            .write_with_operation(&record, OperationKind::Delete)
            .await
            .unwrap();
    }

    async fn records(service: &TestService, kind: EntityKind) -> Vec<SyncRecord> {
        service
            .store()
            .list_records(kind, &owner(), true)
            .await
            .unwrap()
    }

    fn writes(remote: &InMemoryRemote) -> usize {
        remote
            .calls()
            .iter()
            .filter(|call| call.method != RemoteMethod::List)
            .count()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_run_is_blocked_before_any_remote_call() {
        let remote = InMemoryRemote::new();
        let service = service_with(
            &remote,
            &NetworkStatus::offline(),
            FixedSession::new(session()),
            StoreService::open_in_memory().await.unwrap(),
        );
        let record = create(&service, EntityKind::Category, json!({"name": "Rent"})).await;

        let result = service.sync_all().await;

        assert_eq!(result.outcome, SyncState::Blocked);
        assert!(matches!(result.errors[..], [SyncError::NetworkUnavailable(_)]));
        assert_eq!(remote.call_count(), 0);
        let stored = service
            .store()
            .get_record(EntityKind::Category, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_pending());
        assert!(!service.is_syncing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_or_malformed_identity_blocks_the_run() {
        let remote = InMemoryRemote::new();
        let signed_out = service_with(
            &remote,
            &NetworkStatus::online(),
            FixedSession::signed_out(),
            StoreService::open_in_memory().await.unwrap(),
        );
        let result = signed_out.sync_all().await;
        assert!(matches!(result.errors[..], [SyncError::IdentityInvalid(_)]));

        let mut bad_owner = session();
        bad_owner.user.id = "not-a-uuid".to_string();
        let malformed = service_with(
            &remote,
            &NetworkStatus::online(),
            FixedSession::new(bad_owner),
            StoreService::open_in_memory().await.unwrap(),
        );
        let result = malformed.sync_all().await;
        assert_eq!(result.outcome, SyncState::Blocked);
        assert!(matches!(result.errors[..], [SyncError::IdentityInvalid(_)]));

        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_in_flight_rejects_a_second_request() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        create(&service, EntityKind::Category, json!({"name": "Rent"})).await;

        service.in_flight.store(true, Ordering::SeqCst);
        let result = service.sync_all().await;
        assert_eq!(result.outcome, SyncState::Blocked);
        assert_eq!(result.errors, vec![SyncError::AlreadySyncing]);
        assert_eq!(remote.call_count(), 0);
        assert!(service.is_syncing());

        service.in_flight.store(false, Ordering::SeqCst);
        assert!(service.sync_all().await.success);
        assert!(!service.is_syncing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_follows_kind_order_then_creation_order() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        let pause = || std::thread::sleep(std::time::Duration::from_millis(5));

        let expense = create(
            &service,
            EntityKind::Entry,
            json!({"amount_cents": 900, "direction": "expense", "occurred_on": "2026-10-01"}),
        )
        .await;
        pause();
        let first = create(&service, EntityKind::Category, json!({"name": "First"})).await;
        pause();
        let second = create(&service, EntityKind::Category, json!({"name": "Second"})).await;
        pause();
        edit(&service, first.clone(), json!({"name": "First, renamed"})).await;

        let result = service.sync_all().await;
        assert!(result.success, "{:?}", result.errors);

        let inserted: Vec<_> = remote
            .calls()
            .into_iter()
            .filter(|call| call.method == RemoteMethod::Insert)
            .map(|call| (call.kind, call.id))
            .collect();
        assert_eq!(
            inserted,
            vec![
                (EntityKind::Category, Some(first.id.to_string())),
                (EntityKind::Category, Some(second.id.to_string())),
                (EntityKind::Entry, Some(expense.id.to_string())),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_promotes_temporary_ids_and_clears_the_queue() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        let record = create(&service, EntityKind::Category, json!({"name": "Rent"})).await;

        let result = service.sync_all().await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.counts(EntityKind::Category).pushed, 1);
        let stored = records(&service, EntityKind::Category).await;
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].id.is_temporary());
        assert_ne!(stored[0].id, record.id);
        assert_eq!(stored[0].sync_status, SyncStatus::Synced);
        assert!(service
            .store()
            .pending_operations(&owner())
            .await
            .unwrap()
            .is_empty());

        let remote_rows = remote.rows(EntityKind::Category, &owner());
        assert_eq!(remote_rows.len(), 1);
        assert_eq!(remote_rows[0].id, stored[0].id.as_str());
        assert_eq!(stored[0].server_updated_at, Some(remote_rows[0].updated_at));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entries_reach_the_authority_with_category_authority_ids() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        let category = create(&service, EntityKind::Category, json!({"name": "Food"})).await;
        create(
            &service,
            EntityKind::Entry,
            json!({
                "amount_cents": 1250,
                "direction": "expense",
                "occurred_on": "2026-10-18",
                "category_id": category.id.as_str()
            }),
        )
        .await;

        let result = service.sync_all().await;
        assert!(result.success, "{:?}", result.errors);

        let category_id = remote.rows(EntityKind::Category, &owner())[0].id.clone();
        let entries = remote.rows(EntityKind::Entry, &owner());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data["category_id"], json!(category_id));
        assert!(records(&service, EntityKind::Entry)
            .await
            .iter()
            .all(|entry| !entry.is_pending()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_run_without_changes_is_a_no_op() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Goal, owner(), "g1", 1_000, data(json!({"name": "Trip", "target_cents": 9000})));
        create(&service, EntityKind::Category, json!({"name": "Rent"})).await;

        assert!(service.sync_all().await.success);
        let before = records(&service, EntityKind::Category).await;
        let goals_before = records(&service, EntityKind::Goal).await;
        remote.clear_calls();

        let second = service.sync_all().await;

        assert!(second.success);
        assert_eq!(writes(&remote), 0);
        assert_eq!(second.totals(), SyncCounts::default());
        assert_eq!(records(&service, EntityKind::Category).await, before);
        assert_eq!(records(&service, EntityKind::Goal).await, goals_before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_push_keeps_the_record_pending_and_exhausts_its_queue_entry() {
        let remote = InMemoryRemote::new();
        let service = service_with(
            &remote,
            &NetworkStatus::online(),
            FixedSession::new(session()),
            StoreService::open_in_memory()
                .await
                .unwrap()
                .with_max_retries(2),
        );
        let failing = create(&service, EntityKind::Category, json!({"name": "Rent"})).await;
        create(&service, EntityKind::Category, json!({"name": "Food"})).await;
        remote.fail_on(failing.id.as_str());

        let first = service.sync_all().await;
        assert_eq!(first.outcome, SyncState::PartialFailure);
        assert_eq!(first.counts(EntityKind::Category).pushed, 1);
        assert!(matches!(first.errors[..], [SyncError::RecordSync { .. }]));

        let second = service.sync_all().await;
        assert!(second
            .errors
            .iter()
            .any(|error| matches!(error, SyncError::QueueExhausted { attempts: 2, .. })));

        let stored = service
            .store()
            .get_record(EntityKind::Category, &failing.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_pending());
        assert!(stored.last_error.is_some());
        let exhausted = service.store().exhausted_operations(&owner()).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].entity_id, failing.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_never_overwrites_a_pending_local_edit() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "c1", 1_000, data(json!({"name": "Remote"})));
        assert!(service.sync_all().await.success);

        let synced = records(&service, EntityKind::Category).await.remove(0);
        edit(&service, synced, json!({"name": "Local"})).await;
        remote.fail_on("c1");
        remote.seed(
            EntityKind::Category,
            owner(),
            "c1",
            now_ms() + 60_000,
            data(json!({"name": "Elsewhere"})),
        );

        let result = service.sync_all().await;

        assert_eq!(result.outcome, SyncState::PartialFailure);
        let stored = records(&service, EntityKind::Category).await;
        assert_eq!(stored[0].data["name"], json!("Local"));
        assert!(stored[0].is_pending());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_authority_write_replaces_a_synced_copy() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "c1", 1_000, data(json!({"name": "Old"})));
        assert!(service.sync_all().await.success);

        let later = now_ms() + 60_000;
        remote.seed(EntityKind::Category, owner(), "c1", later, data(json!({"name": "New"})));
        let result = service.sync_all().await;

        assert!(result.success);
        assert_eq!(result.counts(EntityKind::Category).pulled, 1);
        let stored = records(&service, EntityKind::Category).await;
        assert_eq!(stored[0].data["name"], json!("New"));
        assert_eq!(stored[0].sync_status, SyncStatus::Synced);
        assert_eq!(stored[0].server_updated_at, Some(later));
        assert_eq!(stored[0].version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_local_copy_wins_and_is_logged() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "c1", 1_000, data(json!({"name": "Mine"})));
        assert!(service.sync_all().await.success);

        // Newer than the last pull but older than the local copy's clock
        remote.seed(EntityKind::Category, owner(), "c1", 2_000, data(json!({"name": "Stale"})));
        let result = service.sync_all().await;

        assert!(result.success);
        assert_eq!(result.counts(EntityKind::Category).kept_local, 1);
        let stored = records(&service, EntityKind::Category).await;
        assert_eq!(stored[0].data["name"], json!("Mine"));
        assert!(stored[0].is_pending());

        let conflicts = service.store().list_conflicts(&owner(), 10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].record_id, "c1");
        assert_eq!(conflicts[0].incoming_updated_at, 2_000);
        assert_eq!(conflicts[0].strategy, CONFLICT_STRATEGY);

        assert!(service.sync_all().await.success);
        assert_eq!(
            remote.get(EntityKind::Category, "c1").unwrap().data["name"],
            json!("Mine")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_of_a_local_only_record_never_reaches_the_authority() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        let record = create(&service, EntityKind::Category, json!({"name": "Oops"})).await;
        tombstone(&service, record).await;

        let result = service.sync_all().await;

        assert!(result.success);
        assert_eq!(result.counts(EntityKind::Category).purged, 1);
        assert_eq!(writes(&remote), 0);
        assert!(records(&service, EntityKind::Category).await.is_empty());
        assert!(service
            .store()
            .pending_operations(&owner())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_of_a_synced_record_is_deleted_then_purged() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        create(&service, EntityKind::Category, json!({"name": "Rent"})).await;
        assert!(service.sync_all().await.success);

        let synced = records(&service, EntityKind::Category).await.remove(0);
        let id = synced.id.clone();
        tombstone(&service, synced).await;
        let result = service.sync_all().await;

        assert!(result.success);
        assert_eq!(result.counts(EntityKind::Category).deleted, 1);
        assert!(remote.get(EntityKind::Category, id.as_str()).is_none());
        assert!(records(&service, EntityKind::Category).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_remote_delete_keeps_the_tombstone() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "c1", 1_000, data(json!({"name": "Rent"})));
        assert!(service.sync_all().await.success);

        let synced = records(&service, EntityKind::Category).await.remove(0);
        tombstone(&service, synced).await;
        remote.fail_on("c1");
        let result = service.sync_all().await;

        assert_eq!(result.outcome, SyncState::PartialFailure);
        let stored = records(&service, EntityKind::Category).await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_deleted);
        assert!(remote.get(EntityKind::Category, "c1").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_pull_pages_through_everything_and_sets_the_cursor() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        for (index, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let updated_at = 1_000 + i64::try_from(index).unwrap();
            remote.seed(EntityKind::Category, owner(), id, updated_at, data(json!({"name": id})));
        }

        let result = service.sync_all().await;

        assert!(result.success);
        assert_eq!(result.counts(EntityKind::Category).pulled, 5);
        let lists = remote
            .calls()
            .iter()
            .filter(|call| call.method == RemoteMethod::List && call.kind == EntityKind::Category)
            .count();
        assert_eq!(lists, 3);

        let meta = service
            .store()
            .load_meta(&owner(), EntityKind::Category)
            .await
            .unwrap();
        assert_eq!(meta.cursor, Some(PullCursor::new(1_004_000, "e")));
        assert!(meta.last_sync_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn incremental_pull_only_fetches_rows_past_the_cursor() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "old", 1_000, data(json!({"name": "Old"})));
        assert!(service.sync_all().await.success);

        remote.remove(EntityKind::Category, "old");
        remote.seed(EntityKind::Category, owner(), "new", 2_000, data(json!({"name": "New"})));
        let result = service.sync_all().await;

        assert_eq!(result.counts(EntityKind::Category).pulled, 1);
        assert_eq!(result.counts(EntityKind::Category).reconciled, 0);
        let ids: Vec<String> = records(&service, EntityKind::Category)
            .await
            .iter()
            .map(|record| record.id.to_string())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"old".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_pull_removes_records_deleted_elsewhere() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "x", 1_000, data(json!({"name": "X"})));
        remote.seed(EntityKind::Category, owner(), "y", 1_001, data(json!({"name": "Y"})));
        assert!(service.sync_all().await.success);
        let local_only = create(&service, EntityKind::Goal, json!({"name": "Trip", "target_cents": 10})).await;
        remote.fail_on(local_only.id.as_str());

        remote.remove(EntityKind::Category, "y");
        let result = service.sync_full().await;

        assert_eq!(result.counts(EntityKind::Category).reconciled, 1);
        let ids: Vec<String> = records(&service, EntityKind::Category)
            .await
            .iter()
            .map(|record| record.id.to_string())
            .collect();
        assert_eq!(ids, vec!["x".to_string()]);
        assert_eq!(records(&service, EntityKind::Goal).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_page_skips_the_kind_and_keeps_its_cursor() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        remote.seed(EntityKind::Category, owner(), "c1", 1_000, data(json!({"name": "Rent"})));
        remote.seed(EntityKind::Goal, owner(), "g1", 1_000, data(json!({"name": "Trip", "target_cents": 5})));
        remote.fail_list(EntityKind::Category);

        let result = service.sync_all().await;

        assert_eq!(result.outcome, SyncState::PartialFailure);
        assert!(matches!(
            result.errors[..],
            [SyncError::PullFailed {
                kind: EntityKind::Category,
                ..
            }]
        ));
        assert!(records(&service, EntityKind::Category).await.is_empty());
        assert_eq!(records(&service, EntityKind::Goal).await.len(), 1);
        let meta = service
            .store()
            .load_meta(&owner(), EntityKind::Category)
            .await
            .unwrap();
        assert_eq!(meta.cursor, None);
        assert_eq!(meta.last_sync_at, None);

        let goal_meta = service
            .store()
            .load_meta(&owner(), EntityKind::Goal)
            .await
            .unwrap();
        assert!(goal_meta.last_sync_at.is_some());
        assert_eq!(goal_meta.cursor, Some(PullCursor::new(1_000_000, "g1")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_end_with_the_outcome_then_idle() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        let mut events = service.subscribe();

        let result = service.sync_all().await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                SyncEvent::StateChanged(SyncState::Syncing),
                SyncEvent::Completed(Box::new(result)),
                SyncEvent::StateChanged(SyncState::Success),
                SyncEvent::StateChanged(SyncState::Idle),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_record_returns_the_authority_id() {
        let remote = InMemoryRemote::new();
        let service = service(&remote).await;
        let record = create(&service, EntityKind::Category, json!({"name": "Rent"})).await;

        let id = service
            .push_record(EntityKind::Category, &record.id)
            .await
            .unwrap();

        assert!(!id.is_temporary());
        assert!(remote.get(EntityKind::Category, id.as_str()).is_some());
        let stored = service
            .store()
            .get_record(EntityKind::Category, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_record_offline_leaves_the_record_queued() {
        let remote = InMemoryRemote::new();
        let network = NetworkStatus::offline();
        let service = service_with(
            &remote,
            &network,
            FixedSession::new(session()),
            StoreService::open_in_memory().await.unwrap(),
        );
        let record = create(&service, EntityKind::Category, json!({"name": "Rent"})).await;

        let error = service
            .push_record(EntityKind::Category, &record.id)
            .await
            .unwrap_err();

        assert!(matches!(error, SyncError::NetworkUnavailable(_)));
        assert_eq!(remote.call_count(), 0);
        assert_eq!(service.store().pending_operations(&owner()).await.unwrap().len(), 1);

        network.set_online(true);
        assert!(service.sync_all().await.success);
        assert_eq!(remote.rows(EntityKind::Category, &owner()).len(), 1);
    }
}
