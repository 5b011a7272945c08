//! In-process remote authority with a call log and failure injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use uuid::Uuid;

use super::{
    ensure_authority_id, Identity, ListRequest, RemoteAuthority, RemoteError, RemoteRecord,
    RemoteResult, WriteAck,
};
use crate::models::{EntityKind, OwnerId, RecordId, SyncRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteMethod {
    Insert,
    Update,
    Delete,
    List,
}

/// One outbound call as the authority saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: RemoteMethod,
    pub kind: EntityKind,
    pub owner_id: OwnerId,
    /// Record addressed by the call, if any
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    owner_id: OwnerId,
    updated_at: i64,
    version: i64,
    data: Map<String, Value>,
}

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<(EntityKind, String), StoredRow>,
    clock: i64,
    calls: Vec<RemoteCall>,
    failing_ids: HashSet<String>,
    failing_lists: HashSet<EntityKind>,
    unavailable: bool,
}

impl State {
    /// Strictly increasing authority clock, never behind wall time
    fn tick(&mut self) -> i64 {
        self.clock = (self.clock + 1).max(crate::util::now_ms());
        self.clock
    }

    fn record_call(
        &mut self,
        method: RemoteMethod,
        kind: EntityKind,
        identity: &Identity,
        id: Option<&str>,
    ) {
        self.calls.push(RemoteCall {
            method,
            kind,
            owner_id: identity.owner_id,
            id: id.map(str::to_string),
        });
    }

    fn check(&self, id: Option<&str>) -> RemoteResult<()> {
        if self.unavailable {
            return Err(RemoteError::Unavailable("authority is down".to_string()));
        }
        if let Some(id) = id.filter(|id| self.failing_ids.contains(*id)) {
            return Err(RemoteError::Api(format!("write rejected for {id} (500)")));
        }
        Ok(())
    }
}

/// Remote authority kept in memory, cloneable across tasks
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<State>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a row in place as if another device had written it
    pub fn seed(
        &self,
        kind: EntityKind,
        owner_id: OwnerId,
        id: &str,
        updated_at: i64,
        data: Map<String, Value>,
    ) {
        let mut state = self.state();
        state.clock = state.clock.max(updated_at);
        state.rows.insert(
            (kind, id.to_string()),
            StoredRow {
                owner_id,
                updated_at,
                version: 1,
                data,
            },
        );
    }

    /// Drop a row as if another device had deleted it
    pub fn remove(&self, kind: EntityKind, id: &str) -> bool {
        self.state().rows.remove(&(kind, id.to_string())).is_some()
    }

    /// Rows of a kind for an owner, newest first
    pub fn rows(&self, kind: EntityKind, owner_id: &OwnerId) -> Vec<RemoteRecord> {
        let state = self.state();
        let mut rows: Vec<_> = state
            .rows
            .iter()
            .filter(|((row_kind, _), row)| *row_kind == kind && row.owner_id == *owner_id)
            .map(|((_, id), row)| to_record(id, row))
            .collect();
        sort_rows(&mut rows);
        rows
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<RemoteRecord> {
        self.state()
            .rows
            .get(&(kind, id.to_string()))
            .map(|row| to_record(id, row))
    }

    /// Make every call addressing `id` fail
    pub fn fail_on(&self, id: &str) {
        self.state().failing_ids.insert(id.to_string());
    }

    /// Make every list of `kind` fail
    pub fn fail_list(&self, kind: EntityKind) {
        self.state().failing_lists.insert(kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_ids.clear();
        state.failing_lists.clear();
        state.unavailable = false;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

impl RemoteAuthority for InMemoryRemote {
    async fn insert(&self, identity: &Identity, record: &SyncRecord) -> RemoteResult<WriteAck> {
        let mut state = self.state();
        state.record_call(
            RemoteMethod::Insert,
            record.kind,
            identity,
            Some(record.id.as_str()),
        );
        state.check(Some(record.id.as_str()))?;

        let id = Uuid::now_v7().to_string();
        let updated_at = state.tick();
        state.rows.insert(
            (record.kind, id.clone()),
            StoredRow {
                owner_id: identity.owner_id,
                updated_at,
                version: record.version,
                data: record.data.clone(),
            },
        );
        Ok(WriteAck { id, updated_at })
    }

    async fn update(&self, identity: &Identity, record: &SyncRecord) -> RemoteResult<WriteAck> {
        let mut state = self.state();
        state.record_call(
            RemoteMethod::Update,
            record.kind,
            identity,
            Some(record.id.as_str()),
        );
        ensure_authority_id(&record.id)?;
        state.check(Some(record.id.as_str()))?;

        let updated_at = state.tick();
        let row = state
            .rows
            .get_mut(&(record.kind, record.id.to_string()))
            .filter(|row| row.owner_id == identity.owner_id)
            .ok_or_else(|| RemoteError::NotFound(format!("{} {}", record.kind, record.id)))?;
        row.updated_at = updated_at;
        row.version = record.version;
        row.data = record.data.clone();

        Ok(WriteAck {
            id: record.id.to_string(),
            updated_at,
        })
    }

    async fn delete(
        &self,
        identity: &Identity,
        kind: EntityKind,
        id: &RecordId,
    ) -> RemoteResult<()> {
        let mut state = self.state();
        state.record_call(RemoteMethod::Delete, kind, identity, Some(id.as_str()));
        ensure_authority_id(id)?;
        state.check(Some(id.as_str()))?;

        let key = (kind, id.to_string());
        if state
            .rows
            .get(&key)
            .is_some_and(|row| row.owner_id == identity.owner_id)
        {
            state.rows.remove(&key);
        }
        Ok(())
    }

    async fn list(
        &self,
        identity: &Identity,
        kind: EntityKind,
        request: &ListRequest,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        let mut state = self.state();
        state.record_call(RemoteMethod::List, kind, identity, None);
        state.check(None)?;
        if state.failing_lists.contains(&kind) {
            return Err(RemoteError::Api(format!("list of {kind} rejected (500)")));
        }

        let mut rows: Vec<_> = state
            .rows
            .iter()
            .filter(|((row_kind, _), row)| {
                *row_kind == kind
                    && row.owner_id == identity.owner_id
                    && request
                        .updated_after
                        .map_or(true, |after| row.updated_at * 1_000 > after)
            })
            .map(|((_, id), row)| to_record(id, row))
            .collect();
        sort_rows(&mut rows);

        Ok(rows
            .into_iter()
            .skip(usize::try_from(request.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(request.limit).unwrap_or(usize::MAX))
            .collect())
    }
}

fn to_record(id: &str, row: &StoredRow) -> RemoteRecord {
    RemoteRecord {
        id: id.to_string(),
        owner_id: Some(row.owner_id.to_string()),
        updated_at: row.updated_at,
        updated_at_micros: row.updated_at * 1_000,
        version: Some(row.version),
        data: row.data.clone(),
    }
}

fn sort_rows(rows: &mut [RemoteRecord]) {
    rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}
