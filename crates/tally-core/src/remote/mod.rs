//! Remote authority: the server holding the durable copy of every record.

pub mod memory;
pub mod postgrest;

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{EntityKind, OwnerId, RecordId, SyncRecord, SyncStatus};

pub use memory::InMemoryRemote;
pub use postgrest::SupabaseRemote;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote API error: {0}")]
    Api(String),
    #[error("Remote record not found: {0}")]
    NotFound(String),
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
    #[error("Remote authority unavailable: {0}")]
    Unavailable(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Owner and credentials every remote call is scoped by
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub owner_id: OwnerId,
    access_token: String,
}

impl Identity {
    pub fn new(owner_id: OwnerId, access_token: impl Into<String>) -> Self {
        Self {
            owner_id,
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Identity")
            .field("owner_id", &self.owner_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Authority confirmation of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub id: String,
    /// Authority clock (Unix ms) of the write
    pub updated_at: i64,
}

/// One page of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListRequest {
    /// Only rows strictly newer than this (Unix µs); `None` lists everything
    pub updated_after: Option<i64>,
    pub limit: u32,
    pub offset: u32,
}

/// A row as the authority returns it
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub owner_id: Option<String>,
    /// Authority clock, Unix ms
    pub updated_at: i64,
    /// Authority clock at full precision (Unix µs), for pull cursors
    pub updated_at_micros: i64,
    pub version: Option<i64>,
    /// Domain fields only
    pub data: Map<String, Value>,
}

impl RemoteRecord {
    /// Convert to a local record stamped synced
    ///
    /// Rows belonging to another owner are rejected.
    pub fn into_local(
        self,
        kind: EntityKind,
        owner: &OwnerId,
        now: i64,
    ) -> crate::Result<SyncRecord> {
        if let Some(row_owner) = self.owner_id.as_deref() {
            if row_owner.trim() != owner.as_str() {
                return Err(crate::Error::InvalidInput(format!(
                    "{kind} {} belongs to another owner",
                    self.id
                )));
            }
        }

        Ok(SyncRecord {
            id: RecordId::authority(self.id)?,
            owner_id: *owner,
            kind,
            sync_status: SyncStatus::Synced,
            local_updated_at: now,
            server_updated_at: Some(self.updated_at),
            version: self.version.unwrap_or(1).max(1),
            is_deleted: false,
            last_error: None,
            data: self.data,
        })
    }
}

/// Outbound surface of the remote authority, one table per entity kind.
///
/// Every call is scoped by the identity's owner id.
#[allow(async_fn_in_trait)]
pub trait RemoteAuthority {
    /// Create a row; the authority assigns its id
    async fn insert(&self, identity: &Identity, record: &SyncRecord) -> RemoteResult<WriteAck>;

    /// Replace the domain fields of an existing row
    async fn update(&self, identity: &Identity, record: &SyncRecord) -> RemoteResult<WriteAck>;

    /// Remove a row. Removing an absent row succeeds.
    async fn delete(&self, identity: &Identity, kind: EntityKind, id: &RecordId)
        -> RemoteResult<()>;

    /// Rows ordered by `updated_at` descending, then id ascending
    async fn list(
        &self,
        identity: &Identity,
        kind: EntityKind,
        request: &ListRequest,
    ) -> RemoteResult<Vec<RemoteRecord>>;
}

/// Temporary ids never leave the device as a write target
pub(crate) fn ensure_authority_id(id: &RecordId) -> RemoteResult<()> {
    if id.is_temporary() {
        return Err(RemoteError::InvalidPayload(format!(
            "temporary id {id} cannot be sent to the authority"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> OwnerId {
        "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".parse().unwrap()
    }

    fn row(owner_id: Option<&str>) -> RemoteRecord {
        RemoteRecord {
            id: "c1".to_string(),
            owner_id: owner_id.map(str::to_string),
            updated_at: 1_000,
            updated_at_micros: 1_000_000,
            version: None,
            data: json!({"name": "Rent"}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn into_local_marks_synced() {
        let record = row(Some("0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10"))
            .into_local(EntityKind::Category, &owner(), 5_000)
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.server_updated_at, Some(1_000));
        assert_eq!(record.local_updated_at, 5_000);
        assert_eq!(record.version, 1);
    }

    #[test]
    fn into_local_rejects_foreign_rows() {
        let result = row(Some("0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e99")).into_local(
            EntityKind::Category,
            &owner(),
            5_000,
        );
        assert!(result.is_err());
    }

    #[test]
    fn identity_debug_redacts_token() {
        let identity = Identity::new(owner(), "secret-token");
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn temporary_ids_are_not_update_targets() {
        assert!(ensure_authority_id(&RecordId::temporary()).is_err());
        assert!(ensure_authority_id(&RecordId::authority("x").unwrap()).is_ok());
    }
}
