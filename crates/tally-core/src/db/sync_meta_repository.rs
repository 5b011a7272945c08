//! Sync metadata repository

use libsql::Connection;

use crate::error::Result;
use crate::models::{EntityKind, OwnerId, PullCursor, SyncMeta};

/// Trait for sync bookkeeping storage (async)
#[allow(async_fn_in_trait)]
pub trait SyncMetaRepository {
    /// Load metadata for an owner and kind; never-synced pairs get an empty record
    async fn load(&self, owner: &OwnerId, kind: EntityKind) -> Result<SyncMeta>;

    /// Persist metadata, replacing any previous value
    async fn save(&self, meta: &SyncMeta) -> Result<()>;
}

/// libSQL implementation of `SyncMetaRepository`
pub struct LibSqlSyncMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SyncMetaRepository for LibSqlSyncMetaRepository<'_> {
    async fn load(&self, owner: &OwnerId, kind: EntityKind) -> Result<SyncMeta> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_sync_at, cursor_updated_at, cursor_id
                 FROM sync_meta WHERE owner_id = ? AND entity_kind = ?",
                [owner.as_str(), kind.as_str().to_string()],
            )
            .await?;

        let mut meta = SyncMeta {
            owner_id: *owner,
            kind,
            last_sync_at: None,
            cursor: None,
        };

        if let Some(row) = rows.next().await? {
            meta.last_sync_at = row.get(0)?;
            let cursor_updated_at: Option<i64> = row.get(1)?;
            let cursor_id: Option<String> = row.get(2)?;
            meta.cursor = cursor_updated_at
                .zip(cursor_id)
                .map(|(updated_at, id)| PullCursor::new(updated_at, id));
        }

        Ok(meta)
    }

    async fn save(&self, meta: &SyncMeta) -> Result<()> {
        let (cursor_updated_at, cursor_id) = meta
            .cursor
            .as_ref()
            .map(|cursor| (cursor.updated_at, cursor.id.clone()))
            .unzip();

        self.conn
            .execute(
                "INSERT INTO sync_meta (owner_id, entity_kind, last_sync_at, cursor_updated_at, cursor_id)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(owner_id, entity_kind) DO UPDATE SET
                    last_sync_at = excluded.last_sync_at,
                    cursor_updated_at = excluded.cursor_updated_at,
                    cursor_id = excluded.cursor_id",
                libsql::params![
                    meta.owner_id.as_str(),
                    meta.kind.as_str(),
                    meta.last_sync_at,
                    cursor_updated_at,
                    cursor_id
                ],
            )
            .await?;
        Ok(())
    }
}
